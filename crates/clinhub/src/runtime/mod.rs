//! Background workers and the hub builder.
//!
//! - [`HubBuilder`]: registers workflows and wires the hub together
//! - [`RuntimeConfig`]: polling intervals, locks, retry policies, worker counts
//! - [`WorkflowConfig`]: per-type deadlines and instance retention
//!
//! The workers themselves (delivery, timer, audit, retention) are started
//! by [`Hub::run`](crate::Hub::run).

mod audit_worker;
mod config;
mod delivery_worker;
pub(crate) mod registry;
mod retention;
mod timer_worker;

pub use config::{RuntimeConfig, WorkflowConfig};
pub use registry::HubBuilder;

pub(crate) use audit_worker::AuditWorker;
pub(crate) use delivery_worker::DeliveryWorker;
pub(crate) use retention::RetentionSweeper;
pub(crate) use timer_worker::TimerWorker;
