//! Clinical integration hub connecting hospital subsystems.
//!
//! Clinhub sits between the order entry, patient record, LIS, RIS and pharmacy systems:
//!
//! - **Identity resolution**: every subsystem's local patient identifier maps
//!   to one canonical identity; merges keep the older identity as survivor
//! - **Event routing**: events are validated, journaled and fanned out to
//!   subscribed workflows and spokes, per patient in causal order
//! - **Durable workflows**: order, medication and encounter processes are
//!   event-sourced state machines; a transition, its outbound commands and
//!   its audit records commit atomically
//! - **At-least-once delivery**: commands leave through an outbox with
//!   bounded retries and an idempotency key per command
//!
//! # Architecture
//!
//! ```text
//!  spoke ──► RawEnvelope ──► MessageRouter ──► journal (write-ahead)
//!                               │
//!                      Dispatcher (shard per patient)
//!                               │
//!            ┌──────────────────┴──────────────────┐
//!            ▼                                     ▼
//!     WorkflowService                        forward command
//!   1. lock instance                               │
//!   2. replay history → state                      │
//!   3. decide(now, state, input)                   │
//!   4. append events, commands, timers, audit      │
//!   5. commit                                      │
//!            └──────────────────┬──────────────────┘
//!                               ▼
//!                  outbox ──► DeliveryWorker ──► spoke
//!                  audit queue ──► AuditWorker ──► audit sink
//! ```
//!
//! # Example
//!
//! ```ignore
//! use clinhub::{Hub, HubConfig, MemoryStore};
//!
//! let config = HubConfig::from_env()?;
//! let hub = Hub::builder(MemoryStore::new())
//!     .with_clinical_workflows()
//!     .transport(config.spoke_transport()?)
//!     .shared_audit_sink(config.audit_sink()?)
//!     .config(config)
//!     .build()?;
//!
//! hub.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```
//!
//! # Feature Flags
//!
//! - `postgres`: enables [`PgStore`]

pub mod audit;
pub mod config;
mod decider;
pub mod delivery;
mod error;
pub mod event;
pub mod health;
mod hub;
pub mod identity;
pub mod router;
pub mod runtime;
mod service;
pub mod store;
mod subsystem;
pub mod telemetry;
mod timer;
mod workflow;
pub mod workflows;

pub use audit::{AuditKind, AuditRecord, AuditReference, AuditSink};
pub use config::{ConfigError, HubConfig};
pub use decider::ApplyOutcome;
pub use delivery::{HttpSpokeTransport, RetryPolicy, SpokeTransport};
pub use error::{Error, Result};
pub use event::{ClinicalEvent, EventCategory, EventId, RawEnvelope};
pub use health::{HealthReport, HealthStatus, HubStatus};
pub use hub::Hub;
pub use identity::{CanonicalId, CanonicalIdentity, IdentityResolver};
pub use nonempty::NonEmpty;
pub use router::{MessageRouter, RouteReport, RouteTarget, SubscriptionTable};
pub use runtime::{HubBuilder, RuntimeConfig, WorkflowConfig};
pub use service::WorkflowService;
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use store::{HubStore, MemoryStore};
pub use subsystem::{Subsystem, UnknownSubsystem};
pub use timer::{DEADLINE_TIMER_KEY, Timer};
pub use workflow::{
    CommandSpec, CorrelationError, Decision, HasWorkflowId, Rejection, Workflow, WorkflowId,
    WorkflowRef,
};
