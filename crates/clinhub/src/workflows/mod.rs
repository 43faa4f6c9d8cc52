//! Built-in clinical workflows.
//!
//! Each workflow type carries its own transition table; the engine
//! dispatches on [`Workflow::TYPE`](crate::Workflow::TYPE).

mod encounter;
mod medication;
mod order_lifecycle;

pub use encounter::{Encounter, EncounterEvent, EncounterInput, EncounterState, EncounterStatus};
pub use medication::{
    DispenseEvent, DispenseInput, DispenseState, DispenseStatus, MedicationDispense,
};
pub use order_lifecycle::{OrderEvent, OrderInput, OrderLifecycle, OrderState, OrderStatus};

use crate::Workflow;

/// Type names of the built-in workflows.
pub const BUILTIN_TYPES: [&str; 3] = [
    OrderLifecycle::TYPE,
    MedicationDispense::TYPE,
    Encounter::TYPE,
];
