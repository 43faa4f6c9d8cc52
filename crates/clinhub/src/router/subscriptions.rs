//! Static subscription table.

use std::collections::HashMap;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::Workflow;
use crate::event::event_types;
use crate::subsystem::Subsystem;
use crate::workflows::{Encounter, MedicationDispense, OrderLifecycle};

/// Where a routed event goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    /// Applied to the instance of this workflow type the event correlates to.
    Workflow(&'static str),
    /// Forwarded to a spoke as an outbox command.
    Spoke(Subsystem),
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Workflow(workflow_type) => write!(f, "workflow:{workflow_type}"),
            RouteTarget::Spoke(subsystem) => write!(f, "spoke:{subsystem}"),
        }
    }
}

impl Serialize for RouteTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Event type to subscriber targets, built once at startup.
///
/// # Example
///
/// ```
/// use clinhub::Subsystem;
/// use clinhub::router::{RouteTarget, SubscriptionTable};
///
/// let table = SubscriptionTable::new()
///     .subscribe("ORDER_PLACED", RouteTarget::Workflow("order-lifecycle"))
///     .subscribe("LAB_RESULT_READY", RouteTarget::Spoke(Subsystem::Dpi));
///
/// assert_eq!(table.targets("ORDER_PLACED").len(), 1);
/// assert!(table.targets("UNKNOWN").is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTable {
    routes: HashMap<String, Vec<RouteTarget>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. Subscribing the same target twice has no effect.
    pub fn subscribe(mut self, event_type: impl Into<String>, target: RouteTarget) -> Self {
        let targets = self.routes.entry(event_type.into()).or_default();
        if !targets.contains(&target) {
            targets.push(target);
        }
        self
    }

    pub fn subscribe_all(self, event_types: &[&str], target: RouteTarget) -> Self {
        event_types
            .iter()
            .fold(self, |table, event_type| table.subscribe(*event_type, target))
    }

    /// Subscribers of an event type, in subscription order.
    pub fn targets(&self, event_type: &str) -> &[RouteTarget] {
        self.routes.get(event_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Workflow types referenced by any subscription.
    pub fn workflow_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        let mut seen = Vec::new();
        self.routes.values().flatten().filter_map(move |target| match target {
            RouteTarget::Workflow(t) if !seen.contains(t) => {
                seen.push(*t);
                Some(*t)
            }
            _ => None,
        })
    }

    /// Subscriptions for the built-in clinical workflows.
    ///
    /// Results are also filed in the patient record (DPI).
    pub fn clinical_defaults() -> Self {
        use event_types::*;

        Self::new()
            .subscribe_all(
                &[
                    ORDER_PLACED,
                    ORDER_ACCEPTED,
                    ORDER_REJECTED,
                    ORDER_CANCELLED,
                    SPECIMEN_COLLECTED,
                    RESULT_RECEIVED,
                    LAB_RESULT_READY,
                    IMAGE_RESULT_READY,
                ],
                RouteTarget::Workflow(OrderLifecycle::TYPE),
            )
            .subscribe_all(
                &[RESULT_RECEIVED, LAB_RESULT_READY, IMAGE_RESULT_READY],
                RouteTarget::Spoke(Subsystem::Dpi),
            )
            .subscribe_all(
                &[
                    PRESCRIPTION_CREATED,
                    PRESCRIPTION_CANCELLED,
                    MEDICATION_DISPENSED,
                    DISPENSE_REJECTED,
                ],
                RouteTarget::Workflow(MedicationDispense::TYPE),
            )
            .subscribe_all(
                &[PATIENT_ADMITTED, PATIENT_TRANSFERRED, PATIENT_DISCHARGED],
                RouteTarget::Workflow(Encounter::TYPE),
            )
    }
}
