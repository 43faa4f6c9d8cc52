//! Order lifecycle: a CPOE order performed by the laboratory or radiology.
//!
//! ```text
//! New ─ORDER_PLACED─▶ Created ─▶ Transmitted ─ORDER_ACCEPTED/SPECIMEN_COLLECTED─▶ ResultPending
//!                                    │                                               │
//!                                    └──────────── RESULT_RECEIVED ──────────────────┤
//!                                                                                    ▼
//!                                                              ResultReceived ─▶ Completed
//!
//! ORDER_CANCELLED (before a result) ─▶ Cancelled
//! ORDER_REJECTED, deadline          ─▶ Failed
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::event::{ClinicalEvent, event_types};
use crate::identity::CanonicalId;
use crate::subsystem::Subsystem;
use crate::workflow::{CorrelationError, Decision, HasWorkflowId, Rejection, Workflow, WorkflowId};

const ORDER_KEYS: &[&str] = &["orderId", "order_id", "labOrderId", "imageOrderId"];
const DEPARTMENT_KEYS: &[&str] = &["department", "departmentId", "performer"];

/// Workflow marker type.
pub struct OrderLifecycle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// No order placed yet.
    #[default]
    New,
    Created,
    Transmitted,
    ResultPending,
    ResultReceived,
    Completed,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "New",
            OrderStatus::Created => "Created",
            OrderStatus::Transmitted => "Transmitted",
            OrderStatus::ResultPending => "ResultPending",
            OrderStatus::ResultReceived => "ResultReceived",
            OrderStatus::Completed => "Completed",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Failed => "Failed",
        }
    }

    fn awaits_result(&self) -> bool {
        matches!(self, OrderStatus::Transmitted | OrderStatus::ResultPending)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderState {
    pub status: OrderStatus,
    pub order_id: Option<String>,
    pub patient: Option<CanonicalId>,
    pub performer: Option<Subsystem>,
    pub result: Option<Value>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderInput {
    Place {
        order_id: String,
        patient: CanonicalId,
        performer: Subsystem,
        details: Value,
    },
    Accept {
        order_id: String,
    },
    RecordResult {
        order_id: String,
        result: Value,
    },
    Cancel {
        order_id: String,
        reason: String,
    },
    Reject {
        order_id: String,
        reason: String,
    },
    Timeout {
        order_id: String,
    },
}

impl HasWorkflowId for OrderInput {
    fn workflow_id(&self) -> WorkflowId {
        match self {
            OrderInput::Place { order_id, .. }
            | OrderInput::Accept { order_id }
            | OrderInput::RecordResult { order_id, .. }
            | OrderInput::Cancel { order_id, .. }
            | OrderInput::Reject { order_id, .. }
            | OrderInput::Timeout { order_id } => WorkflowId::new(order_id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Created {
        order_id: String,
        patient: CanonicalId,
        performer: Subsystem,
    },
    Transmitted,
    ResultPending,
    ResultReceived {
        result: Value,
    },
    Completed,
    Cancelled {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

/// Performing subsystem named by an order's department field.
fn performer_for(department: Option<String>) -> Result<Subsystem, CorrelationError> {
    let Some(department) = department else {
        return Ok(Subsystem::Lis);
    };
    match department.to_ascii_lowercase().as_str() {
        "lis" | "lab" | "laboratory" => Ok(Subsystem::Lis),
        "ris" | "radiology" | "imaging" => Ok(Subsystem::Ris),
        other => Err(CorrelationError::new(format!(
            "no performing subsystem for department {other}"
        ))),
    }
}

fn reason(event: &ClinicalEvent, default: &str) -> String {
    event
        .payload_str(&["reason"])
        .unwrap_or_else(|| default.to_string())
}

fn not_accepted(input: &OrderInput, status: OrderStatus) -> Rejection {
    let name = match input {
        OrderInput::Place { .. } => "place",
        OrderInput::Accept { .. } => "accept",
        OrderInput::RecordResult { .. } => "result",
        OrderInput::Cancel { .. } => "cancel",
        OrderInput::Reject { .. } => "reject",
        OrderInput::Timeout { .. } => "timeout",
    };
    Rejection::new(format!("{name} not accepted in {}", status.as_str()))
}

impl Workflow for OrderLifecycle {
    type State = OrderState;
    type Input = OrderInput;
    type Event = OrderEvent;

    const TYPE: &'static str = "order-lifecycle";

    fn correlate(event: &ClinicalEvent) -> Result<OrderInput, CorrelationError> {
        let order_id = event
            .payload_str(ORDER_KEYS)
            .ok_or_else(|| CorrelationError::missing_key(ORDER_KEYS))?;

        match event.event_type.as_str() {
            event_types::ORDER_PLACED => Ok(OrderInput::Place {
                order_id,
                patient: event.patient,
                performer: performer_for(event.payload_str(DEPARTMENT_KEYS))?,
                details: event.payload.clone(),
            }),
            event_types::ORDER_ACCEPTED | event_types::SPECIMEN_COLLECTED => {
                Ok(OrderInput::Accept { order_id })
            }
            event_types::RESULT_RECEIVED
            | event_types::LAB_RESULT_READY
            | event_types::IMAGE_RESULT_READY => Ok(OrderInput::RecordResult {
                order_id,
                result: event
                    .payload
                    .get("result")
                    .cloned()
                    .unwrap_or_else(|| event.payload.clone()),
            }),
            event_types::ORDER_CANCELLED => Ok(OrderInput::Cancel {
                order_id,
                reason: reason(event, "cancelled by ordering clinician"),
            }),
            event_types::ORDER_REJECTED => Ok(OrderInput::Reject {
                order_id,
                reason: reason(event, "rejected by performing department"),
            }),
            other => Err(CorrelationError::unsupported(other)),
        }
    }

    fn evolve(mut state: OrderState, event: OrderEvent) -> OrderState {
        match event {
            OrderEvent::Created {
                order_id,
                patient,
                performer,
            } => {
                state.status = OrderStatus::Created;
                state.order_id = Some(order_id);
                state.patient = Some(patient);
                state.performer = Some(performer);
            }
            OrderEvent::Transmitted => state.status = OrderStatus::Transmitted,
            OrderEvent::ResultPending => state.status = OrderStatus::ResultPending,
            OrderEvent::ResultReceived { result } => {
                state.status = OrderStatus::ResultReceived;
                state.result = Some(result);
            }
            OrderEvent::Completed => state.status = OrderStatus::Completed,
            OrderEvent::Cancelled { .. } => state.status = OrderStatus::Cancelled,
            OrderEvent::Failed { reason } => {
                state.status = OrderStatus::Failed;
                state.failure = Some(reason);
            }
        }
        state
    }

    fn decide(
        _now: OffsetDateTime,
        state: &OrderState,
        input: &OrderInput,
    ) -> Result<Decision<OrderEvent, OrderInput>, Rejection> {
        let performer = state.performer.unwrap_or(Subsystem::Lis);

        match (state.status, input) {
            (
                OrderStatus::New,
                OrderInput::Place {
                    order_id,
                    patient,
                    performer,
                    details,
                },
            ) => Ok(Decision::from_events(nonempty::nonempty![
                OrderEvent::Created {
                    order_id: order_id.clone(),
                    patient: *patient,
                    performer: *performer,
                },
                OrderEvent::Transmitted
            ])
            .with_command(
                *performer,
                "order.transmit",
                json!({ "orderId": order_id, "patientId": patient, "details": details }),
            )),

            (OrderStatus::Transmitted, OrderInput::Accept { .. }) => {
                Ok(Decision::event(OrderEvent::ResultPending))
            }

            (status, OrderInput::RecordResult { order_id, result }) if status.awaits_result() => {
                Ok(Decision::from_events(nonempty::nonempty![
                    OrderEvent::ResultReceived {
                        result: result.clone()
                    },
                    OrderEvent::Completed
                ])
                .with_notification(
                    "result.available",
                    json!({
                        "orderId": order_id,
                        "patientId": state.patient,
                        "performer": performer,
                    }),
                ))
            }

            (
                OrderStatus::Created | OrderStatus::Transmitted | OrderStatus::ResultPending,
                OrderInput::Cancel { order_id, reason },
            ) => Ok(Decision::event(OrderEvent::Cancelled {
                reason: reason.clone(),
            })
            .with_command(
                performer,
                "order.cancel",
                json!({ "orderId": order_id, "reason": reason }),
            )),

            (status, OrderInput::Reject { order_id, reason }) if status.awaits_result() => {
                Ok(Decision::event(OrderEvent::Failed {
                    reason: reason.clone(),
                })
                .with_notification(
                    "order.failed",
                    json!({ "orderId": order_id, "patientId": state.patient, "reason": reason }),
                ))
            }

            (
                OrderStatus::Created | OrderStatus::Transmitted | OrderStatus::ResultPending,
                OrderInput::Timeout { order_id },
            ) => Ok(Decision::event(OrderEvent::Failed {
                reason: "deadline exceeded".into(),
            })
            .with_notification(
                "order.timeout",
                json!({ "orderId": order_id, "patientId": state.patient, "status": state.status.as_str() }),
            )),

            (status, input) => Err(not_accepted(input, status)),
        }
    }

    fn is_terminal(state: &OrderState) -> bool {
        matches!(
            state.status,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    fn status(state: &OrderState) -> &'static str {
        state.status.as_str()
    }

    fn timeout_input(workflow_id: &WorkflowId) -> Option<OrderInput> {
        Some(OrderInput::Timeout {
            order_id: workflow_id.to_string(),
        })
    }

    fn cancel_input(workflow_id: &WorkflowId, reason: &str) -> Option<OrderInput> {
        Some(OrderInput::Cancel {
            order_id: workflow_id.to_string(),
            reason: reason.to_string(),
        })
    }
}
