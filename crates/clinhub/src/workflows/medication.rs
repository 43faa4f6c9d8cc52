//! Medication dispensing: a CPOE prescription fulfilled by the pharmacy.
//!
//! `Prescribed → DispenseRequested → Dispensed | Cancelled | Failed`

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::event::{ClinicalEvent, event_types};
use crate::identity::CanonicalId;
use crate::subsystem::Subsystem;
use crate::workflow::{CorrelationError, Decision, HasWorkflowId, Rejection, Workflow, WorkflowId};

const PRESCRIPTION_KEYS: &[&str] = &["prescriptionId", "prescription_id"];

pub struct MedicationDispense;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispenseStatus {
    #[default]
    New,
    Prescribed,
    DispenseRequested,
    Dispensed,
    Cancelled,
    Failed,
}

impl DispenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispenseStatus::New => "New",
            DispenseStatus::Prescribed => "Prescribed",
            DispenseStatus::DispenseRequested => "DispenseRequested",
            DispenseStatus::Dispensed => "Dispensed",
            DispenseStatus::Cancelled => "Cancelled",
            DispenseStatus::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispenseState {
    pub status: DispenseStatus,
    pub patient: Option<CanonicalId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispenseInput {
    Prescribe {
        prescription_id: String,
        patient: CanonicalId,
        medication: Value,
    },
    Dispensed {
        prescription_id: String,
    },
    Reject {
        prescription_id: String,
        reason: String,
    },
    Cancel {
        prescription_id: String,
        reason: String,
    },
    Timeout {
        prescription_id: String,
    },
}

impl HasWorkflowId for DispenseInput {
    fn workflow_id(&self) -> WorkflowId {
        match self {
            DispenseInput::Prescribe {
                prescription_id, ..
            }
            | DispenseInput::Dispensed { prescription_id }
            | DispenseInput::Reject {
                prescription_id, ..
            }
            | DispenseInput::Cancel {
                prescription_id, ..
            }
            | DispenseInput::Timeout { prescription_id } => WorkflowId::new(prescription_id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispenseEvent {
    Prescribed { patient: CanonicalId },
    DispenseRequested,
    Dispensed,
    Cancelled { reason: String },
    Failed { reason: String },
}

impl Workflow for MedicationDispense {
    type State = DispenseState;
    type Input = DispenseInput;
    type Event = DispenseEvent;

    const TYPE: &'static str = "medication-dispense";

    fn correlate(event: &ClinicalEvent) -> Result<DispenseInput, CorrelationError> {
        let prescription_id = event
            .payload_str(PRESCRIPTION_KEYS)
            .ok_or_else(|| CorrelationError::missing_key(PRESCRIPTION_KEYS))?;
        let reason = |default: &str| {
            event
                .payload_str(&["reason"])
                .unwrap_or_else(|| default.to_string())
        };

        match event.event_type.as_str() {
            event_types::PRESCRIPTION_CREATED => Ok(DispenseInput::Prescribe {
                prescription_id,
                patient: event.patient,
                medication: event.payload.clone(),
            }),
            event_types::MEDICATION_DISPENSED => Ok(DispenseInput::Dispensed { prescription_id }),
            event_types::DISPENSE_REJECTED => Ok(DispenseInput::Reject {
                prescription_id,
                reason: reason("rejected by pharmacy"),
            }),
            event_types::PRESCRIPTION_CANCELLED => Ok(DispenseInput::Cancel {
                prescription_id,
                reason: reason("cancelled by prescriber"),
            }),
            other => Err(CorrelationError::unsupported(other)),
        }
    }

    fn evolve(mut state: DispenseState, event: DispenseEvent) -> DispenseState {
        state.status = match event {
            DispenseEvent::Prescribed { patient } => {
                state.patient = Some(patient);
                DispenseStatus::Prescribed
            }
            DispenseEvent::DispenseRequested => DispenseStatus::DispenseRequested,
            DispenseEvent::Dispensed => DispenseStatus::Dispensed,
            DispenseEvent::Cancelled { .. } => DispenseStatus::Cancelled,
            DispenseEvent::Failed { .. } => DispenseStatus::Failed,
        };
        state
    }

    fn decide(
        _now: OffsetDateTime,
        state: &DispenseState,
        input: &DispenseInput,
    ) -> Result<Decision<DispenseEvent, DispenseInput>, Rejection> {
        use DispenseStatus::*;

        match (state.status, input) {
            (
                New,
                DispenseInput::Prescribe {
                    prescription_id,
                    patient,
                    medication,
                },
            ) => Ok(Decision::from_events(nonempty::nonempty![
                DispenseEvent::Prescribed { patient: *patient },
                DispenseEvent::DispenseRequested
            ])
            .with_command(
                Subsystem::Pharmacy,
                "dispense.request",
                json!({
                    "prescriptionId": prescription_id,
                    "patientId": patient,
                    "medication": medication,
                }),
            )),

            (DispenseRequested, DispenseInput::Dispensed { prescription_id }) => {
                Ok(Decision::event(DispenseEvent::Dispensed).with_notification(
                    "medication.dispensed",
                    json!({ "prescriptionId": prescription_id, "patientId": state.patient }),
                ))
            }

            (DispenseRequested, DispenseInput::Reject { prescription_id, reason }) => {
                Ok(Decision::event(DispenseEvent::Failed {
                    reason: reason.clone(),
                })
                .with_notification(
                    "dispense.rejected",
                    json!({
                        "prescriptionId": prescription_id,
                        "patientId": state.patient,
                        "reason": reason,
                    }),
                ))
            }

            (Prescribed | DispenseRequested, DispenseInput::Cancel { prescription_id, reason }) => {
                Ok(Decision::event(DispenseEvent::Cancelled {
                    reason: reason.clone(),
                })
                .with_command(
                    Subsystem::Pharmacy,
                    "dispense.cancel",
                    json!({ "prescriptionId": prescription_id, "reason": reason }),
                ))
            }

            (Prescribed | DispenseRequested, DispenseInput::Timeout { prescription_id }) => {
                Ok(Decision::event(DispenseEvent::Failed {
                    reason: "deadline exceeded".into(),
                })
                .with_notification(
                    "dispense.timeout",
                    json!({ "prescriptionId": prescription_id, "patientId": state.patient }),
                ))
            }

            (status, _) => Err(Rejection::new(format!(
                "input not accepted in {}",
                status.as_str()
            ))),
        }
    }

    fn is_terminal(state: &DispenseState) -> bool {
        matches!(
            state.status,
            DispenseStatus::Dispensed | DispenseStatus::Cancelled | DispenseStatus::Failed
        )
    }

    fn status(state: &DispenseState) -> &'static str {
        state.status.as_str()
    }

    fn timeout_input(workflow_id: &WorkflowId) -> Option<DispenseInput> {
        Some(DispenseInput::Timeout {
            prescription_id: workflow_id.to_string(),
        })
    }

    fn cancel_input(workflow_id: &WorkflowId, reason: &str) -> Option<DispenseInput> {
        Some(DispenseInput::Cancel {
            prescription_id: workflow_id.to_string(),
            reason: reason.to_string(),
        })
    }
}
