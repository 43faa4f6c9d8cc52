//! Inpatient encounter: admission, transfers and discharge reported by the DPI.

use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

use crate::event::{ClinicalEvent, event_types};
use crate::identity::CanonicalId;
use crate::subsystem::Subsystem;
use crate::workflow::{CorrelationError, Decision, HasWorkflowId, Rejection, Workflow, WorkflowId};

const ENCOUNTER_KEYS: &[&str] = &["encounterId", "encounter_id", "admissionId", "visitId"];
const DEPARTMENT_KEYS: &[&str] = &["departmentId", "department"];

pub struct Encounter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncounterStatus {
    #[default]
    Expected,
    Admitted,
    Transferred,
    Discharged,
}

impl EncounterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncounterStatus::Expected => "Expected",
            EncounterStatus::Admitted => "Admitted",
            EncounterStatus::Transferred => "Transferred",
            EncounterStatus::Discharged => "Discharged",
        }
    }

    fn in_house(&self) -> bool {
        matches!(self, EncounterStatus::Admitted | EncounterStatus::Transferred)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncounterState {
    pub status: EncounterStatus,
    pub patient: Option<CanonicalId>,
    pub department: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EncounterInput {
    Admit {
        encounter_id: String,
        patient: CanonicalId,
        department: Option<String>,
    },
    Transfer {
        encounter_id: String,
        department: String,
    },
    Discharge {
        encounter_id: String,
    },
}

impl HasWorkflowId for EncounterInput {
    fn workflow_id(&self) -> WorkflowId {
        match self {
            EncounterInput::Admit { encounter_id, .. }
            | EncounterInput::Transfer { encounter_id, .. }
            | EncounterInput::Discharge { encounter_id } => WorkflowId::new(encounter_id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EncounterEvent {
    Admitted {
        patient: CanonicalId,
        department: Option<String>,
    },
    Transferred {
        department: String,
    },
    Discharged,
}

impl Workflow for Encounter {
    type State = EncounterState;
    type Input = EncounterInput;
    type Event = EncounterEvent;

    const TYPE: &'static str = "encounter";

    fn correlate(event: &ClinicalEvent) -> Result<EncounterInput, CorrelationError> {
        let encounter_id = event
            .payload_str(ENCOUNTER_KEYS)
            .ok_or_else(|| CorrelationError::missing_key(ENCOUNTER_KEYS))?;
        let department = event.payload_str(DEPARTMENT_KEYS);

        match event.event_type.as_str() {
            event_types::PATIENT_ADMITTED => Ok(EncounterInput::Admit {
                encounter_id,
                patient: event.patient,
                department,
            }),
            event_types::PATIENT_TRANSFERRED => Ok(EncounterInput::Transfer {
                encounter_id,
                department: department.ok_or_else(|| CorrelationError::missing_key(DEPARTMENT_KEYS))?,
            }),
            event_types::PATIENT_DISCHARGED => Ok(EncounterInput::Discharge { encounter_id }),
            other => Err(CorrelationError::unsupported(other)),
        }
    }

    fn evolve(mut state: EncounterState, event: EncounterEvent) -> EncounterState {
        match event {
            EncounterEvent::Admitted {
                patient,
                department,
            } => {
                state.status = EncounterStatus::Admitted;
                state.patient = Some(patient);
                state.department = department;
            }
            EncounterEvent::Transferred { department } => {
                state.status = EncounterStatus::Transferred;
                state.department = Some(department);
            }
            EncounterEvent::Discharged => state.status = EncounterStatus::Discharged,
        }
        state
    }

    fn decide(
        _now: OffsetDateTime,
        state: &EncounterState,
        input: &EncounterInput,
    ) -> Result<Decision<EncounterEvent, EncounterInput>, Rejection> {
        match (state.status, input) {
            (
                EncounterStatus::Expected,
                EncounterInput::Admit {
                    encounter_id,
                    patient,
                    department,
                },
            ) => Ok(Decision::event(EncounterEvent::Admitted {
                patient: *patient,
                department: department.clone(),
            })
            .with_notification(
                "patient.admitted",
                json!({ "encounterId": encounter_id, "patientId": patient, "departmentId": department }),
            )),

            (status, EncounterInput::Transfer { encounter_id, department }) if status.in_house() => {
                if state.department.as_deref() == Some(department.as_str()) {
                    return Err(Rejection::new(format!("already in department {department}")));
                }
                Ok(Decision::event(EncounterEvent::Transferred {
                    department: department.clone(),
                })
                .with_notification(
                    "patient.transferred",
                    json!({
                        "encounterId": encounter_id,
                        "patientId": state.patient,
                        "from": state.department,
                        "to": department,
                    }),
                ))
            }

            (status, EncounterInput::Discharge { encounter_id }) if status.in_house() => {
                Ok(Decision::event(EncounterEvent::Discharged)
                    .with_command(
                        Subsystem::Pharmacy,
                        "patient.discharged",
                        json!({ "encounterId": encounter_id, "patientId": state.patient }),
                    )
                    .with_notification(
                        "patient.discharged",
                        json!({ "encounterId": encounter_id, "patientId": state.patient }),
                    ))
            }

            (status, _) => Err(Rejection::new(format!(
                "input not accepted in {}",
                status.as_str()
            ))),
        }
    }

    fn is_terminal(state: &EncounterState) -> bool {
        state.status == EncounterStatus::Discharged
    }

    fn status(state: &EncounterState) -> &'static str {
        state.status.as_str()
    }
}
