//! Inbound envelopes and the immutable clinical events built from them.
//!
//! A [`RawEnvelope`] is the wire shape accepted from a spoke. It is checked by
//! [`RawEnvelope::validate`] before anything is persisted; the router then
//! resolves the patient and journals the event, which assigns the
//! [`EventId`] and the per-source [`CausalToken`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::identity::CanonicalId;
use crate::subsystem::Subsystem;

const MAX_LOCAL_ID_LEN: usize = 128;
const MAX_EVENT_TYPE_LEN: usize = 64;
const MAX_SOURCE_EVENT_ID_LEN: usize = 128;

/// Well-known event type names.
pub mod event_types {
    pub const ORDER_PLACED: &str = "ORDER_PLACED";
    pub const ORDER_ACCEPTED: &str = "ORDER_ACCEPTED";
    pub const ORDER_REJECTED: &str = "ORDER_REJECTED";
    pub const ORDER_CANCELLED: &str = "ORDER_CANCELLED";
    pub const SPECIMEN_COLLECTED: &str = "SPECIMEN_COLLECTED";
    pub const RESULT_RECEIVED: &str = "RESULT_RECEIVED";
    pub const LAB_RESULT_READY: &str = "LAB_RESULT_READY";
    pub const IMAGE_RESULT_READY: &str = "IMAGE_RESULT_READY";

    pub const PRESCRIPTION_CREATED: &str = "PRESCRIPTION_CREATED";
    pub const PRESCRIPTION_CANCELLED: &str = "PRESCRIPTION_CANCELLED";
    pub const MEDICATION_DISPENSED: &str = "MEDICATION_DISPENSED";
    pub const DISPENSE_REJECTED: &str = "DISPENSE_REJECTED";

    pub const PATIENT_ADMITTED: &str = "PATIENT_ADMITTED";
    pub const PATIENT_TRANSFERRED: &str = "PATIENT_TRANSFERRED";
    pub const PATIENT_DISCHARGED: &str = "PATIENT_DISCHARGED";
}

/// Audit stream an event type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Patient,
    Clinical,
    Administrative,
}

impl EventCategory {
    pub fn of(event_type: &str) -> Self {
        use event_types::*;
        match event_type {
            PATIENT_ADMITTED | PATIENT_TRANSFERRED | PATIENT_DISCHARGED => EventCategory::Patient,
            PRESCRIPTION_CREATED | LAB_RESULT_READY | IMAGE_RESULT_READY => EventCategory::Clinical,
            _ => EventCategory::Administrative,
        }
    }

    /// Name of the audit stream records of this category are filed under.
    pub fn stream(&self) -> &'static str {
        match self {
            EventCategory::Patient => "patient-events",
            EventCategory::Clinical => "clinical-events",
            EventCategory::Administrative => "administrative-events",
        }
    }
}

/// Urgency attached to an event by its producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Optional producer metadata carried through to audit records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hospital_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub priority: Priority,
}

/// Envelope shape failures. Nothing is persisted when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    UnknownSubsystem(#[from] crate::subsystem::UnknownSubsystem),

    #[error("invalid occurred_at timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("payload must be a JSON object")]
    PayloadNotObject,

    #[error("invalid event type: {0}")]
    InvalidEventType(String),

    #[error("field {field} exceeds {max} characters")]
    FieldTooLong { field: &'static str, max: usize },
}

/// Inbound event envelope as received from a spoke.
///
/// Every field is optional on the wire so that a missing field is reported
/// as [`EnvelopeError::MissingField`] instead of a decoding failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEnvelope {
    pub source: Option<String>,
    pub local_patient_id: Option<String>,
    pub event_type: Option<String>,
    pub payload: Option<Value>,
    /// RFC 3339 timestamp of the clinical fact.
    pub occurred_at: Option<String>,
    /// Producer's own event id, used to make ingestion idempotent.
    pub source_event_id: Option<String>,
    pub metadata: Option<EventMetadata>,
}

impl RawEnvelope {
    /// Convenience constructor for the required fields.
    pub fn new(
        source: Subsystem,
        local_patient_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            source: Some(source.as_str().to_string()),
            local_patient_id: Some(local_patient_id.into()),
            event_type: Some(event_type.into()),
            payload: Some(payload),
            occurred_at: OffsetDateTime::now_utc().format(&Rfc3339).ok(),
            source_event_id: None,
            metadata: None,
        }
    }

    pub fn with_source_event_id(mut self, id: impl Into<String>) -> Self {
        self.source_event_id = Some(id.into());
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: impl Into<String>) -> Self {
        self.occurred_at = Some(occurred_at.into());
        self
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Check the envelope shape and normalize its fields.
    pub fn validate(&self) -> Result<ValidatedEnvelope, EnvelopeError> {
        let source: Subsystem = required(&self.source, "source")?.parse()?;

        let local_patient_id = required(&self.local_patient_id, "local_patient_id")?;
        check_len(local_patient_id, "local_patient_id", MAX_LOCAL_ID_LEN)?;

        let event_type = normalize_event_type(required(&self.event_type, "event_type")?)?;

        let payload = match &self.payload {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(value @ Value::Object(_)) => value.clone(),
            Some(_) => return Err(EnvelopeError::PayloadNotObject),
        };

        let occurred_at = required(&self.occurred_at, "occurred_at")?;
        let occurred_at = OffsetDateTime::parse(occurred_at, &Rfc3339)
            .map_err(|_| EnvelopeError::InvalidTimestamp(occurred_at.to_string()))?;

        let source_event_id = match self.source_event_id.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(id) => {
                check_len(id, "source_event_id", MAX_SOURCE_EVENT_ID_LEN)?;
                Some(id.to_string())
            }
        };

        Ok(ValidatedEnvelope {
            source,
            local_patient_id: local_patient_id.to_string(),
            event_type,
            payload,
            occurred_at: occurred_at.to_offset(time::UtcOffset::UTC),
            source_event_id,
            metadata: self.metadata.clone().unwrap_or_default(),
        })
    }
}

fn required<'a>(field: &'a Option<String>, name: &'static str) -> Result<&'a str, EnvelopeError> {
    match field.as_deref().map(str::trim) {
        None | Some("") => Err(EnvelopeError::MissingField(name)),
        Some(value) => Ok(value),
    }
}

fn check_len(value: &str, field: &'static str, max: usize) -> Result<(), EnvelopeError> {
    if value.chars().count() > max {
        return Err(EnvelopeError::FieldTooLong { field, max });
    }
    Ok(())
}

/// Normalize `OrderPlaced`, `order-placed` and `order_placed` to `ORDER_PLACED`.
fn normalize_event_type(raw: &str) -> Result<String, EnvelopeError> {
    let mut normalized = String::with_capacity(raw.len() + 4);
    let mut previous: Option<char> = None;
    for c in raw.chars() {
        match c {
            '-' | '.' | ' ' => normalized.push('_'),
            c if c.is_ascii_uppercase() => {
                if previous.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit()) {
                    normalized.push('_');
                }
                normalized.push(c);
            }
            c => normalized.push(c.to_ascii_uppercase()),
        }
        previous = Some(c);
    }

    let valid = !normalized.is_empty()
        && normalized
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(EnvelopeError::InvalidEventType(raw.to_string()));
    }
    check_len(&normalized, "event_type", MAX_EVENT_TYPE_LEN)?;
    Ok(normalized)
}

/// An envelope that passed shape validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEnvelope {
    pub source: Subsystem,
    pub local_patient_id: String,
    pub event_type: String,
    pub payload: Value,
    pub occurred_at: OffsetDateTime,
    pub source_event_id: Option<String>,
    pub metadata: EventMetadata,
}

impl ValidatedEnvelope {
    /// Build the immutable event once the journal assigned its identity.
    pub(crate) fn into_event(
        self,
        id: EventId,
        patient: CanonicalId,
        causal_token: CausalToken,
        received_at: OffsetDateTime,
    ) -> ClinicalEvent {
        ClinicalEvent {
            id,
            source: self.source,
            patient,
            local_patient_id: self.local_patient_id,
            event_type: self.event_type,
            payload: self.payload,
            occurred_at: self.occurred_at,
            received_at,
            causal_token,
            source_event_id: self.source_event_id,
            metadata: self.metadata,
        }
    }
}

/// Unique clinical event identifier (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Monotonic per-source ordering marker, independent of wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CausalToken(pub u64);

impl fmt::Display for CausalToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ingested, immutable clinical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalEvent {
    pub id: EventId,
    pub source: Subsystem,
    pub patient: CanonicalId,
    pub local_patient_id: String,
    pub event_type: String,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub causal_token: CausalToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<String>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl ClinicalEvent {
    /// First non-empty string (or number) found under any of `keys`.
    pub fn payload_str(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| match self.payload.get(*key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn category(&self) -> EventCategory {
        EventCategory::of(&self.event_type)
    }
}
