//! Audit records and the sinks they are delivered to.
//!
//! Records are written to the store's audit queue in the same unit of work
//! as the transition they describe, then pushed to an [`AuditSink`] by the
//! audit worker. Delivery is retried with capped backoff and never gives up;
//! it never blocks workflow progress.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::event::{EventCategory, EventId};
use crate::identity::CanonicalId;
use crate::store::CommandId;
use crate::workflow::WorkflowRef;

/// What an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Transition,
    RejectedTransition,
    LateEvent,
    Uncorrelated,
    Unrouted,
    DeliveryExhausted,
    IdentityProvisioned,
    IdentityMerged,
    IdentityLinked,
    Cancelled,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Transition => "transition",
            AuditKind::RejectedTransition => "rejected_transition",
            AuditKind::LateEvent => "late_event",
            AuditKind::Uncorrelated => "uncorrelated",
            AuditKind::Unrouted => "unrouted",
            AuditKind::DeliveryExhausted => "delivery_exhausted",
            AuditKind::IdentityProvisioned => "identity_provisioned",
            AuditKind::IdentityMerged => "identity_merged",
            AuditKind::IdentityLinked => "identity_linked",
            AuditKind::Cancelled => "cancelled",
        }
    }
}

/// The event, command or actor that caused an audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AuditReference {
    Event(EventId),
    Command(CommandId),
    Timer(Uuid),
    Identity(CanonicalId),
    Operator(String),
}

/// An immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowRef>,
    pub reference: AuditReference,
    pub kind: AuditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resulting_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<EventCategory>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl AuditRecord {
    pub fn new(kind: AuditKind, reference: AuditReference) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow: None,
            reference,
            kind,
            resulting_state: None,
            detail: None,
            category: None,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_workflow(mut self, workflow: WorkflowRef) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.resulting_state = Some(state.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_category(mut self, category: EventCategory) -> Self {
        self.category = Some(category);
        self
    }
}

/// A queued audit record claimed for delivery.
#[derive(Debug, Clone)]
pub struct QueuedAudit {
    pub record: AuditRecord,
    /// Failed delivery attempts so far.
    pub attempts: u32,
}

/// Audit delivery failed; the record stays queued.
#[derive(Debug, thiserror::Error)]
#[error("audit sink unavailable: {0}")]
pub struct AuditSinkError(pub String);

/// Destination for audit records (the external audit collaborator).
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn emit(&self, record: &AuditRecord) -> Result<(), AuditSinkError>;
}

/// Writes audit records to the `clinhub::audit` tracing target.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, record: &AuditRecord) -> Result<(), AuditSinkError> {
        info!(
            target: "clinhub::audit",
            record_id = %record.id,
            kind = record.kind.as_str(),
            workflow = record.workflow.as_ref().map(ToString::to_string),
            resulting_state = record.resulting_state.as_deref(),
            stream = record.category.map(|c| c.stream()),
            detail = record.detail.as_deref(),
            "audit"
        );
        Ok(())
    }
}

/// Posts audit records as JSON to the audit collaborator.
#[derive(Debug, Clone)]
pub struct HttpAuditSink {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpAuditSink {
    pub fn new(endpoint: url::Url, timeout: Duration) -> Result<Self, AuditSinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuditSinkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn emit(&self, record: &AuditRecord) -> Result<(), AuditSinkError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(record)
            .send()
            .await
            .map_err(|e| AuditSinkError(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AuditSinkError(format!(
                "audit endpoint returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
