//! Outbox storage for outbound commands and scheduled timers.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditRecord;
use crate::identity::CanonicalId;
use crate::subsystem::Subsystem;
use crate::workflow::{WorkflowId, WorkflowRef};

/// Command identifier, also the idempotency key sent to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

impl CommandId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Deterministic id derived from a stable name (UUID v5).
    ///
    /// Re-deriving a command from the same input yields the same id, so the
    /// outbox insert stays idempotent across replays.
    pub fn derived(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for CommandId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Delivery state of an outbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting for its first attempt.
    Pending,
    /// Acknowledged by the target.
    Delivered,
    /// Last attempt failed; retried after backoff.
    Failed,
    /// Out of attempts or rejected by the target; needs an operator.
    Exhausted,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "exhausted" => Ok(DeliveryStatus::Exhausted),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// A command owned by the outbox until its target acknowledges it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub id: CommandId,
    /// Workflow instance that issued the command; `None` for forwarded events.
    pub workflow: Option<WorkflowRef>,
    pub patient: Option<CanonicalId>,
    pub target: Subsystem,
    pub action: String,
    pub payload: Value,
    pub status: DeliveryStatus,
    /// Delivery attempts made so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<OffsetDateTime>,
}

impl OutboundCommand {
    /// A new pending command.
    pub fn new(id: CommandId, target: Subsystem, action: impl Into<String>, payload: Value) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            workflow: None,
            patient: None,
            target,
            action: action.into(),
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            delivered_at: None,
        }
    }

    pub fn with_workflow(mut self, workflow: WorkflowRef) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn with_patient(mut self, patient: CanonicalId) -> Self {
        self.patient = Some(patient);
        self
    }

    /// Key receivers deduplicate on.
    pub fn idempotency_key(&self) -> String {
        self.id.to_string()
    }
}

/// Filter for listing outbound commands.
#[derive(Debug, Clone, Default)]
pub struct CommandQuery {
    pub status: Option<DeliveryStatus>,
    pub target: Option<Subsystem>,
    pub workflow_type: Option<String>,
    pub workflow_id: Option<WorkflowId>,
    pub limit: Option<u32>,
}

impl CommandQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn target(mut self, target: Subsystem) -> Self {
        self.target = Some(target);
        self
    }

    pub fn workflow(mut self, workflow: &WorkflowRef) -> Self {
        self.workflow_type = Some(workflow.workflow_type().to_string());
        self.workflow_id = Some(workflow.workflow_id().clone());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn matches(&self, command: &OutboundCommand) -> bool {
        if self.status.is_some_and(|s| s != command.status) {
            return false;
        }
        if self.target.is_some_and(|t| t != command.target) {
            return false;
        }
        match (&self.workflow_type, &command.workflow) {
            (Some(_), None) => return false,
            (Some(wanted), Some(wf)) if wanted != wf.workflow_type() => return false,
            _ => {}
        }
        match (&self.workflow_id, &command.workflow) {
            (Some(_), None) => false,
            (Some(wanted), Some(wf)) => wanted == wf.workflow_id(),
            _ => true,
        }
    }
}

/// A due timer claimed for processing.
#[derive(Debug, Clone)]
pub struct DueTimer {
    pub id: Uuid,
    pub workflow: WorkflowRef,
    /// The workflow input to apply, as JSON.
    pub input: Value,
    pub key: Option<String>,
    pub attempts: u32,
    pub fire_at: OffsetDateTime,
}

/// Storage operations for command delivery and timers.
///
/// # Locking Protocol
///
/// 1. `claim_command` atomically selects a deliverable command and locks it
///    for `lock_duration`
/// 2. exactly one of `mark_delivered`, `record_failure` or `mark_exhausted`
///    is called before the lock expires
/// 3. if a worker crashes, the lock expires and another worker claims it
///
/// Exhausted and delivered commands are never claimed again.
pub trait OutboxStore: Send + Sync + Clone + 'static {
    /// Write a command ahead of any delivery attempt.
    ///
    /// Insert-if-absent by id: returns `false` if the command already exists.
    fn enqueue_command(
        &self,
        command: OutboundCommand,
    ) -> impl Future<Output = crate::Result<bool>> + Send;

    /// Claim the next pending or failed command whose backoff has elapsed.
    fn claim_command(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> impl Future<Output = crate::Result<Option<OutboundCommand>>> + Send;

    /// Record an acknowledged delivery.
    fn mark_delivered(&self, id: CommandId) -> impl Future<Output = crate::Result<()>> + Send;

    /// Count a failed attempt and delay the next one by `backoff`.
    fn record_failure(
        &self,
        id: CommandId,
        error: &str,
        backoff: Duration,
    ) -> impl Future<Output = crate::Result<()>> + Send;

    /// Count a final failed attempt and stop retrying.
    ///
    /// `audit` is queued in the same atomic step.
    fn mark_exhausted(
        &self,
        id: CommandId,
        error: &str,
        audit: AuditRecord,
    ) -> impl Future<Output = crate::Result<()>> + Send;

    fn get_command(
        &self,
        id: CommandId,
    ) -> impl Future<Output = crate::Result<Option<OutboundCommand>>> + Send;

    /// Commands matching the query, oldest first.
    fn list_commands(
        &self,
        query: &CommandQuery,
    ) -> impl Future<Output = crate::Result<Vec<OutboundCommand>>> + Send;

    fn count_commands(
        &self,
        status: DeliveryStatus,
    ) -> impl Future<Output = crate::Result<u64>> + Send;

    /// Operator action: reset an exhausted command to pending with zero
    /// attempts. Returns `false` if it is missing or not exhausted.
    fn retry_exhausted(&self, id: CommandId) -> impl Future<Output = crate::Result<bool>> + Send;

    /// Claim the next timer with `fire_at <= now`.
    fn claim_timer(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> impl Future<Output = crate::Result<Option<DueTimer>>> + Send;

    /// Mark a claimed timer done.
    ///
    /// Re-arming a keyed timer gives it a new id, so a worker still holding
    /// the old claim changes nothing here.
    fn mark_timer_processed(&self, id: Uuid) -> impl Future<Output = crate::Result<()>> + Send;

    /// Same id rule as [`mark_timer_processed`](Self::mark_timer_processed).
    fn record_timer_failure(
        &self,
        id: Uuid,
        error: &str,
        backoff: Duration,
    ) -> impl Future<Output = crate::Result<()>> + Send;
}
