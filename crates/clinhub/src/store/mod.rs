//! Storage abstraction for the hub.
//!
//! The router's write-ahead journal, workflow instances, the outbox, the
//! identity map and the audit queue all live behind one store type so that
//! a transition, its commands and its audit records commit atomically.
//!
//! - [`MemoryStore`]: in-process storage, used by default and in tests
//! - [`PgStore`]: PostgreSQL storage (requires the `postgres` feature)

mod journal;
mod memory;
mod outbox;
#[cfg(feature = "postgres")]
mod postgres;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

pub use journal::{AppendOutcome, EventJournal, JournalEntry, RouteStatus};
pub use memory::MemoryStore;
pub use outbox::{CommandId, CommandQuery, DeliveryStatus, DueTimer, OutboundCommand, OutboxStore};
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use crate::audit::{AuditRecord, QueuedAudit};
use crate::error::Result;
use crate::event::{CausalToken, EventId};
use crate::identity::{CanonicalId, IdentityStore};
use crate::subsystem::Subsystem;
use crate::workflow::{WorkflowId, WorkflowRef};

/// How an input reached a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Event,
    Timer,
    Cancellation,
}

/// Identity and ordering metadata of an input applied to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMeta {
    /// Unique per input: the event id, timer id or cancellation id.
    pub input_id: String,
    pub kind: InputKind,
    pub source: Option<Subsystem>,
    pub causal_token: Option<CausalToken>,
    pub patient: Option<CanonicalId>,
}

impl InputMeta {
    pub fn event(id: EventId, source: Subsystem, token: CausalToken, patient: CanonicalId) -> Self {
        Self {
            input_id: id.to_string(),
            kind: InputKind::Event,
            source: Some(source),
            causal_token: Some(token),
            patient: Some(patient),
        }
    }

    pub fn timer(id: Uuid) -> Self {
        Self {
            input_id: format!("timer:{id}"),
            kind: InputKind::Timer,
            source: None,
            causal_token: None,
            patient: None,
        }
    }

    pub fn cancellation(id: Uuid) -> Self {
        Self {
            input_id: format!("cancel:{id}"),
            kind: InputKind::Cancellation,
            source: None,
            causal_token: None,
            patient: None,
        }
    }
}

/// A transition the state machine refused. The instance state is unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedTransition {
    pub input_id: String,
    pub status: String,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Instance data loaded with the lock, needed to decide.
#[derive(Debug, Clone, Default)]
pub struct InstanceSnapshot {
    /// Whether the instance was persisted before.
    pub exists: bool,
    /// Patient bound to the instance, if any.
    pub patient: Option<CanonicalId>,
    /// Highest applied causal token per source.
    pub watermarks: BTreeMap<Subsystem, CausalToken>,
}

/// Result of beginning a unit of work.
pub enum BeginResult<U> {
    /// The instance is active (or new) and locked.
    Active {
        /// Existing events for replay.
        events: Vec<Value>,
        snapshot: InstanceSnapshot,
        uow: U,
    },
    /// The input was applied (or rejected) before. No lock held.
    AlreadyApplied,
    /// The instance reached a terminal state. No lock held.
    Completed { status: String },
}

/// One event in an instance's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sequence: i64,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// An input applied to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedInput {
    pub input_id: String,
    pub kind: InputKind,
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
}

/// Full view of a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstanceView {
    pub workflow: WorkflowRef,
    pub status: String,
    pub patient: Option<CanonicalId>,
    pub history: Vec<HistoryEntry>,
    pub applied_inputs: Vec<AppliedInput>,
    pub rejections: Vec<RejectedTransition>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub archived_at: Option<OffsetDateTime>,
}

/// Summary of a workflow instance for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstanceSummary {
    pub workflow: WorkflowRef,
    pub status: String,
    pub patient: Option<CanonicalId>,
    pub event_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// Filter for listing workflow instances. Archived instances are excluded.
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    pub workflow_type: Option<String>,
    pub status: Option<String>,
    pub patient: Option<CanonicalId>,
    pub limit: u32,
    pub offset: u32,
}

/// Why an input ended up in the dead-letter path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The target instance is already terminal.
    LateEvent,
    /// The event could not be mapped to an instance.
    Uncorrelated,
    /// The first input for an instance was refused; no instance exists.
    Rejected,
}

/// An input that could not be applied to any instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub workflow_type: String,
    pub workflow_id: Option<WorkflowId>,
    pub input_id: String,
    pub reason: DeadLetterReason,
    pub detail: String,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Storage backend for workflow instances.
///
/// [`Store::begin`] acquires an exclusive lock on the instance, so exactly
/// one transition is applied per instance at a time.
pub trait Store: Send + Sync + Clone + 'static {
    /// The unit of work type returned by this store.
    type UnitOfWork<'a>: UnitOfWork + Send
    where
        Self: 'a;

    /// Begin a unit of work for applying `input_id` to an instance.
    ///
    /// Checks, in order and under the instance lock: whether `input_id` was
    /// already applied, whether the instance is terminal, then loads the
    /// history for replay. The lock is held until the unit of work is
    /// committed or dropped.
    fn begin<'a>(
        &'a self,
        workflow_type: &'static str,
        workflow_id: &WorkflowId,
        input_id: &str,
    ) -> impl Future<Output = Result<BeginResult<Self::UnitOfWork<'a>>>> + Send;
}

/// A transactional unit of work for a single workflow instance.
///
/// Changes are only persisted when [`commit`](Self::commit) is called;
/// dropping the unit of work rolls everything back.
pub trait UnitOfWork: Send {
    /// Append events to the instance history.
    fn append_events<E, I>(&mut self, events: I) -> impl Future<Output = Result<()>> + Send
    where
        E: Serialize + Send,
        I: IntoIterator<Item = E> + Send;

    /// Record the input as applied and advance its source watermark.
    fn record_input(&mut self, input: &InputMeta) -> impl Future<Output = Result<()>> + Send;

    /// Record a rejected transition. The input counts as applied.
    fn record_rejection(
        &mut self,
        input: &InputMeta,
        status: &str,
        reason: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Associate the instance with a patient if it has none yet.
    fn bind_patient(&mut self, patient: CanonicalId);

    /// Write commands to the outbox. Existing ids are skipped.
    fn enqueue_commands(
        &mut self,
        commands: Vec<OutboundCommand>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Schedule timers. A keyed timer replaces the pending one with that key.
    fn schedule_timers<T>(&mut self, timers: T) -> impl Future<Output = Result<()>> + Send
    where
        T: IntoIterator<Item = crate::Timer<Value>> + Send;

    /// Cancel pending timers by key.
    fn cancel_timers(&mut self, keys: Vec<String>) -> impl Future<Output = Result<()>> + Send;

    /// Whether timer `id` of this instance is still pending.
    ///
    /// `false` once it was cancelled, dropped on completion or replaced by a
    /// re-armed timer with the same key.
    fn timer_is_pending(&mut self, id: Uuid) -> impl Future<Output = Result<bool>> + Send;

    /// Queue audit records for delivery.
    fn emit_audit(&mut self, records: Vec<AuditRecord>) -> impl Future<Output = Result<()>> + Send;

    /// Set the status reported by queries.
    fn set_status(&mut self, status: &str);

    /// Mark the instance terminal. Its pending timers are dropped on commit.
    fn mark_completed(&mut self);

    /// Commit, persisting all changes and releasing the lock.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}

/// Query-only operations on workflow instances.
#[async_trait]
pub trait WorkflowQueryStore: Send + Sync + Clone + 'static {
    async fn load_instance(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowInstanceView>>;

    async fn list_instances(&self, query: &InstanceQuery) -> Result<Vec<WorkflowInstanceSummary>>;

    /// Archive terminal instances completed before `cutoff`.
    ///
    /// Returns the number of instances archived.
    async fn archive_completed_before(&self, cutoff: OffsetDateTime) -> Result<u64>;
}

/// Queue of audit records awaiting delivery to the audit sink.
pub trait AuditQueue: Send + Sync + Clone + 'static {
    /// Queue records outside of a workflow unit of work.
    fn enqueue_audit(&self, records: Vec<AuditRecord>) -> impl Future<Output = Result<()>> + Send;

    /// Claim the oldest deliverable record.
    fn claim_audit(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> impl Future<Output = Result<Option<QueuedAudit>>> + Send;

    fn mark_audit_delivered(&self, id: Uuid) -> impl Future<Output = Result<()>> + Send;

    fn record_audit_failure(
        &self,
        id: Uuid,
        error: &str,
        backoff: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    fn count_pending_audit(&self) -> impl Future<Output = Result<u64>> + Send;
}

/// Inputs that could not be applied.
pub trait DeadLetterStore: Send + Sync + Clone + 'static {
    /// Record a dead letter and its audit record atomically.
    ///
    /// A second letter for the same `(workflow_type, input_id)` is ignored,
    /// along with its audit record. Returns `true` if recorded.
    fn record_dead_letter(
        &self,
        letter: DeadLetter,
        audit: AuditRecord,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Most recent first.
    fn list_dead_letters(&self, limit: u32) -> impl Future<Output = Result<Vec<DeadLetter>>> + Send;

    fn count_dead_letters(&self) -> impl Future<Output = Result<u64>> + Send;
}

/// Everything the hub needs from a backend.
pub trait HubStore:
    Store + WorkflowQueryStore + OutboxStore + EventJournal + IdentityStore + AuditQueue + DeadLetterStore
{
}

impl<T> HubStore for T where
    T: Store
        + WorkflowQueryStore
        + OutboxStore
        + EventJournal
        + IdentityStore
        + AuditQueue
        + DeadLetterStore
{
}
