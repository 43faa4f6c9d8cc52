//! In-process store.
//!
//! Every table lives behind one `std::sync::Mutex` that is only held for
//! short synchronous sections, never across an `.await`. Per-instance
//! exclusivity comes from a `tokio::sync::Mutex` per workflow instance,
//! held by the unit of work until commit or drop. A unit of work buffers
//! its changes and applies them in a single critical section on commit, so
//! an uncommitted unit of work leaves no trace.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::journal::{AppendOutcome, EventJournal, JournalEntry, RouteStatus};
use super::outbox::{CommandId, CommandQuery, DeliveryStatus, DueTimer, OutboundCommand, OutboxStore};
use super::{
    AppliedInput, AuditQueue, BeginResult, DeadLetter, DeadLetterStore, HistoryEntry, InputMeta,
    InstanceQuery, InstanceSnapshot, RejectedTransition, Store, UnitOfWork, WorkflowInstanceSummary,
    WorkflowInstanceView, WorkflowQueryStore,
};
use crate::Timer;
use crate::audit::{AuditRecord, QueuedAudit};
use crate::error::{Error, Result};
use crate::event::{CausalToken, ClinicalEvent, EventId, ValidatedEnvelope};
use crate::identity::{
    CanonicalId, CanonicalIdentity, IdentityStore, LinkOutcome, LocalIdentifier, MergePlan,
    MergeRecord, ProvisionOutcome,
};
use crate::subsystem::Subsystem;
use crate::workflow::{WorkflowId, WorkflowRef};

const DEFAULT_LIST_LIMIT: u32 = 100;

type InstanceKey = (String, WorkflowId);

/// In-memory implementation of every store trait.
///
/// Cloning is cheap and clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    locks: Mutex<HashMap<InstanceKey, Arc<AsyncMutex<()>>>>,
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    identities: HashMap<CanonicalId, CanonicalIdentity>,
    links: HashMap<LocalIdentifier, CanonicalId>,
    merges: Vec<MergeRecord>,

    sequences: HashMap<Subsystem, u64>,
    journal: Vec<JournalEntry>,
    journal_index: HashMap<EventId, usize>,
    source_events: HashMap<(Subsystem, String), EventId>,

    instances: HashMap<InstanceKey, InstanceRow>,
    commands: Vec<CommandRow>,
    command_index: HashMap<CommandId, usize>,
    timers: Vec<TimerRow>,
    audit: Vec<AuditRow>,
    dead_letters: Vec<DeadLetter>,
}

struct InstanceRow {
    status: String,
    patient: Option<CanonicalId>,
    events: Vec<HistoryEntry>,
    applied: Vec<AppliedInput>,
    applied_ids: HashSet<String>,
    rejections: Vec<RejectedTransition>,
    watermarks: BTreeMap<Subsystem, CausalToken>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
    archived_at: Option<OffsetDateTime>,
}

impl InstanceRow {
    fn new(now: OffsetDateTime) -> Self {
        Self {
            status: String::new(),
            patient: None,
            events: Vec::new(),
            applied: Vec::new(),
            applied_ids: HashSet::new(),
            rejections: Vec::new(),
            watermarks: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            archived_at: None,
        }
    }

    fn mark_applied(&mut self, input: &InputMeta, now: OffsetDateTime) {
        if self.applied_ids.insert(input.input_id.clone()) {
            self.applied.push(AppliedInput {
                input_id: input.input_id.clone(),
                kind: input.kind,
                applied_at: now,
            });
        }
    }
}

struct CommandRow {
    command: OutboundCommand,
    available_at: OffsetDateTime,
}

struct TimerRow {
    id: Uuid,
    workflow: WorkflowRef,
    input: Value,
    key: Option<String>,
    fire_at: OffsetDateTime,
    attempts: u32,
    locked_until: Option<OffsetDateTime>,
    processed: bool,
}

struct AuditRow {
    record: AuditRecord,
    attempts: u32,
    available_at: OffsetDateTime,
    delivered: bool,
}

impl Tables {
    fn command_mut(&mut self, id: CommandId) -> Result<&mut CommandRow> {
        let index = *self
            .command_index
            .get(&id)
            .ok_or_else(|| Error::not_found("command", id))?;
        Ok(&mut self.commands[index])
    }

    fn insert_command(&mut self, command: OutboundCommand) -> bool {
        if self.command_index.contains_key(&command.id) {
            return false;
        }
        self.command_index.insert(command.id, self.commands.len());
        self.commands.push(CommandRow {
            available_at: command.created_at,
            command,
        });
        true
    }

    fn journal_mut(&mut self, id: EventId) -> Result<&mut JournalEntry> {
        let index = *self
            .journal_index
            .get(&id)
            .ok_or_else(|| Error::not_found("event", id))?;
        Ok(&mut self.journal[index])
    }

    /// Identity `id` ends up in after following its merges.
    fn survivor_of(&self, id: CanonicalId) -> CanonicalId {
        let mut current = id;
        while let Some(next) = self.identities.get(&current).and_then(|i| i.superseded_by) {
            if next == id {
                break;
            }
            current = next;
        }
        current
    }

    /// A timer re-armed under the same key gets a new id; the old id is gone.
    fn timer_mut(&mut self, id: Uuid) -> Option<&mut TimerRow> {
        self.timers.iter_mut().find(|timer| timer.id == id)
    }

    fn audit_mut(&mut self, id: Uuid) -> Result<&mut AuditRow> {
        self.audit
            .iter_mut()
            .find(|row| row.record.id == id)
            .ok_or_else(|| Error::not_found("audit record", id))
    }

    fn push_audit(&mut self, records: Vec<AuditRecord>, now: OffsetDateTime) {
        self.audit.extend(records.into_iter().map(|record| AuditRow {
            record,
            attempts: 0,
            available_at: now,
            delivered: false,
        }));
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.inner
            .tables
            .lock()
            .map_err(|_| Error::Corrupt("memory store lock poisoned".into()))
    }

    fn instance_lock(&self, key: &InstanceKey) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .map_err(|_| Error::Corrupt("memory store lock poisoned".into()))?;
        Ok(Arc::clone(locks.entry(key.clone()).or_default()))
    }
}

// ---------------------------------------------------------------------------
// Workflow instances
// ---------------------------------------------------------------------------

enum TimerOp {
    Schedule(Timer<Value>),
    Cancel(Vec<String>),
}

/// Buffered unit of work for [`MemoryStore`].
pub struct MemoryUnitOfWork {
    store: MemoryStore,
    key: InstanceKey,
    _guard: OwnedMutexGuard<()>,
    events: Vec<Value>,
    inputs: Vec<InputMeta>,
    rejections: Vec<(InputMeta, String, String)>,
    patient: Option<CanonicalId>,
    commands: Vec<OutboundCommand>,
    timer_ops: Vec<TimerOp>,
    audit: Vec<AuditRecord>,
    status: Option<String>,
    completed: bool,
}

impl Store for MemoryStore {
    type UnitOfWork<'a> = MemoryUnitOfWork;

    async fn begin<'a>(
        &'a self,
        workflow_type: &'static str,
        workflow_id: &WorkflowId,
        input_id: &str,
    ) -> Result<BeginResult<Self::UnitOfWork<'a>>> {
        let key = (workflow_type.to_string(), workflow_id.clone());
        let lock = self.instance_lock(&key)?;
        let guard = lock.lock_owned().await;

        let (events, snapshot) = {
            let tables = self.tables()?;
            match tables.instances.get(&key) {
                Some(row) if row.applied_ids.contains(input_id) => {
                    return Ok(BeginResult::AlreadyApplied);
                }
                Some(row) if row.completed_at.is_some() => {
                    return Ok(BeginResult::Completed {
                        status: row.status.clone(),
                    });
                }
                Some(row) => (
                    row.events.iter().map(|e| e.payload.clone()).collect(),
                    InstanceSnapshot {
                        exists: true,
                        patient: row.patient,
                        watermarks: row.watermarks.clone(),
                    },
                ),
                None => (Vec::new(), InstanceSnapshot::default()),
            }
        };

        Ok(BeginResult::Active {
            events,
            snapshot,
            uow: MemoryUnitOfWork {
                store: self.clone(),
                key,
                _guard: guard,
                events: Vec::new(),
                inputs: Vec::new(),
                rejections: Vec::new(),
                patient: None,
                commands: Vec::new(),
                timer_ops: Vec::new(),
                audit: Vec::new(),
                status: None,
                completed: false,
            },
        })
    }
}

impl UnitOfWork for MemoryUnitOfWork {
    async fn append_events<E, I>(&mut self, events: I) -> Result<()>
    where
        E: Serialize + Send,
        I: IntoIterator<Item = E> + Send,
    {
        for event in events {
            self.events.push(serde_json::to_value(&event)?);
        }
        Ok(())
    }

    async fn record_input(&mut self, input: &InputMeta) -> Result<()> {
        self.inputs.push(input.clone());
        Ok(())
    }

    async fn record_rejection(&mut self, input: &InputMeta, status: &str, reason: &str) -> Result<()> {
        self.rejections
            .push((input.clone(), status.to_string(), reason.to_string()));
        Ok(())
    }

    fn bind_patient(&mut self, patient: CanonicalId) {
        self.patient = Some(patient);
    }

    async fn enqueue_commands(&mut self, commands: Vec<OutboundCommand>) -> Result<()> {
        self.commands.extend(commands);
        Ok(())
    }

    async fn schedule_timers<T>(&mut self, timers: T) -> Result<()>
    where
        T: IntoIterator<Item = Timer<Value>> + Send,
    {
        self.timer_ops
            .extend(timers.into_iter().map(TimerOp::Schedule));
        Ok(())
    }

    async fn cancel_timers(&mut self, keys: Vec<String>) -> Result<()> {
        self.timer_ops.push(TimerOp::Cancel(keys));
        Ok(())
    }

    async fn timer_is_pending(&mut self, id: Uuid) -> Result<bool> {
        let workflow = WorkflowRef::new(self.key.0.clone(), self.key.1.clone());
        Ok(self
            .store
            .tables()?
            .timers
            .iter()
            .any(|t| t.id == id && !t.processed && t.workflow == workflow))
    }

    async fn emit_audit(&mut self, records: Vec<AuditRecord>) -> Result<()> {
        self.audit.extend(records);
        Ok(())
    }

    fn set_status(&mut self, status: &str) {
        self.status = Some(status.to_string());
    }

    fn mark_completed(&mut self) {
        self.completed = true;
    }

    async fn commit(self) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let store = self.store.clone();
        let mut tables = store.tables()?;
        let tables = &mut *tables;

        let workflow = WorkflowRef::new(self.key.0.clone(), self.key.1.clone());
        let row = tables
            .instances
            .entry(self.key.clone())
            .or_insert_with(|| InstanceRow::new(now));

        for payload in self.events {
            let sequence = row.events.len() as i64 + 1;
            row.events.push(HistoryEntry {
                sequence,
                payload,
                recorded_at: now,
            });
        }
        for input in &self.inputs {
            row.mark_applied(input, now);
            if let (Some(source), Some(token)) = (input.source, input.causal_token) {
                let watermark = row.watermarks.entry(source).or_insert(token);
                if token > *watermark {
                    *watermark = token;
                }
            }
        }
        for (input, status, reason) in &self.rejections {
            row.mark_applied(input, now);
            row.rejections.push(RejectedTransition {
                input_id: input.input_id.clone(),
                status: status.clone(),
                reason: reason.clone(),
                recorded_at: now,
            });
        }
        if row.patient.is_none() {
            row.patient = self.patient;
        }
        if let Some(status) = self.status {
            row.status = status;
        }
        if self.completed {
            row.completed_at = Some(now);
        }
        row.updated_at = now;
        let completed = self.completed;

        for command in self.commands {
            tables.insert_command(command);
        }

        for op in self.timer_ops {
            match op {
                TimerOp::Schedule(timer) => {
                    if let Some(key) = &timer.key {
                        tables.timers.retain(|t| {
                            t.processed || t.workflow != workflow || t.key.as_ref() != Some(key)
                        });
                    }
                    tables.timers.push(TimerRow {
                        id: Uuid::now_v7(),
                        workflow: workflow.clone(),
                        input: timer.input,
                        key: timer.key,
                        fire_at: timer.fire_at,
                        attempts: 0,
                        locked_until: None,
                        processed: false,
                    });
                }
                TimerOp::Cancel(keys) => {
                    tables.timers.retain(|t| {
                        t.processed
                            || t.workflow != workflow
                            || !t.key.as_ref().is_some_and(|k| keys.contains(k))
                    });
                }
            }
        }
        if completed {
            tables
                .timers
                .retain(|t| t.processed || t.workflow != workflow);
        }

        tables.push_audit(self.audit, now);
        Ok(())
    }
}

#[async_trait]
impl WorkflowQueryStore for MemoryStore {
    async fn load_instance(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowInstanceView>> {
        let tables = self.tables()?;
        let key = (workflow_type.to_string(), workflow_id.clone());
        Ok(tables.instances.get(&key).map(|row| WorkflowInstanceView {
            workflow: WorkflowRef::new(workflow_type, workflow_id.clone()),
            status: row.status.clone(),
            patient: row.patient,
            history: row.events.clone(),
            applied_inputs: row.applied.clone(),
            rejections: row.rejections.clone(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            archived_at: row.archived_at,
        }))
    }

    async fn list_instances(&self, query: &InstanceQuery) -> Result<Vec<WorkflowInstanceSummary>> {
        let tables = self.tables()?;
        let mut summaries: Vec<_> = tables
            .instances
            .iter()
            .filter(|(_, row)| row.archived_at.is_none())
            .filter(|((workflow_type, _), _)| {
                query.workflow_type.as_ref().is_none_or(|t| t == workflow_type)
            })
            .filter(|(_, row)| query.status.as_ref().is_none_or(|s| *s == row.status))
            .filter(|(_, row)| query.patient.is_none_or(|p| row.patient == Some(p)))
            .map(|((workflow_type, workflow_id), row)| WorkflowInstanceSummary {
                workflow: WorkflowRef::new(workflow_type.clone(), workflow_id.clone()),
                status: row.status.clone(),
                patient: row.patient,
                event_count: row.events.len() as i64,
                updated_at: row.updated_at,
                completed_at: row.completed_at,
            })
            .collect();

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let limit = if query.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            query.limit
        };
        Ok(summaries
            .into_iter()
            .skip(query.offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn archive_completed_before(&self, cutoff: OffsetDateTime) -> Result<u64> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables()?;
        let mut archived = 0;
        for row in tables.instances.values_mut() {
            if row.archived_at.is_none() && row.completed_at.is_some_and(|at| at < cutoff) {
                row.archived_at = Some(now);
                archived += 1;
            }
        }
        Ok(archived)
    }
}

// ---------------------------------------------------------------------------
// Outbox and timers
// ---------------------------------------------------------------------------

impl OutboxStore for MemoryStore {
    async fn enqueue_command(&self, command: OutboundCommand) -> Result<bool> {
        Ok(self.tables()?.insert_command(command))
    }

    async fn claim_command(
        &self,
        _worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<OutboundCommand>> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables()?;
        let row = tables.commands.iter_mut().find(|row| {
            matches!(
                row.command.status,
                DeliveryStatus::Pending | DeliveryStatus::Failed
            ) && row.available_at <= now
        });
        Ok(row.map(|row| {
            row.available_at = now + lock_duration;
            row.command.clone()
        }))
    }

    async fn mark_delivered(&self, id: CommandId) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables()?;
        let command = &mut tables.command_mut(id)?.command;
        command.attempts += 1;
        command.status = DeliveryStatus::Delivered;
        command.delivered_at = Some(now);
        command.updated_at = now;
        Ok(())
    }

    async fn record_failure(&self, id: CommandId, error: &str, backoff: Duration) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables()?;
        let row = tables.command_mut(id)?;
        row.command.attempts += 1;
        row.command.status = DeliveryStatus::Failed;
        row.command.last_error = Some(error.to_string());
        row.command.updated_at = now;
        row.available_at = now + backoff;
        Ok(())
    }

    async fn mark_exhausted(&self, id: CommandId, error: &str, audit: AuditRecord) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables()?;
        let command = &mut tables.command_mut(id)?.command;
        command.attempts += 1;
        command.status = DeliveryStatus::Exhausted;
        command.last_error = Some(error.to_string());
        command.updated_at = now;
        tables.push_audit(vec![audit], now);
        Ok(())
    }

    async fn get_command(&self, id: CommandId) -> Result<Option<OutboundCommand>> {
        let tables = self.tables()?;
        Ok(tables
            .command_index
            .get(&id)
            .map(|index| tables.commands[*index].command.clone()))
    }

    async fn list_commands(&self, query: &CommandQuery) -> Result<Vec<OutboundCommand>> {
        let tables = self.tables()?;
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT) as usize;
        Ok(tables
            .commands
            .iter()
            .map(|row| &row.command)
            .filter(|command| query.matches(command))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_commands(&self, status: DeliveryStatus) -> Result<u64> {
        let tables = self.tables()?;
        Ok(tables
            .commands
            .iter()
            .filter(|row| row.command.status == status)
            .count() as u64)
    }

    async fn retry_exhausted(&self, id: CommandId) -> Result<bool> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables()?;
        let Some(index) = tables.command_index.get(&id).copied() else {
            return Ok(false);
        };
        let row = &mut tables.commands[index];
        if row.command.status != DeliveryStatus::Exhausted {
            return Ok(false);
        }
        row.command.status = DeliveryStatus::Pending;
        row.command.attempts = 0;
        row.command.updated_at = now;
        row.available_at = now;
        Ok(true)
    }

    async fn claim_timer(&self, _worker_id: &str, lock_duration: Duration) -> Result<Option<DueTimer>> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables()?;
        let row = tables
            .timers
            .iter_mut()
            .filter(|t| !t.processed && t.fire_at <= now)
            .filter(|t| t.locked_until.is_none_or(|until| until <= now))
            .min_by_key(|t| t.fire_at);
        Ok(row.map(|row| {
            row.locked_until = Some(now + lock_duration);
            DueTimer {
                id: row.id,
                workflow: row.workflow.clone(),
                input: row.input.clone(),
                key: row.key.clone(),
                attempts: row.attempts,
                fire_at: row.fire_at,
            }
        }))
    }

    async fn mark_timer_processed(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables()?;
        if let Some(timer) = tables.timer_mut(id) {
            timer.processed = true;
        }
        Ok(())
    }

    async fn record_timer_failure(&self, id: Uuid, _error: &str, backoff: Duration) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables()?;
        if let Some(timer) = tables.timer_mut(id) {
            timer.attempts += 1;
            timer.locked_until = Some(now + backoff);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

impl EventJournal for MemoryStore {
    async fn append(&self, envelope: ValidatedEnvelope, patient: CanonicalId) -> Result<AppendOutcome> {
        let mut tables = self.tables()?;

        if let Some(source_event_id) = &envelope.source_event_id {
            let key = (envelope.source, source_event_id.clone());
            if let Some(existing) = tables.source_events.get(&key).copied() {
                let event = tables.journal_mut(existing)?.event.clone();
                return Ok(AppendOutcome::Existing(event));
            }
        }

        let sequence = tables.sequences.entry(envelope.source).or_insert(0);
        *sequence += 1;
        let token = CausalToken(*sequence);

        let id = EventId::generate();
        let source_key = envelope
            .source_event_id
            .clone()
            .map(|sid| (envelope.source, sid));
        let event = envelope.into_event(id, patient, token, OffsetDateTime::now_utc());

        if let Some(key) = source_key {
            tables.source_events.insert(key, id);
        }
        let index = tables.journal.len();
        tables.journal_index.insert(id, index);
        tables.journal.push(JournalEntry {
            event: event.clone(),
            status: RouteStatus::Pending,
            routed_at: None,
        });

        Ok(AppendOutcome::Appended(event))
    }

    async fn mark_routed(&self, id: EventId) -> Result<()> {
        let mut tables = self.tables()?;
        let entry = tables.journal_mut(id)?;
        entry.status = RouteStatus::Routed;
        entry.routed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn mark_unrouted(&self, id: EventId) -> Result<()> {
        let mut tables = self.tables()?;
        let entry = tables.journal_mut(id)?;
        entry.status = RouteStatus::Unrouted;
        entry.routed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn pending_events(&self, limit: u32) -> Result<Vec<ClinicalEvent>> {
        let tables = self.tables()?;
        Ok(tables
            .journal
            .iter()
            .filter(|entry| entry.status == RouteStatus::Pending)
            .take(limit as usize)
            .map(|entry| entry.event.clone())
            .collect())
    }

    async fn pending_before(&self, patient: CanonicalId, event: EventId, limit: u32) -> Result<Vec<ClinicalEvent>> {
        let tables = self.tables()?;
        let end = tables
            .journal_index
            .get(&event)
            .copied()
            .unwrap_or(tables.journal.len());
        let survivor = tables.survivor_of(patient);
        Ok(tables.journal[..end]
            .iter()
            .filter(|entry| {
                entry.status == RouteStatus::Pending && tables.survivor_of(entry.event.patient) == survivor
            })
            .take(limit as usize)
            .map(|entry| entry.event.clone())
            .collect())
    }

    async fn load_event(&self, id: EventId) -> Result<Option<JournalEntry>> {
        let tables = self.tables()?;
        Ok(tables
            .journal_index
            .get(&id)
            .map(|index| tables.journal[*index].clone()))
    }

    async fn list_unrouted(&self, limit: u32) -> Result<Vec<ClinicalEvent>> {
        let tables = self.tables()?;
        Ok(tables
            .journal
            .iter()
            .rev()
            .filter(|entry| entry.status == RouteStatus::Unrouted)
            .take(limit as usize)
            .map(|entry| entry.event.clone())
            .collect())
    }

    async fn count_events(&self, status: RouteStatus) -> Result<u64> {
        let tables = self.tables()?;
        Ok(tables
            .journal
            .iter()
            .filter(|entry| entry.status == status)
            .count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Identity map
// ---------------------------------------------------------------------------

impl IdentityStore for MemoryStore {
    async fn find_local(&self, local: &LocalIdentifier) -> Result<Option<CanonicalId>> {
        Ok(self.tables()?.links.get(local).copied())
    }

    async fn load_identity(&self, id: CanonicalId) -> Result<Option<CanonicalIdentity>> {
        Ok(self.tables()?.identities.get(&id).cloned())
    }

    async fn provision(
        &self,
        local: &LocalIdentifier,
        id: CanonicalId,
        created_at: OffsetDateTime,
        audit: AuditRecord,
    ) -> Result<ProvisionOutcome> {
        let mut tables = self.tables()?;
        if let Some(existing) = tables.links.get(local) {
            return Ok(ProvisionOutcome::Existing(*existing));
        }

        let identity = CanonicalIdentity {
            id,
            created_at,
            identifiers: [local.clone()].into_iter().collect(),
            superseded_by: None,
            version: 0,
        };
        tables.links.insert(local.clone(), id);
        tables.identities.insert(id, identity.clone());
        tables.push_audit(vec![audit], OffsetDateTime::now_utc());
        Ok(ProvisionOutcome::Created(identity))
    }

    async fn link(&self, local: &LocalIdentifier, id: CanonicalId, audit: AuditRecord) -> Result<LinkOutcome> {
        let mut tables = self.tables()?;
        if let Some(existing) = tables.links.get(local) {
            return Ok(LinkOutcome::AlreadyLinked(*existing));
        }

        let identity = tables
            .identities
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownCanonicalIdentity(id.to_string()))?;
        if identity.is_superseded() {
            return Ok(LinkOutcome::TargetSuperseded);
        }
        identity.identifiers.insert(local.clone());
        identity.version += 1;
        tables.links.insert(local.clone(), id);
        tables.push_audit(vec![audit], OffsetDateTime::now_utc());
        Ok(LinkOutcome::Linked)
    }

    async fn commit_merge(&self, plan: &MergePlan, audit: AuditRecord) -> Result<bool> {
        let mut tables = self.tables()?;

        let current = |id: CanonicalId, version: u64, tables: &Tables| {
            tables
                .identities
                .get(&id)
                .is_some_and(|i| i.version == version && !i.is_superseded())
        };
        if !current(plan.survivor, plan.survivor_version, &tables)
            || !current(plan.superseded, plan.superseded_version, &tables)
        {
            return Ok(false);
        }

        let inherited = match tables.identities.get_mut(&plan.superseded) {
            Some(superseded) => {
                superseded.superseded_by = Some(plan.survivor);
                superseded.version += 1;
                superseded.identifiers.clone()
            }
            None => return Ok(false),
        };
        if let Some(survivor) = tables.identities.get_mut(&plan.survivor) {
            survivor.identifiers.extend(inherited);
            survivor.version += 1;
        }
        tables.merges.push(MergeRecord {
            survivor: plan.survivor,
            superseded: plan.superseded,
            merged_at: plan.merged_at,
        });
        tables.push_audit(vec![audit], OffsetDateTime::now_utc());
        Ok(true)
    }

    async fn merge_history(&self, id: CanonicalId) -> Result<Vec<MergeRecord>> {
        Ok(self
            .tables()?
            .merges
            .iter()
            .filter(|record| record.survivor == id || record.superseded == id)
            .cloned()
            .collect())
    }

    async fn count_identities(&self) -> Result<u64> {
        Ok(self
            .tables()?
            .identities
            .values()
            .filter(|identity| !identity.is_superseded())
            .count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Audit queue and dead letters
// ---------------------------------------------------------------------------

impl AuditQueue for MemoryStore {
    async fn enqueue_audit(&self, records: Vec<AuditRecord>) -> Result<()> {
        self.tables()?.push_audit(records, OffsetDateTime::now_utc());
        Ok(())
    }

    async fn claim_audit(&self, _worker_id: &str, lock_duration: Duration) -> Result<Option<QueuedAudit>> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables()?;
        let row = tables
            .audit
            .iter_mut()
            .find(|row| !row.delivered && row.available_at <= now);
        Ok(row.map(|row| {
            row.available_at = now + lock_duration;
            QueuedAudit {
                record: row.record.clone(),
                attempts: row.attempts,
            }
        }))
    }

    async fn mark_audit_delivered(&self, id: Uuid) -> Result<()> {
        self.tables()?.audit_mut(id)?.delivered = true;
        Ok(())
    }

    async fn record_audit_failure(&self, id: Uuid, _error: &str, backoff: Duration) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables()?;
        let row = tables.audit_mut(id)?;
        row.attempts += 1;
        row.available_at = now + backoff;
        Ok(())
    }

    async fn count_pending_audit(&self) -> Result<u64> {
        Ok(self.tables()?.audit.iter().filter(|row| !row.delivered).count() as u64)
    }
}

impl DeadLetterStore for MemoryStore {
    async fn record_dead_letter(&self, letter: DeadLetter, audit: AuditRecord) -> Result<bool> {
        let mut tables = self.tables()?;
        let duplicate = tables
            .dead_letters
            .iter()
            .any(|l| l.workflow_type == letter.workflow_type && l.input_id == letter.input_id);
        if duplicate {
            return Ok(false);
        }
        tables.dead_letters.push(letter);
        tables.push_audit(vec![audit], OffsetDateTime::now_utc());
        Ok(true)
    }

    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>> {
        Ok(self
            .tables()?
            .dead_letters
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count_dead_letters(&self) -> Result<u64> {
        Ok(self.tables()?.dead_letters.len() as u64)
    }
}
