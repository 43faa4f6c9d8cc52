//! PostgreSQL store implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use time::OffsetDateTime;
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

/// PostgreSQL-backed store for production use.
///
/// Uses row-level locking via `SELECT ... FOR UPDATE` on the
/// `workflow_instances` table for per-instance exclusivity. The lock is held
/// for the duration of the unit of work's transaction, which also carries
/// the instance's outbox commands, timers and audit records.
///
/// # Database Schema
///
/// Requires the tables created by `migrations/` in the `clinhub` schema:
///
/// | Table                  | Purpose                                          |
/// |------------------------|--------------------------------------------------|
/// | `identities`           | Canonical identities and supersede links         |
/// | `identity_links`       | Local identifier to canonical identity map       |
/// | `identity_merges`      | Append-only merge history                        |
/// | `journal`              | Write-ahead journal of accepted events           |
/// | `workflow_instances`   | Row-level locking, status, watermarks            |
/// | `workflow_events`      | Append-only instance history                     |
/// | `applied_inputs`       | Idempotency record of applied inputs             |
/// | `rejected_transitions` | Inputs the state machine refused                 |
/// | `outbox`               | Outbound commands                                |
/// | `timers`               | Scheduled workflow inputs                        |
/// | `audit_outbox`         | Audit records awaiting the audit sink            |
/// | `dead_letters`         | Late and uncorrelated inputs                     |
///
/// # Concurrency
///
/// Different workflow instances execute concurrently (different rows); the
/// same instance is serialized. Outbox, timer and audit rows are claimed with
/// `FOR UPDATE SKIP LOCKED` so several hub processes can share one database.
///
/// # Example
///
/// ```ignore
/// use clinhub::{Hub, PgStore};
///
/// let store = PgStore::connect("postgres://...").await?;
/// store.migrate().await?;
/// let hub = Hub::builder(store).with_clinical_workflows().transport(transport).build()?;
/// ```
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool to `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_history(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        workflow_type: &str,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<HistoryEntry>> {
        let rows: Vec<(i64, Value, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT sequence, payload, recorded_at
            FROM clinhub.workflow_events
            WHERE workflow_type = $1 AND workflow_id = $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(workflow_type)
        .bind(workflow_id.as_str())
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(sequence, payload, recorded_at)| HistoryEntry {
                sequence,
                payload,
                recorded_at,
            })
            .collect())
    }

    async fn identifiers_of(&self, id: CanonicalId) -> Result<BTreeSet<LocalIdentifier>> {
        // An identity owns its own links plus those of every identity merged into it.
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            WITH RECURSIVE merged(id) AS (
                SELECT $1::uuid
                UNION
                SELECT i.id FROM clinhub.identities i JOIN merged m ON i.superseded_by = m.id
            )
            SELECT subsystem, local_id
            FROM clinhub.identity_links
            WHERE identity_id IN (SELECT id FROM merged)
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(subsystem, local_id)| Ok(LocalIdentifier::new(parse_subsystem(&subsystem)?, local_id)))
            .collect()
    }
}

fn parse_subsystem(value: &str) -> Result<Subsystem> {
    value
        .parse()
        .map_err(|e| Error::Corrupt(format!("{e} in stored row")))
}

/// Decode a unit enum stored as its serde name.
fn from_text<T: DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_value(Value::String(value.to_string()))
        .map_err(|e| Error::Corrupt(format!("unexpected stored value {value:?}: {e}")))
}

/// Encode a unit enum as its serde name.
fn to_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(Error::Corrupt(format!("expected a string encoding, got {other}"))),
    }
}

fn workflow_ref(workflow_type: Option<String>, workflow_id: Option<String>) -> Option<WorkflowRef> {
    match (workflow_type, workflow_id) {
        (Some(t), Some(id)) => Some(WorkflowRef::new(t, id)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Workflow instances
// ---------------------------------------------------------------------------

impl Store for PgStore {
    type UnitOfWork<'a> = PgUnitOfWork<'a>;

    async fn begin<'a>(
        &'a self,
        workflow_type: &'static str,
        workflow_id: &WorkflowId,
        input_id: &str,
    ) -> Result<BeginResult<Self::UnitOfWork<'a>>> {
        let mut tx = self.pool.begin().await?;
        let workflow_id_str = workflow_id.as_str();

        // Ensure the instance row exists (rolled back with the transaction if
        // nothing is committed).
        let created = sqlx::query(
            r#"INSERT INTO clinhub.workflow_instances (workflow_type, workflow_id)
               VALUES ($1, $2)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(workflow_type)
        .bind(workflow_id_str)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        // Acquire row-level lock
        let (status, patient, watermarks, completed_at): (String, Option<Uuid>, Value, Option<OffsetDateTime>) =
            sqlx::query_as(
                r#"SELECT status, patient, watermarks, completed_at
                   FROM clinhub.workflow_instances
                   WHERE workflow_type = $1 AND workflow_id = $2
                   FOR UPDATE"#,
            )
            .bind(workflow_type)
            .bind(workflow_id_str)
            .fetch_one(&mut *tx)
            .await?;

        let applied: Option<i32> = sqlx::query_scalar(
            r#"SELECT 1 FROM clinhub.applied_inputs
               WHERE workflow_type = $1 AND workflow_id = $2 AND input_id = $3"#,
        )
        .bind(workflow_type)
        .bind(workflow_id_str)
        .bind(input_id)
        .fetch_optional(&mut *tx)
        .await?;

        // Early returns drop the transaction, releasing the lock
        if applied.is_some() {
            return Ok(BeginResult::AlreadyApplied);
        }
        if completed_at.is_some() {
            return Ok(BeginResult::Completed { status });
        }

        let watermarks: BTreeMap<Subsystem, CausalToken> = serde_json::from_value(watermarks)
            .map_err(|e| Error::Corrupt(format!("watermarks of {workflow_type}:{workflow_id}: {e}")))?;
        let history = self.load_history(&mut tx, workflow_type, workflow_id).await?;
        let next_sequence = history.len() as i64 + 1;

        let snapshot = InstanceSnapshot {
            exists: !created,
            patient: patient.map(CanonicalId::from_uuid),
            watermarks: watermarks.clone(),
        };

        let uow = PgUnitOfWork {
            tx,
            workflow_type,
            workflow_id: workflow_id_str.to_owned(),
            next_sequence,
            events_appended: 0,
            watermarks,
            patient: None,
            status: None,
            is_completed: false,
        };

        Ok(BeginResult::Active {
            events: history.into_iter().map(|entry| entry.payload).collect(),
            snapshot,
            uow,
        })
    }
}

/// PostgreSQL unit of work.
///
/// Wraps a transaction with the instance row lock held until commit.
pub struct PgUnitOfWork<'a> {
    tx: Transaction<'a, Postgres>,
    workflow_type: &'static str,
    workflow_id: String,
    next_sequence: i64,
    events_appended: i64,
    watermarks: BTreeMap<Subsystem, CausalToken>,
    patient: Option<CanonicalId>,
    status: Option<String>,
    is_completed: bool,
}

impl PgUnitOfWork<'_> {
    async fn insert_applied(&mut self, input: &InputMeta) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO clinhub.applied_inputs (workflow_type, workflow_id, input_id, kind)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(self.workflow_type)
        .bind(&self.workflow_id)
        .bind(&input.input_id)
        .bind(to_text(&input.kind)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}

impl UnitOfWork for PgUnitOfWork<'_> {
    async fn append_events<E, I>(&mut self, events: I) -> Result<()>
    where
        E: Serialize + Send,
        I: IntoIterator<Item = E> + Send,
    {
        // Collect to avoid holding iterator across await
        let events: Vec<_> = events.into_iter().collect();
        for event in events {
            let payload = serde_json::to_value(&event)?;

            sqlx::query(
                r#"INSERT INTO clinhub.workflow_events (workflow_type, workflow_id, sequence, payload)
                   VALUES ($1, $2, $3, $4)"#,
            )
            .bind(self.workflow_type)
            .bind(&self.workflow_id)
            .bind(self.next_sequence)
            .bind(payload)
            .execute(&mut *self.tx)
            .await?;

            self.next_sequence += 1;
            self.events_appended += 1;
        }
        Ok(())
    }

    async fn record_input(&mut self, input: &InputMeta) -> Result<()> {
        self.insert_applied(input).await?;
        if let (Some(source), Some(token)) = (input.source, input.causal_token) {
            let watermark = self.watermarks.entry(source).or_insert(token);
            if token > *watermark {
                *watermark = token;
            }
        }
        Ok(())
    }

    async fn record_rejection(&mut self, input: &InputMeta, status: &str, reason: &str) -> Result<()> {
        self.insert_applied(input).await?;
        sqlx::query(
            r#"INSERT INTO clinhub.rejected_transitions (workflow_type, workflow_id, input_id, status, reason)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(self.workflow_type)
        .bind(&self.workflow_id)
        .bind(&input.input_id)
        .bind(status)
        .bind(reason)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    fn bind_patient(&mut self, patient: CanonicalId) {
        self.patient = Some(patient);
    }

    async fn enqueue_commands(&mut self, commands: Vec<OutboundCommand>) -> Result<()> {
        for command in &commands {
            insert_command(&mut *self.tx, command).await?;
        }
        Ok(())
    }

    async fn schedule_timers<T>(&mut self, timers: T) -> Result<()>
    where
        T: IntoIterator<Item = Timer<Value>> + Send,
    {
        // Collect to avoid holding iterator across await
        let timers: Vec<_> = timers.into_iter().collect();
        for timer in timers {
            if let Some(key) = &timer.key {
                // Keyed timer: replace the pending timer with the same key
                sqlx::query(
                    r#"INSERT INTO clinhub.timers (id, workflow_type, workflow_id, fire_at, input, key)
                       VALUES ($1, $2, $3, $4, $5, $6)
                       ON CONFLICT (workflow_type, workflow_id, key)
                       WHERE key IS NOT NULL AND processed_at IS NULL
                       DO UPDATE SET id = EXCLUDED.id, fire_at = EXCLUDED.fire_at,
                                     input = EXCLUDED.input, attempts = 0, last_error = NULL,
                                     locked_until = NULL, locked_by = NULL, created_at = now()"#,
                )
                .bind(Uuid::now_v7())
                .bind(self.workflow_type)
                .bind(&self.workflow_id)
                .bind(timer.fire_at)
                .bind(&timer.input)
                .bind(key)
                .execute(&mut *self.tx)
                .await?;
            } else {
                sqlx::query(
                    r#"INSERT INTO clinhub.timers (id, workflow_type, workflow_id, fire_at, input)
                       VALUES ($1, $2, $3, $4, $5)"#,
                )
                .bind(Uuid::now_v7())
                .bind(self.workflow_type)
                .bind(&self.workflow_id)
                .bind(timer.fire_at)
                .bind(&timer.input)
                .execute(&mut *self.tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn cancel_timers(&mut self, keys: Vec<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE clinhub.timers
            SET processed_at = now(),
                locked_until = NULL,
                locked_by = NULL
            WHERE workflow_type = $1
              AND workflow_id = $2
              AND processed_at IS NULL
              AND key = ANY($3)
            "#,
        )
        .bind(self.workflow_type)
        .bind(&self.workflow_id)
        .bind(&keys)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn timer_is_pending(&mut self, id: Uuid) -> Result<bool> {
        let pending: Option<i32> = sqlx::query_scalar(
            r#"SELECT 1 FROM clinhub.timers
               WHERE id = $1 AND workflow_type = $2 AND workflow_id = $3 AND processed_at IS NULL"#,
        )
        .bind(id)
        .bind(self.workflow_type)
        .bind(&self.workflow_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(pending.is_some())
    }

    async fn emit_audit(&mut self, records: Vec<AuditRecord>) -> Result<()> {
        for record in &records {
            insert_audit(&mut *self.tx, record).await?;
        }
        Ok(())
    }

    fn set_status(&mut self, status: &str) {
        self.status = Some(status.to_string());
    }

    fn mark_completed(&mut self) {
        self.is_completed = true;
    }

    async fn commit(mut self) -> Result<()> {
        sqlx::query(
            r#"UPDATE clinhub.workflow_instances
               SET status = COALESCE($3, status),
                   patient = COALESCE(patient, $4),
                   watermarks = $5,
                   event_count = event_count + $6,
                   updated_at = now(),
                   completed_at = CASE WHEN $7 THEN now() ELSE completed_at END
               WHERE workflow_type = $1 AND workflow_id = $2"#,
        )
        .bind(self.workflow_type)
        .bind(&self.workflow_id)
        .bind(self.status.as_deref())
        .bind(self.patient.map(|p| p.as_uuid()))
        .bind(serde_json::to_value(&self.watermarks)?)
        .bind(self.events_appended)
        .bind(self.is_completed)
        .execute(&mut *self.tx)
        .await?;

        if self.is_completed {
            // Terminal instances have no pending timers
            sqlx::query(
                r#"UPDATE clinhub.timers
                   SET processed_at = now(), locked_until = NULL, locked_by = NULL
                   WHERE workflow_type = $1 AND workflow_id = $2 AND processed_at IS NULL"#,
            )
            .bind(self.workflow_type)
            .bind(&self.workflow_id)
            .execute(&mut *self.tx)
            .await?;
        }

        self.tx.commit().await?;
        Ok(())
    }
}

async fn insert_command<'e, E>(executor: E, command: &OutboundCommand) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"INSERT INTO clinhub.outbox
               (id, workflow_type, workflow_id, patient, target, action, payload, status,
                attempts, created_at, updated_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
           ON CONFLICT (id) DO NOTHING"#,
    )
    .bind(command.id.as_uuid())
    .bind(command.workflow.as_ref().map(|w| w.workflow_type().to_string()))
    .bind(command.workflow.as_ref().map(|w| w.workflow_id().as_str().to_string()))
    .bind(command.patient.map(|p| p.as_uuid()))
    .bind(command.target.as_str())
    .bind(&command.action)
    .bind(&command.payload)
    .bind(command.status.as_str())
    .bind(command.attempts as i32)
    .bind(command.created_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn insert_audit<'e, E>(executor: E, record: &AuditRecord) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"INSERT INTO clinhub.audit_outbox (id, record)
           VALUES ($1, $2)
           ON CONFLICT (id) DO NOTHING"#,
    )
    .bind(record.id)
    .bind(serde_json::to_value(record)?)
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    workflow_type: String,
    workflow_id: String,
    status: String,
    patient: Option<Uuid>,
    event_count: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
    archived_at: Option<OffsetDateTime>,
}

#[async_trait]
impl WorkflowQueryStore for PgStore {
    async fn load_instance(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowInstanceView>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<InstanceRow> = sqlx::query_as(
            r#"
            SELECT workflow_type, workflow_id, status, patient, event_count,
                   created_at, updated_at, completed_at, archived_at
            FROM clinhub.workflow_instances
            WHERE workflow_type = $1 AND workflow_id = $2
            "#,
        )
        .bind(workflow_type)
        .bind(workflow_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let history = self.load_history(&mut tx, workflow_type, workflow_id).await?;

        let applied: Vec<(String, String, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT input_id, kind, applied_at
            FROM clinhub.applied_inputs
            WHERE workflow_type = $1 AND workflow_id = $2
            ORDER BY applied_at, input_id
            "#,
        )
        .bind(workflow_type)
        .bind(workflow_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let rejections: Vec<(String, String, String, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT input_id, status, reason, recorded_at
            FROM clinhub.rejected_transitions
            WHERE workflow_type = $1 AND workflow_id = $2
            ORDER BY id
            "#,
        )
        .bind(workflow_type)
        .bind(workflow_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let applied_inputs = applied
            .into_iter()
            .map(|(input_id, kind, applied_at)| {
                Ok(AppliedInput {
                    input_id,
                    kind: from_text(&kind)?,
                    applied_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(WorkflowInstanceView {
            workflow: WorkflowRef::new(row.workflow_type, row.workflow_id),
            status: row.status,
            patient: row.patient.map(CanonicalId::from_uuid),
            history,
            applied_inputs,
            rejections: rejections
                .into_iter()
                .map(|(input_id, status, reason, recorded_at)| RejectedTransition {
                    input_id,
                    status,
                    reason,
                    recorded_at,
                })
                .collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            archived_at: row.archived_at,
        }))
    }

    async fn list_instances(&self, query: &InstanceQuery) -> Result<Vec<WorkflowInstanceSummary>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            r#"
            SELECT workflow_type, workflow_id, status, patient, event_count,
                   created_at, updated_at, completed_at, archived_at
            FROM clinhub.workflow_instances
            WHERE archived_at IS NULL
            "#,
        );

        if let Some(workflow_type) = &query.workflow_type {
            builder.push(" AND workflow_type = ");
            builder.push_bind(workflow_type.clone());
        }
        if let Some(status) = &query.status {
            builder.push(" AND status = ");
            builder.push_bind(status.clone());
        }
        if let Some(patient) = query.patient {
            builder.push(" AND patient = ");
            builder.push_bind(patient.as_uuid());
        }

        let limit = if query.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            query.limit
        };
        builder.push(" ORDER BY updated_at DESC");
        builder.push(" LIMIT ");
        builder.push_bind(limit as i64);
        builder.push(" OFFSET ");
        builder.push_bind(query.offset as i64);

        let rows = builder
            .build_query_as::<InstanceRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| WorkflowInstanceSummary {
                workflow: WorkflowRef::new(row.workflow_type, row.workflow_id),
                status: row.status,
                patient: row.patient.map(CanonicalId::from_uuid),
                event_count: row.event_count,
                updated_at: row.updated_at,
                completed_at: row.completed_at,
            })
            .collect())
    }

    async fn archive_completed_before(&self, cutoff: OffsetDateTime) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE clinhub.workflow_instances
            SET archived_at = now()
            WHERE archived_at IS NULL
              AND completed_at IS NOT NULL
              AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Outbox and timers
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct CommandRow {
    id: Uuid,
    workflow_type: Option<String>,
    workflow_id: Option<String>,
    patient: Option<Uuid>,
    target: String,
    action: String,
    payload: Value,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    delivered_at: Option<OffsetDateTime>,
}

impl TryFrom<CommandRow> for OutboundCommand {
    type Error = Error;

    fn try_from(row: CommandRow) -> Result<Self> {
        Ok(OutboundCommand {
            id: CommandId::from_uuid(row.id),
            workflow: workflow_ref(row.workflow_type, row.workflow_id),
            patient: row.patient.map(CanonicalId::from_uuid),
            target: parse_subsystem(&row.target)?,
            action: row.action,
            payload: row.payload,
            status: row.status.parse().map_err(Error::Corrupt)?,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            delivered_at: row.delivered_at,
        })
    }
}

const COMMAND_COLUMNS: &str = "id, workflow_type, workflow_id, patient, target, action, payload, \
                               status, attempts, last_error, created_at, updated_at, delivered_at";

impl OutboxStore for PgStore {
    async fn enqueue_command(&self, command: OutboundCommand) -> Result<bool> {
        insert_command(&self.pool, &command).await
    }

    async fn claim_command(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<OutboundCommand>> {
        // Lock timestamp is computed in DB to avoid clock skew between app and DB servers.
        let lock_duration_secs = lock_duration.as_secs_f64();
        let row: Option<CommandRow> = sqlx::query_as(&format!(
            r#"
            UPDATE clinhub.outbox
            SET available_at = now() + ($1 * interval '1 second'),
                locked_by = $2
            WHERE id = (
                SELECT id FROM clinhub.outbox
                WHERE status IN ('pending', 'failed')
                  AND available_at <= now()
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COMMAND_COLUMNS}
            "#
        ))
        .bind(lock_duration_secs)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboundCommand::try_from).transpose()
    }

    async fn mark_delivered(&self, id: CommandId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE clinhub.outbox
            SET status = 'delivered',
                attempts = attempts + 1,
                delivered_at = now(),
                updated_at = now(),
                locked_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_failure(&self, id: CommandId, error: &str, backoff: Duration) -> Result<()> {
        // Backoff computed in DB to avoid clock skew between app and DB servers.
        let backoff_secs = backoff.as_secs_f64();
        sqlx::query(
            r#"
            UPDATE clinhub.outbox
            SET status = 'failed',
                attempts = attempts + 1,
                last_error = $2,
                available_at = now() + ($3 * interval '1 second'),
                updated_at = now(),
                locked_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(backoff_secs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_exhausted(&self, id: CommandId, error: &str, audit: AuditRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE clinhub.outbox
            SET status = 'exhausted',
                attempts = attempts + 1,
                last_error = $2,
                updated_at = now(),
                locked_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_command(&self, id: CommandId) -> Result<Option<OutboundCommand>> {
        let row: Option<CommandRow> = sqlx::query_as(&format!(
            "SELECT {COMMAND_COLUMNS} FROM clinhub.outbox WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboundCommand::try_from).transpose()
    }

    async fn list_commands(&self, query: &CommandQuery) -> Result<Vec<OutboundCommand>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {COMMAND_COLUMNS} FROM clinhub.outbox WHERE TRUE"
        ));

        if let Some(status) = query.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(target) = query.target {
            builder.push(" AND target = ");
            builder.push_bind(target.as_str());
        }
        if let Some(workflow_type) = &query.workflow_type {
            builder.push(" AND workflow_type = ");
            builder.push_bind(workflow_type.clone());
        }
        if let Some(workflow_id) = &query.workflow_id {
            builder.push(" AND workflow_id = ");
            builder.push_bind(workflow_id.as_str().to_string());
        }

        builder.push(" ORDER BY created_at LIMIT ");
        builder.push_bind(query.limit.unwrap_or(DEFAULT_LIST_LIMIT) as i64);

        builder
            .build_query_as::<CommandRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(OutboundCommand::try_from)
            .collect()
    }

    async fn count_commands(&self, status: DeliveryStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clinhub.outbox WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn retry_exhausted(&self, id: CommandId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE clinhub.outbox
            SET status = 'pending',
                attempts = 0,
                available_at = now(),
                updated_at = now(),
                locked_by = NULL
            WHERE id = $1
              AND status = 'exhausted'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_timer(&self, worker_id: &str, lock_duration: Duration) -> Result<Option<DueTimer>> {
        // Lock timestamp is computed in DB to avoid clock skew between app and DB servers.
        let lock_duration_secs = lock_duration.as_secs_f64();
        let row: Option<(Uuid, String, String, Value, Option<String>, i32, OffsetDateTime)> =
            sqlx::query_as(
                r#"
                UPDATE clinhub.timers
                SET locked_until = now() + ($1 * interval '1 second'),
                    locked_by = $2
                WHERE id = (
                    SELECT id FROM clinhub.timers
                    WHERE fire_at <= now()
                      AND processed_at IS NULL
                      AND (locked_until IS NULL OR locked_until < now())
                    ORDER BY fire_at
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, workflow_type, workflow_id, input, key, attempts, fire_at
                "#,
            )
            .bind(lock_duration_secs)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id, workflow_type, workflow_id, input, key, attempts, fire_at)| DueTimer {
            id,
            workflow: WorkflowRef::new(workflow_type, workflow_id),
            input,
            key,
            attempts: attempts.max(0) as u32,
            fire_at,
        }))
    }

    async fn mark_timer_processed(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE clinhub.timers
            SET processed_at = now(),
                locked_until = NULL,
                locked_by = NULL
            WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_timer_failure(&self, id: Uuid, error: &str, backoff: Duration) -> Result<()> {
        // Backoff computed in DB to avoid clock skew between app and DB servers.
        let backoff_secs = backoff.as_secs_f64();
        sqlx::query(
            r#"
            UPDATE clinhub.timers
            SET attempts = attempts + 1,
                last_error = $2,
                locked_until = now() + ($3 * interval '1 second'),
                locked_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(backoff_secs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct JournalRow {
    id: Uuid,
    source: String,
    patient: Uuid,
    local_patient_id: String,
    event_type: String,
    payload: Value,
    occurred_at: OffsetDateTime,
    received_at: OffsetDateTime,
    causal_token: i64,
    source_event_id: Option<String>,
    metadata: Value,
    status: String,
    routed_at: Option<OffsetDateTime>,
}

impl JournalRow {
    fn into_entry(self) -> Result<JournalEntry> {
        let status = from_text(&self.status)?;
        let routed_at = self.routed_at;
        Ok(JournalEntry {
            event: self.into_event()?,
            status,
            routed_at,
        })
    }

    fn into_event(self) -> Result<ClinicalEvent> {
        Ok(ClinicalEvent {
            id: EventId::from_uuid(self.id),
            source: parse_subsystem(&self.source)?,
            patient: CanonicalId::from_uuid(self.patient),
            local_patient_id: self.local_patient_id,
            event_type: self.event_type,
            payload: self.payload,
            occurred_at: self.occurred_at,
            received_at: self.received_at,
            causal_token: CausalToken(self.causal_token.max(0) as u64),
            source_event_id: self.source_event_id,
            metadata: serde_json::from_value(self.metadata)?,
        })
    }
}

const JOURNAL_COLUMNS: &str = "id, source, patient, local_patient_id, event_type, payload, \
                               occurred_at, received_at, causal_token, source_event_id, metadata, \
                               status, routed_at";

impl PgStore {
    async fn find_source_event(&self, source: Subsystem, source_event_id: &str) -> Result<Option<ClinicalEvent>> {
        let row: Option<JournalRow> = sqlx::query_as(&format!(
            "SELECT {JOURNAL_COLUMNS} FROM clinhub.journal WHERE source = $1 AND source_event_id = $2"
        ))
        .bind(source.as_str())
        .bind(source_event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JournalRow::into_event).transpose()
    }

    async fn set_route_status(&self, id: EventId, status: RouteStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE clinhub.journal SET status = $2, routed_at = now() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("event", id));
        }
        Ok(())
    }
}

impl EventJournal for PgStore {
    async fn append(&self, envelope: ValidatedEnvelope, patient: CanonicalId) -> Result<AppendOutcome> {
        if let Some(source_event_id) = &envelope.source_event_id {
            if let Some(existing) = self.find_source_event(envelope.source, source_event_id).await? {
                return Ok(AppendOutcome::Existing(existing));
            }
        }

        let mut tx = self.pool.begin().await?;

        // The sequence row lock serializes appends per source.
        let token: i64 = sqlx::query_scalar(
            r#"INSERT INTO clinhub.source_sequences (source, last_token)
               VALUES ($1, 1)
               ON CONFLICT (source) DO UPDATE SET last_token = clinhub.source_sequences.last_token + 1
               RETURNING last_token"#,
        )
        .bind(envelope.source.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let source = envelope.source;
        let source_event_id = envelope.source_event_id.clone();
        let event = envelope.into_event(
            EventId::generate(),
            patient,
            CausalToken(token.max(0) as u64),
            OffsetDateTime::now_utc(),
        );

        let inserted = sqlx::query(
            r#"INSERT INTO clinhub.journal
                   (id, source, patient, local_patient_id, event_type, payload, occurred_at,
                    received_at, causal_token, source_event_id, metadata)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (source, source_event_id) DO NOTHING"#,
        )
        .bind(event.id.as_uuid())
        .bind(event.source.as_str())
        .bind(event.patient.as_uuid())
        .bind(&event.local_patient_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.occurred_at)
        .bind(event.received_at)
        .bind(token)
        .bind(event.source_event_id.as_deref())
        .bind(serde_json::to_value(&event.metadata)?)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            // Lost a race with a concurrent append of the same source event;
            // rolling back releases the token.
            drop(tx);
            let existing = match &source_event_id {
                Some(id) => self.find_source_event(source, id).await?,
                None => None,
            };
            return existing
                .map(AppendOutcome::Existing)
                .ok_or_else(|| Error::Corrupt("journal insert conflicted without a source event".into()));
        }

        tx.commit().await?;
        Ok(AppendOutcome::Appended(event))
    }

    async fn mark_routed(&self, id: EventId) -> Result<()> {
        self.set_route_status(id, RouteStatus::Routed).await
    }

    async fn mark_unrouted(&self, id: EventId) -> Result<()> {
        self.set_route_status(id, RouteStatus::Unrouted).await
    }

    async fn pending_events(&self, limit: u32) -> Result<Vec<ClinicalEvent>> {
        let rows: Vec<JournalRow> = sqlx::query_as(&format!(
            "SELECT {JOURNAL_COLUMNS} FROM clinhub.journal
             WHERE status = 'pending' ORDER BY journal_seq LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JournalRow::into_event).collect()
    }

    async fn pending_before(&self, patient: CanonicalId, event: EventId, limit: u32) -> Result<Vec<ClinicalEvent>> {
        let rows: Vec<JournalRow> = sqlx::query_as(&format!(
            "WITH RECURSIVE merged (identity_id) AS (
                 SELECT $1::uuid
                 UNION
                 SELECT m.superseded FROM clinhub.identity_merges m
                 JOIN merged ON m.survivor = merged.identity_id
             )
             SELECT {JOURNAL_COLUMNS} FROM clinhub.journal
             WHERE status = 'pending'
               AND patient IN (SELECT identity_id FROM merged)
               AND journal_seq < (SELECT journal_seq FROM clinhub.journal WHERE id = $2)
             ORDER BY journal_seq LIMIT $3"
        ))
        .bind(patient.as_uuid())
        .bind(event.as_uuid())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JournalRow::into_event).collect()
    }

    async fn load_event(&self, id: EventId) -> Result<Option<JournalEntry>> {
        let row: Option<JournalRow> = sqlx::query_as(&format!(
            "SELECT {JOURNAL_COLUMNS} FROM clinhub.journal WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(JournalRow::into_entry).transpose()
    }

    async fn list_unrouted(&self, limit: u32) -> Result<Vec<ClinicalEvent>> {
        let rows: Vec<JournalRow> = sqlx::query_as(&format!(
            "SELECT {JOURNAL_COLUMNS} FROM clinhub.journal
             WHERE status = 'unrouted' ORDER BY journal_seq DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JournalRow::into_event).collect()
    }

    async fn count_events(&self, status: RouteStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clinhub.journal WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

// ---------------------------------------------------------------------------
// Identity map
// ---------------------------------------------------------------------------

impl IdentityStore for PgStore {
    async fn find_local(&self, local: &LocalIdentifier) -> Result<Option<CanonicalId>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            "SELECT identity_id FROM clinhub.identity_links WHERE subsystem = $1 AND local_id = $2",
        )
        .bind(local.subsystem.as_str())
        .bind(&local.local_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id.map(CanonicalId::from_uuid))
    }

    async fn load_identity(&self, id: CanonicalId) -> Result<Option<CanonicalIdentity>> {
        let row: Option<(OffsetDateTime, Option<Uuid>, i64)> = sqlx::query_as(
            "SELECT created_at, superseded_by, version FROM clinhub.identities WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        let Some((created_at, superseded_by, version)) = row else {
            return Ok(None);
        };

        Ok(Some(CanonicalIdentity {
            id,
            created_at,
            identifiers: self.identifiers_of(id).await?,
            superseded_by: superseded_by.map(CanonicalId::from_uuid),
            version: version.max(0) as u64,
        }))
    }

    async fn provision(
        &self,
        local: &LocalIdentifier,
        id: CanonicalId,
        created_at: OffsetDateTime,
        audit: AuditRecord,
    ) -> Result<ProvisionOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO clinhub.identities (id, created_at) VALUES ($1, $2)")
            .bind(id.as_uuid())
            .bind(created_at)
            .execute(&mut *tx)
            .await?;

        let linked = sqlx::query(
            r#"INSERT INTO clinhub.identity_links (subsystem, local_id, identity_id)
               VALUES ($1, $2, $3)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(local.subsystem.as_str())
        .bind(&local.local_id)
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !linked {
            drop(tx);
            return self
                .find_local(local)
                .await?
                .map(ProvisionOutcome::Existing)
                .ok_or_else(|| Error::Corrupt(format!("link for {local} vanished")));
        }

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(ProvisionOutcome::Created(CanonicalIdentity {
            id,
            created_at,
            identifiers: [local.clone()].into_iter().collect(),
            superseded_by: None,
            version: 0,
        }))
    }

    async fn link(&self, local: &LocalIdentifier, id: CanonicalId, audit: AuditRecord) -> Result<LinkOutcome> {
        let mut tx = self.pool.begin().await?;

        let target: Option<Option<Uuid>> = sqlx::query_scalar(
            "SELECT superseded_by FROM clinhub.identities WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        match target {
            None => return Err(Error::UnknownCanonicalIdentity(id.to_string())),
            Some(Some(_)) => return Ok(LinkOutcome::TargetSuperseded),
            Some(None) => {}
        }

        let linked = sqlx::query(
            r#"INSERT INTO clinhub.identity_links (subsystem, local_id, identity_id)
               VALUES ($1, $2, $3)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(local.subsystem.as_str())
        .bind(&local.local_id)
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !linked {
            drop(tx);
            return self
                .find_local(local)
                .await?
                .map(LinkOutcome::AlreadyLinked)
                .ok_or_else(|| Error::Corrupt(format!("link for {local} vanished")));
        }

        sqlx::query("UPDATE clinhub.identities SET version = version + 1 WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(LinkOutcome::Linked)
    }

    async fn commit_merge(&self, plan: &MergePlan, audit: AuditRecord) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let superseded = sqlx::query(
            r#"UPDATE clinhub.identities
               SET superseded_by = $2, version = version + 1
               WHERE id = $1 AND version = $3 AND superseded_by IS NULL"#,
        )
        .bind(plan.superseded.as_uuid())
        .bind(plan.survivor.as_uuid())
        .bind(plan.superseded_version as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let survivor = sqlx::query(
            r#"UPDATE clinhub.identities
               SET version = version + 1
               WHERE id = $1 AND version = $2 AND superseded_by IS NULL"#,
        )
        .bind(plan.survivor.as_uuid())
        .bind(plan.survivor_version as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if superseded != 1 || survivor != 1 {
            // Rolled back on drop
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO clinhub.identity_merges (survivor, superseded, merged_at) VALUES ($1, $2, $3)",
        )
        .bind(plan.survivor.as_uuid())
        .bind(plan.superseded.as_uuid())
        .bind(plan.merged_at)
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn merge_history(&self, id: CanonicalId) -> Result<Vec<MergeRecord>> {
        let rows: Vec<(Uuid, Uuid, OffsetDateTime)> = sqlx::query_as(
            r#"SELECT survivor, superseded, merged_at
               FROM clinhub.identity_merges
               WHERE survivor = $1 OR superseded = $1
               ORDER BY id"#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(survivor, superseded, merged_at)| MergeRecord {
                survivor: CanonicalId::from_uuid(survivor),
                superseded: CanonicalId::from_uuid(superseded),
                merged_at,
            })
            .collect())
    }

    async fn count_identities(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM clinhub.identities WHERE superseded_by IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

// ---------------------------------------------------------------------------
// Audit queue and dead letters
// ---------------------------------------------------------------------------

impl AuditQueue for PgStore {
    async fn enqueue_audit(&self, records: Vec<AuditRecord>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in &records {
            insert_audit(&mut *tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn claim_audit(&self, worker_id: &str, lock_duration: Duration) -> Result<Option<QueuedAudit>> {
        let lock_duration_secs = lock_duration.as_secs_f64();
        let row: Option<(Value, i32)> = sqlx::query_as(
            r#"
            UPDATE clinhub.audit_outbox
            SET available_at = now() + ($1 * interval '1 second'),
                locked_by = $2
            WHERE id = (
                SELECT id FROM clinhub.audit_outbox
                WHERE delivered_at IS NULL
                  AND available_at <= now()
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING record, attempts
            "#,
        )
        .bind(lock_duration_secs)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(record, attempts)| {
            Ok(QueuedAudit {
                record: serde_json::from_value(record)?,
                attempts: attempts.max(0) as u32,
            })
        })
        .transpose()
    }

    async fn mark_audit_delivered(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE clinhub.audit_outbox SET delivered_at = now(), locked_by = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_audit_failure(&self, id: Uuid, error: &str, backoff: Duration) -> Result<()> {
        let backoff_secs = backoff.as_secs_f64();
        sqlx::query(
            r#"
            UPDATE clinhub.audit_outbox
            SET attempts = attempts + 1,
                last_error = $2,
                available_at = now() + ($3 * interval '1 second'),
                locked_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(backoff_secs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_pending_audit(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM clinhub.audit_outbox WHERE delivered_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    workflow_type: String,
    workflow_id: Option<String>,
    input_id: String,
    reason: String,
    detail: String,
    payload: Value,
    recorded_at: OffsetDateTime,
}

impl DeadLetterStore for PgStore {
    async fn record_dead_letter(&self, letter: DeadLetter, audit: AuditRecord) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let recorded = sqlx::query(
            r#"INSERT INTO clinhub.dead_letters
                   (id, workflow_type, workflow_id, input_id, reason, detail, payload, recorded_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (workflow_type, input_id) DO NOTHING"#,
        )
        .bind(letter.id)
        .bind(&letter.workflow_type)
        .bind(letter.workflow_id.as_ref().map(|id| id.as_str().to_string()))
        .bind(&letter.input_id)
        .bind(to_text(&letter.reason)?)
        .bind(&letter.detail)
        .bind(&letter.payload)
        .bind(letter.recorded_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if recorded {
            insert_audit(&mut *tx, &audit).await?;
            tx.commit().await?;
        }
        Ok(recorded)
    }

    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            r#"SELECT id, workflow_type, workflow_id, input_id, reason, detail, payload, recorded_at
               FROM clinhub.dead_letters
               ORDER BY recorded_at DESC, id DESC
               LIMIT $1"#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DeadLetter {
                    id: row.id,
                    workflow_type: row.workflow_type,
                    workflow_id: row.workflow_id.map(WorkflowId::from),
                    input_id: row.input_id,
                    reason: from_text(&row.reason)?,
                    detail: row.detail,
                    payload: row.payload,
                    recorded_at: row.recorded_at,
                })
            })
            .collect()
    }

    async fn count_dead_letters(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clinhub.dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
