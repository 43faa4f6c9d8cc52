//! Applying one input to one workflow instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditRecord, AuditReference};
use crate::error::Result;
use crate::event::EventCategory;
use crate::store::{
    BeginResult, CommandId, DeadLetter, DeadLetterReason, DeadLetterStore, HubStore,
    InputKind, InputMeta, OutboundCommand, Store, UnitOfWork,
};
use crate::timer::DEADLINE_TIMER_KEY;
use crate::workflow::{HasWorkflowId, Workflow, WorkflowId, WorkflowRef};

/// What happened to an input offered to a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The transition was applied and committed.
    Applied {
        status: String,
        /// Outbox commands written by this transition.
        commands: Vec<CommandId>,
    },
    /// The state machine refused the input; recorded, state unchanged.
    Rejected { reason: String },
    /// The instance already applied this input; nothing changed.
    Duplicate,
    /// The instance is terminal; the input went to the dead-letter path.
    LateEvent { status: String },
    /// The event could not be mapped to an instance of this workflow type.
    Uncorrelated { reason: String },
    /// The timer was cancelled or re-armed after it was claimed.
    Superseded,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

/// Everything the engine records about an input besides the input itself.
pub(crate) struct InputContext {
    pub meta: InputMeta,
    pub reference: AuditReference,
    pub category: Option<EventCategory>,
    /// Kept with a dead letter if the input cannot be applied.
    pub payload: Value,
    /// Set for timer inputs; the timer must still be pending when applied.
    pub timer: Option<Uuid>,
}

/// Apply `input` to its instance under the instance lock.
///
/// 1. Begin a unit of work (lock; skip inputs already applied; divert
///    inputs for terminal instances to the dead-letter path; skip timers
///    that are no longer pending)
/// 2. Refuse events older than the instance's watermark for their source
/// 3. Replay history into state and call `Workflow::decide`
/// 4. Record a rejection, or append events, write commands to the outbox
///    and maintain timers. A rejected first input leaves no instance behind;
///    it is dead-lettered instead.
/// 5. Queue the audit record and commit
///
/// Nothing is persisted if any step fails.
pub(crate) async fn execute<W, S>(
    store: &S,
    ctx: &InputContext,
    input: &W::Input,
    deadline: Option<Duration>,
) -> Result<ApplyOutcome>
where
    W: Workflow,
    S: HubStore,
{
    let workflow_id = input.workflow_id();
    let workflow = WorkflowRef::new(W::TYPE, workflow_id.clone());

    let (event_payloads, snapshot, mut uow) =
        match store.begin(W::TYPE, &workflow_id, &ctx.meta.input_id).await? {
            BeginResult::Active {
                events,
                snapshot,
                uow,
            } => (events, snapshot, uow),
            BeginResult::AlreadyApplied => {
                debug!(workflow = %workflow, input_id = %ctx.meta.input_id, "Input already applied");
                return Ok(ApplyOutcome::Duplicate);
            }
            BeginResult::Completed { status } => {
                divert_late_input(store, ctx, &workflow, &status).await?;
                return Ok(ApplyOutcome::LateEvent { status });
            }
        };

    if let Some(timer) = ctx.timer {
        if !uow.timer_is_pending(timer).await? {
            debug!(workflow = %workflow, %timer, "Timer superseded, skipped");
            return Ok(ApplyOutcome::Superseded);
        }
    }

    let state = replay_state::<W>(&workflow_id, event_payloads)?;
    let current_status = W::status(&state);
    let patient = snapshot.patient.or(ctx.meta.patient);
    if let Some(patient) = patient {
        uow.bind_patient(patient);
    }

    let out_of_order = match (ctx.meta.source, ctx.meta.causal_token) {
        (Some(source), Some(token)) => snapshot
            .watermarks
            .get(&source)
            .filter(|watermark| token <= **watermark)
            .map(|watermark| {
                format!(
                    "out of order: {source} token {} is not after {}",
                    token.0, watermark.0
                )
            }),
        _ => None,
    };

    let now = OffsetDateTime::now_utc();
    let decision = match out_of_order {
        Some(reason) => Err(crate::workflow::Rejection::new(reason)),
        None => W::decide(now, &state, input),
    };

    let decision = match decision {
        Ok(decision) => decision,
        Err(rejection) => {
            warn!(
                workflow = %workflow,
                input_id = %ctx.meta.input_id,
                status = current_status,
                reason = %rejection.reason,
                "Transition rejected"
            );
            if !snapshot.exists {
                drop(uow);
                divert_rejected_first_input(store, ctx, &workflow, current_status, &rejection.reason)
                    .await?;
                return Ok(ApplyOutcome::Rejected {
                    reason: rejection.reason,
                });
            }
            uow.record_rejection(&ctx.meta, current_status, &rejection.reason)
                .await?;
            uow.emit_audit(vec![
                audit_record(ctx, AuditKind::RejectedTransition, &workflow, current_status)
                    .with_detail(rejection.reason.clone()),
            ])
            .await?;
            uow.commit().await?;
            return Ok(ApplyOutcome::Rejected {
                reason: rejection.reason,
            });
        }
    };

    let (events, commands, timers, cancel_timers) = decision.into_parts();
    let final_state = events.iter().cloned().fold(state, W::evolve);
    let status = W::status(&final_state);

    uow.append_events(events).await?;
    uow.record_input(&ctx.meta).await?;

    let outbound: Vec<OutboundCommand> = commands
        .into_iter()
        .enumerate()
        .map(|(index, spec)| {
            let id = CommandId::derived(&format!("{workflow}/{}/{index}", ctx.meta.input_id));
            let command = OutboundCommand::new(id, spec.target, spec.action, spec.payload)
                .with_workflow(workflow.clone());
            match patient {
                Some(patient) => command.with_patient(patient),
                None => command,
            }
        })
        .collect();
    let command_ids = outbound.iter().map(|c| c.id).collect();
    uow.enqueue_commands(outbound).await?;

    if !cancel_timers.is_empty() {
        uow.cancel_timers(cancel_timers).await?;
    }

    let mut json_timers = timers
        .into_iter()
        .map(|t| {
            Ok(crate::Timer {
                fire_at: t.fire_at,
                input: serde_json::to_value(&t.input)?,
                key: t.key,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if W::is_terminal(&final_state) {
        uow.mark_completed();
    } else if let Some(deadline) = deadline {
        if let Some(timeout) = W::timeout_input(&workflow_id) {
            json_timers.push(
                crate::Timer::at(now + deadline, serde_json::to_value(&timeout)?)
                    .with_key(DEADLINE_TIMER_KEY),
            );
        }
    }
    uow.schedule_timers(json_timers).await?;

    let kind = match ctx.meta.kind {
        InputKind::Cancellation => AuditKind::Cancelled,
        _ => AuditKind::Transition,
    };
    uow.emit_audit(vec![audit_record(ctx, kind, &workflow, status)])
        .await?;
    uow.set_status(status);
    uow.commit().await?;

    debug!(workflow = %workflow, input_id = %ctx.meta.input_id, status, "Transition applied");
    Ok(ApplyOutcome::Applied {
        status: status.to_string(),
        commands: command_ids,
    })
}

/// Record a dead letter and an audit record for an uncorrelated event.
pub(crate) async fn divert_uncorrelated<S>(
    store: &S,
    workflow_type: &'static str,
    ctx: &InputContext,
    reason: &str,
) -> Result<()>
where
    S: DeadLetterStore,
{
    warn!(workflow_type, input_id = %ctx.meta.input_id, reason, "Event not correlated to an instance");
    let mut record = AuditRecord::new(AuditKind::Uncorrelated, ctx.reference.clone())
        .with_detail(format!("{workflow_type}: {reason}"));
    if let Some(category) = ctx.category {
        record = record.with_category(category);
    }
    store
        .record_dead_letter(
            DeadLetter {
                id: Uuid::now_v7(),
                workflow_type: workflow_type.to_string(),
                workflow_id: None,
                input_id: ctx.meta.input_id.clone(),
                reason: DeadLetterReason::Uncorrelated,
                detail: reason.to_string(),
                payload: ctx.payload.clone(),
                recorded_at: OffsetDateTime::now_utc(),
            },
            record,
        )
        .await?;
    Ok(())
}

/// A refused first input has no instance to record its rejection on.
async fn divert_rejected_first_input<S>(
    store: &S,
    ctx: &InputContext,
    workflow: &WorkflowRef,
    status: &str,
    reason: &str,
) -> Result<()>
where
    S: DeadLetterStore,
{
    store
        .record_dead_letter(
            DeadLetter {
                id: Uuid::now_v7(),
                workflow_type: workflow.workflow_type().to_string(),
                workflow_id: Some(workflow.workflow_id().clone()),
                input_id: ctx.meta.input_id.clone(),
                reason: DeadLetterReason::Rejected,
                detail: reason.to_string(),
                payload: ctx.payload.clone(),
                recorded_at: OffsetDateTime::now_utc(),
            },
            audit_record(ctx, AuditKind::RejectedTransition, workflow, status).with_detail(reason),
        )
        .await?;
    Ok(())
}

async fn divert_late_input<S>(
    store: &S,
    ctx: &InputContext,
    workflow: &WorkflowRef,
    status: &str,
) -> Result<()>
where
    S: DeadLetterStore,
{
    if ctx.meta.kind != InputKind::Event {
        debug!(workflow = %workflow, input_id = %ctx.meta.input_id, status, "Instance terminal, input skipped");
        return Ok(());
    }

    warn!(workflow = %workflow, input_id = %ctx.meta.input_id, status, "Late event for terminal instance");
    let detail = format!("instance is {status}");
    store
        .record_dead_letter(
            DeadLetter {
                id: Uuid::now_v7(),
                workflow_type: workflow.workflow_type().to_string(),
                workflow_id: Some(workflow.workflow_id().clone()),
                input_id: ctx.meta.input_id.clone(),
                reason: DeadLetterReason::LateEvent,
                detail: detail.clone(),
                payload: ctx.payload.clone(),
                recorded_at: OffsetDateTime::now_utc(),
            },
            audit_record(ctx, AuditKind::LateEvent, workflow, status).with_detail(detail),
        )
        .await?;
    Ok(())
}

fn audit_record(ctx: &InputContext, kind: AuditKind, workflow: &WorkflowRef, status: &str) -> AuditRecord {
    let record = AuditRecord::new(kind, ctx.reference.clone())
        .with_workflow(workflow.clone())
        .with_state(status);
    match ctx.category {
        Some(category) => record.with_category(category),
        None => record,
    }
}

/// Replay events to reconstruct the current state.
pub(crate) fn replay_state<W: Workflow>(workflow_id: &WorkflowId, events: Vec<Value>) -> Result<W::State> {
    let mut state = W::State::default();

    for (sequence, payload) in events.into_iter().enumerate() {
        let event: W::Event = serde_json::from_value(payload).map_err(|e| {
            crate::Error::event_deserialization(W::TYPE, workflow_id.as_str(), sequence, e)
        })?;
        state = W::evolve(state, event);
    }

    Ok(state)
}
