//! Integration tests for PgStore.

use std::time::Duration;

use clinhub::audit::{AuditKind, AuditRecord, AuditReference};
use clinhub::event::{CausalToken, EventId};
use clinhub::identity::{
    CanonicalId, IdentityStore, LinkOutcome, LocalIdentifier, MergePlan, ProvisionOutcome,
};
use clinhub::store::{
    AppendOutcome, AuditQueue, BeginResult, CommandId, DeadLetter, DeadLetterReason,
    DeadLetterStore, DeliveryStatus, EventJournal, InputMeta, OutboundCommand, OutboxStore,
    RouteStatus, Store, UnitOfWork, WorkflowQueryStore,
};
use clinhub::{PgStore, RawEnvelope, Subsystem, Timer, WorkflowId};
use serde_json::json;
use test_utils::db_test;
use time::OffsetDateTime;
use uuid::Uuid;

const WF: &str = "order-lifecycle";

/// Begin a unit of work and expect the instance to be active.
async fn begin_active<'a>(
    store: &'a PgStore,
    workflow_id: &WorkflowId,
    input_id: &str,
) -> anyhow::Result<(Vec<serde_json::Value>, <PgStore as Store>::UnitOfWork<'a>)> {
    match store.begin(WF, workflow_id, input_id).await? {
        BeginResult::Active { events, uow, .. } => Ok((events, uow)),
        BeginResult::AlreadyApplied => Err(anyhow::anyhow!("{workflow_id}: input already applied")),
        BeginResult::Completed { status } => Err(anyhow::anyhow!("{workflow_id}: completed as {status}")),
    }
}

fn identity_audit(kind: AuditKind, id: CanonicalId) -> AuditRecord {
    AuditRecord::new(kind, AuditReference::Identity(id))
}

async fn provision(store: &PgStore, subsystem: Subsystem, local_id: &str) -> anyhow::Result<CanonicalId> {
    let local = LocalIdentifier::new(subsystem, local_id);
    let id = CanonicalId::generate();
    match store
        .provision(&local, id, OffsetDateTime::now_utc(), identity_audit(AuditKind::IdentityProvisioned, id))
        .await?
    {
        ProvisionOutcome::Created(identity) => Ok(identity.id),
        ProvisionOutcome::Existing(id) => Ok(id),
    }
}

fn command(target: Subsystem) -> OutboundCommand {
    OutboundCommand::new(CommandId::generate(), target, "order.transmit", json!({ "orderId": "ORD-1" }))
}

// =============================================================================
// Workflow instances
// =============================================================================

db_test!(committed_input_is_not_applied_twice, |pool| {
    let store = PgStore::new(pool.clone());
    let id = WorkflowId::new("ORD-1");
    let input = InputMeta::cancellation(Uuid::now_v7());

    let (events, mut uow) = begin_active(&store, &id, &input.input_id).await?;
    assert!(events.is_empty());
    uow.append_events([json!({ "type": "created" }), json!({ "type": "transmitted" })])
        .await?;
    uow.record_input(&input).await?;
    uow.set_status("Transmitted");
    uow.commit().await?;

    assert!(matches!(
        store.begin(WF, &id, &input.input_id).await?,
        BeginResult::AlreadyApplied
    ));

    let (events, uow) = begin_active(&store, &id, "another-input").await?;
    assert_eq!(events.len(), 2);
    drop(uow);

    let view = store.load_instance(WF, &id).await?.expect("instance");
    assert_eq!(view.status, "Transmitted");
    assert_eq!(view.history.len(), 2);
    assert_eq!(view.history[1].sequence, 1);
    assert_eq!(view.applied_inputs.len(), 1);
    Ok(())
});

db_test!(dropped_unit_of_work_rolls_back, |pool| {
    let store = PgStore::new(pool.clone());
    let id = WorkflowId::new("ORD-2");

    let (_, mut uow) = begin_active(&store, &id, "input-1").await?;
    uow.append_events([json!({ "type": "created" })]).await?;
    uow.enqueue_commands(vec![command(Subsystem::Lis)]).await?;
    drop(uow);

    assert!(store.load_instance(WF, &id).await?.is_none());
    assert_eq!(store.count_commands(DeliveryStatus::Pending).await?, 0);
    Ok(())
});

db_test!(completed_instance_refuses_new_inputs, |pool| {
    let store = PgStore::new(pool.clone());
    let id = WorkflowId::new("ORD-3");

    let (_, mut uow) = begin_active(&store, &id, "input-1").await?;
    uow.append_events([json!({ "type": "completed" })]).await?;
    uow.record_input(&InputMeta::cancellation(Uuid::now_v7())).await?;
    uow.schedule_timers([Timer::at(OffsetDateTime::now_utc(), json!({})).with_key("deadline")])
        .await?;
    uow.set_status("Completed");
    uow.mark_completed();
    uow.commit().await?;

    match store.begin(WF, &id, "input-2").await? {
        BeginResult::Completed { status } => assert_eq!(status, "Completed"),
        _ => panic!("expected completed instance"),
    }

    // Completion drops pending timers.
    assert!(store.claim_timer("w", Duration::from_secs(30)).await?.is_none());
    Ok(())
});

db_test!(watermarks_and_patient_are_kept, |pool| {
    let store = PgStore::new(pool.clone());
    let id = WorkflowId::new("ORD-4");
    let patient = CanonicalId::generate();
    let input = InputMeta::event(EventId::generate(), Subsystem::Lis, CausalToken(5), patient);

    let (_, mut uow) = begin_active(&store, &id, &input.input_id).await?;
    uow.bind_patient(patient);
    uow.append_events([json!({ "type": "accepted" })]).await?;
    uow.record_input(&input).await?;
    uow.set_status("ResultPending");
    uow.commit().await?;

    match store.begin(WF, &id, "next").await? {
        BeginResult::Active { snapshot, .. } => {
            assert!(snapshot.exists);
            assert_eq!(snapshot.patient, Some(patient));
            assert_eq!(snapshot.watermarks.get(&Subsystem::Lis), Some(&CausalToken(5)));
        }
        _ => panic!("expected active instance"),
    }
    Ok(())
});

db_test!(rejection_marks_input_applied, |pool| {
    let store = PgStore::new(pool.clone());
    let id = WorkflowId::new("ORD-5");
    let input = InputMeta::cancellation(Uuid::now_v7());

    let (_, mut uow) = begin_active(&store, &id, &input.input_id).await?;
    uow.set_status("New");
    uow.record_rejection(&input, "New", "cancel not accepted in New").await?;
    uow.commit().await?;

    assert!(matches!(
        store.begin(WF, &id, &input.input_id).await?,
        BeginResult::AlreadyApplied
    ));
    let view = store.load_instance(WF, &id).await?.expect("instance");
    assert_eq!(view.rejections.len(), 1);
    assert_eq!(view.rejections[0].reason, "cancel not accepted in New");
    assert!(view.history.is_empty());
    Ok(())
});

db_test!(keyed_timer_is_replaced, |pool| {
    let store = PgStore::new(pool.clone());
    let id = WorkflowId::new("ORD-6");
    let past = OffsetDateTime::now_utc() - time::Duration::seconds(1);

    for n in 0..2 {
        let (_, mut uow) = begin_active(&store, &id, &format!("input-{n}")).await?;
        uow.schedule_timers([Timer::at(past, json!({ "n": n })).with_key("deadline")])
            .await?;
        uow.record_input(&InputMeta::cancellation(Uuid::now_v7())).await?;
        uow.commit().await?;
    }

    let timer = store
        .claim_timer("w", Duration::from_secs(30))
        .await?
        .expect("due timer");
    assert_eq!(timer.input, json!({ "n": 1 }));
    assert_eq!(timer.key.as_deref(), Some("deadline"));
    assert!(store.claim_timer("w", Duration::from_secs(30)).await?.is_none());

    store.mark_timer_processed(timer.id).await?;
    Ok(())
});

db_test!(rearmed_timer_outlives_a_stale_claim, |pool| {
    let store = PgStore::new(pool.clone());
    let id = WorkflowId::new("ORD-7");
    let past = OffsetDateTime::now_utc() - time::Duration::seconds(1);

    let (_, mut uow) = begin_active(&store, &id, "input-0").await?;
    uow.schedule_timers([Timer::at(past, json!({ "n": 0 })).with_key("deadline")])
        .await?;
    uow.record_input(&InputMeta::cancellation(Uuid::now_v7())).await?;
    uow.commit().await?;

    let claimed = store
        .claim_timer("w", Duration::from_secs(30))
        .await?
        .expect("due timer");

    let (_, mut uow) = begin_active(&store, &id, "input-1").await?;
    uow.schedule_timers([Timer::at(past, json!({ "n": 1 })).with_key("deadline")])
        .await?;
    uow.record_input(&InputMeta::cancellation(Uuid::now_v7())).await?;
    uow.commit().await?;

    let (_, mut uow) = begin_active(&store, &id, "input-2").await?;
    assert!(!uow.timer_is_pending(claimed.id).await?);
    drop(uow);

    store.mark_timer_processed(claimed.id).await?;
    let rearmed = store
        .claim_timer("w", Duration::from_secs(30))
        .await?
        .expect("re-armed timer is still due");
    assert_ne!(rearmed.id, claimed.id);
    assert_eq!(rearmed.input, json!({ "n": 1 }));
    Ok(())
});

// =============================================================================
// Journal
// =============================================================================

db_test!(journal_assigns_tokens_per_source, |pool| {
    let store = PgStore::new(pool.clone());
    let patient = provision(&store, Subsystem::Cpoe, "P-1").await?;

    let mut tokens = Vec::new();
    for (source, n) in [(Subsystem::Cpoe, 1), (Subsystem::Cpoe, 2), (Subsystem::Lis, 3)] {
        let envelope = RawEnvelope::new(source, "P-1", "ORDER_PLACED", json!({ "orderId": n })).validate()?;
        tokens.push(store.append(envelope, patient).await?.into_event().causal_token);
    }
    assert_eq!(tokens, vec![CausalToken(1), CausalToken(2), CausalToken(1)]);
    assert_eq!(store.count_events(RouteStatus::Pending).await?, 3);

    let pending = store.pending_events(10).await?;
    store.mark_routed(pending[0].id).await?;
    store.mark_unrouted(pending[1].id).await?;

    assert_eq!(store.pending_events(10).await?.len(), 1);
    let unrouted = store.list_unrouted(10).await?;
    assert_eq!(unrouted.len(), 1);
    assert_eq!(unrouted[0].id, pending[1].id);

    let entry = store.load_event(pending[0].id).await?.expect("journaled");
    assert_eq!(entry.status, RouteStatus::Routed);
    Ok(())
});

db_test!(journal_deduplicates_source_event_ids, |pool| {
    let store = PgStore::new(pool.clone());
    let patient = provision(&store, Subsystem::Cpoe, "P-1").await?;
    let raw = RawEnvelope::new(Subsystem::Cpoe, "P-1", "ORDER_PLACED", json!({ "orderId": "ORD-1" }))
        .with_source_event_id("cpoe-42");

    let first = store.append(raw.validate()?, patient).await?;
    let second = store.append(raw.validate()?, patient).await?;

    assert!(matches!(first, AppendOutcome::Appended(_)));
    assert!(matches!(second, AppendOutcome::Existing(_)));
    assert_eq!(first.event().id, second.event().id);
    assert_eq!(store.count_events(RouteStatus::Pending).await?, 1);
    Ok(())
});

db_test!(pending_before_is_per_patient_in_journal_order, |pool| {
    let store = PgStore::new(pool.clone());
    let p1 = provision(&store, Subsystem::Cpoe, "P-1").await?;
    let p2 = provision(&store, Subsystem::Cpoe, "P-2").await?;

    let mut events = Vec::new();
    for (patient, local) in [(p1, "P-1"), (p2, "P-2"), (p1, "P-1"), (p1, "P-1")] {
        let envelope = RawEnvelope::new(Subsystem::Cpoe, local, "PATIENT_ADMITTED", json!({})).validate()?;
        events.push(store.append(envelope, patient).await?.into_event());
    }
    store.mark_routed(events[0].id).await?;

    let earlier = store.pending_before(p1, events[3].id, 10).await?;
    assert_eq!(earlier.iter().map(|e| e.id).collect::<Vec<_>>(), vec![events[2].id]);
    assert!(store.pending_before(p1, events[2].id, 10).await?.is_empty());
    assert!(store.pending_before(p2, events[1].id, 10).await?.is_empty());

    // After P-2 is merged into P-1, its pending events precede P-1's.
    let survivor = store.load_identity(p1).await?.expect("p1");
    let superseded = store.load_identity(p2).await?.expect("p2");
    let plan = MergePlan {
        survivor: p1,
        survivor_version: survivor.version,
        superseded: p2,
        superseded_version: superseded.version,
        merged_at: OffsetDateTime::now_utc(),
    };
    assert!(store.commit_merge(&plan, identity_audit(AuditKind::IdentityMerged, p1)).await?);

    let earlier = store.pending_before(p1, events[3].id, 10).await?;
    assert_eq!(
        earlier.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![events[1].id, events[2].id]
    );
    Ok(())
});

// =============================================================================
// Identity map
// =============================================================================

db_test!(provisioning_is_insert_or_get, |pool| {
    let store = PgStore::new(pool.clone());
    let local = LocalIdentifier::new(Subsystem::Lis, "L-1");

    let first = provision(&store, Subsystem::Lis, "L-1").await?;
    let candidate = CanonicalId::generate();
    let second = store
        .provision(
            &local,
            candidate,
            OffsetDateTime::now_utc(),
            identity_audit(AuditKind::IdentityProvisioned, candidate),
        )
        .await?;
    assert!(matches!(second, ProvisionOutcome::Existing(id) if id == first));
    assert_eq!(store.find_local(&local).await?, Some(first));
    assert_eq!(store.count_identities().await?, 1);
    assert_eq!(store.count_pending_audit().await?, 1, "only the created identity is audited");
    Ok(())
});

db_test!(merge_checks_versions, |pool| {
    let store = PgStore::new(pool.clone());
    let survivor = provision(&store, Subsystem::Cpoe, "C-1").await?;
    let superseded = provision(&store, Subsystem::Lis, "L-1").await?;

    let load = |id| store.load_identity(id);
    let s = load(survivor).await?.expect("survivor");
    let l = load(superseded).await?.expect("superseded");

    let stale = MergePlan {
        survivor: s.id,
        survivor_version: s.version + 1,
        superseded: l.id,
        superseded_version: l.version,
        merged_at: OffsetDateTime::now_utc(),
    };
    assert!(!store.commit_merge(&stale, identity_audit(AuditKind::IdentityMerged, s.id)).await?);
    assert_eq!(store.count_pending_audit().await?, 2);

    let plan = MergePlan {
        survivor_version: s.version,
        ..stale
    };
    assert!(store.commit_merge(&plan, identity_audit(AuditKind::IdentityMerged, s.id)).await?);
    assert!(
        !store.commit_merge(&plan, identity_audit(AuditKind::IdentityMerged, s.id)).await?,
        "versions moved on"
    );
    assert_eq!(store.count_pending_audit().await?, 3);

    let merged = load(survivor).await?.expect("survivor");
    assert!(merged.identifiers.contains(&LocalIdentifier::new(Subsystem::Lis, "L-1")));
    assert_eq!(load(superseded).await?.expect("superseded").superseded_by, Some(survivor));
    assert_eq!(store.merge_history(superseded).await?.len(), 1);
    assert_eq!(store.count_identities().await?, 1);

    // Linking to a superseded identity must be retried against the survivor.
    let outcome = store
        .link(
            &LocalIdentifier::new(Subsystem::Ris, "R-1"),
            superseded,
            identity_audit(AuditKind::IdentityLinked, superseded),
        )
        .await?;
    assert_eq!(outcome, LinkOutcome::TargetSuperseded);
    assert_eq!(store.count_pending_audit().await?, 3);
    Ok(())
});

db_test!(link_reports_existing_owner, |pool| {
    let store = PgStore::new(pool.clone());
    let owner = provision(&store, Subsystem::Ris, "R-1").await?;
    let other = provision(&store, Subsystem::Cpoe, "C-1").await?;

    let pharmacy = LocalIdentifier::new(Subsystem::Pharmacy, "PH-1");
    let audit = || identity_audit(AuditKind::IdentityLinked, other);
    assert_eq!(store.link(&pharmacy, other, audit()).await?, LinkOutcome::Linked);

    let ris = LocalIdentifier::new(Subsystem::Ris, "R-1");
    assert_eq!(store.link(&ris, other, audit()).await?, LinkOutcome::AlreadyLinked(owner));
    assert_eq!(store.count_pending_audit().await?, 3, "two provisions and one link");
    Ok(())
});

// =============================================================================
// Outbox
// =============================================================================

db_test!(enqueue_is_insert_if_absent, |pool| {
    let store = PgStore::new(pool.clone());
    let cmd = command(Subsystem::Lis);

    assert!(store.enqueue_command(cmd.clone()).await?);
    assert!(!store.enqueue_command(cmd.clone()).await?);

    let stored = store.get_command(cmd.id).await?.expect("command");
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert_eq!(stored.payload, cmd.payload);
    assert_eq!(stored.target, Subsystem::Lis);
    Ok(())
});

db_test!(claimed_command_is_locked, |pool| {
    let store = PgStore::new(pool.clone());
    store.enqueue_command(command(Subsystem::Lis)).await?;

    let claimed = store.claim_command("w1", Duration::from_secs(30)).await?;
    assert!(claimed.is_some());
    assert!(store.claim_command("w2", Duration::from_secs(30)).await?.is_none());

    store.mark_delivered(claimed.expect("claimed").id).await?;
    assert_eq!(store.count_commands(DeliveryStatus::Delivered).await?, 1);
    Ok(())
});

db_test!(failure_exhaustion_and_operator_retry, |pool| {
    let store = PgStore::new(pool.clone());
    let cmd = command(Subsystem::Ris);
    store.enqueue_command(cmd.clone()).await?;

    let claimed = store.claim_command("w", Duration::from_secs(30)).await?.expect("claim");
    store.record_failure(claimed.id, "connection refused", Duration::ZERO).await?;

    let retried = store.claim_command("w", Duration::from_secs(30)).await?.expect("reclaim");
    assert_eq!(retried.status, DeliveryStatus::Failed);
    assert_eq!(retried.attempts, 1);
    assert_eq!(retried.last_error.as_deref(), Some("connection refused"));

    assert!(!store.retry_exhausted(cmd.id).await?, "not exhausted yet");
    store
        .mark_exhausted(
            cmd.id,
            "connection refused",
            AuditRecord::new(AuditKind::DeliveryExhausted, AuditReference::Command(cmd.id)),
        )
        .await?;
    assert_eq!(store.count_pending_audit().await?, 1);
    assert!(store.claim_command("w", Duration::from_secs(30)).await?.is_none());
    assert_eq!(store.count_commands(DeliveryStatus::Exhausted).await?, 1);

    assert!(store.retry_exhausted(cmd.id).await?);
    let reset = store.get_command(cmd.id).await?.expect("command");
    assert_eq!(reset.status, DeliveryStatus::Pending);
    assert_eq!(reset.attempts, 0);
    assert!(store.claim_command("w", Duration::from_secs(30)).await?.is_some());
    Ok(())
});

// =============================================================================
// Audit queue and dead letters
// =============================================================================

db_test!(audit_queue_delivers_each_record_once, |pool| {
    let store = PgStore::new(pool.clone());
    store
        .enqueue_audit(vec![
            AuditRecord::new(AuditKind::Unrouted, AuditReference::Event(EventId::generate())),
            AuditRecord::new(AuditKind::IdentityProvisioned, AuditReference::Identity(CanonicalId::generate())),
        ])
        .await?;
    assert_eq!(store.count_pending_audit().await?, 2);

    let first = store.claim_audit("w", Duration::from_secs(30)).await?.expect("first");
    let second = store.claim_audit("w", Duration::from_secs(30)).await?.expect("second");
    assert_ne!(first.record.id, second.record.id);
    assert!(store.claim_audit("w", Duration::from_secs(30)).await?.is_none());

    store.mark_audit_delivered(first.record.id).await?;
    store.record_audit_failure(second.record.id, "sink down", Duration::ZERO).await?;
    assert_eq!(store.count_pending_audit().await?, 1);

    let again = store.claim_audit("w", Duration::from_secs(30)).await?.expect("retry");
    assert_eq!(again.record, second.record);
    assert_eq!(again.attempts, 1);
    Ok(())
});

db_test!(dead_letters_are_recorded_once, |pool| {
    let store = PgStore::new(pool.clone());
    let letter = DeadLetter {
        id: Uuid::now_v7(),
        workflow_type: WF.into(),
        workflow_id: Some(WorkflowId::new("ORD-1")),
        input_id: "event-1".into(),
        reason: DeadLetterReason::LateEvent,
        detail: "instance is Completed".into(),
        payload: json!({ "orderId": "ORD-1" }),
        recorded_at: OffsetDateTime::now_utc(),
    };

    let audit = || AuditRecord::new(AuditKind::LateEvent, AuditReference::Operator("event-1".into()));
    assert!(store.record_dead_letter(letter.clone(), audit()).await?);
    assert!(
        !store
            .record_dead_letter(
                DeadLetter {
                    id: Uuid::now_v7(),
                    ..letter
                },
                audit(),
            )
            .await?
    );
    assert_eq!(store.count_pending_audit().await?, 1);

    let letters = store.list_dead_letters(10).await?;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::LateEvent);
    assert_eq!(store.count_dead_letters().await?, 1);
    Ok(())
});
