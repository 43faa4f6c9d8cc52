//! Per-patient ordering across the inline, dispatcher and recovery paths.

use std::sync::Arc;

use clinhub::store::{EventJournal, RouteStatus};
use clinhub::{ApplyOutcome, Error, RawEnvelope, Subsystem, WorkflowId};
use serde_json::json;
use tokio::task::JoinSet;

use crate::support::{TestHub, envelope};

const ENCOUNTER: &str = "encounter";

fn admit(encounter: &str) -> RawEnvelope {
    envelope(
        Subsystem::Dpi,
        "P-1",
        "PATIENT_ADMITTED",
        json!({ "encounterId": encounter, "departmentId": "er" }),
    )
}

fn transfer(encounter: &str, department: &str) -> RawEnvelope {
    envelope(
        Subsystem::Dpi,
        "P-1",
        "PATIENT_TRANSFERRED",
        json!({ "encounterId": encounter, "departmentId": department }),
    )
}

#[tokio::test]
async fn routing_a_later_event_routes_earlier_ones_first() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let router = app.hub.router();

    let admitted = router.ingest(&admit("ENC-1")).await?;
    let to_icu = router.ingest(&transfer("ENC-1", "icu")).await?;
    let to_ward = router.ingest(&transfer("ENC-1", "ward")).await?;

    let report = router
        .route_pending(&to_ward)
        .await?
        .expect("event was pending");
    assert!(report.outcome(ENCOUNTER).is_some_and(ApplyOutcome::is_applied));

    // Both predecessors were routed on the way; nothing is left to do.
    assert!(router.route_pending(&to_icu).await?.is_none());
    assert!(router.route_pending(&admitted).await?.is_none());
    assert_eq!(app.store().count_events(RouteStatus::Pending).await?, 0);

    let view = app
        .hub
        .service()
        .instance(ENCOUNTER, &WorkflowId::new("ENC-1"))
        .await?;
    assert_eq!(view.status, "Transferred");
    assert!(view.rejections.is_empty(), "{:?}", view.rejections);
    assert_eq!(view.applied_inputs.len(), 3);
    Ok(())
}

#[tokio::test]
async fn inline_event_waits_for_queued_predecessor() -> anyhow::Result<()> {
    let app = TestHub::builder().build();

    // Journaled and queued, but no shard is running yet.
    app.hub.submit(&admit("ENC-1")).await?;

    let (_, report) = app.hub.ingest_and_route(&transfer("ENC-1", "icu")).await?;
    assert!(report.outcome(ENCOUNTER).is_some_and(ApplyOutcome::is_applied));
    assert_eq!(app.status_of(ENCOUNTER, "ENC-1").await?.as_deref(), Some("Transferred"));
    assert_eq!(app.store().count_events(RouteStatus::Pending).await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inline_events_for_one_encounter_are_all_applied() -> anyhow::Result<()> {
    const TRANSFERS: usize = 40;

    let app = TestHub::builder().build();
    app.hub.ingest_and_route(&admit("ENC-1")).await?;

    let mut tasks = JoinSet::new();
    for n in 0..TRANSFERS {
        let hub = Arc::clone(&app.hub);
        tasks.spawn(async move {
            let (_, report) = hub.ingest_and_route(&transfer("ENC-1", &format!("ward-{n}"))).await?;
            Ok::<_, Error>(report.outcome(ENCOUNTER).cloned())
        });
    }

    let mut rejected = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined?? {
            Some(ApplyOutcome::Applied { .. }) => {}
            other => rejected.push(other),
        }
    }
    assert!(rejected.is_empty(), "not applied: {rejected:?}");

    let view = app
        .hub
        .service()
        .instance(ENCOUNTER, &WorkflowId::new("ENC-1"))
        .await?;
    assert!(view.rejections.is_empty());
    assert_eq!(view.applied_inputs.len(), TRANSFERS + 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submitted_events_for_one_encounter_are_all_applied() -> anyhow::Result<()> {
    const TRANSFERS: usize = 25;

    let app = TestHub::builder().start();
    app.hub.submit(&admit("ENC-1")).await?;

    let mut tasks = JoinSet::new();
    for n in 0..TRANSFERS {
        let hub = Arc::clone(&app.hub);
        tasks.spawn(async move { hub.submit(&transfer("ENC-1", &format!("ward-{n}"))).await });
    }
    while let Some(joined) = tasks.join_next().await {
        joined??;
    }

    crate::support::wait_until(
        crate::support::DEFAULT_TEST_TIMEOUT,
        crate::support::DEFAULT_POLL_INTERVAL,
        || async {
            let pending = app.store().count_events(RouteStatus::Pending).await?;
            Ok((pending == 0).then_some(()))
        },
    )
    .await?;

    let view = app
        .hub
        .service()
        .instance(ENCOUNTER, &WorkflowId::new("ENC-1"))
        .await?;
    assert!(view.rejections.is_empty(), "{:?}", view.rejections);
    assert_eq!(view.applied_inputs.len(), TRANSFERS + 1);

    app.shutdown().await
}

#[tokio::test]
async fn full_shard_before_run_is_refused_without_journaling() -> anyhow::Result<()> {
    let app = TestHub::builder()
        .config(|c| {
            c.router.dispatch_shards = 1;
            c.router.dispatch_capacity = 1;
        })
        .build();

    app.hub.submit(&admit("ENC-1")).await?;
    let err = app.hub.submit(&transfer("ENC-1", "icu")).await.unwrap_err();
    assert!(matches!(err, Error::DispatcherFull { shard: 0 }), "{err}");
    assert_eq!(err.reason_code(), "dispatcher_full");
    assert_eq!(app.store().count_events(RouteStatus::Pending).await?, 1);

    // Running the hub drains the queue and recovers what it holds.
    let hub = Arc::clone(&app.hub);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(async move {
        hub.run(async move {
            let _ = stop_rx.await;
        })
        .await
    });

    app.wait_for_status(ENCOUNTER, "ENC-1", "Admitted").await?;
    app.hub.submit(&transfer("ENC-1", "icu")).await?;
    app.wait_for_status(ENCOUNTER, "ENC-1", "Transferred").await?;

    let _ = stop_tx.send(());
    running.await??;
    Ok(())
}

#[tokio::test]
async fn events_pending_across_a_merge_apply_in_order() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let router = app.hub.router();
    let resolver = app.hub.resolver();

    let older = resolver.resolve(Subsystem::Dpi, "P-OLD").await?;
    app.hub.ingest_and_route(&admit("ENC-1")).await?;
    let to_icu = router.ingest(&transfer("ENC-1", "icu")).await?;

    let survivor = resolver.merge(older.id, to_icu.patient).await?;
    assert_eq!(survivor.id, older.id, "older identity survives");

    let to_ward = router.ingest(&transfer("ENC-1", "ward")).await?;
    assert_eq!(to_ward.patient, survivor.id);
    assert_ne!(to_icu.patient, to_ward.patient);

    let report = router
        .route_pending(&to_ward)
        .await?
        .expect("event was pending");
    assert!(report.outcome(ENCOUNTER).is_some_and(ApplyOutcome::is_applied));
    assert!(router.route_pending(&to_icu).await?.is_none());

    let view = app
        .hub
        .service()
        .instance(ENCOUNTER, &WorkflowId::new("ENC-1"))
        .await?;
    assert!(view.rejections.is_empty(), "{:?}", view.rejections);
    assert_eq!(view.applied_inputs.len(), 3);
    Ok(())
}

#[tokio::test]
async fn queued_events_survive_a_merge_between_shards() -> anyhow::Result<()> {
    let app = TestHub::builder()
        .config(|c| c.router.dispatch_shards = 16)
        .build();
    let resolver = app.hub.resolver();
    let dispatcher = app.hub.dispatcher();

    let older = resolver.resolve(Subsystem::Dpi, "P-OLD").await?;
    app.hub.ingest_and_route(&admit("ENC-1")).await?;
    let to_icu = app.hub.submit(&transfer("ENC-1", "icu")).await?;

    let survivor = resolver.merge(older.id, to_icu.patient).await?;
    let to_ward = app.hub.submit(&transfer("ENC-1", "ward")).await?;

    // New events of the merged-away identity are placed by the survivor.
    assert_eq!(to_ward.patient, survivor.id);
    assert_eq!(dispatcher.shard_for(to_ward.patient), dispatcher.shard_for(survivor.id));
    let relinked = resolver.resolve(Subsystem::Dpi, "P-1").await?;
    assert_eq!(dispatcher.shard_for(relinked.id), dispatcher.shard_for(survivor.id));
    assert_eq!(
        app.hub.router().stripe_for(relinked.id),
        app.hub.router().stripe_for(older.id)
    );

    let hub = Arc::clone(&app.hub);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(async move {
        hub.run(async move {
            let _ = stop_rx.await;
        })
        .await
    });

    crate::support::wait_until(
        crate::support::DEFAULT_TEST_TIMEOUT,
        crate::support::DEFAULT_POLL_INTERVAL,
        || async {
            let pending = app.store().count_events(RouteStatus::Pending).await?;
            Ok((pending == 0).then_some(()))
        },
    )
    .await?;

    let view = app
        .hub
        .service()
        .instance(ENCOUNTER, &WorkflowId::new("ENC-1"))
        .await?;
    assert_eq!(view.status, "Transferred");
    assert!(view.rejections.is_empty(), "{:?}", view.rejections);
    assert_eq!(view.applied_inputs.len(), 3);

    let _ = stop_tx.send(());
    running.await??;
    Ok(())
}
