//! Workflow lifecycles driven by routed events, timers and operators.

use std::time::Duration;

use clinhub::event::{CausalToken, EventId};
use clinhub::store::{CommandQuery, DeadLetterReason, DeadLetterStore, InstanceQuery, OutboxStore};
use clinhub::{ApplyOutcome, AuditKind, Error, Subsystem, WorkflowId};
use serde_json::json;

use crate::support::{
    DEFAULT_POLL_INTERVAL, DEFAULT_TEST_TIMEOUT, TestHub, envelope, order_placed, wait_until,
};

const ORDER: &str = "order-lifecycle";

fn lab(event_type: &str, order_id: &str) -> clinhub::RawEnvelope {
    envelope(Subsystem::Lis, "L-1", event_type, json!({ "orderId": order_id }))
}

#[tokio::test]
async fn order_runs_to_completion() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let hub = &app.hub;

    hub.ingest_and_route(&order_placed("P-1", "ORD-1", "laboratory")).await?;
    hub.ingest_and_route(&lab("SPECIMEN_COLLECTED", "ORD-1")).await?;
    let (_, report) = hub
        .ingest_and_route(&envelope(
            Subsystem::Lis,
            "L-1",
            "LAB_RESULT_READY",
            json!({ "orderId": "ORD-1", "result": { "potassium": 4.1 } }),
        ))
        .await?;

    match report.outcome(ORDER) {
        Some(ApplyOutcome::Applied { status, commands }) => {
            assert_eq!(status, "Completed");
            assert_eq!(commands.len(), 1);
        }
        other => panic!("expected applied result, got {other:?}"),
    }

    let view = hub.service().instance(ORDER, &WorkflowId::new("ORD-1")).await?;
    assert_eq!(view.status, "Completed");
    assert!(view.completed_at.is_some());
    assert!(view.patient.is_some());
    // Created, Transmitted, ResultPending, ResultReceived, Completed
    assert_eq!(view.history.len(), 5);
    assert_eq!(view.applied_inputs.len(), 3);

    let notifications = app
        .commands(CommandQuery::new().target(Subsystem::Notification))
        .await?;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].action, "result.available");

    let dpi = app.commands(CommandQuery::new().target(Subsystem::Dpi)).await?;
    assert_eq!(dpi.len(), 1, "result is filed in the patient record");
    Ok(())
}

#[tokio::test]
async fn repeated_accept_is_rejected_and_recorded() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let hub = &app.hub;

    hub.ingest_and_route(&order_placed("P-1", "ORD-1", "lab")).await?;
    hub.ingest_and_route(&lab("ORDER_ACCEPTED", "ORD-1")).await?;
    let (_, report) = hub.ingest_and_route(&lab("ORDER_ACCEPTED", "ORD-1")).await?;

    assert_eq!(
        report.outcome(ORDER),
        Some(&ApplyOutcome::Rejected {
            reason: "accept not accepted in ResultPending".into()
        })
    );

    let view = hub.service().instance(ORDER, &WorkflowId::new("ORD-1")).await?;
    assert_eq!(view.status, "ResultPending");
    assert_eq!(view.rejections.len(), 1);
    assert_eq!(view.rejections[0].status, "ResultPending");
    Ok(())
}

#[tokio::test]
async fn stale_token_from_a_source_is_rejected() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let hub = &app.hub;

    hub.ingest_and_route(&order_placed("P-1", "ORD-1", "lab")).await?;
    let (accepted, _) = hub.ingest_and_route(&lab("ORDER_ACCEPTED", "ORD-1")).await?;

    // A distinct event carrying a token the instance has already seen.
    let mut stale = accepted.clone();
    stale.id = EventId::generate();
    stale.event_type = "LAB_RESULT_READY".into();
    assert_eq!(stale.causal_token, CausalToken(1));

    let outcome = hub.service().apply_event(ORDER, &stale).await?;
    match outcome {
        ApplyOutcome::Rejected { reason } => assert!(reason.starts_with("out of order")),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(app.status_of(ORDER, "ORD-1").await?.as_deref(), Some("ResultPending"));

    // Re-applying the accepted event itself is a no-op.
    assert_eq!(hub.service().apply_event(ORDER, &accepted).await?, ApplyOutcome::Duplicate);
    Ok(())
}

#[tokio::test]
async fn late_event_goes_to_dead_letters() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let hub = &app.hub;

    hub.ingest_and_route(&order_placed("P-1", "ORD-1", "lab")).await?;
    hub.ingest_and_route(&lab("RESULT_RECEIVED", "ORD-1")).await?;
    let (_, report) = hub
        .ingest_and_route(&envelope(
            Subsystem::Cpoe,
            "P-1",
            "ORDER_CANCELLED",
            json!({ "orderId": "ORD-1" }),
        ))
        .await?;

    assert_eq!(
        report.outcome(ORDER),
        Some(&ApplyOutcome::LateEvent {
            status: "Completed".into()
        })
    );

    let letters = app.store().list_dead_letters(10).await?;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::LateEvent);
    assert_eq!(letters[0].workflow_id, Some(WorkflowId::new("ORD-1")));
    Ok(())
}

#[tokio::test]
async fn refused_first_event_creates_no_instance() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let hub = &app.hub;

    let (_, report) = hub.ingest_and_route(&lab("ORDER_ACCEPTED", "ORD-9")).await?;
    assert_eq!(
        report.outcome(ORDER),
        Some(&ApplyOutcome::Rejected {
            reason: "accept not accepted in New".into()
        })
    );

    assert_eq!(app.status_of(ORDER, "ORD-9").await?, None);
    let listed = hub
        .service()
        .list(&InstanceQuery {
            workflow_type: Some(ORDER.into()),
            limit: 10,
            ..Default::default()
        })
        .await?;
    assert!(listed.is_empty());

    let letters = app.store().list_dead_letters(10).await?;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::Rejected);
    assert_eq!(letters[0].workflow_id, Some(WorkflowId::new("ORD-9")));

    // The order can still be placed afterwards.
    hub.ingest_and_route(&order_placed("P-1", "ORD-9", "lab")).await?;
    assert_eq!(app.status_of(ORDER, "ORD-9").await?.as_deref(), Some("Transmitted"));
    Ok(())
}

#[tokio::test]
async fn event_without_business_key_is_uncorrelated() -> anyhow::Result<()> {
    let app = TestHub::builder().start();

    let (_, report) = app
        .hub
        .ingest_and_route(&envelope(Subsystem::Cpoe, "P-1", "ORDER_PLACED", json!({ "department": "lab" })))
        .await?;
    assert!(matches!(report.outcome(ORDER), Some(ApplyOutcome::Uncorrelated { .. })));

    let letters = app.store().list_dead_letters(10).await?;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::Uncorrelated);
    assert!(letters[0].workflow_id.is_none());

    app.wait_for_audit(AuditKind::Uncorrelated, 1).await?;
    app.shutdown().await
}

#[tokio::test]
async fn operator_cancellation() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let hub = &app.hub;
    let order = WorkflowId::new("ORD-1");

    let err = hub.service().cancel(ORDER, &order, "duplicate").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    hub.ingest_and_route(&order_placed("P-1", "ORD-1", "radiology")).await?;
    let outcome = hub.service().cancel(ORDER, &order, "duplicate order").await?;
    assert!(matches!(&outcome, ApplyOutcome::Applied { status, .. } if status == "Cancelled"));

    let cancels = app
        .commands(CommandQuery::new().target(Subsystem::Ris))
        .await?
        .into_iter()
        .filter(|c| c.action == "order.cancel")
        .collect::<Vec<_>>();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].payload["reason"], "duplicate order");

    let again = hub.service().cancel(ORDER, &order, "duplicate order").await?;
    assert!(matches!(again, ApplyOutcome::LateEvent { .. }));
    Ok(())
}

#[tokio::test]
async fn encounters_cannot_be_cancelled() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    app.hub
        .ingest_and_route(&envelope(
            Subsystem::Cpoe,
            "P-1",
            "PATIENT_ADMITTED",
            json!({ "encounterId": "ENC-1", "departmentId": "cardiology" }),
        ))
        .await?;

    let err = app
        .hub
        .service()
        .cancel("encounter", &WorkflowId::new("ENC-1"), "test")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CancellationUnsupported(_)));
    Ok(())
}

#[tokio::test]
async fn overdue_order_fails_on_deadline() -> anyhow::Result<()> {
    let app = TestHub::builder()
        .config(|c| c.workflow.default_deadline = Some(Duration::from_millis(100)))
        .start();

    app.hub.submit(&order_placed("P-1", "ORD-1", "lab")).await?;
    app.wait_for_status(ORDER, "ORD-1", "Failed").await?;

    let timeouts = app
        .commands(CommandQuery::new().target(Subsystem::Notification))
        .await?;
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].action, "order.timeout");

    app.shutdown().await
}

#[tokio::test]
async fn result_before_deadline_clears_the_timer() -> anyhow::Result<()> {
    let app = TestHub::builder()
        .config(|c| c.workflow.default_deadline = Some(Duration::from_millis(300)))
        .start();

    // Inline, since the two sources resolve to different patient shards.
    app.hub.ingest_and_route(&order_placed("P-1", "ORD-1", "lab")).await?;
    app.hub.ingest_and_route(&lab("RESULT_RECEIVED", "ORD-1")).await?;
    assert_eq!(app.status_of(ORDER, "ORD-1").await?.as_deref(), Some("Completed"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(app.status_of(ORDER, "ORD-1").await?.as_deref(), Some("Completed"));
    assert!(
        app.store().list_dead_letters(10).await?.is_empty(),
        "a fired deadline must not dead-letter"
    );

    app.shutdown().await
}

#[tokio::test]
async fn deadline_claimed_before_a_rearm_is_superseded() -> anyhow::Result<()> {
    let app = TestHub::builder()
        .config(|c| c.workflow.default_deadline = Some(Duration::from_millis(50)))
        .build();
    let hub = &app.hub;

    hub.ingest_and_route(&order_placed("P-1", "ORD-1", "lab")).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let claimed = app
        .store()
        .claim_timer("w", Duration::from_secs(30))
        .await?
        .expect("deadline is due");

    hub.ingest_and_route(&lab("ORDER_ACCEPTED", "ORD-1")).await?;
    assert_eq!(hub.service().apply_timer(&claimed).await?, ApplyOutcome::Superseded);
    assert_eq!(app.status_of(ORDER, "ORD-1").await?.as_deref(), Some("ResultPending"));

    app.store().mark_timer_processed(claimed.id).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let rearmed = app
        .store()
        .claim_timer("w", Duration::from_secs(30))
        .await?
        .expect("re-armed deadline is still scheduled");
    assert_ne!(rearmed.id, claimed.id);
    Ok(())
}

#[tokio::test]
async fn retention_sweep_archives_terminal_instances() -> anyhow::Result<()> {
    let app = TestHub::builder()
        .config(|c| {
            c.workflow.retention = Duration::ZERO;
            c.runtime.retention_sweep_interval = Duration::from_millis(20);
        })
        .start();

    app.hub.ingest_and_route(&order_placed("P-1", "ORD-1", "lab")).await?;
    app.hub.ingest_and_route(&order_placed("P-1", "ORD-2", "lab")).await?;
    app.hub.ingest_and_route(&lab("RESULT_RECEIVED", "ORD-1")).await?;

    let query = InstanceQuery {
        workflow_type: Some(ORDER.into()),
        limit: 10,
        ..Default::default()
    };
    wait_until(DEFAULT_TEST_TIMEOUT, DEFAULT_POLL_INTERVAL, || async {
        let listed = app.hub.service().list(&query).await?;
        let ids: Vec<_> = listed.iter().map(|s| s.workflow.workflow_id().to_string()).collect();
        Ok((ids == ["ORD-2"]).then_some(()))
    })
    .await?;

    let archived = app.hub.service().instance(ORDER, &WorkflowId::new("ORD-1")).await?;
    assert!(archived.archived_at.is_some());

    app.shutdown().await
}

#[tokio::test]
async fn medication_is_dispensed() -> anyhow::Result<()> {
    let app = TestHub::builder().start();

    app.hub
        .submit(&envelope(
            Subsystem::Cpoe,
            "P-1",
            "PRESCRIPTION_CREATED",
            json!({ "prescriptionId": "RX-1", "drug": "amoxicillin" }),
        ))
        .await?;
    app.wait_for_status("medication-dispense", "RX-1", "DispenseRequested").await?;

    let requests = wait_until(DEFAULT_TEST_TIMEOUT, DEFAULT_POLL_INTERVAL, || async {
        let delivered = app.transport.deliveries_to(Subsystem::Pharmacy);
        Ok((!delivered.is_empty()).then_some(delivered))
    })
    .await?;
    assert_eq!(requests[0].request.action, "dispense.request");

    app.hub
        .submit(&envelope(
            Subsystem::Pharmacy,
            "PH-1",
            "MEDICATION_DISPENSED",
            json!({ "prescription_id": "RX-1" }),
        ))
        .await?;
    app.wait_for_status("medication-dispense", "RX-1", "Dispensed").await?;

    app.shutdown().await
}

#[tokio::test]
async fn encounter_transfer_and_discharge() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let hub = &app.hub;
    let adt = |event_type: &str, payload| envelope(Subsystem::Cpoe, "P-1", event_type, payload);

    hub.ingest_and_route(&adt("PATIENT_ADMITTED", json!({ "encounterId": "ENC-1", "departmentId": "er" })))
        .await?;

    let (_, same_ward) = hub
        .ingest_and_route(&adt("PATIENT_TRANSFERRED", json!({ "encounterId": "ENC-1", "departmentId": "er" })))
        .await?;
    assert!(matches!(same_ward.outcome("encounter"), Some(ApplyOutcome::Rejected { .. })));

    hub.ingest_and_route(&adt("PATIENT_TRANSFERRED", json!({ "encounterId": "ENC-1", "departmentId": "icu" })))
        .await?;
    assert_eq!(app.status_of("encounter", "ENC-1").await?.as_deref(), Some("Transferred"));

    hub.ingest_and_route(&adt("PATIENT_DISCHARGED", json!({ "encounterId": "ENC-1" })))
        .await?;
    assert_eq!(app.status_of("encounter", "ENC-1").await?.as_deref(), Some("Discharged"));

    let pharmacy = app
        .commands(CommandQuery::new().target(Subsystem::Pharmacy))
        .await?;
    assert_eq!(pharmacy.len(), 1);
    assert_eq!(pharmacy[0].action, "patient.discharged");
    Ok(())
}
