//! Ingestion, journaling and routing.

use clinhub::event::CausalToken;
use clinhub::health::{self, HealthStatus};
use clinhub::store::{CommandQuery, DeliveryStatus};
use clinhub::{ApplyOutcome, Error, RawEnvelope, RouteTarget, Subsystem};
use serde_json::json;

use crate::support::{TestHub, envelope, order_placed};

#[tokio::test]
async fn causal_tokens_increase_per_source() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let router = app.hub.router();

    let mut cpoe = Vec::new();
    for n in 0..3 {
        let event = router
            .ingest(&order_placed("P-1", &format!("ORD-{n}"), "lab"))
            .await?;
        cpoe.push(event.causal_token);
    }
    let lis = router
        .ingest(&envelope(Subsystem::Lis, "L-1", "SPECIMEN_COLLECTED", json!({ "orderId": "ORD-0" })))
        .await?;

    assert_eq!(cpoe, vec![CausalToken(1), CausalToken(2), CausalToken(3)]);
    assert_eq!(lis.causal_token, CausalToken(1));
    Ok(())
}

#[tokio::test]
async fn resubmitted_source_event_is_journaled_once() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let raw = order_placed("P-1", "ORD-1", "lab").with_source_event_id("cpoe-42");

    let (first, report) = app.hub.ingest_and_route(&raw).await?;
    let (second, _) = app.hub.ingest_and_route(&raw).await?;

    assert_eq!(first.id, second.id);
    assert_eq!(first.causal_token, second.causal_token);
    assert!(report.outcome("order-lifecycle").is_some_and(ApplyOutcome::is_applied));

    // Routing the same event again does not issue a second transmit.
    let commands = app.commands(CommandQuery::new().target(Subsystem::Lis)).await?;
    assert_eq!(commands.len(), 1);

    let next = app.hub.router().ingest(&order_placed("P-1", "ORD-2", "lab")).await?;
    assert_eq!(next.causal_token, CausalToken(2));
    Ok(())
}

#[tokio::test]
async fn malformed_envelope_is_not_journaled() -> anyhow::Result<()> {
    let app = TestHub::builder().build();

    let missing_type = RawEnvelope {
        event_type: None,
        ..order_placed("P-1", "ORD-1", "lab")
    };
    let err = app.hub.submit(&missing_type).await.unwrap_err();
    assert!(matches!(err, Error::MalformedEnvelope(_)));
    assert!(err.is_rejection());

    let unknown_source = RawEnvelope {
        source: Some("mainframe".into()),
        ..order_placed("P-1", "ORD-1", "lab")
    };
    let err = app.hub.submit(&unknown_source).await.unwrap_err();
    assert_eq!(err.reason_code(), "malformed_envelope");

    let status = app.hub.status().await?;
    assert_eq!(status.pending_events, 0);
    assert_eq!(status.identities, 0);
    Ok(())
}

#[tokio::test]
async fn event_without_subscriber_is_unrouted() -> anyhow::Result<()> {
    let app = TestHub::builder().build();

    let (event, report) = app
        .hub
        .ingest_and_route(&envelope(Subsystem::Cpoe, "P-1", "BILLING_CLOSED", json!({})))
        .await?;

    assert!(report.unrouted);
    assert!(report.targets.is_empty());

    let unrouted = app.hub.router().unrouted(10).await?;
    assert_eq!(unrouted.len(), 1);
    assert_eq!(unrouted[0].id, event.id);

    let reports = app.hub.health().await;
    let router = reports
        .iter()
        .find(|r| r.component == health::MESSAGE_ROUTER)
        .unwrap();
    assert_eq!(router.status, HealthStatus::Degraded);
    Ok(())
}

#[tokio::test]
async fn results_are_forwarded_to_the_patient_record_but_not_echoed() -> anyhow::Result<()> {
    let app = TestHub::builder().build();

    let (_, from_lab) = app
        .hub
        .ingest_and_route(&envelope(
            Subsystem::Lis,
            "L-1",
            "LAB_RESULT_READY",
            json!({ "orderId": "ORD-1", "result": { "hb": 13.2 } }),
        ))
        .await?;
    assert!(from_lab.targets.contains(&RouteTarget::Spoke(Subsystem::Dpi)));
    assert_eq!(from_lab.forwarded.len(), 1);

    let (_, from_dpi) = app
        .hub
        .ingest_and_route(&envelope(
            Subsystem::Dpi,
            "D-1",
            "RESULT_RECEIVED",
            json!({ "orderId": "ORD-2" }),
        ))
        .await?;
    assert!(!from_dpi.targets.contains(&RouteTarget::Spoke(Subsystem::Dpi)));
    assert!(from_dpi.forwarded.is_empty());

    let forwarded = app
        .commands(CommandQuery::new().target(Subsystem::Dpi))
        .await?;
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].action, "event.lab_result_ready");
    assert!(forwarded[0].workflow.is_none());
    Ok(())
}

#[tokio::test]
async fn recover_routes_pending_journal_entries() -> anyhow::Result<()> {
    let app = TestHub::builder().build();

    // Journaled but never routed, as if the process stopped here.
    app.hub.router().ingest(&order_placed("P-1", "ORD-1", "lab")).await?;
    app.hub.router().ingest(&order_placed("P-2", "ORD-2", "radiology")).await?;
    assert_eq!(app.hub.status().await?.pending_events, 2);

    assert_eq!(app.hub.recover().await?, 2);
    assert_eq!(app.hub.recover().await?, 0);

    assert_eq!(app.status_of("order-lifecycle", "ORD-1").await?.as_deref(), Some("Transmitted"));
    let ris = app.commands(CommandQuery::new().target(Subsystem::Ris)).await?;
    assert_eq!(ris.len(), 1);
    assert_eq!(ris[0].status, DeliveryStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn submitted_events_are_routed_by_a_running_hub() -> anyhow::Result<()> {
    let app = TestHub::builder().start();

    let event = app.hub.submit(&order_placed("P-1", "ORD-1", "lab")).await?;
    assert_eq!(event.causal_token, CausalToken(1));

    app.wait_for_status("order-lifecycle", "ORD-1", "Transmitted").await?;
    app.wait_for_command_status(CommandQuery::new().target(Subsystem::Lis), DeliveryStatus::Delivered)
        .await?;

    app.shutdown().await
}
