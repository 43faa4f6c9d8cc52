//! Outbox delivery and audit forwarding against fake spokes.

use std::time::Duration;

use clinhub::health::{self, HealthStatus};
use clinhub::store::{CommandQuery, DeliveryStatus, OutboxStore};
use clinhub::{AuditKind, Subsystem};

use crate::support::{SpokeMode, TEST_MAX_ATTEMPTS, TestHub, order_placed};

fn to_lis() -> CommandQuery {
    CommandQuery::new().target(Subsystem::Lis)
}

#[tokio::test]
async fn command_id_is_the_idempotency_key() -> anyhow::Result<()> {
    let app = TestHub::builder().start();

    app.hub.submit(&order_placed("P-1", "ORD-1", "lab")).await?;
    let commands = app.wait_for_command_status(to_lis(), DeliveryStatus::Delivered).await?;

    let deliveries = app.transport.deliveries_to(Subsystem::Lis);
    assert_eq!(deliveries.len(), 1);
    let request = &deliveries[0].request;
    assert_eq!(request.command_id, commands[0].id);
    assert_eq!(request.idempotency_key, commands[0].id.to_string());
    assert_eq!(request.action, "order.transmit");
    assert_eq!(request.attempt, 1);
    assert_eq!(request.payload["orderId"], "ORD-1");
    assert!(commands[0].delivered_at.is_some());

    app.shutdown().await
}

#[tokio::test]
async fn transient_failures_are_retried_until_delivered() -> anyhow::Result<()> {
    let app = TestHub::builder().spoke_mode(SpokeMode::FailTimes(2)).start();

    app.hub.submit(&order_placed("P-1", "ORD-1", "lab")).await?;
    app.wait_for_command_status(to_lis(), DeliveryStatus::Delivered).await?;

    let attempts: Vec<u32> = app
        .transport
        .deliveries_to(Subsystem::Lis)
        .iter()
        .map(|d| d.request.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    // Every attempt carries the same key.
    let keys: std::collections::HashSet<_> = app
        .transport
        .deliveries()
        .into_iter()
        .map(|d| d.request.idempotency_key)
        .collect();
    assert_eq!(keys.len(), 1);

    app.shutdown().await
}

#[tokio::test]
async fn unavailable_spoke_exhausts_then_operator_retry_delivers() -> anyhow::Result<()> {
    let app = TestHub::builder().spoke_mode(SpokeMode::Unavailable).start();

    app.hub.submit(&order_placed("P-1", "ORD-1", "lab")).await?;
    let exhausted = app.wait_for_command_status(to_lis(), DeliveryStatus::Exhausted).await?;
    assert_eq!(exhausted[0].attempts, TEST_MAX_ATTEMPTS);
    assert!(exhausted[0].last_error.is_some());
    assert_eq!(
        app.transport.deliveries_to(Subsystem::Lis).len(),
        TEST_MAX_ATTEMPTS as usize
    );

    app.wait_for_audit(AuditKind::DeliveryExhausted, 1).await?;
    let reports = app.hub.health().await;
    let outbox = reports.iter().find(|r| r.component == health::OUTBOX).unwrap();
    assert_eq!(outbox.status, HealthStatus::Degraded);

    app.transport.set_mode(SpokeMode::Accept);
    assert!(app.store().retry_exhausted(exhausted[0].id).await?);
    assert!(!app.store().retry_exhausted(exhausted[0].id).await?);

    app.wait_for_command_status(to_lis(), DeliveryStatus::Delivered).await?;
    assert_eq!(app.hub.status().await?.exhausted_commands, 0);

    app.shutdown().await
}

#[tokio::test]
async fn rejected_command_is_not_retried() -> anyhow::Result<()> {
    let app = TestHub::builder().spoke_mode(SpokeMode::Reject).start();

    app.hub.submit(&order_placed("P-1", "ORD-1", "lab")).await?;
    let exhausted = app.wait_for_command_status(to_lis(), DeliveryStatus::Exhausted).await?;
    assert!(
        exhausted[0]
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("unknown order"))
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(app.transport.deliveries_to(Subsystem::Lis).len(), 1);

    app.shutdown().await
}

#[tokio::test]
async fn audit_records_survive_a_sink_outage() -> anyhow::Result<()> {
    let app = TestHub::builder().start();
    app.audit.set_down(true);

    app.hub.submit(&order_placed("P-1", "ORD-1", "lab")).await?;
    app.wait_for_status("order-lifecycle", "ORD-1", "Transmitted").await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(app.audit.records().is_empty());
    assert!(app.hub.status().await?.pending_audit_records > 0);

    app.audit.set_down(false);
    app.wait_for_audit(AuditKind::Transition, 1).await?;
    app.wait_for_audit(AuditKind::IdentityProvisioned, 1).await?;

    let transition = app
        .audit
        .records()
        .into_iter()
        .find(|r| r.kind == AuditKind::Transition)
        .unwrap();
    assert_eq!(transition.resulting_state.as_deref(), Some("Transmitted"));
    assert_eq!(
        transition.workflow.as_ref().map(|w| w.workflow_type().to_string()),
        Some("order-lifecycle".to_string())
    );

    app.shutdown().await
}
