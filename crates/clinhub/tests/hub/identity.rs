//! Identity resolution through the hub.

use std::collections::HashSet;
use std::sync::Arc;

use clinhub::identity::LocalIdentifier;
use clinhub::{Error, Subsystem};

use crate::support::{TestHub, order_placed};

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_first_resolves_share_one_identity() -> anyhow::Result<()> {
    let app = TestHub::builder().build();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let hub = Arc::clone(&app.hub);
        handles.push(tokio::spawn(async move {
            hub.resolver().resolve(Subsystem::Lis, "L-100").await
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await??.id);
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(app.hub.status().await?.identities, 1);
    Ok(())
}

#[tokio::test]
async fn merge_is_commutative_and_idempotent() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let resolver = app.hub.resolver();

    let first = resolver.resolve(Subsystem::Cpoe, "C-1").await?;
    let second = resolver.resolve(Subsystem::Lis, "L-1").await?;

    let survivor = resolver.merge(second.id, first.id).await?;
    assert_eq!(survivor.id, first.id, "older identity survives");
    assert!(survivor.identifiers.contains(&LocalIdentifier::new(Subsystem::Lis, "L-1")));
    assert!(survivor.identifiers.contains(&LocalIdentifier::new(Subsystem::Cpoe, "C-1")));

    let again = resolver.merge(first.id, second.id).await?;
    assert_eq!(again.id, survivor.id);
    assert_eq!(resolver.history(survivor.id).await?.len(), 1);

    // The superseded identity and its identifiers redirect to the survivor.
    assert_eq!(resolver.lookup(second.id).await?.id, survivor.id);
    assert_eq!(resolver.resolve(Subsystem::Lis, "L-1").await?.id, survivor.id);
    Ok(())
}

#[tokio::test]
async fn events_after_merge_carry_the_survivor() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let resolver = app.hub.resolver();

    let cpoe = resolver.resolve(Subsystem::Cpoe, "P-1").await?;
    let lis = resolver.resolve(Subsystem::Lis, "P-1").await?;
    resolver.merge(cpoe.id, lis.id).await?;

    let event = app
        .hub
        .router()
        .ingest(&crate::support::envelope(
            Subsystem::Lis,
            "P-1",
            "SPECIMEN_COLLECTED",
            serde_json::json!({ "orderId": "ORD-9" }),
        ))
        .await?;
    assert_eq!(event.patient, cpoe.id);
    Ok(())
}

#[tokio::test]
async fn unknown_identity_without_auto_provision_is_rejected() -> anyhow::Result<()> {
    let app = TestHub::builder()
        .config(|c| c.identity.auto_provision = false)
        .build();

    let err = app
        .hub
        .ingest_and_route(&order_placed("P-404", "ORD-1", "lab"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownIdentity { subsystem: Subsystem::Cpoe, .. }));
    assert_eq!(err.reason_code(), "unknown_identity");

    let status = app.hub.status().await?;
    assert_eq!(status.pending_events, 0);
    assert_eq!(status.identities, 0);
    assert!(app.hub.router().unrouted(10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn linking_an_owned_identifier_conflicts() -> anyhow::Result<()> {
    let app = TestHub::builder().build();
    let resolver = app.hub.resolver();

    let owner = resolver.resolve(Subsystem::Ris, "R-1").await?;
    let other = resolver.resolve(Subsystem::Cpoe, "C-2").await?;

    let linked = resolver.link(Subsystem::Pharmacy, "PH-1", other.id).await?;
    assert!(linked.identifiers.contains(&LocalIdentifier::new(Subsystem::Pharmacy, "PH-1")));

    // Relinking to the current owner is a no-op.
    assert_eq!(resolver.link(Subsystem::Ris, "R-1", owner.id).await?.id, owner.id);

    let err = resolver.link(Subsystem::Ris, "R-1", other.id).await.unwrap_err();
    assert!(matches!(err, Error::IdentityConflict { .. }));
    Ok(())
}
