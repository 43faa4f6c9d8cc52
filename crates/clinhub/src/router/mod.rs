//! Message routing: validation, identity resolution, journaling and fan-out.
//!
//! Every inbound envelope goes through the same pipeline:
//!
//! 1. [`RawEnvelope::validate`] checks the shape; nothing is stored on failure
//! 2. the local patient identifier is resolved to a canonical identity
//! 3. the event is written to the journal, which assigns its id and causal token
//! 4. [`MessageRouter::route_pending`] delivers it to every subscriber
//!
//! Events journaled but not yet routed stay [`RouteStatus::Pending`] and are
//! replayed by [`MessageRouter::recover`] on startup. Every step downstream of
//! the journal is idempotent, so a replay never duplicates an effect.
//!
//! Journaling and routing of one patient's events are serialized on a lock
//! stripe. Before an event is routed, every pending event of the same patient
//! journaled ahead of it is routed first, so workflows see a patient's events
//! in journal order whichever path (inline, dispatcher shard, recovery)
//! reaches them first.
//!
//! [`RouteStatus::Pending`]: crate::store::RouteStatus::Pending

mod dispatcher;
mod subscriptions;

pub use dispatcher::Dispatcher;
pub use subscriptions::{RouteTarget, SubscriptionTable};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::audit::{AuditKind, AuditRecord, AuditReference};
use crate::decider::ApplyOutcome;
use crate::delivery::RetryPolicy;
use crate::error::Result;
use crate::event::{ClinicalEvent, EventId, RawEnvelope, ValidatedEnvelope};
use crate::identity::{CanonicalId, CanonicalIdentity, IdentityResolver};
use crate::service::WorkflowService;
use crate::store::{
    AppendOutcome, AuditQueue, CommandId, EventJournal, HubStore, OutboundCommand, OutboxStore,
    RouteStatus,
};
use crate::subsystem::Subsystem;

const RECOVERY_BATCH: u32 = 100;

/// Dispatch configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Number of dispatch shards. Events of one patient always use the
    /// same shard. Default: 8.
    pub dispatch_shards: usize,

    /// Queued events per shard before `submit` waits. Default: 1024.
    pub dispatch_capacity: usize,

    /// Retries of a shard whose event failed to route. The shard takes no
    /// further event until this one is routed or the attempts run out; an
    /// event given up on stays pending and is routed ahead of the next
    /// event of its patient.
    pub route_retry: RetryPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dispatch_shards: 8,
            dispatch_capacity: 1024,
            route_retry: RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(10),
            },
        }
    }
}

/// Outcome for one workflow target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowOutcome {
    pub workflow_type: &'static str,
    #[serde(flatten)]
    pub outcome: ApplyOutcome,
}

/// What routing did with one event.
#[derive(Debug, Clone, Serialize)]
pub struct RouteReport {
    pub event_id: EventId,
    pub targets: Vec<RouteTarget>,
    pub workflows: Vec<WorkflowOutcome>,
    /// Outbox commands forwarding the event to spokes.
    pub forwarded: Vec<CommandId>,
    /// No subscriber matched the event type.
    pub unrouted: bool,
}

impl RouteReport {
    /// Outcome reported by `workflow_type`, if it was a target.
    pub fn outcome(&self, workflow_type: &str) -> Option<&ApplyOutcome> {
        self.workflows
            .iter()
            .find(|w| w.workflow_type == workflow_type)
            .map(|w| &w.outcome)
    }
}

/// Validates, resolves, journals and routes clinical events.
pub struct MessageRouter<S> {
    store: S,
    resolver: IdentityResolver<S>,
    service: Arc<WorkflowService<S>>,
    subscriptions: Arc<SubscriptionTable>,
    stripes: Vec<AsyncMutex<()>>,
}

impl<S> MessageRouter<S>
where
    S: HubStore,
{
    pub(crate) fn new(
        store: S,
        resolver: IdentityResolver<S>,
        service: Arc<WorkflowService<S>>,
        subscriptions: Arc<SubscriptionTable>,
        config: &RouterConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            service,
            subscriptions,
            stripes: (0..config.dispatch_shards.max(1))
                .map(|_| AsyncMutex::new(()))
                .collect(),
        }
    }

    /// Lock stripe serializing `patient`'s events.
    pub fn stripe_for(&self, patient: CanonicalId) -> usize {
        (patient.as_uuid().as_u128() % self.stripes.len() as u128) as usize
    }

    /// Lock the stripe of the identity `patient` survives as.
    ///
    /// Events journaled under an identity that was later merged away share
    /// the survivor's stripe. A merge landing while the lock is awaited is
    /// picked up by re-resolving once the lock is held.
    pub(crate) async fn lock_patient(&self, patient: CanonicalId) -> Result<(CanonicalId, MutexGuard<'_, ()>)> {
        let mut survivor = self.resolver.lookup(patient).await?.id;
        loop {
            let guard = self.stripes[self.stripe_for(survivor)].lock().await;
            let current = self.resolver.lookup(survivor).await?.id;
            if current == survivor {
                return Ok((survivor, guard));
            }
            drop(guard);
            survivor = current;
        }
    }

    pub fn resolver(&self) -> &IdentityResolver<S> {
        &self.resolver
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    /// Validate an envelope and resolve its patient. Nothing is journaled.
    ///
    /// Fails with [`Error::MalformedEnvelope`](crate::Error::MalformedEnvelope)
    /// or [`Error::UnknownIdentity`](crate::Error::UnknownIdentity).
    pub async fn admit(&self, raw: &RawEnvelope) -> Result<(ValidatedEnvelope, CanonicalIdentity)> {
        let envelope = raw.validate()?;
        let identity = self
            .resolver
            .resolve(envelope.source, &envelope.local_patient_id)
            .await?;
        Ok((envelope, identity))
    }

    /// Write an admitted envelope to the journal.
    pub async fn journal(
        &self,
        envelope: ValidatedEnvelope,
        patient: CanonicalId,
    ) -> Result<AppendOutcome> {
        let outcome = self.store.append(envelope, patient).await?;
        match &outcome {
            AppendOutcome::Appended(event) => info!(
                event_id = %event.id,
                source = %event.source,
                event_type = %event.event_type,
                patient = %event.patient,
                causal_token = %event.causal_token,
                "Event accepted"
            ),
            AppendOutcome::Existing(event) => debug!(
                event_id = %event.id,
                source = %event.source,
                source_event_id = event.source_event_id.as_deref(),
                "Event already journaled"
            ),
        }
        Ok(outcome)
    }

    /// Admit and journal an envelope without routing it.
    ///
    /// Re-ingesting an envelope with a known `(source, source_event_id)`
    /// returns the event journaled the first time.
    pub async fn ingest(&self, raw: &RawEnvelope) -> Result<ClinicalEvent> {
        let (envelope, identity) = self.admit(raw).await?;
        Ok(self.journal(envelope, identity.id).await?.into_event())
    }

    /// Deliver a journaled event to its subscribers.
    ///
    /// Workflow targets are applied in subscription order; spoke targets
    /// get an outbox command. The originating subsystem never receives its
    /// own event back. An event without subscribers is marked unrouted and
    /// audited. Callers hold the patient's lock stripe.
    async fn route(&self, event: &ClinicalEvent) -> Result<RouteReport> {
        let targets: Vec<RouteTarget> = self
            .subscriptions
            .targets(&event.event_type)
            .iter()
            .copied()
            .filter(|target| *target != RouteTarget::Spoke(event.source))
            .collect();

        let mut report = RouteReport {
            event_id: event.id,
            targets: targets.clone(),
            workflows: Vec::new(),
            forwarded: Vec::new(),
            unrouted: targets.is_empty(),
        };

        if targets.is_empty() {
            warn!(event_id = %event.id, event_type = %event.event_type, "No subscriber for event");
            self.store
                .enqueue_audit(vec![
                    AuditRecord::new(AuditKind::Unrouted, AuditReference::Event(event.id))
                        .with_category(event.category())
                        .with_detail(format!("no subscriber for {}", event.event_type)),
                ])
                .await?;
            self.store.mark_unrouted(event.id).await?;
            return Ok(report);
        }

        let identity = if targets.iter().any(|t| matches!(t, RouteTarget::Spoke(_))) {
            Some(self.resolver.lookup(event.patient).await?)
        } else {
            None
        };

        for target in targets {
            match (target, &identity) {
                (RouteTarget::Workflow(workflow_type), _) => {
                    let outcome = self.service.apply_event(workflow_type, event).await?;
                    debug!(event_id = %event.id, workflow_type, ?outcome, "Routed to workflow");
                    report.workflows.push(WorkflowOutcome {
                        workflow_type,
                        outcome,
                    });
                }
                (RouteTarget::Spoke(subsystem), Some(identity)) => {
                    let command = forward_command(event, subsystem, identity);
                    let command_id = command.id;
                    if self.store.enqueue_command(command).await? {
                        debug!(event_id = %event.id, target = %subsystem, %command_id, "Forwarded to spoke");
                    }
                    report.forwarded.push(command_id);
                }
                (RouteTarget::Spoke(_), None) => {}
            }
        }

        self.store.mark_routed(event.id).await?;
        Ok(report)
    }

    /// Admit, journal and route an envelope inline.
    ///
    /// The patient's lock stripe is held from journaling to the end of
    /// routing, so concurrent callers for one patient are applied in the
    /// order their events were journaled.
    pub async fn ingest_and_route(&self, raw: &RawEnvelope) -> Result<(ClinicalEvent, RouteReport)> {
        let (envelope, identity) = self.admit(raw).await?;
        let (patient, _guard) = self.lock_patient(identity.id).await?;
        let event = self.journal(envelope, patient).await?.into_event();
        let report = self.route_after_predecessors(&event, patient).await?;
        Ok((event, report))
    }

    /// Route a journaled event in patient order unless it is no longer
    /// pending. Returns `None` if something else routed it first.
    pub async fn route_pending(&self, event: &ClinicalEvent) -> Result<Option<RouteReport>> {
        let (patient, _guard) = self.lock_patient(event.patient).await?;
        match self.store.load_event(event.id).await? {
            Some(entry) if entry.status == RouteStatus::Pending => {}
            _ => return Ok(None),
        }
        self.route_after_predecessors(event, patient).await.map(Some)
    }

    /// Route the earlier pending events of `patient` and of every identity
    /// merged into it, then `event`.
    ///
    /// Callers hold the lock stripe of `patient`, a surviving identity.
    async fn route_after_predecessors(&self, event: &ClinicalEvent, patient: CanonicalId) -> Result<RouteReport> {
        loop {
            let earlier = self
                .store
                .pending_before(patient, event.id, RECOVERY_BATCH)
                .await?;
            if earlier.is_empty() {
                break;
            }
            for prior in &earlier {
                debug!(event_id = %event.id, earlier = %prior.id, "Routing earlier pending event first");
                self.route(prior).await?;
            }
        }
        self.route(event).await
    }

    /// Route every journaled event still pending, in journal order.
    ///
    /// Safe to run next to dispatcher shards and inline callers: events
    /// they route first are skipped. Returns the number of events routed.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        loop {
            let batch = self.store.pending_events(RECOVERY_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            for event in &batch {
                if self.route_pending(event).await?.is_some() {
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "Replayed pending journal entries");
        }
        Ok(recovered)
    }

    /// Events no subscriber matched, most recent first.
    pub async fn unrouted(&self, limit: u32) -> Result<Vec<ClinicalEvent>> {
        self.store.list_unrouted(limit).await
    }
}

/// Command forwarding `event` to a spoke, addressed with the spoke's own
/// patient identifier when it has one.
fn forward_command(event: &ClinicalEvent, target: Subsystem, identity: &CanonicalIdentity) -> OutboundCommand {
    let local_patient_id = identity
        .identifiers
        .iter()
        .find(|local| local.subsystem == target)
        .map(|local| local.local_id.clone());

    let payload = json!({
        "eventId": event.id,
        "eventType": event.event_type,
        "source": event.source,
        "patientId": identity.id,
        "localPatientId": local_patient_id,
        "occurredAt": event.occurred_at.format(&Rfc3339).ok(),
        "causalToken": event.causal_token,
        "payload": event.payload,
        "metadata": event.metadata,
    });

    OutboundCommand::new(
        CommandId::derived(&format!("{}/{target}", event.id)),
        target,
        format!("event.{}", event.event_type.to_ascii_lowercase()),
        payload,
    )
    .with_patient(identity.id)
}
