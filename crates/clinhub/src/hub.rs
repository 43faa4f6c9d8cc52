//! The assembled hub: router, dispatcher, workflow service and workers.

use std::future::Future;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::config::HubConfig;
use crate::delivery::SpokeTransport;
use crate::error::Result;
use crate::event::{ClinicalEvent, RawEnvelope};
use crate::health::{self, HealthReport, HubStatus};
use crate::identity::{IdentityResolver, IdentityStore};
use crate::router::{Dispatcher, MessageRouter, RouteReport};
use crate::runtime::{AuditWorker, DeliveryWorker, HubBuilder, RetentionSweeper, TimerWorker};
use crate::service::WorkflowService;
use crate::store::{AuditQueue, DeadLetterStore, DeliveryStatus, EventJournal, HubStore, OutboxStore, RouteStatus};

/// A configured integration hub.
///
/// Built with [`Hub::builder`]. Events enter through [`Hub::submit`]
/// (queued per patient shard) or [`Hub::ingest_and_route`] (routed inline);
/// [`Hub::run`] drives the dispatcher shards and the background workers.
///
/// ```ignore
/// let hub = Hub::builder(MemoryStore::new())
///     .with_clinical_workflows()
///     .transport(config.spoke_transport()?)
///     .config(config)
///     .build()?;
///
/// hub.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
/// ```
pub struct Hub<S>
where
    S: HubStore,
{
    pub(crate) store: S,
    pub(crate) router: Arc<MessageRouter<S>>,
    pub(crate) dispatcher: Arc<Dispatcher<S>>,
    pub(crate) service: Arc<WorkflowService<S>>,
    pub(crate) transport: Arc<dyn SpokeTransport>,
    pub(crate) audit_sink: Arc<dyn AuditSink>,
    pub(crate) config: HubConfig,
    pub(crate) worker_id: String,
    pub(crate) started_at: OffsetDateTime,
}

impl<S> Hub<S>
where
    S: HubStore,
{
    pub fn builder(store: S) -> HubBuilder<S> {
        HubBuilder::new(store)
    }

    /// Validate, journal and queue an event for routing.
    ///
    /// Returns once the event is durable. A duplicate submission returns
    /// the originally journaled event and is not routed again. Before
    /// [`Hub::run`] starts the shards, a full shard queue is refused with
    /// [`Error::DispatcherFull`](crate::Error::DispatcherFull).
    pub async fn submit(&self, raw: &RawEnvelope) -> Result<ClinicalEvent> {
        self.dispatcher.submit(raw).await
    }

    /// Journal and route an event on the calling task.
    ///
    /// Safe to mix with [`Hub::submit`]: the patient's earlier pending
    /// events are routed first.
    pub async fn ingest_and_route(&self, raw: &RawEnvelope) -> Result<(ClinicalEvent, RouteReport)> {
        self.router.ingest_and_route(raw).await
    }

    /// Route journaled events left pending by an earlier run.
    pub async fn recover(&self) -> Result<usize> {
        self.router.recover().await
    }

    /// Run until `shutdown` completes.
    ///
    /// Starts the dispatcher shards, recovers events left pending (including
    /// any submitted before the shards ran), then starts the delivery, timer,
    /// audit and retention workers. On shutdown, workers finish their current
    /// item; events still queued stay pending in the journal and are
    /// recovered on the next start.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runtime = &self.config.runtime;

        let mut worker_handles = self.dispatcher.spawn(&shutdown_rx);

        match self.recover().await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Recovered pending events"),
            Err(e) => {
                let _ = shutdown_tx.send(true);
                return Err(e);
            }
        }

        let delivery_worker_count = runtime.delivery_workers.max(1);
        let timer_worker_count = runtime.timer_workers.max(1);
        let audit_worker_count = runtime.audit_workers.max(1);

        info!(
            worker_id = %self.worker_id,
            workflows = ?self.service.workflow_types(),
            shards = self.dispatcher.shard_count(),
            delivery_workers = delivery_worker_count,
            timer_workers = timer_worker_count,
            audit_workers = audit_worker_count,
            "Hub starting"
        );

        for i in 0..delivery_worker_count {
            let worker = DeliveryWorker::new(
                self.store.clone(),
                Arc::clone(&self.transport),
                runtime.clone(),
                self.worker_name("delivery", i, delivery_worker_count),
            );
            worker_handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        for i in 0..timer_worker_count {
            let worker = TimerWorker::new(
                Arc::clone(&self.service),
                self.store.clone(),
                runtime.clone(),
                self.worker_name("timer", i, timer_worker_count),
            );
            worker_handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        for i in 0..audit_worker_count {
            let worker = AuditWorker::new(
                self.store.clone(),
                Arc::clone(&self.audit_sink),
                runtime.clone(),
                self.worker_name("audit", i, audit_worker_count),
            );
            worker_handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        let sweeper = RetentionSweeper::new(Arc::clone(&self.service), runtime.retention_sweep_interval);
        worker_handles.push(tokio::spawn(sweeper.run(shutdown_rx.clone())));

        shutdown.await;

        let _ = shutdown_tx.send(true);

        let shutdown_timeout = runtime.shutdown_timeout;
        let all_workers = async {
            for handle in worker_handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(shutdown_timeout, all_workers).await {
            Ok(()) => {
                info!(worker_id = %self.worker_id, "Hub stopped gracefully");
            }
            Err(_) => {
                warn!(
                    worker_id = %self.worker_id,
                    timeout_secs = shutdown_timeout.as_secs(),
                    queued = self.dispatcher.queued(),
                    "Shutdown timeout exceeded, forcing stop"
                );
            }
        }

        Ok(())
    }

    fn worker_name(&self, role: &str, index: usize, count: usize) -> String {
        if count == 1 {
            format!("{}-{role}", self.worker_id)
        } else {
            format!("{}-{role}-{index}", self.worker_id)
        }
    }

    /// Health of each hub component.
    ///
    /// A component whose store probe fails is down. The router is degraded
    /// while unrouted events exist, the outbox while exhausted commands do.
    pub async fn health(&self) -> Vec<HealthReport> {
        let id = self.worker_id.as_str();

        let identities = self.store.count_identities().await;
        let unrouted = self.store.count_events(RouteStatus::Unrouted).await;
        let dead_letters = self.store.count_dead_letters().await;
        let exhausted = self.store.count_commands(DeliveryStatus::Exhausted).await;
        let pending_audit = self.store.count_pending_audit().await;

        vec![
            HealthReport::from_probe(health::IDENTITY_RESOLVER, id, identities, |r, _| r),
            HealthReport::from_probe(health::MESSAGE_ROUTER, id, unrouted, |r, n| {
                if n > 0 {
                    r.degraded(format!("{n} unrouted events"))
                } else {
                    r
                }
            }),
            HealthReport::from_probe(health::WORKFLOW_ENGINE, id, dead_letters, |r, _| r),
            HealthReport::from_probe(health::OUTBOX, id, exhausted, |r, n| {
                if n > 0 {
                    r.degraded(format!("{n} exhausted commands"))
                } else {
                    r
                }
            }),
            HealthReport::from_probe(health::AUDIT, id, pending_audit, |r, _| r),
        ]
    }

    /// Operational counters.
    pub async fn status(&self) -> Result<HubStatus> {
        Ok(HubStatus {
            pending_commands: self.store.count_commands(DeliveryStatus::Pending).await?,
            failed_commands: self.store.count_commands(DeliveryStatus::Failed).await?,
            exhausted_commands: self.store.count_commands(DeliveryStatus::Exhausted).await?,
            delivered_commands: self.store.count_commands(DeliveryStatus::Delivered).await?,
            pending_audit_records: self.store.count_pending_audit().await?,
            pending_events: self.store.count_events(RouteStatus::Pending).await?,
            unrouted_events: self.store.count_events(RouteStatus::Unrouted).await?,
            dead_letters: self.store.count_dead_letters().await?,
            identities: self.store.count_identities().await?,
            queued_events: self.dispatcher.queued(),
        })
    }

    pub fn service(&self) -> &WorkflowService<S> {
        &self.service
    }

    pub fn router(&self) -> &MessageRouter<S> {
        &self.router
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    pub fn resolver(&self) -> &IdentityResolver<S> {
        self.router.resolver()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }
}
