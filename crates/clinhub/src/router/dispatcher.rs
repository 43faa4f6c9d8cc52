//! Sharded asynchronous dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{MessageRouter, RouterConfig};
use crate::delivery::RetryPolicy;
use crate::error::{Error, Result};
use crate::event::{ClinicalEvent, RawEnvelope};
use crate::identity::CanonicalId;
use crate::store::{AppendOutcome, HubStore};

/// Routes accepted events in the background, one queue per shard.
///
/// Events of one patient always land on the same shard, the one of the
/// identity the patient currently survives as. A shard routes its
/// events one at a time and does not move on while the current one fails
/// and has retries left. Ordering per patient does not depend on the queue:
/// routing an event first routes any pending event of the same patient
/// journaled before it.
///
/// Events still queued at shutdown stay pending in the journal and are
/// routed by recovery on the next start.
pub struct Dispatcher<S> {
    router: Arc<MessageRouter<S>>,
    senders: Vec<mpsc::Sender<ClinicalEvent>>,
    receivers: Mutex<Option<Vec<mpsc::Receiver<ClinicalEvent>>>>,
    running: AtomicBool,
    retry: RetryPolicy,
}

impl<S> Dispatcher<S>
where
    S: HubStore,
{
    pub(crate) fn new(router: Arc<MessageRouter<S>>, config: &RouterConfig) -> Self {
        let shards = config.dispatch_shards.max(1);
        let capacity = config.dispatch_capacity.max(1);

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..shards).map(|_| mpsc::channel(capacity)).unzip();

        Self {
            router,
            senders,
            receivers: Mutex::new(Some(receivers)),
            running: AtomicBool::new(false),
            retry: config.route_retry.clone(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    /// Shard owning `patient`. Callers pass a surviving identity; the
    /// identities merged into it have no shard of their own.
    pub fn shard_for(&self, patient: CanonicalId) -> usize {
        (patient.as_uuid().as_u128() % self.senders.len() as u128) as usize
    }

    /// Shard tasks have been spawned.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Accept an envelope for asynchronous routing.
    ///
    /// Returns once the event is journaled. Validation and identity
    /// failures are returned before anything is persisted. Resubmitting
    /// an already journaled event returns it without queueing it again.
    ///
    /// Before the shards run, a full shard queue fails with
    /// [`Error::DispatcherFull`] instead of waiting for a consumer that does
    /// not exist yet. Once running, a full queue applies backpressure.
    pub async fn submit(&self, raw: &RawEnvelope) -> Result<ClinicalEvent> {
        let (envelope, identity) = self.router.admit(raw).await?;

        let shard = self.shard_for(identity.id);
        if !self.is_running() && self.senders[shard].capacity() == 0 {
            return Err(Error::DispatcherFull { shard });
        }

        let (patient, outcome) = {
            let (patient, _guard) = self.router.lock_patient(identity.id).await?;
            (patient, self.router.journal(envelope, patient).await?)
        };
        // A merge landing since admission moves the event to the survivor's shard.
        let shard = self.shard_for(patient);

        match outcome {
            AppendOutcome::Appended(event) => {
                self.enqueue(shard, event.clone()).await?;
                Ok(event)
            }
            AppendOutcome::Existing(event) => Ok(event),
        }
    }

    async fn enqueue(&self, shard: usize, event: ClinicalEvent) -> Result<()> {
        let sender = &self.senders[shard];
        if self.is_running() {
            return sender.send(event).await.map_err(|_| Error::DispatcherClosed);
        }

        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                // Journaled as pending; startup recovery routes it.
                debug!(shard, event_id = %event.id, "Shard queue full, left pending for recovery");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Error::DispatcherClosed),
        }
    }

    /// Number of events waiting in shard queues.
    pub fn queued(&self) -> usize {
        self.senders
            .iter()
            .map(|s| s.max_capacity() - s.capacity())
            .sum()
    }

    /// Spawn one routing task per shard.
    ///
    /// Can be called once; later calls spawn nothing.
    pub(crate) fn spawn(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let receivers = match self.receivers.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(receivers) = receivers else {
            warn!("Dispatcher shards already running");
            return Vec::new();
        };
        self.running.store(true, Ordering::Release);

        receivers
            .into_iter()
            .enumerate()
            .map(|(shard, receiver)| {
                let shard_task = Shard {
                    index: shard,
                    router: Arc::clone(&self.router),
                    retry: self.retry.clone(),
                };
                tokio::spawn(shard_task.run(receiver, shutdown.clone()))
            })
            .collect()
    }
}

struct Shard<S> {
    index: usize,
    router: Arc<MessageRouter<S>>,
    retry: RetryPolicy,
}

impl<S: HubStore> Shard<S> {
    async fn run(self, mut receiver: mpsc::Receiver<ClinicalEvent>, mut shutdown: watch::Receiver<bool>) {
        let shard = self.index;
        info!(shard, "Dispatch shard started");

        loop {
            tokio::select! {
                next = receiver.recv() => {
                    let Some(event) = next else { break };
                    if !self.route(&event, &mut shutdown).await {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(shard, "Dispatch shard shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Route one event, retrying with backoff. Returns `false` if shutdown
    /// was requested while waiting to retry.
    async fn route(&self, event: &ClinicalEvent, shutdown: &mut watch::Receiver<bool>) -> bool {
        let shard = self.index;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.router.route_pending(event).await {
                Ok(Some(_)) => return true,
                Ok(None) => {
                    debug!(shard, event_id = %event.id, "Event already routed");
                    return true;
                }
                Err(e) => e,
            };

            if !self.retry.should_retry(attempt) {
                error!(
                    shard,
                    event_id = %event.id,
                    attempt,
                    error = %error,
                    "Error routing event; left pending, routed before the patient's next event"
                );
                return true;
            }

            let backoff = self.retry.backoff_duration(attempt);
            warn!(
                shard,
                event_id = %event.id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Error routing event, will retry"
            );

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(shard, event_id = %event.id, "Shutdown during retry, event left pending for recovery");
                        return false;
                    }
                }
            }
        }
    }
}
