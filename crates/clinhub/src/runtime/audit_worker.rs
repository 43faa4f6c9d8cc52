//! Audit worker pushing queued records to the audit sink.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::RuntimeConfig;
use crate::audit::AuditSink;
use crate::store::AuditQueue;

/// Delivers queued audit records. Never gives up on a record: failures
/// back off up to `audit_retry_policy.max_delay` and retry indefinitely.
pub(crate) struct AuditWorker<S> {
    store: S,
    sink: Arc<dyn AuditSink>,
    config: RuntimeConfig,
    worker_id: String,
}

impl<S> AuditWorker<S>
where
    S: AuditQueue,
{
    pub fn new(store: S, sink: Arc<dyn AuditSink>, config: RuntimeConfig, worker_id: String) -> Self {
        Self {
            store,
            sink,
            config,
            worker_id,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.config.audit_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "Audit worker started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    loop {
                        match self.process_one().await {
                            Ok(true) if !*shutdown.borrow() => continue,
                            Ok(_) => break,
                            Err(e) => {
                                error!(error = %e, "Error delivering audit record");
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Audit worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` when the queue had nothing deliverable.
    pub async fn process_one(&self) -> crate::Result<bool> {
        let Some(queued) = self
            .store
            .claim_audit(&self.worker_id, self.config.audit_lock_duration)
            .await?
        else {
            return Ok(false);
        };

        let id = queued.record.id;
        match self.sink.emit(&queued.record).await {
            Ok(()) => {
                self.store.mark_audit_delivered(id).await?;
                debug!(record_id = %id, kind = queued.record.kind.as_str(), "Audit record delivered");
            }
            Err(e) => {
                let backoff = self
                    .config
                    .audit_retry_policy
                    .backoff_duration(queued.attempts + 1);
                warn!(record_id = %id, attempts = queued.attempts + 1, error = %e, "Audit delivery failed");
                self.store
                    .record_audit_failure(id, &e.to_string(), backoff)
                    .await?;
            }
        }
        Ok(true)
    }
}
