//! Timer worker for processing scheduled inputs.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::RuntimeConfig;
use crate::service::WorkflowService;
use crate::store::{HubStore, OutboxStore};

/// Timer worker that polls for due timers.
///
/// Deadline timers are scheduled by the engine for every non-terminal
/// instance of a workflow type with a timeout input; workflows can also
/// schedule their own keyed timers.
///
/// # Lifecycle
///
/// 1. Poll for due timers at `timer_poll_interval`
/// 2. Claim timer (atomic lock with timeout)
/// 3. Apply its input through the workflow service
/// 4. Mark processed or record failure
/// 5. Repeat until shutdown signal
///
/// A timer for an instance that completed in the meantime is applied as a
/// late input and simply marked processed.
pub(crate) struct TimerWorker<S> {
    service: Arc<WorkflowService<S>>,
    store: S,
    config: RuntimeConfig,
    worker_id: String,
}

impl<S> TimerWorker<S>
where
    S: HubStore,
{
    pub fn new(
        service: Arc<WorkflowService<S>>,
        store: S,
        config: RuntimeConfig,
        worker_id: String,
    ) -> Self {
        Self {
            service,
            store,
            config,
            worker_id,
        }
    }

    /// Run the timer worker until shutdown signal.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.config.timer_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "Timer worker started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    loop {
                        match self.process_one().await {
                            Ok(true) if !*shutdown.borrow() => continue,
                            Ok(_) => break,
                            Err(e) => {
                                error!(error = %e, "Error processing timer");
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Timer worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Try to claim and process one timer. Returns `false` if none was due.
    pub async fn process_one(&self) -> crate::Result<bool> {
        let Some(timer) = self
            .store
            .claim_timer(&self.worker_id, self.config.timer_lock_duration)
            .await?
        else {
            return Ok(false);
        };

        debug!(
            timer_id = %timer.id,
            workflow = %timer.workflow,
            key = timer.key.as_deref(),
            attempt = timer.attempts + 1,
            "Processing timer"
        );

        match self.service.apply_timer(&timer).await {
            Ok(outcome) => {
                self.store.mark_timer_processed(timer.id).await?;
                debug!(timer_id = %timer.id, ?outcome, "Timer processed");
            }
            Err(e) => {
                let error_msg = format!("Failed to apply timer input: {e}");
                warn!(timer_id = %timer.id, error = %error_msg, "Timer execution failed");
                let backoff = self.config.retry_policy.backoff_duration(timer.attempts + 1);
                self.store
                    .record_timer_failure(timer.id, &error_msg, backoff)
                    .await?;
            }
        }

        Ok(true)
    }
}
