//! Delivery worker for pushing outbox commands to spokes.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::RuntimeConfig;
use crate::audit::{AuditKind, AuditRecord, AuditReference};
use crate::delivery::{Ack, DeliveryRequest, SpokeTransport};
use crate::store::{OutboundCommand, OutboxStore};

/// Worker that polls the outbox for deliverable commands.
///
/// # Lifecycle
///
/// 1. Poll for a deliverable command at `delivery_poll_interval`
/// 2. Claim it (atomic lock with timeout)
/// 3. Deliver through the spoke transport with its idempotency key
/// 4. Mark delivered, back off, or mark exhausted and audit
/// 5. Repeat until shutdown signal
///
/// A command is attempted at most `retry_policy.max_attempts` times. A
/// spoke that refuses a command exhausts it immediately.
pub(crate) struct DeliveryWorker<S> {
    store: S,
    transport: Arc<dyn SpokeTransport>,
    config: RuntimeConfig,
    worker_id: String,
}

impl<S> DeliveryWorker<S>
where
    S: OutboxStore,
{
    pub fn new(
        store: S,
        transport: Arc<dyn SpokeTransport>,
        config: RuntimeConfig,
        worker_id: String,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            worker_id,
        }
    }

    /// Run until the shutdown receiver signals.
    ///
    /// An in-flight delivery is finished before the worker exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.config.delivery_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "Delivery worker started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    // Drain what is deliverable before waiting for the next tick.
                    loop {
                        match self.process_one().await {
                            Ok(true) if !*shutdown.borrow() => continue,
                            Ok(_) => break,
                            Err(e) => {
                                error!(error = %e, "Error delivering command");
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Delivery worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Try to claim and deliver one command.
    ///
    /// Returns `false` when nothing was deliverable.
    pub async fn process_one(&self) -> crate::Result<bool> {
        let Some(command) = self
            .store
            .claim_command(&self.worker_id, self.config.delivery_lock_duration)
            .await?
        else {
            return Ok(false);
        };

        let request = DeliveryRequest::for_command(&command);
        let attempt = request.attempt;
        debug!(
            command_id = %command.id,
            target = %command.target,
            action = %command.action,
            attempt,
            "Delivering command"
        );

        match self.transport.deliver(command.target, &request).await {
            Ok(Ack::Accepted) => {
                self.store.mark_delivered(command.id).await?;
                debug!(command_id = %command.id, "Command delivered");
            }
            Ok(Ack::Rejected { reason }) => {
                let error = format!("rejected by {}: {reason}", command.target);
                self.exhaust(&command, &error, attempt).await?;
            }
            Err(e) if self.config.retry_policy.should_retry(attempt) => {
                let backoff = self
                    .config
                    .retry_policy
                    .backoff_duration(attempt)
                    .max(e.retry_after().unwrap_or_default());
                warn!(
                    command_id = %command.id,
                    target = %command.target,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Delivery failed, will retry"
                );
                self.store
                    .record_failure(command.id, &e.to_string(), backoff)
                    .await?;
            }
            Err(e) => {
                self.exhaust(&command, &e.to_string(), attempt).await?;
            }
        }

        Ok(true)
    }

    async fn exhaust(&self, command: &OutboundCommand, error: &str, attempt: u32) -> crate::Result<()> {
        error!(
            command_id = %command.id,
            target = %command.target,
            action = %command.action,
            attempt,
            error,
            "Command exhausted, operator action required"
        );
        let mut record = AuditRecord::new(AuditKind::DeliveryExhausted, AuditReference::Command(command.id))
            .with_detail(format!("{} to {} after {attempt} attempt(s): {error}", command.action, command.target));
        if let Some(workflow) = &command.workflow {
            record = record.with_workflow(workflow.clone());
        }
        self.store.mark_exhausted(command.id, error, record).await
    }
}
