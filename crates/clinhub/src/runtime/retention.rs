//! Periodic archival of terminal instances.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info};

use crate::service::WorkflowService;
use crate::store::HubStore;

pub(crate) struct RetentionSweeper<S> {
    service: Arc<WorkflowService<S>>,
    sweep_interval: std::time::Duration,
}

impl<S> RetentionSweeper<S>
where
    S: HubStore,
{
    pub fn new(service: Arc<WorkflowService<S>>, sweep_interval: std::time::Duration) -> Self {
        Self {
            service,
            sweep_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticks = interval(self.sweep_interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    match self.service.archive_expired().await {
                        Ok(0) => {}
                        Ok(archived) => info!(archived, "Archived terminal workflow instances"),
                        Err(e) => error!(error = %e, "Retention sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
