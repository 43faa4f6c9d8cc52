//! Workflow service entrypoint.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::decider::ApplyOutcome;
use crate::error::{Error, Result};
use crate::event::ClinicalEvent;
use crate::runtime::WorkflowConfig;
use crate::runtime::registry::{WorkflowEntry, WorkflowRegistry};
use crate::store::{
    DueTimer, HubStore, InstanceQuery, WorkflowInstanceSummary, WorkflowInstanceView,
    WorkflowQueryStore,
};
use crate::workflow::WorkflowId;

/// App-facing workflow service.
///
/// The single entrypoint for applying inputs to workflow instances and
/// querying them. The router, the timer worker and the operator surface
/// all go through it.
pub struct WorkflowService<S> {
    store: S,
    registry: Arc<WorkflowRegistry>,
    config: WorkflowConfig,
}

impl<S> WorkflowService<S>
where
    S: HubStore,
{
    pub(crate) fn new(store: S, registry: Arc<WorkflowRegistry>, config: WorkflowConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    fn entry(&self, workflow_type: &str) -> Result<(&'static str, &dyn WorkflowEntry)> {
        self.registry
            .get(workflow_type)
            .ok_or_else(|| Error::UnknownWorkflowType(workflow_type.to_string()))
    }

    /// Offer a routed event to the instance of `workflow_type` it correlates to.
    pub async fn apply_event(
        &self,
        workflow_type: &str,
        event: &ClinicalEvent,
    ) -> Result<ApplyOutcome> {
        let (workflow_type, entry) = self.entry(workflow_type)?;
        entry
            .apply_event(event, self.config.deadline_for(workflow_type))
            .await
    }

    /// Deliver the input carried by a due timer.
    pub async fn apply_timer(&self, timer: &DueTimer) -> Result<ApplyOutcome> {
        let (workflow_type, entry) = self.entry(timer.workflow.workflow_type())?;
        entry
            .apply_timer(timer, self.config.deadline_for(workflow_type))
            .await
    }

    /// Operator cancellation of a running instance.
    ///
    /// Fails with [`Error::NotFound`] if the instance does not exist and
    /// with [`Error::CancellationUnsupported`] if its type cannot be
    /// cancelled. Cancelling a terminal instance is reported as
    /// [`ApplyOutcome::LateEvent`].
    pub async fn cancel(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
        reason: &str,
    ) -> Result<ApplyOutcome> {
        let (workflow_type, entry) = self.entry(workflow_type)?;
        if self
            .store
            .load_instance(workflow_type, workflow_id)
            .await?
            .is_none()
        {
            return Err(Error::not_found("workflow instance", format!("{workflow_type}:{workflow_id}")));
        }

        let request_id = Uuid::now_v7();
        info!(workflow_type, workflow_id = %workflow_id, %request_id, reason, "Cancellation requested");
        entry.cancel(workflow_id, reason, request_id).await
    }

    pub async fn instance(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowInstanceView> {
        self.store
            .load_instance(workflow_type, workflow_id)
            .await?
            .ok_or_else(|| Error::not_found("workflow instance", format!("{workflow_type}:{workflow_id}")))
    }

    pub async fn list(&self, query: &InstanceQuery) -> Result<Vec<WorkflowInstanceSummary>> {
        self.store.list_instances(query).await
    }

    /// Archive terminal instances older than the retention period.
    pub async fn archive_expired(&self) -> Result<u64> {
        let cutoff = OffsetDateTime::now_utc() - self.config.retention;
        self.store.archive_completed_before(cutoff).await
    }

    /// Registered workflow types, sorted.
    pub fn workflow_types(&self) -> Vec<&'static str> {
        self.registry.types()
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }
}
