//! Workflow registry and hub builder.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::Workflow;
use crate::audit::{AuditReference, AuditSink, TracingAuditSink};
use crate::config::HubConfig;
use crate::decider::{self, ApplyOutcome, InputContext};
use crate::delivery::SpokeTransport;
use crate::error::{Error, Result};
use crate::event::ClinicalEvent;
use crate::hub::Hub;
use crate::identity::IdentityResolver;
use crate::router::{Dispatcher, MessageRouter, SubscriptionTable};
use crate::service::WorkflowService;
use crate::store::{DueTimer, HubStore, InputMeta};
use crate::workflow::WorkflowId;
use crate::workflows::{Encounter, MedicationDispense, OrderLifecycle};

/// Type-erased workflow entry for dynamic dispatch.
///
/// Lets the registry keep different workflow types in one map while each
/// entry deserializes and executes with its concrete types.
#[async_trait]
pub(crate) trait WorkflowEntry: Send + Sync {
    /// Correlate a routed event and apply it to its instance.
    async fn apply_event(
        &self,
        event: &ClinicalEvent,
        deadline: Option<Duration>,
    ) -> Result<ApplyOutcome>;

    /// Apply the input carried by a due timer.
    async fn apply_timer(&self, timer: &DueTimer, deadline: Option<Duration>)
    -> Result<ApplyOutcome>;

    /// Apply an operator cancellation request.
    async fn cancel(
        &self,
        workflow_id: &WorkflowId,
        reason: &str,
        request_id: Uuid,
    ) -> Result<ApplyOutcome>;
}

struct TypedWorkflowEntry<W, S> {
    store: S,
    _marker: PhantomData<fn() -> W>,
}

#[async_trait]
impl<W, S> WorkflowEntry for TypedWorkflowEntry<W, S>
where
    W: Workflow,
    S: HubStore,
{
    async fn apply_event(
        &self,
        event: &ClinicalEvent,
        deadline: Option<Duration>,
    ) -> Result<ApplyOutcome> {
        let ctx = InputContext {
            meta: InputMeta::event(event.id, event.source, event.causal_token, event.patient),
            reference: AuditReference::Event(event.id),
            category: Some(event.category()),
            payload: serde_json::to_value(event)?,
            timer: None,
        };

        match W::correlate(event) {
            Ok(input) => decider::execute::<W, S>(&self.store, &ctx, &input, deadline).await,
            Err(err) => {
                decider::divert_uncorrelated(&self.store, W::TYPE, &ctx, &err.reason).await?;
                Ok(ApplyOutcome::Uncorrelated { reason: err.reason })
            }
        }
    }

    async fn apply_timer(
        &self,
        timer: &DueTimer,
        deadline: Option<Duration>,
    ) -> Result<ApplyOutcome> {
        let input: W::Input = serde_json::from_value(timer.input.clone())?;
        let ctx = InputContext {
            meta: InputMeta::timer(timer.id),
            reference: AuditReference::Timer(timer.id),
            category: None,
            payload: timer.input.clone(),
            timer: Some(timer.id),
        };
        decider::execute::<W, S>(&self.store, &ctx, &input, deadline).await
    }

    async fn cancel(
        &self,
        workflow_id: &WorkflowId,
        reason: &str,
        request_id: Uuid,
    ) -> Result<ApplyOutcome> {
        let Some(input) = W::cancel_input(workflow_id, reason) else {
            return Err(Error::CancellationUnsupported(W::TYPE.to_string()));
        };
        let ctx = InputContext {
            meta: InputMeta::cancellation(request_id),
            reference: AuditReference::Operator(format!("cancel:{request_id}")),
            category: None,
            payload: serde_json::json!({ "reason": reason }),
            timer: None,
        };
        decider::execute::<W, S>(&self.store, &ctx, &input, None).await
    }
}

/// Registry mapping workflow types to their entries.
pub(crate) struct WorkflowRegistry {
    entries: HashMap<&'static str, Box<dyn WorkflowEntry>>,
}

impl WorkflowRegistry {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn register<W, S>(&mut self, store: S)
    where
        W: Workflow,
        S: HubStore,
    {
        let entry = TypedWorkflowEntry::<W, S> {
            store,
            _marker: PhantomData,
        };
        self.entries.insert(W::TYPE, Box::new(entry));
    }

    fn contains(&self, workflow_type: &str) -> bool {
        self.entries.contains_key(workflow_type)
    }

    /// Look up a workflow entry by type.
    ///
    /// Returns the static workflow type key along with the entry.
    pub(crate) fn get(&self, workflow_type: &str) -> Option<(&'static str, &dyn WorkflowEntry)> {
        self.entries
            .get_key_value(workflow_type)
            .map(|(k, v)| (*k, v.as_ref()))
    }

    /// Registered workflow types, sorted.
    pub(crate) fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.entries.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

/// Builder for constructing a [`Hub`].
///
/// Registration problems (duplicate workflow types, subscriptions naming
/// an unregistered type, a missing transport) are reported by
/// [`build`](Self::build).
///
/// # Example
///
/// ```ignore
/// let hub = Hub::builder(MemoryStore::new())
///     .with_clinical_workflows()
///     .transport(HttpSpokeTransport::new(Duration::from_secs(10))?.with_endpoints(endpoints))
///     .config(HubConfig::from_env()?)
///     .build()?;
///
/// hub.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
/// ```
pub struct HubBuilder<S>
where
    S: HubStore,
{
    store: S,
    registry: WorkflowRegistry,
    duplicate_workflow_type: Option<String>,
    subscriptions: Option<SubscriptionTable>,
    transport: Option<Arc<dyn SpokeTransport>>,
    audit_sink: Arc<dyn AuditSink>,
    config: HubConfig,
}

impl<S> HubBuilder<S>
where
    S: HubStore,
{
    pub(crate) fn new(store: S) -> Self {
        Self {
            store,
            registry: WorkflowRegistry::new(),
            duplicate_workflow_type: None,
            subscriptions: None,
            transport: None,
            audit_sink: Arc::new(TracingAuditSink),
            config: HubConfig::default(),
        }
    }

    /// Register a workflow type. Each type can only be registered once.
    pub fn register<W: Workflow>(mut self) -> Self {
        if self.registry.contains(W::TYPE) {
            if self.duplicate_workflow_type.is_none() {
                self.duplicate_workflow_type = Some(W::TYPE.to_string());
            }
            return self;
        }
        self.registry.register::<W, S>(self.store.clone());
        self
    }

    /// Register the built-in order, medication and encounter workflows.
    pub fn with_clinical_workflows(self) -> Self {
        self.register::<OrderLifecycle>()
            .register::<MedicationDispense>()
            .register::<Encounter>()
    }

    /// Set the subscription table.
    ///
    /// If not called, uses [`SubscriptionTable::clinical_defaults()`].
    pub fn subscriptions(mut self, subscriptions: SubscriptionTable) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    pub fn transport(mut self, transport: impl SpokeTransport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set the audit sink. Defaults to [`TracingAuditSink`].
    pub fn audit_sink(mut self, sink: impl AuditSink) -> Self {
        self.audit_sink = Arc::new(sink);
        self
    }

    /// Set an audit sink chosen at runtime.
    pub fn shared_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    /// If not called, uses [`HubConfig::default()`].
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Hub<S>> {
        if let Some(workflow_type) = self.duplicate_workflow_type {
            return Err(Error::DuplicateWorkflowType(workflow_type));
        }

        let subscriptions = self
            .subscriptions
            .unwrap_or_else(SubscriptionTable::clinical_defaults);
        if let Some(missing) = subscriptions
            .workflow_types()
            .find(|t| !self.registry.contains(t))
        {
            return Err(Error::UnknownWorkflowType(missing.to_string()));
        }

        let Some(transport) = self.transport else {
            return Err(Error::Transport("no spoke transport configured".into()));
        };

        let config = self.config;
        let worker_id = config
            .runtime
            .worker_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let service = Arc::new(WorkflowService::new(
            self.store.clone(),
            Arc::new(self.registry),
            config.workflow.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            self.store.clone(),
            IdentityResolver::new(self.store.clone(), config.identity.clone()),
            Arc::clone(&service),
            Arc::new(subscriptions),
            &config.router,
        ));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&router), &config.router));

        Ok(Hub {
            store: self.store,
            router,
            dispatcher,
            service,
            transport,
            audit_sink: self.audit_sink,
            config,
            worker_id,
            started_at: OffsetDateTime::now_utc(),
        })
    }
}
