use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use clinhub::audit::{AuditKind, AuditRecord, AuditSink, AuditSinkError};
use clinhub::delivery::{Ack, DeliveryRequest, SpokeTransport, TransportError};
use clinhub::store::{CommandQuery, DeliveryStatus, OutboundCommand, OutboxStore};
use clinhub::{Hub, HubConfig, MemoryStore, RawEnvelope, RetryPolicy, Subsystem, WorkflowId};
use serde_json::Value;
use tokio::task::JoinHandle;

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("clinhub=debug")
        .try_init();
}

pub const TEST_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fast polling and short backoff.
pub fn test_config() -> HubConfig {
    let mut config = HubConfig::default();
    config.runtime.delivery_poll_interval = Duration::from_millis(20);
    config.runtime.timer_poll_interval = Duration::from_millis(20);
    config.runtime.audit_poll_interval = Duration::from_millis(20);
    config.runtime.shutdown_timeout = Duration::from_secs(5);
    config.runtime.retry_policy = RetryPolicy {
        max_attempts: TEST_MAX_ATTEMPTS,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(80),
    };
    config.runtime.audit_retry_policy = RetryPolicy {
        max_attempts: u32::MAX,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(80),
    };
    config.runtime.worker_id = Some("test-hub".into());
    config
}

/// Poll until condition returns Some(T) or timeout expires.
pub async fn wait_until<F, Fut, T>(timeout: Duration, interval: Duration, check: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(result) = check().await? {
            return Ok(result);
        }

        if tokio::time::Instant::now() > deadline {
            return Err(anyhow!("timeout waiting for condition"));
        }

        tokio::time::sleep(interval).await;
    }
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// How the fake spoke answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpokeMode {
    Accept,
    /// Unavailable for the next `n` deliveries, then accept.
    FailTimes(u32),
    Unavailable,
    Reject,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub target: Subsystem,
    pub request: DeliveryRequest,
}

/// Spoke transport recording every delivery attempt.
#[derive(Clone)]
pub struct RecordingTransport {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    mode: Arc<Mutex<SpokeMode>>,
    failures: Arc<AtomicU32>,
}

impl RecordingTransport {
    pub fn new(mode: SpokeMode) -> Self {
        Self {
            deliveries: Arc::default(),
            mode: Arc::new(Mutex::new(mode)),
            failures: Arc::default(),
        }
    }

    pub fn set_mode(&self, mode: SpokeMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn deliveries_to(&self, target: Subsystem) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.target == target)
            .collect()
    }
}

#[async_trait]
impl SpokeTransport for RecordingTransport {
    async fn deliver(
        &self,
        target: Subsystem,
        request: &DeliveryRequest,
    ) -> std::result::Result<Ack, TransportError> {
        self.deliveries.lock().unwrap().push(Delivery {
            target,
            request: request.clone(),
        });

        let mode = *self.mode.lock().unwrap();
        match mode {
            SpokeMode::Accept => Ok(Ack::Accepted),
            SpokeMode::FailTimes(n) => {
                if self.failures.fetch_add(1, Ordering::SeqCst) < n {
                    Err(TransportError::Unavailable {
                        target,
                        reason: "connection refused".into(),
                    })
                } else {
                    Ok(Ack::Accepted)
                }
            }
            SpokeMode::Unavailable => Err(TransportError::Unavailable {
                target,
                reason: "connection refused".into(),
            }),
            SpokeMode::Reject => Ok(Ack::Rejected {
                reason: "unknown order".into(),
            }),
        }
    }
}

/// Audit sink keeping every record it receives.
#[derive(Clone, Default)]
pub struct RecordingAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
    down: Arc<AtomicBool>,
}

impl RecordingAuditSink {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.records().iter().filter(|r| r.kind == kind).count()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn emit(&self, record: &AuditRecord) -> std::result::Result<(), AuditSinkError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AuditSinkError("audit service unavailable".into()));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test hub
// ---------------------------------------------------------------------------

/// A hub on a fresh `MemoryStore` with recording fakes. Drop signals shutdown.
pub struct TestHub {
    pub hub: Arc<Hub<MemoryStore>>,
    pub transport: RecordingTransport,
    pub audit: RecordingAuditSink,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<clinhub::Result<()>>>,
}

pub struct TestHubBuilder {
    config: HubConfig,
    mode: SpokeMode,
}

impl TestHubBuilder {
    pub fn config(mut self, f: impl FnOnce(&mut HubConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn spoke_mode(mut self, mode: SpokeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Build without starting workers.
    pub fn build(self) -> TestHub {
        init_test_tracing();
        let transport = RecordingTransport::new(self.mode);
        let audit = RecordingAuditSink::default();
        let hub = Hub::builder(MemoryStore::new())
            .with_clinical_workflows()
            .transport(transport.clone())
            .audit_sink(audit.clone())
            .config(self.config)
            .build()
            .unwrap();

        TestHub {
            hub: Arc::new(hub),
            transport,
            audit,
            shutdown: None,
            handle: None,
        }
    }

    /// Build and run the hub in the background.
    pub fn start(self) -> TestHub {
        let mut test_hub = self.build();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let hub = Arc::clone(&test_hub.hub);
        test_hub.handle = Some(tokio::spawn(async move {
            hub.run(async move {
                let _ = shutdown_rx.await;
            })
            .await
        }));
        test_hub.shutdown = Some(shutdown_tx);
        test_hub
    }
}

impl TestHub {
    pub fn builder() -> TestHubBuilder {
        TestHubBuilder {
            config: test_config(),
            mode: SpokeMode::Accept,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        self.hub.store()
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await??;
        }
        Ok(())
    }

    pub async fn status_of(&self, workflow_type: &str, workflow_id: &str) -> Result<Option<String>> {
        match self
            .hub
            .service()
            .instance(workflow_type, &WorkflowId::new(workflow_id))
            .await
        {
            Ok(view) => Ok(Some(view.status)),
            Err(clinhub::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn wait_for_status(&self, workflow_type: &str, workflow_id: &str, expected: &str) -> Result<()> {
        wait_until(DEFAULT_TEST_TIMEOUT, DEFAULT_POLL_INTERVAL, || async {
            let status = self.status_of(workflow_type, workflow_id).await?;
            Ok((status.as_deref() == Some(expected)).then_some(()))
        })
        .await
        .map_err(|e| anyhow!("{workflow_type}:{workflow_id} never reached {expected}: {e}"))
    }

    pub async fn commands(&self, query: CommandQuery) -> Result<Vec<OutboundCommand>> {
        Ok(self.store().list_commands(&query).await?)
    }

    pub async fn wait_for_command_status(
        &self,
        query: CommandQuery,
        expected: DeliveryStatus,
    ) -> Result<Vec<OutboundCommand>> {
        wait_until(DEFAULT_TEST_TIMEOUT, DEFAULT_POLL_INTERVAL, || async {
            let commands = self.commands(query.clone()).await?;
            let done = !commands.is_empty() && commands.iter().all(|c| c.status == expected);
            Ok(done.then_some(commands))
        })
        .await
    }

    pub async fn wait_for_audit(&self, kind: AuditKind, count: usize) -> Result<()> {
        wait_until(DEFAULT_TEST_TIMEOUT, DEFAULT_POLL_INTERVAL, || async {
            Ok((self.audit.count(kind) >= count).then_some(()))
        })
        .await
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

pub fn envelope(source: Subsystem, patient: &str, event_type: &str, payload: Value) -> RawEnvelope {
    RawEnvelope::new(source, patient, event_type, payload)
}

pub fn order_placed(patient: &str, order_id: &str, department: &str) -> RawEnvelope {
    envelope(
        Subsystem::Cpoe,
        patient,
        "ORDER_PLACED",
        serde_json::json!({ "orderId": order_id, "department": department }),
    )
}
