//! Runtime configuration.

use std::collections::HashMap;
use std::time::Duration;

use crate::delivery::RetryPolicy;

/// Configuration for the background workers.
///
/// Controls polling intervals, lock durations, retry behavior and worker
/// concurrency.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use clinhub::runtime::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     delivery_poll_interval: Duration::from_millis(50),
///     delivery_workers: 4,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often delivery workers poll the outbox. Default: 100ms.
    pub delivery_poll_interval: Duration,

    /// How often timer workers poll for due timers.
    ///
    /// Timer precision is limited by this interval. Default: 1 second.
    pub timer_poll_interval: Duration,

    /// How often audit workers poll the audit queue. Default: 200ms.
    pub audit_poll_interval: Duration,

    /// How long a claimed command stays locked to its worker.
    ///
    /// Should exceed the spoke request timeout. If a worker crashes, the
    /// command becomes claimable again after this duration. Default: 5 minutes.
    pub delivery_lock_duration: Duration,

    /// How long a claimed timer stays locked. Default: 5 minutes.
    pub timer_lock_duration: Duration,

    /// How long a claimed audit record stays locked. Default: 1 minute.
    pub audit_lock_duration: Duration,

    /// Maximum time to wait for in-flight work during shutdown. Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Backoff and attempt limit for command delivery.
    pub retry_policy: RetryPolicy,

    /// Backoff for audit delivery. `max_attempts` is ignored: audit
    /// records are retried until delivered.
    pub audit_retry_policy: RetryPolicy,

    /// Worker identifier, used as the lock owner and in health reports.
    ///
    /// If `None`, a UUID is generated when the hub is built.
    pub worker_id: Option<String>,

    /// Default: 1.
    pub delivery_workers: usize,

    /// Default: 1.
    pub timer_workers: usize,

    /// Default: 1.
    pub audit_workers: usize,

    /// How often terminal instances past retention are archived. Default: 1 hour.
    pub retention_sweep_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            delivery_poll_interval: Duration::from_millis(100),
            timer_poll_interval: Duration::from_secs(1),
            audit_poll_interval: Duration::from_millis(200),
            delivery_lock_duration: Duration::from_secs(300),
            timer_lock_duration: Duration::from_secs(300),
            audit_lock_duration: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            audit_retry_policy: RetryPolicy {
                max_attempts: u32::MAX,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
            },
            worker_id: None,
            delivery_workers: 1,
            timer_workers: 1,
            audit_workers: 1,
            retention_sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Per-workflow-type deadlines and instance retention.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Deadline for workflow types without an entry in `deadlines`.
    ///
    /// `None` disables deadline monitoring for them. Default: 24 hours.
    pub default_deadline: Option<Duration>,

    /// Deadline per workflow type, overriding `default_deadline`.
    pub deadlines: HashMap<String, Duration>,

    /// How long terminal instances stay queryable before archival.
    ///
    /// Default: 30 days.
    pub retention: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_deadline: Some(Duration::from_secs(24 * 3600)),
            deadlines: HashMap::new(),
            retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl WorkflowConfig {
    /// Deadline applied to instances of `workflow_type`.
    pub fn deadline_for(&self, workflow_type: &str) -> Option<Duration> {
        self.deadlines
            .get(workflow_type)
            .copied()
            .or(self.default_deadline)
    }

    pub fn with_deadline(mut self, workflow_type: impl Into<String>, deadline: Duration) -> Self {
        self.deadlines.insert(workflow_type.into(), deadline);
        self
    }
}
