//! Hub configuration loaded from `CLINHUB_*` environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `CLINHUB_AUTO_PROVISION` | `true` |
//! | `CLINHUB_MAX_MERGE_RETRIES` | `8` |
//! | `CLINHUB_DISPATCH_SHARDS` | `8` |
//! | `CLINHUB_DISPATCH_CAPACITY` | `1024` |
//! | `CLINHUB_DELIVERY_MAX_ATTEMPTS` | `5` |
//! | `CLINHUB_DELIVERY_BASE_DELAY_MS` | `1000` |
//! | `CLINHUB_DELIVERY_MAX_DELAY_MS` | `300000` |
//! | `CLINHUB_DELIVERY_WORKERS` | `1` |
//! | `CLINHUB_TIMER_WORKERS` | `1` |
//! | `CLINHUB_POLL_INTERVAL_MS` | `100` |
//! | `CLINHUB_TIMER_POLL_INTERVAL_MS` | `1000` |
//! | `CLINHUB_WORKER_ID` | random UUID |
//! | `CLINHUB_SHUTDOWN_TIMEOUT_SECS` | `30` |
//! | `CLINHUB_DEFAULT_DEADLINE_SECS` | `86400` (`0` disables) |
//! | `CLINHUB_DEADLINE_<TYPE>_SECS` | unset (e.g. `CLINHUB_DEADLINE_ORDER_LIFECYCLE_SECS`) |
//! | `CLINHUB_RETENTION_DAYS` | `30` |
//! | `CLINHUB_SPOKE_<SUBSYSTEM>_URL` | unset (e.g. `CLINHUB_SPOKE_LIS_URL`) |
//! | `CLINHUB_AUDIT_URL` | unset (audit records go to tracing) |
//! | `CLINHUB_HTTP_TIMEOUT_MS` | `10000` |

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::audit::{AuditSink, HttpAuditSink, TracingAuditSink};
use crate::delivery::HttpSpokeTransport;
use crate::identity::IdentityConfig;
use crate::router::RouterConfig;
use crate::runtime::{RuntimeConfig, WorkflowConfig};
use crate::subsystem::Subsystem;
use crate::workflows::BUILTIN_TYPES;

/// A configuration variable could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("failed to build {component}: {reason}")]
    Build {
        component: &'static str,
        reason: String,
    },
}

/// Everything needed to assemble a hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub runtime: RuntimeConfig,
    pub identity: IdentityConfig,
    pub router: RouterConfig,
    pub workflow: WorkflowConfig,
    /// Base URL per outbound target.
    pub endpoints: BTreeMap<Subsystem, Url>,
    pub audit_url: Option<Url>,
    /// Timeout for spoke and audit HTTP calls.
    pub http_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            identity: IdentityConfig::default(),
            router: RouterConfig::default(),
            workflow: WorkflowConfig::default(),
            endpoints: BTreeMap::new(),
            audit_url: None,
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl HubConfig {
    /// Load from the process environment after reading `.env`, if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using `lookup` to read variables. Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        env.set("CLINHUB_AUTO_PROVISION", &mut config.identity.auto_provision)?;
        env.set("CLINHUB_MAX_MERGE_RETRIES", &mut config.identity.max_merge_retries)?;

        env.set("CLINHUB_DISPATCH_SHARDS", &mut config.router.dispatch_shards)?;
        env.set("CLINHUB_DISPATCH_CAPACITY", &mut config.router.dispatch_capacity)?;

        let runtime = &mut config.runtime;
        env.set("CLINHUB_DELIVERY_MAX_ATTEMPTS", &mut runtime.retry_policy.max_attempts)?;
        env.set_millis("CLINHUB_DELIVERY_BASE_DELAY_MS", &mut runtime.retry_policy.base_delay)?;
        env.set_millis("CLINHUB_DELIVERY_MAX_DELAY_MS", &mut runtime.retry_policy.max_delay)?;
        env.set("CLINHUB_DELIVERY_WORKERS", &mut runtime.delivery_workers)?;
        env.set("CLINHUB_TIMER_WORKERS", &mut runtime.timer_workers)?;
        env.set_millis("CLINHUB_POLL_INTERVAL_MS", &mut runtime.delivery_poll_interval)?;
        env.set_millis("CLINHUB_TIMER_POLL_INTERVAL_MS", &mut runtime.timer_poll_interval)?;
        env.set_secs("CLINHUB_SHUTDOWN_TIMEOUT_SECS", &mut runtime.shutdown_timeout)?;
        if let Some(worker_id) = env.get("CLINHUB_WORKER_ID") {
            runtime.worker_id = Some(worker_id);
        }
        if runtime.retry_policy.max_attempts == 0 {
            return Err(env.invalid("CLINHUB_DELIVERY_MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        if let Some(secs) = env.parse::<u64>("CLINHUB_DEFAULT_DEADLINE_SECS")? {
            config.workflow.default_deadline = (secs > 0).then(|| Duration::from_secs(secs));
        }
        for workflow_type in BUILTIN_TYPES {
            let var = format!("CLINHUB_DEADLINE_{}_SECS", env_suffix(workflow_type));
            if let Some(secs) = env.parse::<u64>(&var)? {
                config.workflow.deadlines.insert(workflow_type.to_string(), Duration::from_secs(secs));
            }
        }
        if let Some(days) = env.parse::<u64>("CLINHUB_RETENTION_DAYS")? {
            config.workflow.retention = Duration::from_secs(days * 24 * 3600);
        }

        for subsystem in Subsystem::ALL {
            let var = format!("CLINHUB_SPOKE_{}_URL", env_suffix(subsystem.as_str()));
            if let Some(url) = env.parse::<Url>(&var)? {
                config.endpoints.insert(subsystem, url);
            }
        }
        config.audit_url = env.parse::<Url>("CLINHUB_AUDIT_URL")?;
        env.set_millis("CLINHUB_HTTP_TIMEOUT_MS", &mut config.http_timeout)?;

        Ok(config)
    }

    /// HTTP transport addressing the configured endpoints.
    pub fn spoke_transport(&self) -> Result<HttpSpokeTransport, ConfigError> {
        HttpSpokeTransport::new(self.http_timeout)
            .map(|t| t.with_endpoints(self.endpoints.clone()))
            .map_err(|e| ConfigError::Build {
                component: "spoke transport",
                reason: e.to_string(),
            })
    }

    /// HTTP audit sink if `audit_url` is set, the tracing sink otherwise.
    pub fn audit_sink(&self) -> Result<Arc<dyn AuditSink>, ConfigError> {
        match &self.audit_url {
            Some(url) => HttpAuditSink::new(url.clone(), self.http_timeout)
                .map(|sink| Arc::new(sink) as Arc<dyn AuditSink>)
                .map_err(|e| ConfigError::Build {
                    component: "audit sink",
                    reason: e.to_string(),
                }),
            None => Ok(Arc::new(TracingAuditSink)),
        }
    }
}

/// `order-lifecycle` -> `ORDER_LIFECYCLE`
fn env_suffix(name: &str) -> String {
    name.replace('-', "_").to_ascii_uppercase()
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn invalid(&self, var: &str, value: &str, reason: impl ToString) -> ConfigError {
        ConfigError::Invalid {
            var: var.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(var)
            .map(|value| value.parse::<T>().map_err(|e| self.invalid(var, &value, e)))
            .transpose()
    }

    fn set<T>(&self, var: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.parse(var)? {
            *target = value;
        }
        Ok(())
    }

    fn set_millis(&self, var: &str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(ms) = self.parse::<u64>(var)? {
            *target = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn set_secs(&self, var: &str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(secs) = self.parse::<u64>(var)? {
            *target = Duration::from_secs(secs);
        }
        Ok(())
    }
}
