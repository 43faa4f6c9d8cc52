//! Component health and operational counters.

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::Result;

pub const IDENTITY_RESOLVER: &str = "identity-resolver";
pub const MESSAGE_ROUTER: &str = "message-router";
pub const WORKFLOW_ENGINE: &str = "workflow-engine";
pub const OUTBOX: &str = "outbox";
pub const AUDIT: &str = "audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
}

/// Health of one hub component.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub component: &'static str,
    pub status: HealthStatus,
    /// Worker identity of the reporting process.
    pub identity: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthReport {
    pub(crate) fn ok(component: &'static str, identity: &str) -> Self {
        Self {
            component,
            status: HealthStatus::Ok,
            identity: identity.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            detail: None,
        }
    }

    pub(crate) fn degraded(mut self, detail: impl Into<String>) -> Self {
        self.status = HealthStatus::Degraded;
        self.detail = Some(detail.into());
        self
    }

    /// Report for a component whose probe failed.
    pub(crate) fn from_probe<T>(
        component: &'static str,
        identity: &str,
        probe: Result<T>,
        check: impl FnOnce(Self, T) -> Self,
    ) -> Self {
        let report = Self::ok(component, identity);
        match probe {
            Ok(value) => check(report, value),
            Err(e) => Self {
                status: HealthStatus::Down,
                detail: Some(e.to_string()),
                ..report
            },
        }
    }
}

/// Worst status across reports.
pub fn overall(reports: &[HealthReport]) -> HealthStatus {
    reports
        .iter()
        .map(|r| r.status)
        .max()
        .unwrap_or(HealthStatus::Ok)
}

/// Operational counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStatus {
    pub pending_commands: u64,
    pub failed_commands: u64,
    pub exhausted_commands: u64,
    pub delivered_commands: u64,
    pub pending_audit_records: u64,
    pub pending_events: u64,
    pub unrouted_events: u64,
    pub dead_letters: u64,
    pub identities: u64,
    /// Events accepted but still waiting in dispatcher queues.
    pub queued_events: usize,
}
