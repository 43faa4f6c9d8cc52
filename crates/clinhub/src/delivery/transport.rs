//! Engine-to-spoke delivery calls.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::identity::CanonicalId;
use crate::store::{CommandId, OutboundCommand};
use crate::subsystem::Subsystem;

/// Header carrying the command's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// What a spoke receives for one delivery attempt.
///
/// Receivers must deduplicate on `idempotency_key`: a command may arrive
/// again after a timeout even when the first attempt succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub command_id: CommandId,
    pub action: String,
    pub payload: Value,
    pub idempotency_key: String,
    /// 1-based attempt number.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient: Option<CanonicalId>,
}

impl DeliveryRequest {
    /// Build the request for the next attempt of `command`.
    pub fn for_command(command: &OutboundCommand) -> Self {
        Self {
            command_id: command.id,
            action: command.action.clone(),
            payload: command.payload.clone(),
            idempotency_key: command.idempotency_key(),
            attempt: command.attempts + 1,
            patient: command.patient,
        }
    }
}

/// A spoke's answer to a delivery.
///
/// Acknowledgment means receipt, not completion of spoke-side processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Accepted,
    /// The spoke refused the command permanently; it is not retried.
    Rejected { reason: String },
}

/// The spoke could not be reached or failed transiently.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no endpoint configured for {0}")]
    NoEndpoint(Subsystem),

    #[error("{target} unavailable: {reason}")]
    Unavailable { target: Subsystem, reason: String },

    /// The spoke asked for the command again later.
    #[error("{target} busy: status {status}")]
    Busy {
        target: Subsystem,
        status: u16,
        retry_after: Option<Duration>,
    },
}

impl TransportError {
    /// Delay the spoke asked for before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Busy { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Client errors a spoke uses to say "not now" rather than "never".
fn is_transient(status: reqwest::StatusCode) -> bool {
    matches!(
        status,
        reqwest::StatusCode::REQUEST_TIMEOUT
            | reqwest::StatusCode::CONFLICT
            | reqwest::StatusCode::LOCKED
            | reqwest::StatusCode::TOO_MANY_REQUESTS
    )
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Pushes commands to departmental subsystems and the notification service.
#[async_trait]
pub trait SpokeTransport: Send + Sync + 'static {
    async fn deliver(
        &self,
        target: Subsystem,
        request: &DeliveryRequest,
    ) -> std::result::Result<Ack, TransportError>;
}

/// HTTP transport: one base URL per subsystem.
///
/// Each request is a JSON `POST` of the [`DeliveryRequest`] with the
/// idempotency key repeated in the [`IDEMPOTENCY_KEY_HEADER`] header.
/// `2xx` is accepted and `4xx` a permanent rejection, except 408, 409,
/// 423 and 429 which are retried after any `Retry-After` the spoke sends.
/// Anything else or a network failure leaves the spoke unavailable.
#[derive(Debug, Clone)]
pub struct HttpSpokeTransport {
    client: reqwest::Client,
    endpoints: HashMap<Subsystem, Url>,
}

impl HttpSpokeTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoints: HashMap::new(),
        })
    }

    pub fn with_endpoint(mut self, target: Subsystem, url: Url) -> Self {
        self.endpoints.insert(target, url);
        self
    }

    pub fn with_endpoints(mut self, endpoints: impl IntoIterator<Item = (Subsystem, Url)>) -> Self {
        self.endpoints.extend(endpoints);
        self
    }

    pub fn endpoint(&self, target: Subsystem) -> Option<&Url> {
        self.endpoints.get(&target)
    }
}

#[async_trait]
impl SpokeTransport for HttpSpokeTransport {
    async fn deliver(
        &self,
        target: Subsystem,
        request: &DeliveryRequest,
    ) -> std::result::Result<Ack, TransportError> {
        let endpoint = self
            .endpoints
            .get(&target)
            .ok_or(TransportError::NoEndpoint(target))?;

        debug!(
            command_id = %request.command_id,
            target = %target,
            attempt = request.attempt,
            "Posting command"
        );

        let response = self
            .client
            .post(endpoint.clone())
            .header(IDEMPOTENCY_KEY_HEADER, &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::Unavailable {
                target,
                reason: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(Ack::Accepted);
        }
        if is_transient(status) {
            return Err(TransportError::Busy {
                target,
                status: status.as_u16(),
                retry_after: retry_after(response.headers()),
            });
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Ok(Ack::Rejected {
                reason: if body.is_empty() {
                    format!("status {status}")
                } else {
                    format!("status {status}: {body}")
                },
            });
        }
        Err(TransportError::Unavailable {
            target,
            reason: format!("status {status}"),
        })
    }
}
