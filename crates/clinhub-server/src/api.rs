//! HTTP routes over a [`Hub`].
//!
//! Ingestion answers `202 Accepted` once the event is journaled; routing
//! happens on the dispatcher shards unless `?inline=true` is given.
//! Ingestion rejections carry a stable `reason` code:
//!
//! | Status | Reason               |
//! |--------|----------------------|
//! | 400    | `malformed_envelope` |
//! | 422    | `unknown_identity`   |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clinhub::event::CausalToken;
use clinhub::health::{self, HealthReport, HealthStatus};
use clinhub::store::{
    CommandId, CommandQuery, DeadLetterStore, DeliveryStatus, HubStore, InstanceQuery, OutboxStore,
};
use clinhub::{CanonicalId, EventId, Hub, RawEnvelope, RouteReport, Subsystem, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_LIMIT: u32 = 100;

/// Shared handler state.
pub struct AppState<S: HubStore> {
    pub hub: Arc<Hub<S>>,
}

impl<S: HubStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            hub: Arc::clone(&self.hub),
        }
    }
}

pub fn router<S: HubStore>(hub: Arc<Hub<S>>) -> Router {
    Router::new()
        .route("/events", post(ingest_event::<S>))
        .route("/events/unrouted", get(list_unrouted::<S>))
        .route("/health", get(health_check::<S>))
        .route("/status", get(status::<S>))
        .route("/commands", get(list_commands::<S>))
        .route("/commands/:id", get(get_command::<S>))
        .route("/commands/:id/retry", post(retry_command::<S>))
        .route("/identities/resolve", post(resolve_identity::<S>))
        .route("/identities/merge", post(merge_identities::<S>))
        .route("/identities/:id", get(get_identity::<S>))
        .route("/identities/:id/links", post(link_identity::<S>))
        .route("/identities/:id/history", get(identity_history::<S>))
        .route("/workflows", get(list_workflows::<S>))
        .route("/workflows/:workflow_type/:workflow_id", get(get_workflow::<S>))
        .route(
            "/workflows/:workflow_type/:workflow_id/cancel",
            post(cancel_workflow::<S>),
        )
        .route("/dead-letters", get(list_dead_letters::<S>))
        .with_state(AppState { hub })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failed request, rendered as `{"reason": ..., "message": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    reason: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            reason,
            message: message.into(),
        }
    }

    fn bad_request(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
    }
}

impl From<clinhub::Error> for ApiError {
    fn from(error: clinhub::Error) -> Self {
        let reason = error.reason_code();
        let status = match reason {
            "malformed_envelope" => StatusCode::BAD_REQUEST,
            "unknown_identity" => StatusCode::UNPROCESSABLE_ENTITY,
            "identity_conflict" | "merge_conflict" | "cancellation_unsupported" => {
                StatusCode::CONFLICT
            }
            "not_found" | "unknown_workflow_type" => StatusCode::NOT_FOUND,
            "unavailable" | "dispatcher_full" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(%error, "request failed");
        }
        Self::new(status, reason, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "reason": self.reason, "message": self.message }));
        (self.status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IngestParams {
    /// Route on the request task instead of the dispatcher.
    inline: bool,
}

#[derive(Debug, Serialize)]
struct Accepted {
    event_id: EventId,
    causal_token: CausalToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    route: Option<RouteReport>,
}

async fn ingest_event<S: HubStore>(
    State(state): State<AppState<S>>,
    Query(params): Query<IngestParams>,
    body: Result<Json<RawEnvelope>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    // An undecodable body is as malformed as an envelope missing a field.
    let Json(raw) = body.map_err(|rejection| {
        ApiError::new(StatusCode::BAD_REQUEST, "malformed_envelope", rejection.body_text())
    })?;

    let (event, route) = if params.inline {
        let (event, report) = state.hub.ingest_and_route(&raw).await?;
        (event, Some(report))
    } else {
        (state.hub.submit(&raw).await?, None)
    };

    info!(
        event_id = %event.id,
        source = %event.source,
        event_type = %event.event_type,
        "event accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            event_id: event.id,
            causal_token: event.causal_token,
            route,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LimitParams {
    limit: Option<u32>,
}

impl LimitParams {
    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

async fn list_unrouted<S: HubStore>(
    State(state): State<AppState<S>>,
    Query(params): Query<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    let events = state.hub.router().unrouted(params.limit()).await?;
    Ok(Json(events))
}

// ---------------------------------------------------------------------------
// Health and status
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthBody {
    status: HealthStatus,
    components: Vec<HealthReport>,
}

async fn health_check<S: HubStore>(State(state): State<AppState<S>>) -> impl IntoResponse {
    let components = state.hub.health().await;
    let status = health::overall(&components);
    let code = if status == HealthStatus::Down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(HealthBody { status, components }))
}

async fn status<S: HubStore>(State(state): State<AppState<S>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.hub.status().await?))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommandParams {
    status: Option<DeliveryStatus>,
    target: Option<Subsystem>,
    workflow_type: Option<String>,
    workflow_id: Option<String>,
    limit: Option<u32>,
}

async fn list_commands<S: HubStore>(
    State(state): State<AppState<S>>,
    Query(params): Query<CommandParams>,
) -> ApiResult<impl IntoResponse> {
    let query = CommandQuery {
        status: params.status,
        target: params.target,
        workflow_type: params.workflow_type,
        workflow_id: params.workflow_id.map(WorkflowId::from),
        limit: Some(params.limit.unwrap_or(DEFAULT_LIMIT)),
    };
    Ok(Json(state.hub.store().list_commands(&query).await?))
}

async fn get_command<S: HubStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let command = state
        .hub
        .store()
        .get_command(CommandId::from_uuid(id))
        .await?
        .ok_or_else(|| clinhub::Error::not_found("command", id))?;
    Ok(Json(command))
}

async fn retry_command<S: HubStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let id = CommandId::from_uuid(id);
    let store = state.hub.store();

    if store.retry_exhausted(id).await? {
        info!(command_id = %id, "exhausted command re-queued by operator");
        return Ok(Json(json!({ "command_id": id, "status": DeliveryStatus::Pending })));
    }

    match store.get_command(id).await? {
        Some(command) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "not_exhausted",
            format!("command {id} is {}", command.status),
        )),
        None => Err(clinhub::Error::not_found("command", id).into()),
    }
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    subsystem: Subsystem,
    local_id: String,
}

async fn resolve_identity<S: HubStore>(
    State(state): State<AppState<S>>,
    body: Result<Json<ResolveRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = body.map_err(ApiError::bad_request)?;
    let identity = state
        .hub
        .resolver()
        .resolve(request.subsystem, &request.local_id)
        .await?;
    Ok(Json(identity))
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    a: CanonicalId,
    b: CanonicalId,
}

async fn merge_identities<S: HubStore>(
    State(state): State<AppState<S>>,
    body: Result<Json<MergeRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = body.map_err(ApiError::bad_request)?;
    let survivor = state.hub.resolver().merge(request.a, request.b).await?;
    Ok(Json(survivor))
}

async fn get_identity<S: HubStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let identity = state
        .hub
        .resolver()
        .lookup(CanonicalId::from_uuid(id))
        .await?;
    Ok(Json(identity))
}

async fn link_identity<S: HubStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
    body: Result<Json<ResolveRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = body.map_err(ApiError::bad_request)?;
    let identity = state
        .hub
        .resolver()
        .link(request.subsystem, &request.local_id, CanonicalId::from_uuid(id))
        .await?;
    Ok(Json(identity))
}

async fn identity_history<S: HubStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let history = state
        .hub
        .resolver()
        .history(CanonicalId::from_uuid(id))
        .await?;
    Ok(Json(history))
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorkflowParams {
    #[serde(rename = "type")]
    workflow_type: Option<String>,
    status: Option<String>,
    patient: Option<Uuid>,
    limit: Option<u32>,
    offset: u32,
}

async fn list_workflows<S: HubStore>(
    State(state): State<AppState<S>>,
    Query(params): Query<WorkflowParams>,
) -> ApiResult<impl IntoResponse> {
    let query = InstanceQuery {
        workflow_type: params.workflow_type,
        status: params.status,
        patient: params.patient.map(CanonicalId::from_uuid),
        limit: params.limit.unwrap_or(DEFAULT_LIMIT),
        offset: params.offset,
    };
    Ok(Json(state.hub.service().list(&query).await?))
}

async fn get_workflow<S: HubStore>(
    State(state): State<AppState<S>>,
    Path((workflow_type, workflow_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let view = state
        .hub
        .service()
        .instance(&workflow_type, &WorkflowId::new(workflow_id))
        .await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    reason: String,
}

async fn cancel_workflow<S: HubStore>(
    State(state): State<AppState<S>>,
    Path((workflow_type, workflow_id)): Path<(String, String)>,
    body: Result<Json<CancelRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = body.map_err(ApiError::bad_request)?;
    let outcome = state
        .hub
        .service()
        .cancel(&workflow_type, &WorkflowId::new(workflow_id), &request.reason)
        .await?;
    Ok(Json(outcome))
}

async fn list_dead_letters<S: HubStore>(
    State(state): State<AppState<S>>,
    Query(params): Query<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.hub.store().list_dead_letters(params.limit()).await?))
}
