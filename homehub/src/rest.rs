use crate::errors::Error;
use crate::history::{HistoryAnswer, HistoryQuery};
use crate::hub::Hub;
use crate::ledger::IssueRequest;
use crate::model::{now_ms, ActuatorView, Command, Device, Event};
use crate::ws::ws_handler;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, warn};

const DEFAULT_WINDOW_MS: i64 = 3600 * 1000;
const DEFAULT_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    since: Option<i64>,
    until: Option<i64>,
    limit: Option<usize>,
    bucket_width_ms: Option<i64>,
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    since: Option<i64>,
    until: Option<i64>,
}

impl RangeParams {
    fn resolve(&self) -> (i64, i64) {
        let until = self.until.unwrap_or_else(now_ms);
        (self.since.unwrap_or(until - DEFAULT_WINDOW_MS), until)
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceParams {
    online: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    device_id: String,
    actuator_id: String,
    action: String,
    #[serde(default)]
    value: Value,
    source: Option<String>,
    reason: Option<String>,
    ttl: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAccepted {
    correlation_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    name: String,
}

pub fn create_router(hub: Arc<Hub>) -> Router {
    let state = AppState { hub };

    Router::new()
        .route("/api/v1/history", get(get_history))
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:id", get(get_device))
        .route("/api/v1/devices/:id/actuators", get(device_actuators))
        .route(
            "/api/v1/devices/:id/actuators/:actuator/name",
            put(rename_actuator).delete(clear_actuator_name),
        )
        .route("/api/v1/actuators", get(list_actuators))
        .route("/api/v1/commands", post(issue_command).get(list_commands))
        .route("/api/v1/commands/:id", get(get_command))
        .route("/api/v1/events", get(list_events))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryAnswer>, AppError> {
    let until = params.until.unwrap_or_else(now_ms);
    let query = HistoryQuery {
        since: params.since.unwrap_or(until - DEFAULT_WINDOW_MS),
        until,
        limit: params.limit.unwrap_or(DEFAULT_LIMIT),
        device_id: params.device_id.filter(|d| !d.is_empty()),
        bucket_width_ms: params.bucket_width_ms,
    };
    Ok(Json(state.hub.history.answer(&query).await?))
}

async fn list_devices(
    State(state): State<AppState>,
    Query(params): Query<DeviceParams>,
) -> Json<Vec<Device>> {
    let devices = if params.online.unwrap_or(false) {
        state.hub.registry.online()
    } else {
        state.hub.registry.all()
    };
    Json(devices)
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Device>, AppError> {
    let device = state
        .hub
        .registry
        .get(&id)
        .ok_or(Error::DeviceNotFound(id))?;
    Ok(Json(device))
}

async fn device_actuators(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ActuatorView>>, AppError> {
    Ok(Json(state.hub.registry.actuators(Some(&id))?))
}

async fn list_actuators(State(state): State<AppState>) -> Result<Json<Vec<ActuatorView>>, AppError> {
    Ok(Json(state.hub.registry.actuators(None)?))
}

async fn rename_actuator(
    State(state): State<AppState>,
    Path((id, actuator)): Path<(String, String)>,
    Json(body): Json<RenameRequest>,
) -> Result<Json<Device>, AppError> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::Validation("Name cannot be empty".to_string()).into());
    }
    Ok(Json(state.hub.set_actuator_name(&id, &actuator, name, now_ms())?))
}

async fn clear_actuator_name(
    State(state): State<AppState>,
    Path((id, actuator)): Path<(String, String)>,
) -> Result<Json<Device>, AppError> {
    Ok(Json(state.hub.clear_actuator_name(&id, &actuator, now_ms())?))
}

async fn issue_command(
    State(state): State<AppState>,
    Json(body): Json<CommandRequest>,
) -> Result<(StatusCode, Json<CommandAccepted>), AppError> {
    let request = IssueRequest {
        device_id: body.device_id,
        actuator_id: body.actuator_id,
        action: body.action,
        value: body.value,
        source: body.source.unwrap_or_else(|| "api".to_string()),
        reason: body.reason,
        ttl_ms: body.ttl,
    };
    let command = state.hub.issue_command(request, now_ms())?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandAccepted {
            correlation_id: command.correlation_id,
        }),
    ))
}

async fn list_commands(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Json<Vec<Command>> {
    let (since, until) = params.resolve();
    Json(state.hub.ledger.range(since, until))
}

async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Command>, AppError> {
    let command = state
        .hub
        .ledger
        .get(&id)
        .ok_or(Error::CommandNotFound(id))?;
    Ok(Json(command))
}

async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Json<Vec<Event>> {
    let (since, until) = params.resolve();
    Json(state.hub.events.range(since, until))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let hub = &state.hub;
    Json(json!({
        "status": "ok",
        "devices": hub.registry.len(),
        "pendingCommands": hub.ledger.pending_count(),
        "hotReadings": hub.hot.len(),
        "subscribers": hub.broadcast.subscriber_count(),
    }))
}

pub struct AppError(anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<Error>() {
            Some(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            Some(Error::TransportUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
            Some(Error::Validation(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
        } else {
            warn!("API request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
