use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use gatehouse_core::flow::FlowDefinition;
use gatehouse_core::instance::ToolConfirmationSettings;
use gatehouse_core::types::InstanceId;
use gatehouse_engine::{StepStream, StreamEvent};

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

fn sse_event(event: StreamEvent) -> Event {
    if let StreamEvent::Error(e) = &event {
        debug!(instance_id = %event.instance_id(), error = %e.message, "Streaming run error");
    }
    Event::default()
        .event(event.name())
        .data(event.data_json().to_string())
}

/// One SSE event per stream event; the response ends with the run.
fn sse(stream: StepStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(stream.map(|e| Ok(sse_event(e)))).keep_alive(KeepAlive::default())
}

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Flow definitions ────────────────────────────────────────────

// POST /api/flows
pub async fn register_flow(
    State(state): State<Arc<AppState>>,
    Json(def): Json<FlowDefinition>,
) -> ApiResult<impl IntoResponse> {
    let id = def.id.clone();
    state.engine.register_definition(def).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

// GET /api/flows
pub async fn list_flows(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let flows = state.engine.list_definitions().await?;
    Ok(Json(serde_json::json!({ "flows": flows })))
}

// GET /api/flows/{id}
pub async fn get_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<FlowDefinition>> {
    Ok(Json(state.engine.definition(&id).await?))
}

// ── Instances ───────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceBody {
    pub definition_id: String,
}

// POST /api/instances
pub async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateInstanceBody>,
) -> ApiResult<impl IntoResponse> {
    let info = state.engine.create_instance(&body.definition_id).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

// GET /api/instances/{id}
pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let info = state.engine.instance_info(&InstanceId::from_string(&id)).await?;
    Ok(Json(info))
}

// DELETE /api/instances/{id}
pub async fn delete_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.delete_instance(&InstanceId::from_string(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// GET /api/instances/{id}/history
pub async fn instance_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let steps = state.engine.history(&InstanceId::from_string(&id)).await?;
    Ok(Json(serde_json::json!({ "steps": steps })))
}

#[derive(Deserialize)]
pub struct SendMessageBody {
    pub message: String,
}

// POST /api/instances/{id}/messages (SSE)
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<impl IntoResponse> {
    if body.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".into()));
    }
    let instance_id = InstanceId::from_string(&id);
    debug!(instance_id = %instance_id, "Message received");
    let stream = state.engine.send(&instance_id, &body.message).await?;
    Ok(sse(stream))
}

// POST /api/instances/{id}/resume (SSE)
pub async fn resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let stream = state.engine.resume(&InstanceId::from_string(&id)).await?;
    Ok(sse(stream))
}

// POST /api/instances/{id}/cancel
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancelled = state.engine.cancel(&InstanceId::from_string(&id)).await?;
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

// ── Tool confirmation ───────────────────────────────────────────

// GET /api/instances/{id}/pending
pub async fn pending(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let pending = state.engine.pending(&InstanceId::from_string(&id)).await?;
    Ok(Json(serde_json::json!({ "pending": pending })))
}

// POST /api/instances/{id}/tools/{execution_id}/confirm
pub async fn confirm_tool(
    State(state): State<Arc<AppState>>,
    Path((id, execution_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .engine
        .confirm(&InstanceId::from_string(&id), &execution_id)
        .await?;
    Ok(Json(outcome))
}

// POST /api/instances/{id}/tools/{execution_id}/deny
pub async fn deny_tool(
    State(state): State<Arc<AppState>>,
    Path((id, execution_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let denial = state
        .engine
        .deny(&InstanceId::from_string(&id), &execution_id)
        .await?;
    Ok(Json(denial))
}

// GET /api/instances/{id}/tool-settings
pub async fn get_tool_settings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ToolConfirmationSettings>> {
    Ok(Json(state.engine.settings(&InstanceId::from_string(&id)).await?))
}

// PUT /api/instances/{id}/tool-settings
pub async fn put_tool_settings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(settings): Json<ToolConfirmationSettings>,
) -> ApiResult<Json<ToolConfirmationSettings>> {
    let settings = state
        .engine
        .set_settings(&InstanceId::from_string(&id), settings)
        .await?;
    Ok(Json(settings))
}
