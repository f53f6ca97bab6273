//! Axum integration — HTTP routes for the broker's A2A surface.
//!
//! - `POST /a2a` — JSON-RPC 2.0 dispatch for all methods
//! - `GET /.well-known/agent-card.json` — capability manifest
//! - `GET /.well-known/agent.json` — deprecated manifest path (warns)
//!
//! Streaming methods answer with SSE; each event body is a JSON-RPC
//! success envelope whose `result` is the event, and the stream ends with
//! a `done` event after the first `final=true` status update.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde_json::Value;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, warn};

use crate::device::manifest::ManifestCache;
use crate::error::{self, BrokerError};
use crate::types::{
    GetTaskParams, JsonRpcError as WireError, ListTasksParams, PushConfigIdParams,
    SendMessageParams, StreamEvent, TaskIdParams, TaskPushNotificationConfig,
};

use super::request_handler::RequestHandler;

/// Shared state for the routes.
struct AppState {
    handler: Arc<dyn RequestHandler>,
    manifest: Arc<ManifestCache>,
}

/// Build the broker's axum router.
pub fn broker_router(handler: Arc<dyn RequestHandler>, manifest: Arc<ManifestCache>) -> Router {
    let state = Arc::new(AppState { handler, manifest });

    Router::new()
        .route("/.well-known/agent-card.json", get(handle_agent_card))
        .route("/.well-known/agent.json", get(handle_agent_card_deprecated))
        .route("/a2a", post(handle_jsonrpc))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn handle_agent_card(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manifest.load().await.as_ref().clone()).into_response()
}

async fn handle_agent_card_deprecated(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    warn!(
        "Deprecated agent card endpoint '/.well-known/agent.json' accessed. \
         Please use '/.well-known/agent-card.json' instead."
    );
    Json(state.manifest.load().await.as_ref().clone()).into_response()
}

/// JSON-RPC 2.0 response envelope for this surface.
#[derive(Debug, serde::Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Option<Value>, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(WireError {
                code,
                message,
                data: None,
            }),
        }
    }

    fn from_broker_error(id: Option<Value>, err: BrokerError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(err.into()),
        }
    }
}

/// Main JSON-RPC dispatch. The body is parsed by hand so malformed JSON
/// yields a proper -32700 instead of a bare HTTP 400.
async fn handle_jsonrpc(State(state): State<Arc<AppState>>, body: String) -> Response {
    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            return Json(JsonRpcResponse::error(
                None,
                error::PARSE_ERROR,
                format!("Invalid JSON payload: {}", e),
            ))
            .into_response();
        }
    };

    let id = value.get("id").filter(|v| !v.is_null()).cloned();

    // Envelope validation: version, method shape, and a request id.
    // Notifications are only legal on the outbound push-delivery path;
    // inbound calls must carry an id.
    if value.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
        return Json(JsonRpcResponse::error(
            id,
            error::INVALID_REQUEST,
            "Invalid JSON-RPC version — must be \"2.0\"".to_string(),
        ))
        .into_response();
    }

    let Some(method) = value.get("method").and_then(|v| v.as_str()).map(String::from) else {
        return Json(JsonRpcResponse::error(
            id,
            error::INVALID_REQUEST,
            "Missing 'method' field".to_string(),
        ))
        .into_response();
    };

    if !method.contains('/') {
        return Json(JsonRpcResponse::error(
            id,
            error::INVALID_REQUEST,
            format!("Method '{}' must be of the form category/action", method),
        ))
        .into_response();
    }

    if id.is_none() {
        return Json(JsonRpcResponse::error(
            None,
            error::INVALID_REQUEST,
            "Requests must carry an 'id'".to_string(),
        ))
        .into_response();
    }

    let params = value.get("params").cloned().unwrap_or(Value::Null);
    debug!(method = %method, "JSON-RPC request received");

    match method.as_str() {
        "message/send" => handle_message_send(state, id, params).await,
        "message/stream" => handle_message_stream(state, id, params).await,
        "tasks/get" => handle_tasks_get(state, id, params).await,
        "tasks/list" => handle_tasks_list(state, id, params).await,
        "tasks/cancel" => handle_tasks_cancel(state, id, params).await,
        "tasks/resubscribe" => handle_tasks_resubscribe(state, id, params).await,
        "tasks/pushNotificationConfig/set" => handle_push_set(state, id, params).await,
        "tasks/pushNotificationConfig/get" => handle_push_get(state, id, params).await,
        "tasks/pushNotificationConfig/list" => handle_push_list(state, id, params).await,
        "tasks/pushNotificationConfig/delete" => handle_push_delete(state, id, params).await,
        method => {
            warn!(method = %method, "Unknown JSON-RPC method");
            Json(JsonRpcResponse::error(
                id,
                error::METHOD_NOT_FOUND,
                format!("Method not found: {}", method),
            ))
            .into_response()
        }
    }
}

/// Deserialize params or produce an InvalidParams response.
fn parse_params<T: serde::de::DeserializeOwned>(
    id: &Option<Value>,
    params: Value,
) -> Result<T, Response> {
    serde_json::from_value(params).map_err(|e| {
        Json(JsonRpcResponse::error(
            id.clone(),
            error::INVALID_PARAMS,
            format!("Invalid params: {}", e),
        ))
        .into_response()
    })
}

/// Serialize a handler result into a success envelope.
fn respond<T: serde::Serialize>(id: Option<Value>, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(v) => Json(JsonRpcResponse::success(id, v)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            Json(JsonRpcResponse::error(
                id,
                error::INTERNAL_ERROR,
                format!("Internal error: {}", e),
            ))
            .into_response()
        }
    }
}

async fn handle_message_send(state: Arc<AppState>, id: Option<Value>, params: Value) -> Response {
    let params: SendMessageParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.handler.on_message_send(params).await {
        Ok(response) => respond(id, &response),
        Err(e) => Json(JsonRpcResponse::from_broker_error(id, e)).into_response(),
    }
}

async fn handle_message_stream(state: Arc<AppState>, id: Option<Value>, params: Value) -> Response {
    let card = state.manifest.load().await;
    if !card.capabilities.streaming.unwrap_or(false) {
        return Json(JsonRpcResponse::error(
            id,
            error::UNSUPPORTED_OPERATION,
            "Streaming is not supported by this service".to_string(),
        ))
        .into_response();
    }

    let params: SendMessageParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.handler.on_message_send_stream(params).await {
        Ok(rx) => Sse::new(make_sse_stream(id, rx))
            .keep_alive(KeepAlive::default())
            .into_response(),
        Err(e) => Json(JsonRpcResponse::from_broker_error(id, e)).into_response(),
    }
}

async fn handle_tasks_get(state: Arc<AppState>, id: Option<Value>, params: Value) -> Response {
    let params: GetTaskParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.handler.on_get_task(params).await {
        Ok(task) => respond(id, &task),
        Err(e) => Json(JsonRpcResponse::from_broker_error(id, e)).into_response(),
    }
}

async fn handle_tasks_list(state: Arc<AppState>, id: Option<Value>, params: Value) -> Response {
    let params: ListTasksParams = match parse_params(&id, if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    }) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.handler.on_list_tasks(params).await {
        Ok(response) => respond(id, &response),
        Err(e) => Json(JsonRpcResponse::from_broker_error(id, e)).into_response(),
    }
}

async fn handle_tasks_cancel(state: Arc<AppState>, id: Option<Value>, params: Value) -> Response {
    let params: TaskIdParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.handler.on_cancel_task(params).await {
        Ok(task) => respond(id, &task),
        Err(e) => Json(JsonRpcResponse::from_broker_error(id, e)).into_response(),
    }
}

async fn handle_tasks_resubscribe(
    state: Arc<AppState>,
    id: Option<Value>,
    params: Value,
) -> Response {
    let card = state.manifest.load().await;
    if !card.capabilities.streaming.unwrap_or(false) {
        return Json(JsonRpcResponse::error(
            id,
            error::UNSUPPORTED_OPERATION,
            "Streaming is not supported by this service".to_string(),
        ))
        .into_response();
    }

    let params: TaskIdParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.handler.on_resubscribe(params).await {
        Ok(rx) => Sse::new(make_sse_stream(id, rx))
            .keep_alive(KeepAlive::default())
            .into_response(),
        Err(e) => Json(JsonRpcResponse::from_broker_error(id, e)).into_response(),
    }
}

async fn handle_push_set(state: Arc<AppState>, id: Option<Value>, params: Value) -> Response {
    let params: TaskPushNotificationConfig = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.handler.on_set_push_config(params).await {
        Ok(config) => respond(id, &config),
        Err(e) => Json(JsonRpcResponse::from_broker_error(id, e)).into_response(),
    }
}

async fn handle_push_get(state: Arc<AppState>, id: Option<Value>, params: Value) -> Response {
    let params: PushConfigIdParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.handler.on_get_push_config(params).await {
        Ok(config) => respond(id, &config),
        Err(e) => Json(JsonRpcResponse::from_broker_error(id, e)).into_response(),
    }
}

async fn handle_push_list(state: Arc<AppState>, id: Option<Value>, params: Value) -> Response {
    let params: TaskIdParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.handler.on_list_push_configs(params).await {
        Ok(configs) => respond(id, &configs),
        Err(e) => Json(JsonRpcResponse::from_broker_error(id, e)).into_response(),
    }
}

async fn handle_push_delete(state: Arc<AppState>, id: Option<Value>, params: Value) -> Response {
    let params: PushConfigIdParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.handler.on_delete_push_config(params).await {
        Ok(()) => respond(id, &Value::Null),
        Err(e) => Json(JsonRpcResponse::from_broker_error(id, e)).into_response(),
    }
}

// ---- SSE streaming ----

/// Turn a broadcast receiver into an SSE stream of JSON-RPC success
/// envelopes. Ends with a `done` event after the first `final=true`
/// status update or when the channel closes.
fn make_sse_stream(
    request_id: Option<Value>,
    mut rx: broadcast::Receiver<StreamEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let is_terminal = match &event {
                        StreamEvent::StatusUpdate(update) => update.r#final,
                        _ => false,
                    };

                    let event_type = match &event {
                        StreamEvent::StatusUpdate(_) => "statusUpdate",
                        StreamEvent::ArtifactUpdate(_) => "artifactUpdate",
                        StreamEvent::Task(_) => "task",
                        StreamEvent::Message(_) => "message",
                    };

                    match serde_json::to_value(&event) {
                        Ok(result_value) => {
                            let rpc_response = JsonRpcResponse::success(
                                request_id.clone(),
                                result_value,
                            );
                            match serde_json::to_string(&rpc_response) {
                                Ok(json) => {
                                    yield Ok(Event::default().event(event_type).data(json));
                                }
                                Err(e) => {
                                    error!(error = %e, "Failed to serialize SSE JSON-RPC response");
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to serialize SSE event");
                        }
                    }

                    if is_terminal {
                        yield Ok(Event::default().event("done").data(""));
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    yield Ok(Event::default().event("done").data(""));
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "SSE stream lagged — some events were missed");
                }
            }
        }
    }
}
