//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, warn};

use super::registry::VirtualServers;
use crate::error::rpc_codes;
use crate::oauth::{CallbackParams, error_page, success_page};
use crate::protocol::{
    JsonRpcResponse, PromptsGetParams, RequestId, ResourcesReadParams, ToolsCallParams,
};
use crate::virtual_server::VirtualMcp;
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Virtual server facades
    pub servers: Arc<VirtualServers>,
    /// Bound on one JSON-RPC request
    pub request_timeout: Duration,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/callback", get(callback_handler))
        .route("/vmcp/{server}", post(rpc_handler))
        .route(
            "/vmcp/{server}/backends/{backend}/auth",
            post(begin_auth_handler),
        )
        .route(
            "/vmcp/{server}/resources/{filename}",
            post(upload_resource_handler),
        )
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.servers.health().await {
        Ok(servers) => {
            let healthy = servers.iter().all(|s| s.healthy);
            let body = json!({
                "status": if healthy { "healthy" } else { "degraded" },
                "version": env!("CARGO_PKG_VERSION"),
                "servers": servers,
            });
            // Degraded backends do not make the gateway itself unavailable
            (StatusCode::OK, Json(body))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}

/// JSON-RPC endpoint of one virtual server (POST /vmcp/{server})
async fn rpc_handler(
    State(state): State<Arc<AppState>>,
    Path(server): Path<String>,
    body: Bytes,
) -> Response {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let response =
                JsonRpcResponse::error(None, rpc_codes::PARSE_ERROR, format!("Invalid JSON: {e}"));
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let (id, method, params) = match parse_request(&request) {
        Ok(parsed) => parsed,
        Err(response) => return (StatusCode::BAD_REQUEST, Json(response)).into_response(),
    };

    if is_notification_method(&method) {
        debug!(server = %server, notification = %method, "Notification");
        return StatusCode::ACCEPTED.into_response();
    }
    let Some(id) = id else {
        let response = JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, "Missing id");
        return (StatusCode::BAD_REQUEST, Json(response)).into_response();
    };

    debug!(server = %server, method = %method, id = %id, "Request");

    // Dropped with the handler when the client goes away
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let outcome = match state.servers.get(&server).await {
        Ok(facade) => {
            let work = dispatch(&facade, &method, params, cancel);
            tokio::time::timeout(state.request_timeout, work)
                .await
                .unwrap_or(Err(Error::Cancelled))
        }
        Err(e) => Err(e),
    };

    let response = match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(e) => {
            warn!(server = %server, method = %method, kind = e.kind(), error = %e, "Request failed");
            error_response(id, &e)
        }
    };
    Json(response).into_response()
}

/// Route one MCP method to the facade
async fn dispatch(
    facade: &VirtualMcp,
    method: &str,
    params: Option<Value>,
    cancel: CancellationToken,
) -> Result<Value> {
    match method {
        "initialize" => to_value(facade.initialize().await?),
        "ping" => Ok(json!({})),
        "tools/list" => to_value(facade.list_tools().await?),
        "tools/call" => {
            let params: ToolsCallParams = parse_params(params)?;
            let arguments = match params.arguments {
                Value::Null => json!({}),
                other => other,
            };
            to_value(facade.call_tool(&params.name, arguments).await?)
        }
        "resources/list" => to_value(facade.list_resources().await?),
        "resources/read" => {
            let params: ResourcesReadParams = parse_params(params)?;
            to_value(facade.read_resource(&params.uri).await?)
        }
        "prompts/list" => to_value(facade.list_prompts().await?),
        "prompts/get" => {
            let params: PromptsGetParams = parse_params(params)?;
            to_value(facade.get_prompt(&params.name, params.arguments, cancel).await?)
        }
        other => Err(Error::json_rpc(
            rpc_codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    }
}

/// Begin a backend's authorization flow
async fn begin_auth_handler(
    State(state): State<Arc<AppState>>,
    Path((server, backend)): Path<(String, String)>,
) -> Response {
    let outcome = match state.servers.get(&server).await {
        Ok(facade) => facade.begin_auth(&backend).await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(request) => Json(request).into_response(),
        Err(e) => (status_for(&e), Json(error_body(&e))).into_response(),
    }
}

/// Authorization callback (GET /callback?state=&code=)
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error.as_deref() {
        let description = params.error_description.as_deref().unwrap_or_default();
        warn!(error, "Authorization denied by provider");
        return (StatusCode::BAD_REQUEST, Html(error_page(error, description))).into_response();
    }
    let (Some(auth_state), Some(code)) = (params.state.as_deref(), params.code.as_deref()) else {
        return (
            StatusCode::BAD_REQUEST,
            Html(error_page("invalid_request", "Missing state or code")),
        )
            .into_response();
    };

    match state.servers.handle_callback(auth_state, code).await {
        Ok((_, backend)) => Html(success_page(&backend)).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Html(error_page(e.kind(), &e.to_string())),
        )
            .into_response(),
    }
}

/// Upload a custom resource (raw body, `Content-Type` header optional)
async fn upload_resource_handler(
    State(state): State<Arc<AppState>>,
    Path((server, filename)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let outcome = match state.servers.get(&server).await {
        Ok(facade) => {
            facade
                .upload_resource(&filename, content_type.as_deref(), body.to_vec())
                .await
        }
        Err(e) => Err(e),
    };
    match outcome {
        Ok(resource) => (StatusCode::CREATED, Json(resource.to_protocol())).into_response(),
        Err(e) => (status_for(&e), Json(error_body(&e))).into_response(),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::from)
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| Error::json_rpc(rpc_codes::INVALID_PARAMS, format!("Invalid params: {e}")))
}

/// JSON-RPC error carrying the error kind as `data.kind`
fn error_response(id: RequestId, error: &Error) -> JsonRpcResponse {
    let mut data = json!({ "kind": error.kind() });
    if let Error::AmbiguousReference { backends, .. } = error {
        data["backends"] = json!(backends);
    }
    if let Error::CyclicPromptReference { chain } = error {
        data["chain"] = json!(chain);
    }
    JsonRpcResponse::error_with_data(Some(id), error.to_rpc_code(), error.to_string(), data)
}

fn error_body(error: &Error) -> Value {
    json!({ "error": error.to_string(), "kind": error.kind() })
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::VirtualServerNotFound(_) | Error::BackendNotFound(_) => StatusCode::NOT_FOUND,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Extract a JSON-RPC request ID from a JSON value
fn extract_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        _ => None,
    }
}

/// Check whether a method name represents a notification (no response expected).
fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Parse JSON-RPC request or notification
/// Returns (Option<RequestId>, method, params) - id is None for notifications
#[allow(clippy::result_large_err)] // JsonRpcResponse used directly as HTTP error body
fn parse_request(
    value: &Value,
) -> std::result::Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    let jsonrpc = value.get("jsonrpc").and_then(|v| v.as_str());
    if jsonrpc != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(extract_request_id);

    let method = value
        .get("method")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method")
        })?;

    let params = value.get("params").cloned();

    if !is_notification_method(method) && id.is_none() {
        return Err(JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, "Missing id"));
    }

    Ok((id, method.to_string(), params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extract_request_id_variants() {
        assert_eq!(
            extract_request_id(&json!("abc-123")),
            Some(RequestId::String("abc-123".to_string()))
        );
        assert_eq!(extract_request_id(&json!(42)), Some(RequestId::Number(42)));
        assert_eq!(extract_request_id(&json!(-1)), Some(RequestId::Number(-1)));
        assert!(extract_request_id(&json!(null)).is_none());
        assert!(extract_request_id(&json!(3.5)).is_none());
        assert!(extract_request_id(&json!({"id": 1})).is_none());
    }

    #[test]
    fn notification_method_recognized() {
        assert!(is_notification_method("notifications/initialized"));
        assert!(!is_notification_method("prompts/get"));
        assert!(!is_notification_method(""));
    }

    #[test]
    fn parse_request_requires_version_method_and_id() {
        let (id, method, params) = parse_request(&json!({
            "jsonrpc": "2.0", "id": "req-1", "method": "prompts/list"
        }))
        .unwrap();
        assert_eq!(id, Some(RequestId::String("req-1".to_string())));
        assert_eq!(method, "prompts/list");
        assert!(params.is_none());

        let (id, _, _) = parse_request(&json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(id.is_none());

        for bad in [
            json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}),
            json!({"jsonrpc": "2.0", "id": 1}),
            json!({"jsonrpc": "2.0", "method": "ping"}),
        ] {
            let err = parse_request(&bad).unwrap_err();
            assert_eq!(err.error.unwrap().code, rpc_codes::INVALID_REQUEST);
        }
    }

    #[test]
    fn errors_carry_their_kind() {
        let response = error_response(
            RequestId::Number(7),
            &Error::AmbiguousReference {
                name: "add".into(),
                backends: vec!["a".into(), "b".into()],
            },
        );
        let error = response.error.unwrap();
        assert_eq!(error.code, rpc_codes::INVALID_PARAMS);
        assert_eq!(
            error.data,
            Some(json!({ "kind": "AmbiguousReference", "backends": ["a", "b"] }))
        );
    }

    #[test]
    fn missing_params_are_invalid() {
        let err = parse_params::<PromptsGetParams>(None).unwrap_err();
        assert!(matches!(err, Error::JsonRpc { code, .. } if code == rpc_codes::INVALID_PARAMS));

        let call: ToolsCallParams = parse_params(Some(json!({ "name": "math.add" }))).unwrap();
        assert_eq!(call.name, "math.add");
        assert_eq!(call.arguments, Value::Null);
    }
}
