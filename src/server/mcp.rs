use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router, extract::Request, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::backend::ClientFactory;
use crate::context::{ContextGuard, CurrentContext, RequestContext};
use crate::routing;
use crate::verify::VerifierChain;

#[derive(Clone)]
pub struct GatewayState {
    /// `None` when authentication is disabled; the pipeline then binds an
    /// empty upstream token.
    pub verifier: Option<Arc<VerifierChain>>,
    pub clients: Arc<dyn ClientFactory>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", post(dispatch_tool))
        .layer(middleware::from_fn_with_state(state, gateway_pipeline))
}

/// The per-request gateway pipeline: resolve tenant, authenticate, bind a
/// tenant-scoped backend client, dispatch, release.
///
/// Gates run strictly in order. Tenant resolution fails fast before any
/// token verification work, and the bound client is released on every exit
/// path out of the dispatch, including disconnects (see [`ContextGuard`]).
async fn gateway_pipeline(
    State(state): State<GatewayState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(resource_id) = routing::resolve_resource_id(req.uri(), req.headers()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing_resource_id",
            "resource_id is required; provide it via query param (?resource_id=...) or header (X-Resource-Id: ...)",
        );
    };

    let access_token = match &state.verifier {
        Some(chain) => {
            let Some(token) = bearer_token(req.headers()) else {
                debug!("request carries no bearer token");
                return authentication_required();
            };
            match chain.verify(token).await {
                Some(verification) => verification.access_token,
                None => return authentication_required(),
            }
        }
        None => String::new(),
    };

    let client = state.clients.create(&resource_id, &access_token);
    let context = Arc::new(RequestContext {
        resource_id,
        access_token,
        client,
    });
    let guard = ContextGuard::new(context.clone());
    req.extensions_mut().insert(context);

    let response = next.run(req).await;
    guard.release().await;
    response
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

fn authentication_required() -> Response {
    error_response(
        StatusCode::UNAUTHORIZED,
        "authentication_required",
        "valid authentication token required",
    )
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(json!({ "error": error, "message": message }))).into_response()
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    tool: String,
    #[serde(default)]
    arguments: Value,
}

/// Dispatch a tool call against the request's bound backend client.
async fn dispatch_tool(
    CurrentContext(context): CurrentContext,
    Json(call): Json<ToolCall>,
) -> Response {
    let result = match call.tool.as_str() {
        "list_models" => context.client.list_models().await,
        "get_digital_twin" => {
            let Some(twin_id) = call.arguments.get("twin_id").and_then(Value::as_str) else {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_arguments",
                    "get_digital_twin requires a 'twin_id' string argument",
                );
            };
            context.client.get_twin(twin_id).await
        }
        "query_digital_twins" => {
            let Some(query) = call.arguments.get("query").and_then(Value::as_str) else {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_arguments",
                    "query_digital_twins requires a 'query' string argument",
                );
            };
            context.client.query_twins(query).await
        }
        other => {
            return error_response(
                StatusCode::NOT_FOUND,
                "unknown_tool",
                &format!("no tool named '{other}'"),
            );
        }
    };

    match result {
        Ok(value) => Json(json!({ "result": value })).into_response(),
        Err(err) => {
            warn!(tool = %call.tool, error = %err, "backend request failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                "backend_error",
                "backend request failed",
            )
        }
    }
}
