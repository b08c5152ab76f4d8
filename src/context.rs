use std::sync::Arc;

use axum::Json;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::warn;

use crate::backend::GraphBackend;

/// Per-request state bound after routing and authentication succeed.
///
/// Exactly one context exists per in-flight request. It travels through the
/// request's extensions (request-local storage, never a process global) and
/// is released unconditionally when the request finishes.
pub struct RequestContext {
    pub resource_id: String,
    /// Upstream access token; empty when authentication is disabled.
    pub access_token: String,
    pub client: Arc<dyn GraphBackend>,
}

/// Scoped-release guard for a request's backend client.
///
/// The gateway pipeline releases the guard explicitly once the downstream
/// handler has produced a response. If the request future is dropped before
/// that point (caller disconnect, cancellation), `Drop` spawns the close so
/// the client is still released exactly once.
pub struct ContextGuard {
    context: Option<Arc<RequestContext>>,
}

impl ContextGuard {
    pub fn new(context: Arc<RequestContext>) -> Self {
        Self {
            context: Some(context),
        }
    }

    pub async fn release(mut self) {
        if let Some(context) = self.context.take() {
            close_client(&context).await;
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(context) = self.context.take()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(async move {
                close_client(&context).await;
            });
        }
    }
}

async fn close_client(context: &RequestContext) {
    // Release failures are logged, never surfaced: the response has already
    // been determined by the time cleanup runs.
    if let Err(err) = context.client.close().await {
        warn!(
            resource_id = %context.resource_id,
            error = %err,
            "failed to close backend client"
        );
    }
}

/// Extractor giving tool handlers the active request context.
///
/// Valid only while a request is inside the gateway pipeline's dispatch
/// window; resolving it anywhere else is a programming error.
pub struct CurrentContext(pub Arc<RequestContext>);

impl<S> FromRequestParts<S> for CurrentContext
where
    S: Send + Sync,
{
    type Rejection = NoActiveContext;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Arc<RequestContext>>()
            .cloned()
            .map(CurrentContext)
            .ok_or(NoActiveContext)
    }
}

#[derive(Debug)]
pub struct NoActiveContext;

impl IntoResponse for NoActiveContext {
    fn into_response(self) -> Response {
        warn!("handler resolved a request context outside the gateway pipeline");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "no_active_context",
                "message": "no active request context; handler invoked outside the gateway pipeline"
            })),
        )
            .into_response()
    }
}
