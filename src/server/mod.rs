mod mcp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router, extract::State};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{ClientFactory, HttpClientFactory};
use crate::cli::ServeArgs;
use crate::config::AppConfig;
use crate::jwks::{HttpJwksProvider, JwksCache};
use crate::verify::{
    HttpExchangeStore, LocalVerifier, TokenExchangeVerifier, TokenVerifier, VerifierChain,
};

pub async fn serve(args: ServeArgs, config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let state = build_gateway_state(&config)?;
    let app = app_router(state, config.auth_enabled);

    let listener = TcpListener::bind(SocketAddr::from((args.host, args.port)))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;
    let addr = listener.local_addr().context("listener has no local addr")?;
    if let Some(path) = &args.port_file {
        std::fs::write(path, format!("{addr}\n"))
            .with_context(|| format!("failed to write port file '{}'", path.display()))?;
    }
    info!(%addr, auth_enabled = config.auth_enabled, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("gateway server failed")
}

fn build_gateway_state(config: &AppConfig) -> Result<mcp::GatewayState> {
    let clients: Arc<dyn ClientFactory> = Arc::new(HttpClientFactory::new(
        config.api_base_url_template.clone(),
        Duration::from_secs(config.api_timeout_seconds),
    )?);

    let verifier = if config.auth_enabled {
        let keys = Arc::new(JwksCache::new(Arc::new(HttpJwksProvider::new(
            config.jwks_url.clone(),
        )?)));
        let mut stages: Vec<Arc<dyn TokenVerifier>> = vec![Arc::new(LocalVerifier::new(
            keys,
            config.issuer.clone(),
            config.audience.clone(),
            config.token_leeway_seconds,
        ))];
        if let Some(exchange_url) = &config.exchange_url {
            stages.push(Arc::new(TokenExchangeVerifier::new(Arc::new(
                HttpExchangeStore::new(exchange_url.clone())?,
            ))));
        }
        Some(Arc::new(VerifierChain::new(stages)))
    } else {
        None
    };

    Ok(mcp::GatewayState { verifier, clients })
}

#[derive(Clone)]
struct HealthState {
    auth_enabled: bool,
}

/// Health endpoints bypass the gateway pipeline entirely; probes carry no
/// tenant id or token.
fn app_router(state: mcp::GatewayState, auth_enabled: bool) -> Router {
    let health = Router::new()
        .route("/health", get(readiness))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/ready", get(readiness))
        .with_state(HealthState { auth_enabled });

    health.nest("/mcp", mcp::router(state))
}

async fn liveness() -> Json<serde_json::Value> {
    Json(json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn readiness(State(health): State<HealthState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ready",
        "version": env!("CARGO_PKG_VERSION"),
        "auth_enabled": health.auth_enabled,
    }))
}
