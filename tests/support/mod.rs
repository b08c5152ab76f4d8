use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio::process::{Child, Command};

pub const SECRET: &[u8] = b"integration-signing-key";
pub const KID: &str = "itest-key";
pub const ISSUER: &str = "https://auth.itest/";
pub const AUDIENCE: &str = "https://graph.itest";

pub struct Gateway {
    pub base_url: String,
    // Held so the process is killed and the port file removed on drop.
    _child: Child,
    _temp: tempfile::TempDir,
}

/// Spawn the compiled gateway binary on a free port and wait until it has
/// written its resolved address to the port file.
pub async fn spawn_gateway(extra_env: &BTreeMap<String, String>) -> Result<Gateway> {
    let bin = env!("CARGO_BIN_EXE_graphgate");
    let temp = tempfile::tempdir()?;
    let port_file = temp.path().join("gateway.port");

    let mut command = Command::new(bin);
    command
        .arg("serve")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .arg("--port-file")
        .arg(&port_file)
        .env("GRAPHGATE_AUTH_ISSUER", ISSUER)
        .env("GRAPHGATE_AUTH_AUDIENCE", AUDIENCE)
        .kill_on_drop(true);
    for (key, value) in extra_env {
        command.env(key, value);
    }
    let child = command.spawn().context("failed to spawn gateway binary")?;

    for _ in 0..100 {
        if let Ok(contents) = std::fs::read_to_string(&port_file) {
            let addr: SocketAddr = contents.trim().parse().context("port file is not an addr")?;
            return Ok(Gateway {
                base_url: format!("http://{addr}"),
                _child: child,
                _temp: temp,
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("gateway did not write its port file within 5s")
}

pub fn mint_token(claims: Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(KID.to_string());
    encode(&header, &claims, &EncodingKey::from_secret(SECRET)).expect("token should encode")
}

pub fn valid_claims(expires_in_seconds: i64) -> Value {
    let now = jsonwebtoken::get_current_timestamp() as i64;
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "sub": "itest-user",
        "azp": "itest-client",
        "scope": "graph:read",
        "exp": now + expires_in_seconds,
    })
}

async fn serve(app: Router) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("failed to bind mock listener")?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

/// Mock trust-domain JWKS endpoint. Returns its URL and a fetch counter.
pub async fn spawn_jwks_server() -> Result<(String, Arc<AtomicUsize>)> {
    let fetches = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/.well-known/jwks.json",
            get(|State(fetches): State<Arc<AtomicUsize>>| async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                Json(json!({
                    "keys": [{
                        "kty": "oct",
                        "kid": KID,
                        "alg": "HS256",
                        "k": URL_SAFE_NO_PAD.encode(SECRET)
                    }]
                }))
            }),
        )
        .with_state(fetches.clone());
    let addr = serve(app).await?;
    Ok((format!("http://{addr}/.well-known/jwks.json"), fetches))
}

/// Mock authorization-proxy exchange endpoint knowing a single opaque handle.
pub async fn spawn_exchange_server(handle: &str, upstream_token: &str) -> Result<String> {
    let known = (handle.to_string(), upstream_token.to_string());
    let app = Router::new()
        .route(
            "/exchange",
            post(
                |State((handle, upstream)): State<(String, String)>, Json(body): Json<Value>| async move {
                    if body["token"].as_str() == Some(handle.as_str()) {
                        let now = jsonwebtoken::get_current_timestamp();
                        (
                            axum::http::StatusCode::OK,
                            Json(json!({
                                "access_token": upstream,
                                "client_id": "itest-interactive",
                                "scope": "graph:read",
                                "expires_at_epoch_seconds": now + 600
                            })),
                        )
                    } else {
                        (
                            axum::http::StatusCode::NOT_FOUND,
                            Json(json!({ "error": "unknown_token" })),
                        )
                    }
                },
            ),
        )
        .with_state(known);
    let addr = serve(app).await?;
    Ok(format!("http://{addr}/exchange"))
}

/// Mock tenant backend that echoes which tenant and credential it saw.
/// Returns a base URL template for `GRAPHGATE_API_BASE_URL_TEMPLATE`.
pub async fn spawn_backend_server() -> Result<String> {
    fn auth(headers: &HeaderMap) -> String {
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    let app = Router::new()
        .route(
            "/t/{resource_id}/models",
            get(|Path(resource_id): Path<String>, headers: HeaderMap| async move {
                Json(json!({
                    "models": [],
                    "resource_id": resource_id,
                    "auth": auth(&headers),
                }))
            }),
        )
        .route(
            "/t/{resource_id}/digitaltwins/{twin_id}",
            get(
                |Path((resource_id, twin_id)): Path<(String, String)>, headers: HeaderMap| async move {
                    Json(json!({
                        "$dtId": twin_id,
                        "resource_id": resource_id,
                        "auth": auth(&headers),
                    }))
                },
            ),
        )
        .route(
            "/t/{resource_id}/query",
            post(
                |Path(resource_id): Path<String>, Json(body): Json<Value>| async move {
                    Json(json!([{ "resource_id": resource_id, "query": body["query"] }]))
                },
            ),
        );
    let addr = serve(app).await?;
    Ok(format!("http://{addr}/t/{{resource_id}}"))
}
