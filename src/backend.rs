use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::RESOURCE_ID_PLACEHOLDER;

/// Handle to a tenant-bound backend instance. One handle is created per
/// request and closed exactly once when the request finishes.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    fn endpoint(&self) -> &str;
    async fn list_models(&self) -> Result<Value>;
    async fn get_twin(&self, twin_id: &str) -> Result<Value>;
    async fn query_twins(&self, query: &str) -> Result<Value>;
    async fn close(&self) -> Result<()>;
}

/// Builds a backend handle bound to (tenant endpoint, upstream token).
/// Construction is infallible given valid inputs; no network call happens
/// until the handle is used.
pub trait ClientFactory: Send + Sync {
    fn create(&self, resource_id: &str, access_token: &str) -> Arc<dyn GraphBackend>;
}

pub struct HttpClientFactory {
    base_url_template: String,
    http: reqwest::Client,
}

impl HttpClientFactory {
    pub fn new(base_url_template: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build backend HTTP client")?;
        Ok(Self {
            base_url_template,
            http,
        })
    }
}

impl ClientFactory for HttpClientFactory {
    fn create(&self, resource_id: &str, access_token: &str) -> Arc<dyn GraphBackend> {
        let endpoint = self
            .base_url_template
            .replace(RESOURCE_ID_PLACEHOLDER, resource_id);
        Arc::new(GraphClient {
            endpoint,
            access_token: access_token.to_string(),
            http: self.http.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

pub struct GraphClient {
    endpoint: String,
    access_token: String,
    http: reqwest::Client,
    closed: AtomicBool,
}

impl GraphClient {
    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.access_token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.access_token)
        }
    }

    async fn json_response(builder: reqwest::RequestBuilder) -> Result<Value> {
        builder
            .send()
            .await
            .context("backend request failed")?
            .error_for_status()
            .context("backend returned error status")?
            .json::<Value>()
            .await
            .context("backend response is not valid JSON")
    }
}

#[async_trait]
impl GraphBackend for GraphClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_models(&self) -> Result<Value> {
        let url = format!("{}/models", self.endpoint);
        Self::json_response(self.request(self.http.get(url))).await
    }

    async fn get_twin(&self, twin_id: &str) -> Result<Value> {
        let url = format!("{}/digitaltwins/{twin_id}", self.endpoint);
        Self::json_response(self.request(self.http.get(url))).await
    }

    async fn query_twins(&self, query: &str) -> Result<Value> {
        let url = format!("{}/query", self.endpoint);
        let body = serde_json::json!({ "query": query });
        Self::json_response(self.request(self.http.post(url).json(&body))).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint, "backend client already closed");
            return Ok(());
        }
        // reqwest pools connections internally; closing the handle drops the
        // per-request binding so the token cannot outlive the request.
        debug!(endpoint = %self.endpoint, "backend client closed");
        Ok(())
    }
}
