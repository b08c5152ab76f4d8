use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum JwksError {
    /// The key set was fetched but holds no key with the requested id.
    #[error("no signing key with kid '{kid}'")]
    KeyNotFound { kid: String },
    /// The key set could not be fetched from the trust domain.
    #[error("failed to fetch signing keys: {0}")]
    FetchFailed(String),
}

/// Source of the trust domain's published key set.
#[async_trait]
pub trait JwksProvider: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet>;
}

pub struct HttpJwksProvider {
    url: String,
    http: reqwest::Client,
}

impl HttpJwksProvider {
    pub fn new(url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .context("failed to build JWKS HTTP client")?;
        Ok(Self { url, http })
    }
}

#[async_trait]
impl JwksProvider for HttpJwksProvider {
    async fn fetch(&self) -> Result<JwkSet> {
        self.http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("JWKS request failed for '{}'", self.url))?
            .error_for_status()
            .with_context(|| format!("JWKS endpoint returned error for '{}'", self.url))?
            .json::<JwkSet>()
            .await
            .with_context(|| format!("JWKS response is not a valid key set for '{}'", self.url))
    }
}

struct CachedKeys {
    set: JwkSet,
    generation: u64,
}

/// Process-wide cache of the trust domain's signing keys.
///
/// The key set is fetched lazily on first use and kept for the process
/// lifetime. A lookup for an unknown kid triggers at most one re-fetch
/// (keys rotate); concurrent misses collapse into a single in-flight
/// fetch while populated reads stay on the shared read lock.
pub struct JwksCache {
    provider: Arc<dyn JwksProvider>,
    keys: RwLock<Option<CachedKeys>>,
    fetch_lock: Mutex<()>,
}

impl JwksCache {
    pub fn new(provider: Arc<dyn JwksProvider>) -> Self {
        Self {
            provider,
            keys: RwLock::new(None),
            fetch_lock: Mutex::new(()),
        }
    }

    pub async fn get(&self, kid: &str) -> Result<Jwk, JwksError> {
        let seen_generation = {
            let guard = self.keys.read().await;
            match guard.as_ref() {
                Some(cached) => {
                    if let Some(jwk) = cached.set.find(kid) {
                        return Ok(jwk.clone());
                    }
                    Some(cached.generation)
                }
                None => None,
            }
        };

        let _flight = self.fetch_lock.lock().await;

        // Another caller may have refreshed the set while we waited for the
        // flight lock; their fetch counts as this miss's one re-fetch.
        {
            let guard = self.keys.read().await;
            if let Some(cached) = guard.as_ref()
                && Some(cached.generation) != seen_generation
            {
                return match cached.set.find(kid) {
                    Some(jwk) => Ok(jwk.clone()),
                    None => Err(JwksError::KeyNotFound {
                        kid: kid.to_string(),
                    }),
                };
            }
        }

        if seen_generation.is_some() {
            debug!(kid, "kid missing from cached key set, re-fetching once");
        }
        let set = self
            .provider
            .fetch()
            .await
            .map_err(|err| JwksError::FetchFailed(format!("{err:#}")))?;
        info!(keys = set.keys.len(), "signing key set fetched");

        let mut guard = self.keys.write().await;
        let generation = seen_generation.unwrap_or(0) + 1;
        let found = set.find(kid).cloned();
        *guard = Some(CachedKeys { set, generation });
        drop(guard);

        found.ok_or_else(|| JwksError::KeyNotFound {
            kid: kid.to_string(),
        })
    }
}
