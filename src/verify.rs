use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::jwks::{JwksCache, JwksError};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a successful token verification. Built exactly once by the
/// stage that verified the token and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Verification {
    /// Principal identifier: `azp` when present, else `sub`.
    pub client_id: String,
    pub scopes: Vec<String>,
    pub expires_at_epoch_seconds: Option<u64>,
    /// The upstream access token to present to the tenant backend. For the
    /// local stage this is the presented token itself; for the exchange
    /// stage it is the resolved upstream credential.
    pub access_token: String,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("token is malformed")]
    MalformedToken,
    #[error("no signing key matches the token kid")]
    NoMatchingKey,
    #[error("signing key set unavailable: {0}")]
    KeySetUnavailable(String),
    #[error("signature validation failed")]
    SignatureInvalid,
    #[error("issuer or audience mismatch")]
    ClaimMismatch,
    #[error("token expired")]
    TokenExpired,
    #[error("exchange lookup failed")]
    ExchangeLookupFailed,
}

/// One stage of the verification chain.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn verify(&self, token: &str) -> Result<Verification, VerifyError>;
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Option<String>,
    azp: Option<String>,
    scope: Option<String>,
    exp: Option<u64>,
}

/// Validates raw trust-domain JWTs against the cached signing key set.
pub struct LocalVerifier {
    keys: Arc<JwksCache>,
    issuer: String,
    audience: String,
    leeway_seconds: u64,
}

impl LocalVerifier {
    pub fn new(keys: Arc<JwksCache>, issuer: String, audience: String, leeway_seconds: u64) -> Self {
        Self {
            keys,
            issuer,
            audience,
            leeway_seconds,
        }
    }
}

#[async_trait]
impl TokenVerifier for LocalVerifier {
    fn name(&self) -> &'static str {
        "local-jwt"
    }

    async fn verify(&self, token: &str) -> Result<Verification, VerifyError> {
        // The header is attacker-controlled; nothing in it is trusted until
        // the signature checks out against a published key.
        let header = decode_header(token).map_err(|err| {
            debug!(error = %err, "token header did not parse as a JWT");
            VerifyError::MalformedToken
        })?;
        let kid = header.kid.as_deref().ok_or(VerifyError::MalformedToken)?;

        let jwk = self.keys.get(kid).await.map_err(|err| match err {
            JwksError::KeyNotFound { .. } => VerifyError::NoMatchingKey,
            JwksError::FetchFailed(reason) => {
                warn!(%reason, "signing key set fetch failed during verification");
                VerifyError::KeySetUnavailable(reason)
            }
        })?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|err| {
            warn!(kid, error = %err, "published JWK could not be converted to a decoding key");
            VerifyError::NoMatchingKey
        })?;
        let algorithm = jwk
            .common
            .key_algorithm
            .and_then(|alg| alg.to_string().parse::<Algorithm>().ok())
            .unwrap_or(header.alg);

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.leeway = self.leeway_seconds;

        let data = decode::<RawClaims>(token, &key, &validation).map_err(map_jwt_error)?;
        let claims = data.claims;

        let client_id = claims.azp.or(claims.sub).unwrap_or_default();
        let scopes = split_scopes(claims.scope.as_deref());

        Ok(Verification {
            client_id,
            scopes,
            expires_at_epoch_seconds: claims.exp,
            access_token: token.to_string(),
        })
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> VerifyError {
    match err.kind() {
        ErrorKind::ExpiredSignature => VerifyError::TokenExpired,
        ErrorKind::InvalidSignature => VerifyError::SignatureInvalid,
        ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => VerifyError::ClaimMismatch,
        _ => {
            debug!(error = %err, "token rejected by claim validation");
            VerifyError::MalformedToken
        }
    }
}

fn split_scopes(scope: Option<&str>) -> Vec<String> {
    scope
        .map(|value| value.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Upstream credential resolved from an opaque proxy token.
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    pub access_token: String,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at_epoch_seconds: Option<u64>,
}

/// Read-only view of the authorization proxy's token mappings.
#[async_trait]
pub trait ExchangeStore: Send + Sync {
    /// `Ok(None)` means the handle is unknown to the store; `Err` means the
    /// store itself could not be consulted.
    async fn resolve(&self, opaque_token: &str) -> Result<Option<ExchangeRecord>>;
}

pub struct HttpExchangeStore {
    url: String,
    http: reqwest::Client,
}

impl HttpExchangeStore {
    pub fn new(url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .context("failed to build exchange HTTP client")?;
        Ok(Self { url, http })
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: String,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    expires_at_epoch_seconds: Option<u64>,
}

#[async_trait]
impl ExchangeStore for HttpExchangeStore {
    async fn resolve(&self, opaque_token: &str) -> Result<Option<ExchangeRecord>> {
        let response = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({ "token": opaque_token }))
            .send()
            .await
            .with_context(|| format!("exchange request failed for '{}'", self.url))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let parsed = response
            .error_for_status()
            .with_context(|| format!("exchange endpoint returned error for '{}'", self.url))?
            .json::<ExchangeResponse>()
            .await
            .context("exchange response JSON is invalid")?;

        Ok(Some(ExchangeRecord {
            access_token: parsed.access_token,
            client_id: parsed.client_id,
            scopes: split_scopes(parsed.scope.as_deref()),
            expires_at_epoch_seconds: parsed.expires_at_epoch_seconds,
        }))
    }
}

/// Resolves opaque proxy tokens via the exchange store. Trust is delegated
/// entirely to the store; no cryptographic validation happens here.
pub struct TokenExchangeVerifier {
    store: Arc<dyn ExchangeStore>,
}

impl TokenExchangeVerifier {
    pub fn new(store: Arc<dyn ExchangeStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TokenVerifier for TokenExchangeVerifier {
    fn name(&self) -> &'static str {
        "token-exchange"
    }

    async fn verify(&self, token: &str) -> Result<Verification, VerifyError> {
        let record = self.store.resolve(token).await.map_err(|err| {
            warn!(error = %err, "exchange store could not be consulted");
            VerifyError::ExchangeLookupFailed
        })?;
        let Some(record) = record else {
            debug!("presented token has no exchange record");
            return Err(VerifyError::ExchangeLookupFailed);
        };

        if let Some(expires_at) = record.expires_at_epoch_seconds
            && expires_at <= now_epoch_seconds()
        {
            debug!("exchange record for presented token has expired");
            return Err(VerifyError::ExchangeLookupFailed);
        }

        Ok(Verification {
            client_id: record.client_id.unwrap_or_default(),
            scopes: record.scopes,
            expires_at_epoch_seconds: record.expires_at_epoch_seconds,
            access_token: record.access_token,
        })
    }
}

/// Ordered fallback chain over the verification stages.
///
/// The local stage runs first: client-credential callers present raw
/// trust-domain JWTs that it resolves without any external call, while
/// opaque proxy tokens always fail local signature validation and fall
/// through to the exchange stage. Stage failures are logged, never
/// surfaced; callers only learn that authentication failed.
pub struct VerifierChain {
    stages: Vec<Arc<dyn TokenVerifier>>,
}

impl VerifierChain {
    pub fn new(stages: Vec<Arc<dyn TokenVerifier>>) -> Self {
        Self { stages }
    }

    pub async fn verify(&self, token: &str) -> Option<Verification> {
        for stage in &self.stages {
            match stage.verify(token).await {
                Ok(verification) => {
                    info!(
                        stage = stage.name(),
                        client_id = %verification.client_id,
                        scopes = verification.scopes.len(),
                        "token verified"
                    );
                    return Some(verification);
                }
                Err(err) => {
                    debug!(stage = stage.name(), error = %err, "verification stage failed");
                }
            }
        }
        warn!("token failed every verification stage");
        None
    }
}

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
