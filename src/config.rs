use anyhow::{Result, bail};

pub const RESOURCE_ID_PLACEHOLDER: &str = "{resource_id}";

const DEFAULT_TOKEN_LEEWAY_SECONDS: u64 = 60;
const DEFAULT_API_TIMEOUT_SECONDS: u64 = 30;

/// Gateway configuration resolved from `GRAPHGATE_*` environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub auth_enabled: bool,
    /// Trust domain hosting the signing keys, e.g. `auth.example.com`.
    pub auth_domain: String,
    pub audience: String,
    pub issuer: String,
    pub jwks_url: String,
    /// Exchange endpoint of the local authorization proxy. Opaque proxy
    /// tokens are only accepted when this is configured.
    pub exchange_url: Option<String>,
    pub token_leeway_seconds: u64,
    /// Tenant endpoint template containing a `{resource_id}` placeholder.
    pub api_base_url_template: String,
    pub api_timeout_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|value| value.trim().to_string());

        let auth_enabled = match get("GRAPHGATE_AUTH_ENABLED").as_deref() {
            None | Some("") => true,
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(other) => bail!("GRAPHGATE_AUTH_ENABLED must be true or false, got '{other}'"),
        };

        let auth_domain = get("GRAPHGATE_AUTH_DOMAIN").unwrap_or_default();
        let audience = get("GRAPHGATE_AUTH_AUDIENCE").unwrap_or_default();

        let issuer = match get("GRAPHGATE_AUTH_ISSUER") {
            Some(value) if !value.is_empty() => value,
            _ => format!("https://{auth_domain}/"),
        };
        let jwks_url = match get("GRAPHGATE_JWKS_URL") {
            Some(value) if !value.is_empty() => value,
            _ => format!("https://{auth_domain}/.well-known/jwks.json"),
        };

        if auth_enabled {
            if auth_domain.is_empty() && get("GRAPHGATE_JWKS_URL").is_none() {
                bail!("GRAPHGATE_AUTH_DOMAIN (or GRAPHGATE_JWKS_URL) is required when auth is enabled");
            }
            if audience.is_empty() {
                bail!("GRAPHGATE_AUTH_AUDIENCE is required when auth is enabled");
            }
        }

        let exchange_url = get("GRAPHGATE_EXCHANGE_URL").filter(|value| !value.is_empty());

        let token_leeway_seconds = parse_seconds(
            get("GRAPHGATE_TOKEN_LEEWAY_SECONDS"),
            "GRAPHGATE_TOKEN_LEEWAY_SECONDS",
            DEFAULT_TOKEN_LEEWAY_SECONDS,
        )?;
        let api_timeout_seconds = parse_seconds(
            get("GRAPHGATE_API_TIMEOUT_SECONDS"),
            "GRAPHGATE_API_TIMEOUT_SECONDS",
            DEFAULT_API_TIMEOUT_SECONDS,
        )?;

        let Some(api_base_url_template) =
            get("GRAPHGATE_API_BASE_URL_TEMPLATE").filter(|value| !value.is_empty())
        else {
            bail!("GRAPHGATE_API_BASE_URL_TEMPLATE is required");
        };
        if !api_base_url_template.contains(RESOURCE_ID_PLACEHOLDER) {
            bail!(
                "GRAPHGATE_API_BASE_URL_TEMPLATE must contain the {RESOURCE_ID_PLACEHOLDER} placeholder"
            );
        }

        Ok(Self {
            auth_enabled,
            auth_domain,
            audience,
            issuer,
            jwks_url,
            exchange_url,
            token_leeway_seconds,
            api_base_url_template,
            api_timeout_seconds,
        })
    }
}

fn parse_seconds(raw: Option<String>, key: &str, default: u64) -> Result<u64> {
    match raw {
        None => Ok(default),
        Some(value) if value.is_empty() => Ok(default),
        Some(value) => match value.parse::<u64>() {
            Ok(parsed) => Ok(parsed),
            Err(_) => bail!("{key} must be a non-negative integer, got '{value}'"),
        },
    }
}
