use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("API root must start with '/'")]
    InvalidApiRoot,

    #[error("Environment whitelist cannot be empty")]
    EmptyEnvWhitelist,

    #[error("Request timeout cannot be 0")]
    InvalidRequestTimeout,

    #[error("max_concurrent_dispatches must be greater than 0")]
    InvalidConcurrency,

    #[error("Token {0} cannot be empty")]
    EmptyTokenField(&'static str),

    #[error("Token ttl cannot be 0")]
    InvalidTokenTtl,

    #[error("Identity header names cannot be empty")]
    EmptyIdentityHeader,
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Request headers set by the authenticating front proxy.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    pub user_header: String,
    /// May be repeated, one group per header value.
    pub group_header: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig {
            user_header: "X-Remote-User".into(),
            group_header: "X-Remote-Group".into(),
        }
    }
}

fn default_secret_env() -> String {
    "AGGREGATOR_TOKEN_SECRET".into()
}

fn default_ttl_secs() -> u64 {
    60
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TokenConfig {
    /// Audience every minted token is scoped to.
    pub audience: String,
    pub issuer: String,
    /// Written to the `kid` header so clusters can pick the verification key.
    pub key_id: String,
    /// Name of the environment variable holding the signing secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl TokenConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("audience", &self.audience),
            ("issuer", &self.issuer),
            ("key_id", &self.key_id),
            ("secret_env", &self.secret_env),
        ] {
            if value.is_empty() {
                return Err(ValidationError::EmptyTokenField(field));
            }
        }
        if self.ttl_secs == 0 {
            return Err(ValidationError::InvalidTokenTtl);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Lets clusters advertise plain `http://` endpoints. Tokens are sent in the
    /// clear to such clusters, so this is off unless set explicitly.
    pub allow_insecure_http: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportCacheConfig {
    pub enabled: bool,
    pub max_capacity: u64,
    /// Clients unused for this long are evicted.
    pub idle_timeout_secs: u64,
}

impl Default for TransportCacheConfig {
    fn default() -> Self {
        TransportCacheConfig {
            enabled: true,
            max_capacity: 1000,
            idle_timeout_secs: 300,
        }
    }
}

fn default_api_root() -> String {
    format!("/apis/{}/{}", crate::types::GROUP_NAME, crate::types::API_VERSION)
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_dispatches() -> usize {
    32
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for aggregation requests
    pub listener: Listener,
    /// Admin listener for health and readiness
    pub admin_listener: Listener,
    #[serde(default = "default_api_root")]
    pub api_root: String,
    /// Environments clusters may be selected from, whatever the caller asks for.
    pub env_whitelist: Vec<String>,
    /// OpenAPI document served under `{api_root}/openapi`.
    #[serde(default)]
    pub api_spec_file: Option<PathBuf>,
    /// Deadline for a whole inbound request, fan-out included.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Upper bound on in-flight cluster calls per inbound request.
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,
    #[serde(default)]
    pub identity: IdentityConfig,
    pub token: TokenConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub transport_cache: TransportCacheConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if !self.api_root.starts_with('/') {
            return Err(ValidationError::InvalidApiRoot);
        }
        if self.env_whitelist.iter().all(|env| env.is_empty()) {
            return Err(ValidationError::EmptyEnvWhitelist);
        }
        if self.request_timeout_secs == 0 {
            return Err(ValidationError::InvalidRequestTimeout);
        }
        if self.max_concurrent_dispatches == 0 {
            return Err(ValidationError::InvalidConcurrency);
        }
        if self.identity.user_header.is_empty() || self.identity.group_header.is_empty() {
            return Err(ValidationError::EmptyIdentityHeader);
        }
        self.token.validate()
    }

    /// API root without a trailing slash.
    pub fn normalized_api_root(&self) -> &str {
        let trimmed = self.api_root.trim_end_matches('/');
        if trimmed.is_empty() { "/" } else { trimmed }
    }
}
