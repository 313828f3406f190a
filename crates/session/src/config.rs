use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{Result, SessionError};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_API_PREFIX: &str = "/api/v1";
pub const DEFAULT_USER_AGENT: &str = concat!("barter-session/", env!("CARGO_PKG_VERSION"));

/// Connection settings for the one-shot request surface.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Scheme + host of the API server.
    pub api_base_url: String,

    /// Path prefix shared by every API route (`/api/v1`).
    pub api_prefix: String,

    /// Overall timeout for a single request.
    pub request_timeout: Duration,

    /// Time allowed to establish the TCP/TLS connection.
    pub connect_timeout: Duration,

    pub user_agent: String,

    /// Location of the credential file. `None` keeps credentials in memory only.
    pub storage_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_owned(),
            api_prefix: DEFAULT_API_PREFIX.to_owned(),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            storage_path: None,
        }
    }
}

impl SessionConfig {
    /// Build a config from `BARTER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(base_url) = lookup("BARTER_API_BASE_URL") {
            config.api_base_url = base_url;
        }
        if let Some(prefix) = lookup("BARTER_API_PREFIX") {
            config.api_prefix = prefix;
        }
        if let Some(timeout) = lookup("BARTER_REQUEST_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                SessionError::configuration(format!(
                    "BARTER_REQUEST_TIMEOUT_MS must be an integer, got `{timeout}`"
                ))
            })?;
            config.request_timeout = Duration::from_millis(millis);
        }
        if let Some(path) = lookup("BARTER_STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }

        config.base_url()?;
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api_base_url = base_url.into();
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.api_base_url).map_err(|e| {
            SessionError::configuration(format!("invalid API base URL `{}`: {e}", self.api_base_url))
        })
    }

    /// Full path of a route under the API prefix.
    pub fn endpoint(&self, route: &str) -> String {
        format!(
            "{}/{}",
            self.api_prefix.trim_end_matches('/'),
            route.trim_start_matches('/')
        )
    }

    /// Path of the credential renewal endpoint.
    pub fn refresh_path(&self) -> String {
        self.endpoint("auth/refresh")
    }
}
