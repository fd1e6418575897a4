//! Configuration types for the bridge client
//!
//! This module provides the client configuration, the reconnection policy
//! and the server endpoint the channel is opened against.

use std::time::Duration;

use url::Url;

use crate::credentials::Identity;
use crate::error::{BridgeError, BridgeResult};

/// Default path prefix of the bridge channel endpoint
pub const DEFAULT_PATH_PREFIX: &str = "/ws";

/// Where the bridge server listens
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerEndpoint {
    /// Use `wss` instead of `ws`
    pub secure: bool,

    /// Server host name or address
    pub host: String,

    /// Explicit port; the scheme default is used when `None`
    pub port: Option<u16>,

    /// Path the application and user segments are appended to
    pub path_prefix: String,
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self {
            secure: false,
            host: "localhost".to_string(),
            port: None,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
        }
    }
}

impl ServerEndpoint {
    /// Create a plain-text endpoint for `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Derive the endpoint from a page origin such as `https://example.com:8443`.
    ///
    /// `https`/`wss` origins produce a secure endpoint, `http`/`ws` a plain one.
    /// The port is kept only when the origin names one explicitly.
    pub fn from_origin(origin: &str) -> BridgeResult<Self> {
        let parsed = Url::parse(origin)
            .map_err(|e| BridgeError::Configuration(format!("invalid origin '{origin}': {e}")))?;

        let secure = match parsed.scheme() {
            "https" | "wss" => true,
            "http" | "ws" => false,
            other => {
                return Err(BridgeError::Configuration(format!(
                    "unsupported origin scheme '{other}'"
                )));
            }
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| BridgeError::Configuration(format!("origin '{origin}' has no host")))?;

        Ok(Self {
            secure,
            host: host.to_string(),
            port: parsed.port(),
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
        })
    }

    /// Use `wss`
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set an explicit port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the path prefix
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    /// Channel URL for `identity` within `app_id`.
    ///
    /// Shape: `{ws|wss}://host[:port]{prefix}/{appId}/{userId}?secret=..` for a
    /// user key, `?token=..` for an ephemeral token.
    pub fn url_for(&self, app_id: &str, identity: &Identity) -> BridgeResult<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}", self.host)).map_err(|e| {
            BridgeError::Configuration(format!("invalid server host '{}': {e}", self.host))
        })?;
        url.set_port(self.port)
            .map_err(|()| BridgeError::Configuration("server URL cannot carry a port".into()))?;

        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| BridgeError::Configuration("server URL cannot carry a path".into()))?;
            segments.pop_if_empty();
            segments.extend(self.path_prefix.split('/').filter(|s| !s.is_empty()));
            segments.push(app_id);
            segments.push(&identity.user_id);
        }

        let (name, value) = identity.secret.query_pair();
        url.query_pairs_mut().append_pair(name, value);
        Ok(url)
    }
}

/// Reconnection configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    pub enabled: bool,

    /// Delay before the first retry; doubled on each further attempt
    pub base_interval: Duration,

    /// Ceiling on any single retry delay
    pub max_delay: Duration,

    /// Number of retries before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_interval: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Create new reconnection configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable reconnection
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Short delays, many attempts
    pub fn aggressive() -> Self {
        Self {
            enabled: true,
            base_interval: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 20,
        }
    }

    /// Long delays, few attempts
    pub fn conservative() -> Self {
        Self {
            enabled: true,
            base_interval: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }

    /// Set whether reconnection is enabled
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the base interval
    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    /// Set the delay ceiling
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the attempt cap
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before retry number `attempt` (zero based):
    /// `min(base_interval * 2^attempt, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_interval
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Whether another retry may be scheduled after `attempt` retries
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && attempt < self.max_attempts
    }
}

/// Bridge client configuration
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Application identifier
    pub app_id: String,

    /// Bridge server endpoint
    pub endpoint: ServerEndpoint,

    /// Bound on a single channel open attempt
    pub connect_timeout: Duration,

    /// Bound on the close handshake during `disconnect()`
    pub close_timeout: Duration,

    /// Reconnection policy
    pub reconnect: ReconnectConfig,

    /// Reset credentials and reconnect once when the server rejects the identity
    pub auto_reset_on_auth_failure: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            endpoint: ServerEndpoint::default(),
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
            auto_reset_on_auth_failure: false,
        }
    }
}

impl BridgeConfig {
    /// Create a configuration for `app_id` against `endpoint`
    pub fn new(app_id: impl Into<String>, endpoint: ServerEndpoint) -> Self {
        Self {
            app_id: app_id.into(),
            endpoint,
            ..Self::default()
        }
    }

    /// Load configuration from `BRIDGE_*` environment variables
    pub fn from_env() -> BridgeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> BridgeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let app_id = lookup("BRIDGE_APP_ID")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BridgeError::Configuration("BRIDGE_APP_ID is not set".into()))?;

        let mut endpoint = match lookup("BRIDGE_SERVER_ORIGIN") {
            Some(origin) => ServerEndpoint::from_origin(&origin)?,
            None => ServerEndpoint::default(),
        };
        if let Some(prefix) = lookup("BRIDGE_PATH_PREFIX") {
            endpoint.path_prefix = prefix;
        }

        let mut config = Self::new(app_id, endpoint);
        if let Some(ms) = parse_var::<u64, _>(&lookup, "BRIDGE_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "BRIDGE_RECONNECT_BASE_MS")? {
            config.reconnect.base_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, "BRIDGE_RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the application identifier
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Set the server endpoint
    pub fn with_endpoint(mut self, endpoint: ServerEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the close timeout
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set reconnection configuration
    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Reset credentials automatically on authentication rejection
    pub fn with_auto_reset_on_auth_failure(mut self, enabled: bool) -> Self {
        self.auto_reset_on_auth_failure = enabled;
        self
    }

    /// Check the configuration for values the client cannot work with
    pub fn validate(&self) -> BridgeResult<()> {
        if self.app_id.is_empty() {
            return Err(BridgeError::Configuration("app_id must not be empty".into()));
        }
        if self.endpoint.host.is_empty() {
            return Err(BridgeError::Configuration("server host must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(BridgeError::Configuration(
                "connect_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> BridgeResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| BridgeError::Configuration(format!("invalid {key} '{raw}': {e}")))
        })
        .transpose()
}
