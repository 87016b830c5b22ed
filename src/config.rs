//! Realtime configuration: feature flag, endpoint selection, connection secret.
//!
//! Configuration is usually loaded from the environment once at startup and
//! handed to the realtime client. Endpoint overrides follow the same
//! precedence everywhere: explicit override, then local mode, then production.

use secrecy::SecretString;
use tracing::warn;

/// Production websocket endpoint for the realtime channel service.
pub const REALTIME_ENDPOINT: &str = "wss://rt.brightbase.io/v1/channels";
/// Local development websocket endpoint for the realtime channel service.
pub const LOCAL_REALTIME_ENDPOINT: &str = "ws://localhost:8090/v1/channels";

/// Environment variable toggling realtime subscriptions ("true" enables).
pub const ENV_REALTIME_ENABLED: &str = "BRIGHTBASE_REALTIME_ENABLED";
/// Environment variable holding the realtime connection hash.
pub const ENV_REALTIME_HASH: &str = "BRIGHTBASE_REALTIME_HASH";
/// Environment variable overriding the realtime endpoint.
pub const ENV_REALTIME_ENDPOINT: &str = "BRIGHTBASE_REALTIME_ENDPOINT";

/// Settings that control whether and how the realtime client connects.
#[derive(Clone)]
pub struct RealtimeConfig {
    enabled: bool,
    connection_hash: Option<SecretString>,
    local: bool,
    endpoint_override: Option<String>,
}

impl RealtimeConfig {
    /// Creates an enabled configuration with the given connection hash.
    pub fn new(connection_hash: SecretString) -> Self {
        Self {
            enabled: true,
            connection_hash: Some(connection_hash),
            local: false,
            endpoint_override: None,
        }
    }

    /// Creates a configuration with realtime turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            connection_hash: None,
            local: false,
            endpoint_override: None,
        }
    }

    /// Loads configuration from `BRIGHTBASE_REALTIME_*` environment variables.
    ///
    /// Realtime is enabled only when the flag is the literal string "true".
    /// When the flag is set but the connection hash is absent, realtime is
    /// forced off and a warning is logged once here rather than failing later.
    pub fn from_env() -> Self {
        let enabled = std::env::var(ENV_REALTIME_ENABLED)
            .map(|value| value == "true")
            .unwrap_or(false);
        let connection_hash = std::env::var(ENV_REALTIME_HASH)
            .ok()
            .filter(|value| !value.is_empty())
            .map(SecretString::new);
        let endpoint_override = std::env::var(ENV_REALTIME_ENDPOINT)
            .ok()
            .filter(|value| !value.is_empty());

        let mut config = Self {
            enabled,
            connection_hash,
            local: false,
            endpoint_override,
        };
        if config.enabled && config.connection_hash.is_none() {
            warn!(
                event = "realtime_forced_disabled",
                reason = "connection hash is missing"
            );
            config.enabled = false;
        }
        config
    }

    /// Enables or disables realtime subscriptions.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets or replaces the connection hash.
    pub fn with_connection_hash(mut self, connection_hash: SecretString) -> Self {
        self.connection_hash = Some(connection_hash);
        self
    }

    /// Enables or disables local mode endpoint routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit realtime endpoint override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    /// Whether realtime subscriptions are switched on.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The connection hash identifying this deployment, if configured.
    pub fn connection_hash(&self) -> Option<&SecretString> {
        self.connection_hash.as_ref()
    }

    /// True when realtime can actually run: enabled and a hash is present.
    pub fn is_available(&self) -> bool {
        self.enabled && self.connection_hash.is_some()
    }

    /// Resolves the websocket endpoint to connect to.
    pub fn endpoint(&self) -> &str {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_REALTIME_ENDPOINT
        } else {
            REALTIME_ENDPOINT
        }
    }
}
