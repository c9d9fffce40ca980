//! Bus configuration loaded from the environment.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use erpbus_core::{CoreError, ServiceName};
use erpbus_events::{BusOptions, DEFAULT_NAMESPACE};

use crate::backoff::{
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_DELAY, DEFAULT_RECONNECT_MAX_DELAY,
    ReconnectPolicy,
};

pub const SERVICE_NAME_ENV: &str = "SERVICE_NAME";
pub const REDIS_URL_ENV: &str = "REDIS_URL";
pub const NAMESPACE_ENV: &str = "EVENT_BUS_NAMESPACE";
pub const MAX_RECONNECT_ATTEMPTS_ENV: &str = "EVENT_BUS_MAX_RECONNECT_ATTEMPTS";
pub const RECONNECT_BASE_MS_ENV: &str = "EVENT_BUS_RECONNECT_BASE_MS";
pub const RECONNECT_MAX_MS_ENV: &str = "EVENT_BUS_RECONNECT_MAX_MS";
pub const HANDLER_TIMEOUT_MS_ENV: &str = "EVENT_BUS_HANDLER_TIMEOUT_MS";
pub const MIDDLEWARE_TIMEOUT_MS_ENV: &str = "EVENT_BUS_MIDDLEWARE_TIMEOUT_MS";
pub const FORWARD_TIMEOUT_MS_ENV: &str = "EVENT_BUS_FORWARD_TIMEOUT_MS";

pub const DEFAULT_SERVICE_NAME: &str = "erp-service";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be an unsigned integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("invalid service name: {0}")]
    ServiceName(#[from] CoreError),

    #[error("invalid redis url {0:?}: expected redis:// or rediss://")]
    InvalidRedisUrl(String),

    #[error("invalid namespace {0:?}: must be non-empty and contain no ':'")]
    InvalidNamespace(String),

    #[error("max_reconnect_attempts must be greater than zero")]
    ZeroReconnectAttempts,

    #[error("reconnect max delay ({max_ms} ms) is below the base delay ({base_ms} ms)")]
    InvalidReconnectDelays { base_ms: u64, max_ms: u64 },
}

/// Everything a service needs to join the bus.
///
/// Timeouts of `0` disable the corresponding limit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub service_name: String,
    /// `None` runs the bus local-only.
    pub redis_url: Option<String>,
    pub namespace: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub handler_timeout_ms: u64,
    pub middleware_timeout_ms: u64,
    pub forward_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        let options = BusOptions::default();
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            redis_url: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay_ms: duration_ms(DEFAULT_RECONNECT_BASE_DELAY),
            reconnect_max_delay_ms: duration_ms(DEFAULT_RECONNECT_MAX_DELAY),
            handler_timeout_ms: options.handler_timeout.map_or(0, duration_ms),
            middleware_timeout_ms: options.middleware_timeout.map_or(0, duration_ms),
            forward_timeout_ms: options.forward_timeout.map_or(0, duration_ms),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl BusConfig {
    /// Load from process environment variables and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`BusConfig::from_env`], but falls back to `default_name` when
    /// `SERVICE_NAME` is unset.
    ///
    /// Tools that only listen should not share the default producer identity,
    /// or echo suppression hides every producer running on that default.
    pub fn from_env_with_default_name(default_name: &str) -> Result<Self, ConfigError> {
        Self::from_lookup_with_default_name(|key| std::env::var(key).ok(), default_name)
    }

    /// Load from an arbitrary key lookup (environment, test map, ...).
    ///
    /// Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup_with_default_name(lookup, DEFAULT_SERVICE_NAME)
    }

    pub fn from_lookup_with_default_name<F>(
        lookup: F,
        default_name: &str,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        match get(SERVICE_NAME_ENV) {
            Some(name) => config.service_name = name,
            None => {
                warn!(
                    default = default_name,
                    "{SERVICE_NAME_ENV} not set; using default producer identity"
                );
                config.service_name = default_name.to_string();
            }
        }
        config.redis_url = get(REDIS_URL_ENV);
        if let Some(namespace) = get(NAMESPACE_ENV) {
            config.namespace = namespace;
        }

        if let Some(v) = parse_number(&get, MAX_RECONNECT_ATTEMPTS_ENV)? {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = parse_number(&get, RECONNECT_BASE_MS_ENV)? {
            config.reconnect_base_delay_ms = v;
        }
        if let Some(v) = parse_number(&get, RECONNECT_MAX_MS_ENV)? {
            config.reconnect_max_delay_ms = v;
        }
        if let Some(v) = parse_number(&get, HANDLER_TIMEOUT_MS_ENV)? {
            config.handler_timeout_ms = v;
        }
        if let Some(v) = parse_number(&get, MIDDLEWARE_TIMEOUT_MS_ENV)? {
            config.middleware_timeout_ms = v;
        }
        if let Some(v) = parse_number(&get, FORWARD_TIMEOUT_MS_ENV)? {
            config.forward_timeout_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ServiceName::new(self.service_name.as_str())?;

        if let Some(url) = &self.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(ConfigError::InvalidRedisUrl(url.clone()));
            }
        }
        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(ConfigError::InvalidNamespace(self.namespace.clone()));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::ZeroReconnectAttempts);
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ConfigError::InvalidReconnectDelays {
                base_ms: self.reconnect_base_delay_ms,
                max_ms: self.reconnect_max_delay_ms,
            });
        }
        Ok(())
    }

    pub fn service_name(&self) -> Result<ServiceName, ConfigError> {
        Ok(ServiceName::new(self.service_name.as_str())?)
    }

    pub fn bus_options(&self) -> BusOptions {
        BusOptions {
            handler_timeout: millis(self.handler_timeout_ms),
            middleware_timeout: millis(self.middleware_timeout_ms),
            forward_timeout: millis(self.forward_timeout_ms),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn parse_number<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| ConfigError::InvalidNumber { var, value: raw })
        })
        .transpose()
}
