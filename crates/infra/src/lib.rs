//! Infrastructure layer: configuration, broker transports, bus bootstrap.

use tracing::{info, warn};

use erpbus_events::{EventBus, EventBusBuilder, FailureKind};

pub mod backoff;
pub mod config;
pub mod event_bus;

pub use backoff::{Backoff, ReconnectPolicy};
pub use config::{BusConfig, ConfigError};

/// Build a bus from configuration.
///
/// Without `redis_url` the bus runs local-only. A transport that cannot be
/// created is logged and also degrades to local-only; only invalid
/// configuration is an error. Call from inside a Tokio runtime so the
/// transport can start.
pub fn connect_bus(config: &BusConfig) -> Result<EventBus, ConfigError> {
    config.validate()?;

    let builder = EventBus::builder(config.service_name()?).options(config.bus_options());
    let builder = match config.redis_url.as_deref() {
        Some(url) => with_redis(builder, url, config),
        None => {
            info!(
                kind = %FailureKind::ConfigurationDegraded,
                "REDIS_URL not set; distributed delivery disabled, running local-only"
            );
            builder
        }
    };

    Ok(builder.build())
}

#[cfg(feature = "redis")]
fn with_redis(builder: EventBusBuilder, url: &str, config: &BusConfig) -> EventBusBuilder {
    use std::sync::Arc;

    match event_bus::RedisTransport::new(url, config.namespace.as_str(), config.reconnect_policy())
    {
        Ok(transport) => {
            info!(namespace = %config.namespace, "using redis pub/sub transport");
            let transport = transport.with_publish_timeout(config.bus_options().forward_timeout);
            builder.transport(Arc::new(transport))
        }
        Err(err) => {
            warn!(
                kind = %FailureKind::ConfigurationDegraded,
                error = %err,
                "redis transport unavailable; running local-only"
            );
            builder
        }
    }
}

#[cfg(not(feature = "redis"))]
fn with_redis(builder: EventBusBuilder, _url: &str, _config: &BusConfig) -> EventBusBuilder {
    warn!(
        kind = %FailureKind::ConfigurationDegraded,
        "REDIS_URL set but built without the `redis` feature; running local-only"
    );
    builder
}
