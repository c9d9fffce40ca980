//! Tails every catalog event on the configured broker and logs it.
//!
//! Configured through the usual bus environment (`REDIS_URL`,
//! `EVENT_BUS_NAMESPACE`, ...). Runs until Ctrl-C.

use std::sync::Arc;

use erpbus_events::{EventEnvelope, EventName};
use erpbus_infra::{BusConfig, connect_bus};

/// Identity used when `SERVICE_NAME` is unset. Must differ from any producer's,
/// or echo suppression hides that producer's events.
const MONITOR_SERVICE_NAME: &str = "erpbus-monitor";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    erpbus_observability::init();

    let config = BusConfig::from_env_with_default_name(MONITOR_SERVICE_NAME)?;
    if config.redis_url.is_none() {
        tracing::warn!("REDIS_URL not set; the monitor will only see its own process");
    }
    let bus = connect_bus(&config)?;

    for name in EventName::ALL {
        bus.subscribe_fn(name, |envelope: Arc<EventEnvelope>| async move {
            log_event(&envelope);
            Ok(())
        })?;
    }
    tracing::info!(
        namespace = %config.namespace,
        events = EventName::ALL.len(),
        "monitoring event bus"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    bus.shutdown().await;
    Ok(())
}

fn log_event(envelope: &EventEnvelope) {
    let data = serde_json::to_string(envelope.data())
        .unwrap_or_else(|err| format!("<unserializable: {err}>"));
    tracing::info!(
        event_name = %envelope.event_name(),
        event_id = %envelope.event_id(),
        source = %envelope.source(),
        timestamp = %envelope.timestamp().to_rfc3339(),
        data = %data,
        "event received"
    );
}
