use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use erpbus_events::{BusState, EstimationApproved, EventName};
use erpbus_infra::{BusConfig, ConfigError, connect_bus};

fn approval() -> EstimationApproved {
    EstimationApproved {
        estimation_id: "EST-9".to_string(),
        project_id: "P-7".to_string(),
        project_name: "Warehouse retrofit".to_string(),
        approved_by: "finance.lead".to_string(),
        approved_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap(),
        total_amount: 720_000_000.0,
    }
}

fn counting(bus: &erpbus_events::EventBus) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    bus.subscribe_fn(EventName::EstimationApproved, move |_env| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .unwrap();
    hits
}

#[tokio::test]
async fn missing_redis_url_gives_a_local_only_bus() {
    let config = BusConfig {
        service_name: "estimation-service".to_string(),
        ..Default::default()
    };
    let bus = connect_bus(&config).unwrap();
    let hits = counting(&bus);

    bus.publish(approval()).await.unwrap();

    assert_eq!(bus.state(), BusState::Ready);
    assert!(bus.transport_status().is_none());
    assert_eq!(bus.source().as_str(), "estimation-service");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    bus.shutdown().await;
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let config = BusConfig {
        redis_url: Some("http://localhost:6379".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        connect_bus(&config),
        Err(ConfigError::InvalidRedisUrl(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_broker_degrades_to_local_delivery() {
    let config = BusConfig {
        service_name: "estimation-service".to_string(),
        // Nothing listens on port 1.
        redis_url: Some("redis://127.0.0.1:1".to_string()),
        max_reconnect_attempts: 1,
        reconnect_base_delay_ms: 1,
        reconnect_max_delay_ms: 2,
        ..Default::default()
    };
    let bus = connect_bus(&config).unwrap();
    let hits = counting(&bus);

    tokio::time::timeout(Duration::from_secs(20), async {
        while !bus.transport_status().is_some_and(|s| s.publisher.is_terminal()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("publisher should give up");

    bus.publish(approval()).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    bus.shutdown().await;
    bus.shutdown().await;
    assert_eq!(bus.state(), BusState::Closed);
}
