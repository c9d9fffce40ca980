//! Two bus instances sharing an in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use erpbus_events::{
    BusState, ConnectionState, EventBus, EventName, InMemoryBroker, InMemoryTransport,
    ProjectStatusChanged, ServiceName, channel_name,
};

fn project_status() -> ProjectStatusChanged {
    ProjectStatusChanged {
        project_id: "P-7".to_string(),
        project_name: "Warehouse retrofit".to_string(),
        customer_id: "C-1".to_string(),
        previous_status: "ESTIMATION".to_string(),
        new_status: "CONTRACTED".to_string(),
        estimated_value: Some(750_000_000.0),
        contract_value: Some(720_000_000.0),
    }
}

fn instance(broker: &Arc<InMemoryBroker>, name: &str) -> (EventBus, Arc<InMemoryTransport>) {
    let transport = Arc::new(InMemoryTransport::new(broker.clone()));
    let bus = EventBus::builder(ServiceName::new(name).unwrap())
        .transport(transport.clone())
        .build();
    (bus, transport)
}

fn count(bus: &EventBus, name: EventName) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    bus.subscribe_fn(name, move |_env| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .unwrap();
    hits
}

async fn wait_for(hits: &AtomicUsize, expected: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while hits.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("remote delivery did not arrive");
}

/// Give in-flight broker messages a chance to land.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn remote_subscribers_receive_and_producer_is_not_echoed() {
    let broker = InMemoryBroker::new();
    let (a, _) = instance(&broker, "project-service");
    let (b, _) = instance(&broker, "crm-service");

    let local = count(&a, EventName::ProjectStatusChanged);
    let remote_one = count(&b, EventName::ProjectStatusChanged);
    let remote_two = count(&b, EventName::ProjectStatusChanged);

    a.publish(project_status()).await.unwrap();

    wait_for(&remote_one, 1).await;
    wait_for(&remote_two, 1).await;
    settle().await;

    assert_eq!(local.load(Ordering::SeqCst), 1);
    assert_eq!(remote_one.load(Ordering::SeqCst), 1);
    assert_eq!(remote_two.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn broker_channel_is_subscribed_lazily_and_once() {
    let broker = InMemoryBroker::new();
    let (bus, transport) = instance(&broker, "crm-service");
    let channel = channel_name("erp", EventName::InvoiceCreated);

    assert_eq!(broker.subscriber_count(&channel), 0);

    count(&bus, EventName::InvoiceCreated);
    count(&bus, EventName::InvoiceCreated);

    assert_eq!(broker.subscriber_count(&channel), 1);
    assert_eq!(transport.subscribed_events(), vec![EventName::InvoiceCreated]);
}

#[tokio::test]
async fn disconnected_instance_misses_messages_published_meanwhile() {
    let broker = InMemoryBroker::new();
    let (a, _) = instance(&broker, "project-service");
    let (b, b_transport) = instance(&broker, "crm-service");
    let remote = count(&b, EventName::ProjectStatusChanged);

    b_transport.disconnect();
    assert_eq!(
        b.transport_status().unwrap().subscriber,
        ConnectionState::Reconnecting
    );
    a.publish(project_status()).await.unwrap();

    b_transport.reconnect();
    a.publish(project_status()).await.unwrap();

    wait_for(&remote, 1).await;
    settle().await;
    assert_eq!(remote.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_releases_the_broker_and_is_idempotent() {
    let broker = InMemoryBroker::new();
    let (a, _) = instance(&broker, "project-service");
    let (b, _) = instance(&broker, "crm-service");
    let remote = count(&b, EventName::ProjectStatusChanged);

    b.shutdown().await;
    b.shutdown().await;
    assert_eq!(b.state(), BusState::Closed);
    assert_eq!(
        b.transport_status().unwrap().subscriber,
        ConnectionState::Disconnected
    );

    a.publish(project_status()).await.unwrap();
    settle().await;

    assert_eq!(remote.load(Ordering::SeqCst), 0);
    assert_eq!(
        broker.subscriber_count(&channel_name("erp", EventName::ProjectStatusChanged)),
        0
    );
}
