//! In-memory broker for tests/dev.
//!
//! Several bus instances in one process can share an [`InMemoryBroker`] to get
//! the same cross-instance behaviour as a real broker: messages go through
//! the wire codec, channels are named the same way, and an instance that is
//! offline when a message is published misses it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::catalog::EventName;
use crate::channel::{DEFAULT_NAMESPACE, channel_name};
use crate::envelope::EventEnvelope;
use crate::transport::{
    ConnectionState, ConnectionStateCell, Inbound, Transport, TransportError, TransportStatus,
};
use crate::wire;

#[derive(Debug)]
struct BrokerMessage {
    channel: String,
    payload: String,
}

#[derive(Debug)]
struct Peer {
    tx: mpsc::UnboundedSender<BrokerMessage>,
    online: Arc<AtomicBool>,
}

/// In-process pub/sub broker.
///
/// - No IO
/// - Best-effort fan-out
/// - Offline peers miss messages
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    channels: Mutex<HashMap<String, Vec<Peer>>>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fan a payload out to every online peer on `channel`. Returns how many
    /// peers received it.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(peers) = channels.get_mut(channel) else {
            return 0;
        };

        let mut delivered = 0;
        // Drop any dead peers while publishing.
        peers.retain(|peer| {
            if !peer.online.load(Ordering::Acquire) {
                return !peer.tx.is_closed();
            }
            let sent = peer
                .tx
                .send(BrokerMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok();
            if sent {
                delivered += 1;
            }
            sent
        });
        delivered
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(channel)
            .map_or(0, |peers| peers.iter().filter(|p| !p.tx.is_closed()).count())
    }

    fn attach(&self, channel: String, peer: Peer) {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel)
            .or_default()
            .push(peer);
    }
}

/// One bus instance's connection pair to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryTransport {
    broker: Arc<InMemoryBroker>,
    namespace: String,
    publisher: ConnectionStateCell,
    subscriber: ConnectionStateCell,
    online: Arc<AtomicBool>,
    closed: AtomicBool,
    channels: Mutex<HashSet<EventName>>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<BrokerMessage>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryTransport {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self::with_namespace(broker, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(broker: Arc<InMemoryBroker>, namespace: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            broker,
            namespace: namespace.into(),
            publisher: ConnectionStateCell::new("publisher"),
            subscriber: ConnectionStateCell::new("subscriber"),
            online: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
            channels: Mutex::new(HashSet::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            forwarder: Mutex::new(None),
        }
    }

    /// Simulate losing the broker link. Messages published meanwhile are
    /// missed, and local publishes are not forwarded.
    pub fn disconnect(&self) {
        self.online.store(false, Ordering::Release);
        self.publisher.set(ConnectionState::Reconnecting);
        self.subscriber.set(ConnectionState::Reconnecting);
    }

    /// Restore the link after [`InMemoryTransport::disconnect`].
    pub fn reconnect(&self) {
        if self.publisher.set(ConnectionState::Connected)
            | self.subscriber.set(ConnectionState::Connected)
        {
            self.online.store(true, Ordering::Release);
        }
    }

    /// Drive both connections into the terminal `Failed` state, as if the
    /// reconnect budget had been exhausted.
    pub fn force_failure(&self) {
        self.online.store(false, Ordering::Release);
        self.publisher.set(ConnectionState::Failed);
        self.subscriber.set(ConnectionState::Failed);
    }

    pub fn subscribed_events(&self) -> Vec<EventName> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = channels.iter().copied().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn start(&self, inbound: Inbound) -> Result<(), TransportError> {
        let Some(mut rx) = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Ok(());
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        self.publisher.set(ConnectionState::Connecting);
        self.subscriber.set(ConnectionState::Connecting);

        let namespace = self.namespace.clone();
        let task = runtime.spawn(async move {
            while let Some(message) = rx.recv().await {
                inbound.deliver_raw(&namespace, &message.channel, &message.payload);
            }
        });
        *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        self.publisher.set(ConnectionState::Connected);
        self.subscriber.set(ConnectionState::Connected);
        Ok(())
    }

    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        match self.publisher.get() {
            ConnectionState::Failed => return Err(TransportError::Failed),
            ConnectionState::Connected => {}
            other => return Err(TransportError::Unavailable(format!("publisher is {other}"))),
        }

        let payload = wire::encode(envelope)?;
        let channel = channel_name(&self.namespace, envelope.event_name());
        self.broker.publish(&channel, &payload);
        Ok(())
    }

    fn subscribe(&self, name: EventName) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.subscriber.get().is_terminal() {
            return Err(TransportError::Failed);
        }

        let newly_added = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name);
        if newly_added {
            self.broker.attach(
                channel_name(&self.namespace, name),
                Peer {
                    tx: self.tx.clone(),
                    online: self.online.clone(),
                },
            );
        }
        Ok(())
    }

    fn status(&self) -> TransportStatus {
        TransportStatus {
            publisher: self.publisher.get(),
            subscriber: self.subscriber.get(),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.online.store(false, Ordering::Release);
        if let Some(task) = self.forwarder.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.publisher.set(ConnectionState::Disconnected);
        self.subscriber.set(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InvoiceCreated;
    use chrono::NaiveDate;
    use erpbus_core::ServiceName;

    fn invoice_envelope(source: &str) -> EventEnvelope {
        EventEnvelope::build(
            InvoiceCreated {
                invoice_id: "INV-1".to_string(),
                invoice_number: "INV-2025-001".to_string(),
                customer_id: Some("C-1".to_string()),
                customer_name: "Acme".to_string(),
                total_amount: 1_000_000.0,
                currency: "IDR".to_string(),
                status: "DRAFT".to_string(),
                invoice_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
                due_date: NaiveDate::from_ymd_opt(2025, 2, 14).unwrap(),
            },
            ServiceName::new(source).unwrap(),
        )
    }

    fn started(broker: &Arc<InMemoryBroker>, identity: &str) -> (InMemoryTransport, mpsc::UnboundedReceiver<EventEnvelope>) {
        let transport = InMemoryTransport::new(broker.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        transport
            .start(Inbound::new(ServiceName::new(identity).unwrap(), tx))
            .unwrap();
        (transport, rx)
    }

    #[test]
    fn publishing_to_an_empty_channel_reaches_nobody() {
        let broker = InMemoryBroker::new();
        assert_eq!(broker.publish("erp:events:invoice:created", "{}"), 0);
    }

    #[tokio::test]
    async fn subscription_is_attached_once_per_event_name() {
        let broker = InMemoryBroker::new();
        let (transport, _rx) = started(&broker, "billing");

        transport.subscribe(EventName::InvoiceCreated).unwrap();
        transport.subscribe(EventName::InvoiceCreated).unwrap();

        assert_eq!(broker.subscriber_count("erp:events:invoice:created"), 1);
        assert_eq!(transport.subscribed_events(), vec![EventName::InvoiceCreated]);
    }

    #[tokio::test]
    async fn message_travels_between_transports() {
        let broker = InMemoryBroker::new();
        let (sender, _sender_rx) = started(&broker, "billing");
        let (receiver, mut receiver_rx) = started(&broker, "crm");
        receiver.subscribe(EventName::InvoiceCreated).unwrap();

        let env = invoice_envelope("billing");
        sender.publish(&env).await.unwrap();

        let received = receiver_rx.recv().await.unwrap();
        assert_eq!(received, env);
    }

    #[tokio::test]
    async fn offline_transport_misses_messages_for_good() {
        let broker = InMemoryBroker::new();
        let (sender, _sender_rx) = started(&broker, "billing");
        let (receiver, mut receiver_rx) = started(&broker, "crm");
        receiver.subscribe(EventName::InvoiceCreated).unwrap();

        receiver.disconnect();
        assert_eq!(receiver.status().subscriber, ConnectionState::Reconnecting);
        sender.publish(&invoice_envelope("billing")).await.unwrap();

        receiver.reconnect();
        let second = invoice_envelope("billing");
        sender.publish(&second).await.unwrap();

        let received = receiver_rx.recv().await.unwrap();
        assert_eq!(received.event_id(), second.event_id());
        assert!(receiver_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_transport_refuses_work_and_stays_failed() {
        let broker = InMemoryBroker::new();
        let (transport, _rx) = started(&broker, "billing");

        transport.force_failure();
        transport.reconnect();

        assert!(transport.status().is_degraded());
        assert!(matches!(
            transport.publish(&invoice_envelope("billing")).await,
            Err(TransportError::Failed)
        ));
        assert!(matches!(
            transport.subscribe(EventName::InvoiceCreated),
            Err(TransportError::Failed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = InMemoryBroker::new();
        let (transport, _rx) = started(&broker, "billing");
        transport.subscribe(EventName::InvoiceCreated).unwrap();

        transport.close().await;
        transport.close().await;

        assert_eq!(transport.status().publisher, ConnectionState::Disconnected);
        assert!(matches!(
            transport.publish(&invoice_envelope("billing")).await,
            Err(TransportError::Closed)
        ));
    }
}
