//! Distributed transport abstraction (mechanics only).
//!
//! A transport extends delivery beyond the local process through a shared
//! broker. Each bus instance holds two logical connections: one that only
//! publishes and one that only receives, since many pub/sub protocols cannot
//! issue commands on a connection that is blocked waiting for messages.
//!
//! ## Delivery
//!
//! Broker channels are transient, best-effort pub/sub:
//! - **No persistence**: an instance that is disconnected when a message is
//!   published misses it for good.
//! - **At-most-once**: no acknowledgement, no redelivery.
//! - **No ordering across producers**.
//!
//! Consumers must not rely on the transport for guaranteed or ordered
//! cross-process delivery.

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use erpbus_core::ServiceName;

use crate::catalog::EventName;
use crate::channel::event_name_from_channel;
use crate::envelope::EventEnvelope;
use crate::failure::FailureKind;
use crate::wire::{self, WireError};

/// Lifecycle of one broker connection.
///
/// ```text
/// Disconnected → Connecting → Connected → Reconnecting → Connected
///                                                      ↘ Failed
/// ```
///
/// `Failed` is terminal for that connection only.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Failed = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Failed
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl core::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, lock-free holder of a connection's state.
///
/// Once `Failed` is reached every further transition is ignored, which also
/// guarantees the terminal failure is logged exactly once.
#[derive(Debug)]
pub struct ConnectionStateCell {
    connection: &'static str,
    state: AtomicU8,
}

impl ConnectionStateCell {
    pub fn new(connection: &'static str) -> Self {
        Self {
            connection,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
        }
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`. Returns `false` if the connection had already failed.
    pub fn set(&self, next: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ConnectionState::from_u8(current);
            if from.is_terminal() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.log_transition(from, next);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn log_transition(&self, from: ConnectionState, to: ConnectionState) {
        if from == to {
            return;
        }
        match to {
            ConnectionState::Failed => error!(
                kind = %FailureKind::TerminalBrokerFailure,
                connection = self.connection,
                "broker connection failed permanently; continuing with local delivery only"
            ),
            ConnectionState::Reconnecting => warn!(
                kind = %FailureKind::TransientBrokerError,
                connection = self.connection,
                "broker connection lost; reconnecting"
            ),
            ConnectionState::Connected if from == ConnectionState::Reconnecting => {
                info!(connection = self.connection, "broker connection restored")
            }
            _ => debug!(
                connection = self.connection,
                from = %from,
                to = %to,
                "broker connection state changed"
            ),
        }
    }
}

/// Snapshot of both broker connections.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransportStatus {
    pub publisher: ConnectionState,
    pub subscriber: ConnectionState,
}

impl TransportStatus {
    /// Whether either connection has given up for good.
    pub fn is_degraded(&self) -> bool {
        self.publisher.is_terminal() || self.subscriber.is_terminal()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker connection failed permanently")]
    Failed,

    #[error("transport is closed")]
    Closed,

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker command failed: {0}")]
    Command(String),

    #[error("broker did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// What happened to one inbound message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the bus for local dispatch.
    Forwarded,
    /// Produced by this very instance; dropped.
    Echo,
    /// Not decodable, not ours, or the bus is gone.
    Dropped,
}

/// Path from a transport back into its bus.
///
/// Performs echo suppression: a message whose `source` is this instance's own
/// identity was already dispatched locally inside the original `publish()`
/// and is discarded here.
#[derive(Debug, Clone)]
pub struct Inbound {
    identity: ServiceName,
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl Inbound {
    pub fn new(identity: ServiceName, tx: mpsc::UnboundedSender<EventEnvelope>) -> Self {
        Self { identity, tx }
    }

    pub fn identity(&self) -> &ServiceName {
        &self.identity
    }

    pub fn deliver(&self, envelope: EventEnvelope) -> Delivery {
        if envelope.source() == &self.identity {
            debug!(
                event_name = %envelope.event_name(),
                event_id = %envelope.event_id(),
                "dropping echo of own message"
            );
            return Delivery::Echo;
        }
        match self.tx.send(envelope) {
            Ok(()) => Delivery::Forwarded,
            Err(_) => Delivery::Dropped,
        }
    }

    /// Decode a raw broker message and deliver it.
    pub fn deliver_raw(&self, namespace: &str, channel: &str, payload: &str) -> Delivery {
        let Some(name) = event_name_from_channel(namespace, channel) else {
            debug!(channel, "ignoring message on unrecognised channel");
            return Delivery::Dropped;
        };
        match wire::decode(name, payload) {
            Ok(envelope) => self.deliver(envelope),
            Err(err) => {
                warn!(channel, error = %err, "dropping undecodable message");
                Delivery::Dropped
            }
        }
    }
}

/// Broker adapter used by the bus facade.
///
/// Implementations own their connections and background tasks. All methods
/// are best-effort: the bus logs errors and never surfaces them to
/// publishers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin delivering remote messages into `inbound`. Called once.
    fn start(&self, inbound: Inbound) -> Result<(), TransportError>;

    /// Serialize and publish on the channel for the envelope's event name.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), TransportError>;

    /// Register interest in an event name's channel. Idempotent; returns
    /// without waiting for the broker to confirm.
    fn subscribe(&self, name: EventName) -> Result<(), TransportError>;

    fn status(&self) -> TransportStatus;

    /// Release broker connections. Idempotent.
    async fn close(&self);
}
