//! Broker-backed transports for the event bus.
//!
//! The transport abstraction and the in-memory broker live in
//! `erpbus-events`; this module provides infrastructure-backed ones.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{
    DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_PUBLISH_TIMEOUT, RedisTransport, RedisTransportError,
};
