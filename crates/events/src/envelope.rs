use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use erpbus_core::{EventId, ServiceName};

use crate::catalog::{EventData, EventName, EventPayload};

/// One occurrence of a domain event in transit.
///
/// Notes:
/// - `event_id` is generated at build time, unique per envelope.
/// - `source` identifies the producing bus instance and drives echo suppression.
/// - The event name is derived from the payload variant, so the two can never
///   disagree.
///
/// Middleware may rewrite an envelope through [`EventEnvelope::data_mut`]; once
/// the pipeline finishes the bus wraps it in an `Arc` and nothing mutates it
/// again.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    event_id: EventId,
    timestamp: DateTime<Utc>,
    source: ServiceName,
    data: EventData,
}

impl EventEnvelope {
    /// Build a fresh envelope stamped with the current time.
    pub fn build(data: impl Into<EventData>, source: ServiceName) -> Self {
        Self::from_parts(EventId::new(), Utc::now(), source, data.into())
    }

    pub fn from_parts(
        event_id: EventId,
        timestamp: DateTime<Utc>,
        source: ServiceName,
        data: EventData,
    ) -> Self {
        Self {
            event_id,
            timestamp,
            source,
            data,
        }
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &ServiceName {
        &self.source
    }

    pub fn event_name(&self) -> EventName {
        self.data.event_name()
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut EventData {
        &mut self.data
    }

    /// Typed view of the payload, if it is of kind `P`.
    pub fn payload<P: EventPayload>(&self) -> Option<&P> {
        P::from_data(&self.data)
    }

    pub fn into_data(self) -> EventData {
        self.data
    }
}

/// Builds envelopes for one producer.
///
/// Timestamps never go backwards across sequential calls, even if the wall
/// clock is stepped back.
#[derive(Debug)]
pub struct EnvelopeFactory {
    source: ServiceName,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl EnvelopeFactory {
    pub fn new(source: ServiceName) -> Self {
        Self {
            source,
            last_timestamp: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &ServiceName {
        &self.source
    }

    pub fn build(&self, data: impl Into<EventData>) -> EventEnvelope {
        let timestamp = self.next_timestamp(Utc::now());
        EventEnvelope::from_parts(EventId::new(), timestamp, self.source.clone(), data.into())
    }

    fn next_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let next = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(next);
        next
    }
}
