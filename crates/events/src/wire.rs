//! Wire codec for distributed messages.
//!
//! The message body is a JSON object with `eventId`, `timestamp` (RFC 3339),
//! `source` and `data`. The event name is not part of the body: it is carried
//! by the channel the message was published on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use erpbus_core::{EventId, ServiceName};

use crate::catalog::{EventData, EventName};
use crate::envelope::EventEnvelope;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed message on {event_name}: {error}")]
    Malformed {
        event_name: EventName,
        #[source]
        error: serde_json::Error,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMessage<'a> {
    event_id: &'a EventId,
    timestamp: DateTime<Utc>,
    source: &'a ServiceName,
    data: &'a EventData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundMessage {
    event_id: EventId,
    timestamp: DateTime<Utc>,
    source: ServiceName,
    data: JsonValue,
}

pub fn encode(envelope: &EventEnvelope) -> Result<String, WireError> {
    let message = OutboundMessage {
        event_id: envelope.event_id(),
        timestamp: envelope.timestamp(),
        source: envelope.source(),
        data: envelope.data(),
    };
    serde_json::to_string(&message).map_err(WireError::Encode)
}

/// Decode a message received on the channel for `event_name`.
pub fn decode(event_name: EventName, payload: &str) -> Result<EventEnvelope, WireError> {
    let malformed = |error| WireError::Malformed { event_name, error };

    let message: InboundMessage = serde_json::from_str(payload).map_err(malformed)?;
    let data = EventData::decode(event_name, message.data).map_err(malformed)?;

    Ok(EventEnvelope::from_parts(
        message.event_id,
        message.timestamp,
        message.source,
        data,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EstimationApproved;
    use chrono::TimeZone;
    use serde_json::json;

    fn approval() -> EstimationApproved {
        EstimationApproved {
            estimation_id: "EST-7".to_string(),
            project_id: "P-3".to_string(),
            project_name: "Warehouse".to_string(),
            approved_by: "dina".to_string(),
            approved_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap(),
            total_amount: 42_000_000.0,
        }
    }

    #[test]
    fn encoded_message_has_exactly_the_wire_fields() {
        let env = EventEnvelope::build(approval(), ServiceName::new("engineering").unwrap());
        let value: JsonValue = serde_json::from_str(&encode(&env).unwrap()).unwrap();

        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["data", "eventId", "source", "timestamp"]);
        assert_eq!(value["source"], json!("engineering"));
        assert_eq!(value["eventId"], json!(env.event_id().as_str()));
        assert_eq!(value["data"]["approvedBy"], json!("dina"));
    }

    #[test]
    fn decodes_a_message_from_another_stack() {
        let payload = json!({
            "eventId": "finance-1718000000000-x1y2",
            "timestamp": "2025-03-01T09:30:00.000Z",
            "source": "finance-service",
            "data": {
                "estimationId": "EST-7",
                "projectId": "P-3",
                "projectName": "Warehouse",
                "approvedBy": "dina",
                "approvedAt": "2025-03-01T09:30:00Z",
                "totalAmount": 42000000
            }
        })
        .to_string();

        let env = decode(EventName::EstimationApproved, &payload).unwrap();
        assert_eq!(env.event_id().as_str(), "finance-1718000000000-x1y2");
        assert_eq!(env.source().as_str(), "finance-service");
        assert_eq!(env.payload::<EstimationApproved>(), Some(&approval()));
    }

    #[test]
    fn decoded_envelope_preserves_every_field() {
        let env = EventEnvelope::build(approval(), ServiceName::new("engineering").unwrap());
        let decoded = decode(EventName::EstimationApproved, &encode(&env).unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn payload_not_matching_the_channel_kind_is_malformed() {
        let env = EventEnvelope::build(approval(), ServiceName::new("engineering").unwrap());
        let err = decode(EventName::InvoiceCreated, &encode(&env).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            WireError::Malformed { event_name: EventName::InvoiceCreated, .. }
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(decode(EventName::CustomerCreated, "not json").is_err());
        assert!(decode(EventName::CustomerCreated, "{\"eventId\":\"\"}").is_err());
    }
}
