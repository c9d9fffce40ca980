//! The closed catalog of event kinds and their payload contracts.
//!
//! Every kind has a fixed wire tag (`EventName`) and a payload struct. Field
//! names are camelCase on the wire so services in other stacks can share the
//! channel. Monetary amounts are plain JSON numbers and may be fractional.
//! Calendar dates are written as `YYYY-MM-DD`; a full RFC 3339 timestamp is
//! also accepted on decode and reduced to its UTC date.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Tag of an event kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventName {
    CustomerCreated,
    CustomerUpdated,
    ProjectStatusChanged,
    EstimationApproved,
    InvoiceCreated,
}

impl EventName {
    pub const ALL: [EventName; 5] = [
        EventName::CustomerCreated,
        EventName::CustomerUpdated,
        EventName::ProjectStatusChanged,
        EventName::EstimationApproved,
        EventName::InvoiceCreated,
    ];

    /// Stable wire tag (e.g. `"invoice:created"`).
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::CustomerCreated => "customer:created",
            EventName::CustomerUpdated => "customer:updated",
            EventName::ProjectStatusChanged => "project:status:changed",
            EventName::EstimationApproved => "estimation:approved",
            EventName::InvoiceCreated => "invoice:created",
        }
    }
}

impl core::fmt::Display for EventName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event name: {0:?}")]
pub struct UnknownEventName(pub String);

impl core::str::FromStr for EventName {
    type Err = UnknownEventName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownEventName(s.to_string()))
    }
}

impl Serialize for EventName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// `customer:created`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerCreated {
    pub customer_id: String,
    pub customer_name: String,
    pub channel: String,
    pub city: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_registration: Option<String>,
}

/// `customer:updated`
///
/// `changes` maps each modified field to its new value; the optional fields
/// carry the customer's current values when the producer has them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerUpdated {
    pub customer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_registration: Option<String>,
    pub changes: BTreeMap<String, JsonValue>,
}

/// `project:status:changed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatusChanged {
    pub project_id: String,
    pub project_name: String,
    pub customer_id: String,
    pub previous_status: String,
    pub new_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_value: Option<f64>,
}

/// `estimation:approved`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimationApproved {
    pub estimation_id: String,
    pub project_id: String,
    pub project_name: String,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    pub total_amount: f64,
}

/// `invoice:created`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceCreated {
    pub invoice_id: String,
    pub invoice_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub customer_name: String,
    pub total_amount: f64,
    pub currency: String,
    pub status: String,
    #[serde(deserialize_with = "date_or_timestamp")]
    pub invoice_date: NaiveDate,
    #[serde(deserialize_with = "date_or_timestamp")]
    pub due_date: NaiveDate,
}

fn date_or_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if let Ok(date) = raw.parse::<NaiveDate>() {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc).date_naive())
        .map_err(|_| {
            serde::de::Error::custom(format!(
                "expected YYYY-MM-DD or an RFC 3339 timestamp, got {raw:?}"
            ))
        })
}

/// Payload of an event, one variant per catalog entry.
///
/// Serializes as the bare payload object; the kind travels separately (as the
/// envelope's name locally, as the channel name on the wire).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    CustomerCreated(CustomerCreated),
    CustomerUpdated(CustomerUpdated),
    ProjectStatusChanged(ProjectStatusChanged),
    EstimationApproved(EstimationApproved),
    InvoiceCreated(InvoiceCreated),
}

impl EventData {
    pub fn event_name(&self) -> EventName {
        match self {
            EventData::CustomerCreated(_) => EventName::CustomerCreated,
            EventData::CustomerUpdated(_) => EventName::CustomerUpdated,
            EventData::ProjectStatusChanged(_) => EventName::ProjectStatusChanged,
            EventData::EstimationApproved(_) => EventName::EstimationApproved,
            EventData::InvoiceCreated(_) => EventName::InvoiceCreated,
        }
    }

    /// Decode a bare payload object as the given event kind.
    pub fn decode(name: EventName, value: JsonValue) -> Result<Self, serde_json::Error> {
        Ok(match name {
            EventName::CustomerCreated => EventData::CustomerCreated(serde_json::from_value(value)?),
            EventName::CustomerUpdated => EventData::CustomerUpdated(serde_json::from_value(value)?),
            EventName::ProjectStatusChanged => {
                EventData::ProjectStatusChanged(serde_json::from_value(value)?)
            }
            EventName::EstimationApproved => {
                EventData::EstimationApproved(serde_json::from_value(value)?)
            }
            EventName::InvoiceCreated => EventData::InvoiceCreated(serde_json::from_value(value)?),
        })
    }
}

/// A payload struct that belongs to the catalog.
///
/// Lets subscribers ask for a concrete payload type and have the event name
/// derived at compile time.
pub trait EventPayload: Clone + Send + Sync + Into<EventData> + 'static {
    const NAME: EventName;

    fn from_data(data: &EventData) -> Option<&Self>;
}

macro_rules! impl_event_payload {
    ($t:ident) => {
        impl EventPayload for $t {
            const NAME: EventName = EventName::$t;

            fn from_data(data: &EventData) -> Option<&Self> {
                match data {
                    EventData::$t(payload) => Some(payload),
                    _ => None,
                }
            }
        }

        impl From<$t> for EventData {
            fn from(value: $t) -> Self {
                EventData::$t(value)
            }
        }
    };
}

impl_event_payload!(CustomerCreated);
impl_event_payload!(CustomerUpdated);
impl_event_payload!(ProjectStatusChanged);
impl_event_payload!(EstimationApproved);
impl_event_payload!(InvoiceCreated);
