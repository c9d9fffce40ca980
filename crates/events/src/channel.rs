//! Broker channel naming: `<namespace>:events:<eventName>`.
//!
//! This string is shared by every service on the broker; changing it breaks
//! compatibility with deployed producers and consumers.

use crate::catalog::EventName;

pub const DEFAULT_NAMESPACE: &str = "erp";

const EVENTS_SEGMENT: &str = ":events:";

pub fn channel_name(namespace: &str, name: EventName) -> String {
    format!("{namespace}{EVENTS_SEGMENT}{}", name.as_str())
}

/// Recover the event name from a channel, if the channel belongs to `namespace`.
pub fn event_name_from_channel(namespace: &str, channel: &str) -> Option<EventName> {
    channel
        .strip_prefix(namespace)?
        .strip_prefix(EVENTS_SEGMENT)?
        .parse()
        .ok()
}
