//! # Event Grouping
//!
//! Units emit many events that differ only in timestamp (a power-on every
//! morning, the same error every hour). The backend accepts one description
//! with a list of timestamps, so pending events are grouped by
//! `(type, details)` before upload.
//!
//! ```text
//!  key  type       details            timestamp
//!  k1   power-on   {"v":1}            08:00  ─┐
//!  k2   power-on   {"v":1}            09:00  ─┼─▶ group A: [08:00, 09:00]
//!  k3   error      {"code":"E4"}      09:30  ───▶ group B: [09:30]
//! ```
//!
//! Details are compared as parsed JSON values, so key order and whitespace
//! do not split a group.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::DeviceEvent;

/// Events sharing one `(type, details)` identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventGroup {
    pub event_type: String,
    /// Canonical details text sent to the backend.
    pub details: String,
    /// Keys of every event in the group, in input order.
    pub keys: Vec<String>,
    /// Timestamps of every event in the group, in input order.
    pub timestamps: Vec<DateTime<Utc>>,
    #[serde(skip)]
    identity: serde_json::Value,
}

fn details_identity(details: &str) -> serde_json::Value {
    serde_json::from_str(details)
        .unwrap_or_else(|_| serde_json::Value::String(details.trim().to_string()))
}

/// Canonical form of an event's details.
///
/// Valid JSON is re-serialised compactly; anything else is used
/// as-is after trimming.
pub fn canonical_details(details: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(details) {
        Ok(value) => value.to_string(),
        Err(_) => details.trim().to_string(),
    }
}

/// Groups events by `(type, canonical details)`.
///
/// Groups are returned in order of first appearance.
pub fn group_events(events: &[DeviceEvent]) -> Vec<EventGroup> {
    let mut groups: Vec<EventGroup> = Vec::new();

    for event in events {
        let identity = details_identity(&event.details);

        match groups
            .iter_mut()
            .find(|g| g.event_type == event.event_type && g.identity == identity)
        {
            Some(group) => {
                group.keys.push(event.key.clone());
                group.timestamps.push(event.timestamp);
            }
            None => groups.push(EventGroup {
                event_type: event.event_type.clone(),
                details: canonical_details(&event.details),
                keys: vec![event.key.clone()],
                timestamps: vec![event.timestamp],
                identity,
            }),
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(key: &str, event_type: &str, details: &str, hour: u32) -> DeviceEvent {
        DeviceEvent {
            key: key.into(),
            device: "100".into(),
            event_type: event_type.into(),
            details: details.into(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
            is_uploaded: false,
            is_prod_environment: true,
        }
    }

    #[test]
    fn test_identical_events_share_a_group() {
        let events = vec![
            event("k1", "power-on", r#"{"v":1}"#, 8),
            event("k2", "power-on", r#"{"v":1}"#, 9),
        ];
        let groups = group_events(&events);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].keys, vec!["k1", "k2"]);
        assert_eq!(groups[0].timestamps.len(), 2);
    }

    #[test]
    fn test_key_order_does_not_split_groups() {
        let events = vec![
            event("k1", "error", r#"{"a":1,"b":2}"#, 8),
            event("k2", "error", r#"{ "b": 2, "a": 1 }"#, 9),
        ];
        assert_eq!(group_events(&events).len(), 1);
    }

    #[test]
    fn test_different_type_or_details_split() {
        let events = vec![
            event("k1", "power-on", r#"{"v":1}"#, 8),
            event("k2", "power-off", r#"{"v":1}"#, 9),
            event("k3", "power-on", r#"{"v":2}"#, 10),
        ];
        let groups = group_events(&events);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].event_type, "power-on");
        assert_eq!(groups[1].event_type, "power-off");
    }

    #[test]
    fn test_non_json_details_are_compared_raw() {
        assert_eq!(canonical_details("  not json "), "not json");
    }
}
