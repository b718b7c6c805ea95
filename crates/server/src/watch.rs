//! Watch event source.
//!
//! Reads a stream of JSON watch events such as
//! `{"type": "MODIFIED", "object": {"metadata": {...}}}` and turns them into
//! controller notifications. Events may be separated by any whitespace.

use std::collections::HashMap;
use std::io::Read;

use podwatch_queue::{Notification, meta_namespace_key};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Kind of change carried by a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// One event of the watch stream.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: Value,
}

/// Turns watch events into notifications.
///
/// Watch events only carry the new object, so the last object seen for each
/// key is kept to fill in the old side of updates.
#[derive(Debug, Default)]
pub struct EventTranslator {
    last_seen: HashMap<String, Value>,
}

impl EventTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: WatchEvent) -> Notification {
        let key = meta_namespace_key(&event.object).ok();

        match event.event_type {
            EventType::Added => {
                if let Some(key) = key {
                    self.last_seen.insert(key, event.object.clone());
                }
                Notification::Add(event.object)
            }
            EventType::Modified => {
                let old = key
                    .and_then(|key| self.last_seen.insert(key, event.object.clone()))
                    .unwrap_or(Value::Null);
                Notification::Update {
                    old,
                    new: event.object,
                }
            }
            EventType::Deleted => {
                if let Some(key) = key {
                    self.last_seen.remove(&key);
                }
                Notification::Delete(event.object)
            }
        }
    }

    /// Number of objects currently remembered.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.last_seen.len()
    }
}

/// Read watch events from `reader` until it ends and send the resulting
/// notifications to `notifications`.
///
/// Blocks the calling thread. Events that are valid JSON but not watch events
/// are skipped; a JSON syntax error ends the stream since the reader cannot
/// resynchronise. Returns the number of notifications sent.
pub fn read_events<R: Read>(reader: R, notifications: &mpsc::Sender<Notification>) -> usize {
    let mut translator = EventTranslator::new();
    let mut sent = 0;

    for value in serde_json::Deserializer::from_reader(reader).into_iter::<Value>() {
        let value = match value {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "Unreadable watch stream, stopping");
                break;
            }
        };

        let event: WatchEvent = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping malformed watch event");
                continue;
            }
        };

        if notifications
            .blocking_send(translator.translate(event))
            .is_err()
        {
            debug!("Notification channel closed, stopping event source");
            break;
        }
        sent += 1;
    }

    sent
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(event_type: EventType, name: &str, version: u32) -> WatchEvent {
        WatchEvent {
            event_type,
            object: json!({
                "metadata": { "namespace": "ns", "name": name, "resourceVersion": version }
            }),
        }
    }

    #[test]
    fn test_modified_carries_previous_object() {
        let mut translator = EventTranslator::new();
        translator.translate(event(EventType::Added, "a", 1));

        match translator.translate(event(EventType::Modified, "a", 2)) {
            Notification::Update { old, new } => {
                assert_eq!(old["metadata"]["resourceVersion"], 1);
                assert_eq!(new["metadata"]["resourceVersion"], 2);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn test_modified_without_history_has_null_old() {
        let mut translator = EventTranslator::new();

        match translator.translate(event(EventType::Modified, "a", 3)) {
            Notification::Update { old, .. } => assert!(old.is_null()),
            other => panic!("unexpected notification: {other:?}"),
        }
        assert_eq!(translator.tracked(), 1);
    }

    #[test]
    fn test_deleted_forgets_object() {
        let mut translator = EventTranslator::new();
        translator.translate(event(EventType::Added, "a", 1));
        let notification = translator.translate(event(EventType::Deleted, "a", 1));

        assert_eq!(notification.action(), "delete");
        assert_eq!(translator.tracked(), 0);
    }

    #[test]
    fn test_read_events_skips_malformed() {
        let input = r#"
            {"type": "ADDED", "object": {"metadata": {"namespace": "ns", "name": "a"}}}
            {"type": "BOOKMARK", "object": {}}
            {"kind": "Pod"}
            {"type": "DELETED", "object": {"metadata": {"name": "b"}}}
        "#;
        let (tx, mut rx) = mpsc::channel(8);

        assert_eq!(read_events(input.as_bytes(), &tx), 2);
        drop(tx);

        assert_eq!(rx.blocking_recv().unwrap().action(), "create");
        assert_eq!(rx.blocking_recv().unwrap().action(), "delete");
        assert!(rx.blocking_recv().is_none());
    }

    #[test]
    fn test_read_events_stops_on_syntax_error() {
        let input = r#"{"type": "ADDED", "object": {"metadata": {"name": "a"}}} {"type": "#;
        let (tx, mut rx) = mpsc::channel(8);

        assert_eq!(read_events(input.as_bytes(), &tx), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_read_events_stops_when_receiver_dropped() {
        let input = r#"{"type": "ADDED", "object": {"metadata": {"name": "a"}}}"#;
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        assert_eq!(read_events(input.as_bytes(), &tx), 0);
    }
}
