//! Notification payloads and key extraction.
//!
//! Objects arrive as JSON in Kubernetes object shape. The key of an object is
//! `namespace/name`, or just `name` for cluster-scoped objects.

use serde_json::Value;
use thiserror::Error;

/// Errors raised while deriving or splitting a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The payload is not a JSON object.
    #[error("object is not a JSON object: {0}")]
    NotAnObject(String),

    /// The payload has no `metadata` object.
    #[error("object has no metadata")]
    MissingMetadata,

    /// `metadata.name` is absent, empty or not a string.
    #[error("object metadata has no name")]
    MissingName,

    /// `metadata.namespace` is present but not a string.
    #[error("object metadata namespace is not a string: {0}")]
    InvalidNamespace(String),

    /// A key could not be split back into namespace and name.
    #[error("unexpected key format: {0:?}")]
    InvalidKey(String),
}

/// A change notification delivered by the watch source.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// An object was created (or first observed).
    Add(Value),
    /// An object changed. `old` is the last state seen for it.
    Update { old: Value, new: Value },
    /// An object was deleted. May be a tombstone when the final state is unknown.
    Delete(Value),
}

impl Notification {
    /// The object whose key identifies this notification.
    #[must_use]
    pub const fn object(&self) -> &Value {
        match self {
            Self::Add(obj) | Self::Delete(obj) => obj,
            Self::Update { new, .. } => new,
        }
    }

    /// Short action label for log fields.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Add(_) => "create",
            Self::Update { .. } => "update",
            Self::Delete(_) => "delete",
        }
    }

    /// Whether this is an update whose old and new objects are identical.
    #[must_use]
    pub fn is_noop_update(&self) -> bool {
        matches!(self, Self::Update { old, new } if old == new)
    }
}

/// Derive the queue key of an object.
///
/// Deletion tombstones (`{"key": "...", "obj": ...}`) carry their key
/// already and yield it unchanged.
pub fn meta_namespace_key(obj: &Value) -> Result<String, KeyError> {
    let Some(map) = obj.as_object() else {
        return Err(KeyError::NotAnObject(type_name(obj).to_string()));
    };

    if let Some(Value::String(key)) = map.get("key") {
        if !map.contains_key("metadata") {
            return Ok(key.clone());
        }
    }

    let metadata = map
        .get("metadata")
        .and_then(Value::as_object)
        .ok_or(KeyError::MissingMetadata)?;

    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or(KeyError::MissingName)?;

    match metadata.get("namespace") {
        None | Some(Value::Null) => Ok(name.to_string()),
        Some(Value::String(ns)) if ns.is_empty() => Ok(name.to_string()),
        Some(Value::String(ns)) => Ok(format!("{ns}/{name}")),
        Some(other) => Err(KeyError::InvalidNamespace(type_name(other).to_string())),
    }
}

/// Split a key produced by [`meta_namespace_key`] into namespace and name.
pub fn split_meta_namespace_key(key: &str) -> Result<(Option<&str>, &str), KeyError> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Ok((None, name)),
        (Some(ns), Some(name), None) if !name.is_empty() => {
            Ok(((!ns.is_empty()).then_some(ns), name))
        }
        _ => Err(KeyError::InvalidKey(key.to_string())),
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pod(namespace: &str, name: &str) -> Value {
        json!({
            "kind": "Pod",
            "metadata": { "namespace": namespace, "name": name, "resourceVersion": "1" },
        })
    }

    #[test]
    fn test_namespaced_key() {
        assert_eq!(meta_namespace_key(&pod("ns", "a")), Ok("ns/a".to_string()));
    }

    #[test]
    fn test_cluster_scoped_key() {
        let node = json!({ "kind": "Node", "metadata": { "name": "node-1" } });
        assert_eq!(meta_namespace_key(&node), Ok("node-1".to_string()));
        assert_eq!(meta_namespace_key(&pod("", "x")), Ok("x".to_string()));
    }

    #[test]
    fn test_same_object_same_key() {
        let mut changed = pod("ns", "a");
        changed["metadata"]["resourceVersion"] = json!("2");
        assert_eq!(
            meta_namespace_key(&pod("ns", "a")),
            meta_namespace_key(&changed)
        );
        assert_ne!(
            meta_namespace_key(&pod("ns", "a")),
            meta_namespace_key(&pod("other", "a"))
        );
    }

    #[test]
    fn test_tombstone_key() {
        let tombstone = json!({ "key": "ns/gone", "obj": pod("ns", "gone") });
        assert_eq!(meta_namespace_key(&tombstone), Ok("ns/gone".to_string()));
    }

    #[test]
    fn test_extraction_failures() {
        assert_eq!(
            meta_namespace_key(&json!("ns/a")),
            Err(KeyError::NotAnObject("string".to_string()))
        );
        assert_eq!(
            meta_namespace_key(&json!({ "kind": "Pod" })),
            Err(KeyError::MissingMetadata)
        );
        assert_eq!(
            meta_namespace_key(&json!({ "metadata": { "namespace": "ns" } })),
            Err(KeyError::MissingName)
        );
        assert_eq!(
            meta_namespace_key(&json!({ "metadata": { "name": "" } })),
            Err(KeyError::MissingName)
        );
        assert_eq!(
            meta_namespace_key(&json!({ "metadata": { "name": "a", "namespace": 3 } })),
            Err(KeyError::InvalidNamespace("number".to_string()))
        );
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_meta_namespace_key("ns/a"), Ok((Some("ns"), "a")));
        assert_eq!(split_meta_namespace_key("a"), Ok((None, "a")));
        assert_eq!(split_meta_namespace_key("/a"), Ok((None, "a")));
        assert!(split_meta_namespace_key("a/b/c").is_err());
        assert!(split_meta_namespace_key("ns/").is_err());
        assert!(split_meta_namespace_key("").is_err());
    }

    #[test]
    fn test_notification_object_and_action() {
        let update = Notification::Update {
            old: pod("ns", "a"),
            new: pod("ns", "b"),
        };
        assert_eq!(meta_namespace_key(update.object()), Ok("ns/b".to_string()));
        assert_eq!(update.action(), "update");
        assert!(!update.is_noop_update());

        let same = Notification::Update {
            old: pod("ns", "a"),
            new: pod("ns", "a"),
        };
        assert!(same.is_noop_update());
        assert!(!Notification::Add(pod("ns", "a")).is_noop_update());
    }
}
