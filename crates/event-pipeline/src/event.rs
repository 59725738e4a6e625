// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The event record passed from producers through the pipeline.
//!
//! Fields are addressed with dotted paths (`host.name`), where every segment
//! but the last names a nested object.

use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Opaque producer data attached to an event and handed back on ACK.
pub type Private = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct Event {
    pub timestamp: SystemTime,
    pub fields: Map<String, Value>,
    pub meta: Map<String, Value>,
    pub private: Option<Private>,
}

impl Event {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            fields,
            meta: Map::new(),
            private: None,
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_private(mut self, private: Private) -> Self {
        self.private = Some(private);
        self
    }

    /// Builds an event from a JSON object. Non-object values are stored under
    /// `message`.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self::new(fields),
            other => {
                let mut fields = Map::new();
                fields.insert("message".to_string(), other);
                Self::new(fields)
            }
        }
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        get_path(&self.fields, key)
    }

    /// Sets `key`, creating intermediate objects. A non-object value sitting
    /// on an intermediate segment is replaced. Returns the previous value.
    pub fn put_value(&mut self, key: &str, value: Value) -> Option<Value> {
        put_path(&mut self.fields, key, value)
    }

    pub fn delete(&mut self, key: &str) -> Option<Value> {
        delete_path(&mut self.fields, key)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    /// Recursively merges `other` into the event fields. Nested objects are
    /// merged, every other value overwrites.
    pub fn deep_update(&mut self, other: &Map<String, Value>) {
        deep_merge(&mut self.fields, other);
    }

    /// Approximate in-memory footprint, used for byte bounded queue
    /// accounting. Counts the encoded size of fields and meta.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        encoded_len(&self.fields) + encoded_len(&self.meta)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("timestamp", &self.timestamp)
            .field("fields", &self.fields)
            .field("meta", &self.meta)
            .field("private", &self.private.is_some())
            .finish()
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Self::new(fields)
    }
}

fn encoded_len(map: &Map<String, Value>) -> usize {
    if map.is_empty() {
        return 0;
    }
    serde_json::to_vec(map).map(|buf| buf.len()).unwrap_or(0)
}

pub(crate) fn get_path<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let first = segments.next()?;
    let mut current = map.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

pub(crate) fn put_path(map: &mut Map<String, Value>, key: &str, value: Value) -> Option<Value> {
    match key.split_once('.') {
        None => map.insert(key.to_string(), value),
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            match child {
                Value::Object(inner) => put_path(inner, rest, value),
                _ => None,
            }
        }
    }
}

pub(crate) fn delete_path(map: &mut Map<String, Value>, key: &str) -> Option<Value> {
    match key.split_once('.') {
        None => map.remove(key),
        Some((head, rest)) => match map.get_mut(head) {
            Some(Value::Object(inner)) => delete_path(inner, rest),
            _ => None,
        },
    }
}

pub(crate) fn deep_merge(target: &mut Map<String, Value>, other: &Map<String, Value>) {
    for (key, value) in other {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Checks that every key of `map` (recursively) is usable as a path segment.
pub(crate) fn validate_keys(map: &Map<String, Value>) -> Result<(), String> {
    for (key, value) in map {
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(key.clone());
        }
        if let Value::Object(inner) = value {
            validate_keys(inner)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> Event {
        Event::from_value(value)
    }

    #[test]
    fn test_get_and_put_nested() {
        let mut e = event(json!({"host": {"name": "a"}}));
        assert_eq!(e.get_value("host.name"), Some(&json!("a")));
        assert_eq!(e.get_value("host.ip"), None);

        let previous = e.put_value("host.name", json!("b"));
        assert_eq!(previous, Some(json!("a")));
        e.put_value("agent.version", json!("1.0"));
        assert_eq!(e.fields, *json!({"host": {"name": "b"}, "agent": {"version": "1.0"}}).as_object().unwrap());
    }

    #[test]
    fn test_put_replaces_scalar_intermediate() {
        let mut e = event(json!({"service": "web"}));
        e.put_value("service.name", json!("web"));
        assert_eq!(e.get_value("service.name"), Some(&json!("web")));
    }

    #[test]
    fn test_delete() {
        let mut e = event(json!({"a": {"b": 1, "c": 2}}));
        assert_eq!(e.delete("a.b"), Some(json!(1)));
        assert_eq!(e.delete("a.x.y"), None);
        assert!(!e.has_key("a.b"));
        assert!(e.has_key("a.c"));
    }

    #[test]
    fn test_deep_update_merges_objects() {
        let mut e = event(json!({"a": {"b": 1}, "x": 1}));
        e.deep_update(json!({"a": {"c": 2}, "x": {"y": 3}}).as_object().unwrap());
        assert_eq!(e.fields, *json!({"a": {"b": 1, "c": 2}, "x": {"y": 3}}).as_object().unwrap());
    }

    #[test]
    fn test_from_scalar_value() {
        let e = event(json!("plain line"));
        assert_eq!(e.get_value("message"), Some(&json!("plain line")));
    }

    #[test]
    fn test_approx_size() {
        assert_eq!(Event::new(Map::new()).approx_size(), 0);
        let e = event(json!({"message": "hello"}));
        assert_eq!(e.approx_size(), r#"{"message":"hello"}"#.len());
    }

    #[test]
    fn test_validate_keys() {
        assert!(validate_keys(json!({"a": {"b.c": 1}}).as_object().unwrap()).is_ok());
        assert_eq!(
            validate_keys(json!({"a": {"": 1}}).as_object().unwrap()),
            Err(String::new())
        );
        assert_eq!(
            validate_keys(json!({"a..b": 1}).as_object().unwrap()),
            Err("a..b".to_string())
        );
    }
}
