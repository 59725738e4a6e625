// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Processors the pipeline injects into every client chain.

use std::fmt;

use serde_json::{Map, Value};

use super::{Processor, Verdict};
use crate::dynamic::DynamicFields;
use crate::errors::ProcessorError;
use crate::event::{deep_merge, put_path, Event};

/// Merges static fields, tags and metadata.
pub struct AddFields {
    fields: Map<String, Value>,
    tags: Vec<String>,
    meta: Map<String, Value>,
}

impl AddFields {
    #[must_use]
    pub fn new(fields: Map<String, Value>, tags: Vec<String>, meta: Map<String, Value>) -> Self {
        Self { fields, tags, meta }
    }
}

impl Processor for AddFields {
    fn run(&self, event: &mut Event) -> Result<Verdict, ProcessorError> {
        event.deep_update(&self.fields);
        deep_merge(&mut event.meta, &self.meta);
        if !self.tags.is_empty() {
            add_tags(event, &self.tags)
                .map_err(|reason| ProcessorError::new(self.to_string(), reason))?;
        }
        Ok(Verdict::Keep)
    }
}

impl fmt::Display for AddFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        write!(
            f,
            "add_fields={{fields=[{}], tags=[{}]}}",
            keys.join(","),
            self.tags.join(",")
        )
    }
}

fn add_tags(event: &mut Event, tags: &[String]) -> Result<(), String> {
    let entry = event
        .fields
        .entry("tags".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let existing = match entry {
        Value::Array(existing) => existing,
        other => return Err(format!("expected 'tags' to be an array, found {other}")),
    };
    for tag in tags {
        if !existing.iter().any(|t| t.as_str() == Some(tag.as_str())) {
            existing.push(Value::String(tag.clone()));
        }
    }
    Ok(())
}

/// Merges the snapshot of a [`DynamicFields`] cell current at run time.
pub struct AddDynamicFields {
    cell: DynamicFields,
}

impl AddDynamicFields {
    #[must_use]
    pub fn new(cell: DynamicFields) -> Self {
        Self { cell }
    }
}

impl Processor for AddDynamicFields {
    fn run(&self, event: &mut Event) -> Result<Verdict, ProcessorError> {
        let snapshot = self.cell.get();
        event.deep_update(&snapshot);
        Ok(Verdict::Keep)
    }
}

impl fmt::Display for AddDynamicFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("add_dynamic_fields")
    }
}

/// Sets a single field. Without `overwrite` an existing value wins.
pub struct SetField {
    key: String,
    value: Value,
    overwrite: bool,
}

impl SetField {
    pub fn new(key: impl Into<String>, value: Value, overwrite: bool) -> Self {
        Self {
            key: key.into(),
            value,
            overwrite,
        }
    }
}

impl Processor for SetField {
    fn run(&self, event: &mut Event) -> Result<Verdict, ProcessorError> {
        if self.overwrite || !event.has_key(&self.key) {
            event.put_value(&self.key, self.value.clone());
        }
        Ok(Verdict::Keep)
    }
}

impl fmt::Display for SetField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "set_field={{{}={}}}", self.key, self.value)
    }
}

/// Expands dotted keys into nested objects: `{"a.b": 1}` becomes
/// `{"a": {"b": 1}}`.
pub struct Normalize;

impl Processor for Normalize {
    fn run(&self, event: &mut Event) -> Result<Verdict, ProcessorError> {
        normalize_map(&mut event.fields);
        Ok(Verdict::Keep)
    }
}

impl fmt::Display for Normalize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("normalize")
    }
}

fn normalize_map(map: &mut Map<String, Value>) {
    for value in map.values_mut() {
        if let Value::Object(inner) = value {
            normalize_map(inner);
        }
    }
    let dotted: Vec<String> = map.keys().filter(|k| k.contains('.')).cloned().collect();
    for key in dotted {
        let Some(value) = map.remove(&key) else {
            continue;
        };
        if let Value::Object(incoming) = &value {
            if let Some(existing) = get_object_mut(map, &key) {
                deep_merge(existing, incoming);
                continue;
            }
        }
        put_path(map, &key, value);
    }
}

fn get_object_mut<'a>(map: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Map<String, Value>> {
    match key.split_once('.') {
        None => map.get_mut(key)?.as_object_mut(),
        Some((head, rest)) => get_object_mut(map.get_mut(head)?.as_object_mut()?, rest),
    }
}

/// Removes null values, recursively.
pub struct DropNulls;

impl Processor for DropNulls {
    fn run(&self, event: &mut Event) -> Result<Verdict, ProcessorError> {
        prune_nulls(&mut event.fields);
        Ok(Verdict::Keep)
    }
}

impl fmt::Display for DropNulls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("drop_nulls")
    }
}

fn prune_nulls(map: &mut Map<String, Value>) {
    map.retain(|_, value| !value.is_null());
    for value in map.values_mut() {
        match value {
            Value::Object(inner) => prune_nulls(inner),
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if let Value::Object(inner) = item {
                        prune_nulls(inner);
                    }
                }
            }
            _ => {}
        }
    }
}
