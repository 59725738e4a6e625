// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};

/// Fields that can be swapped at any time by whoever holds a clone of the
/// cell. Processors read the snapshot that is current when they run.
#[derive(Clone, Debug, Default)]
pub struct DynamicFields {
    current: Arc<RwLock<Arc<Map<String, Value>>>>,
}

impl DynamicFields {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(fields))),
        }
    }

    /// Replaces the fields, returning the previous snapshot.
    pub fn set(&self, fields: Map<String, Value>) -> Arc<Map<String, Value>> {
        #[allow(clippy::expect_used)]
        let mut guard = self.current.write().expect("lock poisoned");
        std::mem::replace(&mut *guard, Arc::new(fields))
    }

    #[must_use]
    pub fn get(&self) -> Arc<Map<String, Value>> {
        #[allow(clippy::expect_used)]
        let guard = self.current.read().expect("lock poisoned");
        Arc::clone(&guard)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_swap_is_visible_to_clones() {
        let cell = DynamicFields::new(json!({"a": 1}).as_object().unwrap().clone());
        let reader = cell.clone();
        let before = reader.get();

        let previous = cell.set(json!({"a": 2}).as_object().unwrap().clone());

        assert_eq!(previous, before);
        assert_eq!(before.get("a"), Some(&json!(1)));
        assert_eq!(reader.get().get("a"), Some(&json!(2)));
    }

    #[test]
    fn test_concurrent_swaps() {
        let cell = DynamicFields::default();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        let mut fields = Map::new();
                        fields.insert("writer".to_string(), json!(i));
                        fields.insert("seq".to_string(), json!(j));
                        cell.set(fields);
                        assert_eq!(cell.get().len(), 2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cell.get().get("seq"), Some(&json!(99)));
    }
}
