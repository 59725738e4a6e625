// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-monitoring counters.
//!
//! A [`Registry`] is an explicitly passed tree of named metrics. Components
//! register their counters once on construction and update them with atomic
//! operations; an external reporter reads [`Registry::snapshot`]. Dotted
//! metric names (`added.events`) show up as nested objects in snapshots.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::errors::RegistryError;
use crate::event::put_path;

const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct FloatGauge(AtomicU64);

impl FloatGauge {
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
pub struct Text(RwLock<String>);

impl Text {
    pub fn set(&self, value: impl Into<String>) {
        #[allow(clippy::expect_used)]
        let mut guard = self.0.write().expect("lock poisoned");
        *guard = value.into();
    }

    pub fn get(&self) -> String {
        #[allow(clippy::expect_used)]
        let guard = self.0.read().expect("lock poisoned");
        guard.clone()
    }
}

/// Sample histogram over the last [`HISTOGRAM_WINDOW`] observations.
#[derive(Debug, Default)]
pub struct Histogram {
    state: Mutex<HistogramState>,
}

#[derive(Debug, Default)]
struct HistogramState {
    window: Vec<f64>,
    next: usize,
    count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Histogram {
    pub fn record(&self, value: f64) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        state.count += 1;
        if state.window.len() < HISTOGRAM_WINDOW {
            state.window.push(value);
        } else {
            let slot = state.next;
            state.window[slot] = value;
        }
        state.next = (state.next + 1) % HISTOGRAM_WINDOW;
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let (mut samples, count) = {
            #[allow(clippy::expect_used)]
            let state = self.state.lock().expect("lock poisoned");
            (state.window.clone(), state.count)
        };
        if samples.is_empty() {
            return HistogramSnapshot::default();
        }
        samples.sort_by(f64::total_cmp);
        let quantile = |q: f64| {
            let rank = (q * (samples.len() - 1) as f64).round() as usize;
            samples[rank.min(samples.len() - 1)]
        };
        HistogramSnapshot {
            count,
            min: samples[0],
            max: samples[samples.len() - 1],
            mean: samples.iter().sum::<f64>() / samples.len() as f64,
            p50: quantile(0.50),
            p75: quantile(0.75),
            p95: quantile(0.95),
            p99: quantile(0.99),
        }
    }
}

#[derive(Clone, Debug)]
enum Entry {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Float(Arc<FloatGauge>),
    Text(Arc<Text>),
    Histogram(Arc<Histogram>),
    Registry(Arc<Registry>),
}

impl Entry {
    fn snapshot(&self) -> Value {
        match self {
            Entry::Counter(c) => Value::from(c.get()),
            Entry::Gauge(g) => Value::from(g.get()),
            Entry::Float(g) => Value::from(g.get()),
            Entry::Text(t) => Value::String(t.get()),
            Entry::Histogram(h) => serde_json::to_value(h.snapshot()).unwrap_or(Value::Null),
            Entry::Registry(r) => r.snapshot(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, name: &str, entry: Entry) -> Result<(), RegistryError> {
        if name.is_empty() || name.split('.').any(str::is_empty) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        #[allow(clippy::expect_used)]
        let mut entries = self.entries.lock().expect("lock poisoned");
        let collides = entries.keys().any(|existing| {
            existing == name
                || name.starts_with(&format!("{existing}."))
                || existing.starts_with(&format!("{name}."))
        });
        if collides {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        entries.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn new_counter(&self, name: &str) -> Result<Arc<Counter>, RegistryError> {
        let counter = Arc::new(Counter::default());
        self.insert(name, Entry::Counter(Arc::clone(&counter)))?;
        Ok(counter)
    }

    pub fn new_gauge(&self, name: &str) -> Result<Arc<Gauge>, RegistryError> {
        let gauge = Arc::new(Gauge::default());
        self.insert(name, Entry::Gauge(Arc::clone(&gauge)))?;
        Ok(gauge)
    }

    pub fn new_float_gauge(&self, name: &str) -> Result<Arc<FloatGauge>, RegistryError> {
        let gauge = Arc::new(FloatGauge::default());
        self.insert(name, Entry::Float(Arc::clone(&gauge)))?;
        Ok(gauge)
    }

    pub fn new_text(&self, name: &str) -> Result<Arc<Text>, RegistryError> {
        let text = Arc::new(Text::default());
        self.insert(name, Entry::Text(Arc::clone(&text)))?;
        Ok(text)
    }

    pub fn new_histogram(&self, name: &str) -> Result<Arc<Histogram>, RegistryError> {
        let histogram = Arc::new(Histogram::default());
        self.insert(name, Entry::Histogram(Arc::clone(&histogram)))?;
        Ok(histogram)
    }

    pub fn new_registry(&self, name: &str) -> Result<Arc<Registry>, RegistryError> {
        let registry = Registry::new();
        self.insert(name, Entry::Registry(Arc::clone(&registry)))?;
        Ok(registry)
    }

    pub fn get_registry(&self, name: &str) -> Option<Arc<Registry>> {
        #[allow(clippy::expect_used)]
        let entries = self.entries.lock().expect("lock poisoned");
        match entries.get(name) {
            Some(Entry::Registry(r)) => Some(Arc::clone(r)),
            _ => None,
        }
    }

    /// Unregisters `name`. Metric handles already handed out keep working
    /// but are no longer reported.
    pub fn remove(&self, name: &str) -> bool {
        #[allow(clippy::expect_used)]
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.remove(name).is_some()
    }

    pub fn snapshot(&self) -> Value {
        let entries: Vec<(String, Entry)> = {
            #[allow(clippy::expect_used)]
            let entries = self.entries.lock().expect("lock poisoned");
            entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.clone()))
                .collect()
        };
        let mut out = Map::new();
        for (name, entry) in entries {
            put_path(&mut out, &name, entry.snapshot());
        }
        Value::Object(out)
    }
}

/// Metrics namespace of one running input. Unregistered from its parent when
/// dropped.
#[derive(Debug)]
pub struct InputRegistration {
    registry: Arc<Registry>,
    parent: Option<Arc<Registry>>,
    input_type: String,
    id: String,
    key: String,
}

impl InputRegistration {
    /// Registers `id` under `parent`. Inputs without a type or id get a
    /// registry that is not attached anywhere, so their metrics are not
    /// reported. Fails if `id` is already registered.
    pub fn new(parent: &Arc<Registry>, input_type: &str, id: &str) -> Result<Self, RegistryError> {
        let key = sanitize_id(id);
        let detached = input_type.is_empty() || id.is_empty();

        let (registry, parent) = if detached {
            (Registry::new(), None)
        } else {
            info!(input_type, id, key = key.as_str(), "registering input metrics");
            (parent.new_registry(&key)?, Some(Arc::clone(parent)))
        };
        registry.new_text("input")?.set(input_type);
        registry.new_text("id")?.set(id);

        Ok(Self {
            registry,
            parent,
            input_type: input_type.to_string(),
            id: id.to_string(),
            key,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InputRegistration {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            info!(
                input_type = self.input_type.as_str(),
                id = self.id.as_str(),
                key = self.key.as_str(),
                "unregistering input metrics"
            );
            parent.remove(&self.key);
        }
    }
}

/// Dots would create nested objects in snapshots; input ids stay flat.
fn sanitize_id(id: &str) -> String {
    id.replace('.', "_")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_nests_dotted_names() {
        let registry = Registry::new();
        let queue = registry.new_registry("queue").unwrap();
        queue.new_counter("added.events").unwrap().add(3);
        queue.new_counter("added.bytes").unwrap().add(42);
        queue.new_float_gauge("filled.pct").unwrap().set(0.5);
        registry.new_text("name").unwrap().set("agent");

        assert_eq!(
            registry.snapshot(),
            json!({
                "name": "agent",
                "queue": {
                    "added": {"events": 3, "bytes": 42},
                    "filled": {"pct": 0.5}
                }
            })
        );
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        registry.new_counter("events.total").unwrap();
        assert_eq!(
            registry.new_gauge("events.total").unwrap_err(),
            RegistryError::Duplicate("events.total".to_string())
        );
        assert!(registry.new_counter("events").is_err());
        assert!(registry.new_counter("events.total.x").is_err());
        assert!(registry.new_counter("events.totals").is_ok());
        assert!(matches!(
            registry.new_counter("a..b"),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[test]
    fn test_remove_allows_reregistration() {
        let registry = Registry::new();
        let counter = registry.new_counter("c").unwrap();
        assert!(registry.remove("c"));
        counter.inc();
        assert_eq!(registry.snapshot(), json!({}));
        assert!(registry.new_counter("c").is_ok());
    }

    #[test]
    fn test_histogram_percentiles() {
        let histogram = Histogram::default();
        assert_eq!(histogram.snapshot(), HistogramSnapshot::default());
        for v in 1..=100 {
            histogram.record(f64::from(v));
        }
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count, 100);
        assert_eq!(snapshot.min, 1.0);
        assert_eq!(snapshot.max, 100.0);
        assert_eq!(snapshot.mean, 50.5);
        assert_eq!(snapshot.p50, 51.0);
        assert_eq!(snapshot.p99, 99.0);
    }

    #[test]
    fn test_histogram_window_keeps_recent_samples() {
        let histogram = Histogram::default();
        for _ in 0..HISTOGRAM_WINDOW {
            histogram.record(1.0);
        }
        for _ in 0..HISTOGRAM_WINDOW {
            histogram.record(5.0);
        }
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count, 2 * HISTOGRAM_WINDOW as u64);
        assert_eq!(snapshot.min, 5.0);
    }

    #[test]
    fn test_input_registration_lifecycle() {
        let parent = Registry::new();
        {
            let input = InputRegistration::new(&parent, "filestream", "my.input").unwrap();
            assert_eq!(input.key(), "my_input");
            input.registry().new_counter("events.total").unwrap().add(2);
            assert_eq!(
                parent.snapshot(),
                json!({"my_input": {"input": "filestream", "id": "my.input", "events": {"total": 2}}})
            );
            assert!(matches!(
                InputRegistration::new(&parent, "filestream", "my.input"),
                Err(RegistryError::Duplicate(_))
            ));
        }
        assert_eq!(parent.snapshot(), json!({}));
    }

    #[test]
    fn test_input_without_id_is_detached() {
        let parent = Registry::new();
        let input = InputRegistration::new(&parent, "filestream", "").unwrap();
        input.registry().new_counter("events.total").unwrap();
        assert_eq!(parent.snapshot(), json!({}));
        // detached registrations never collide
        assert!(InputRegistration::new(&parent, "filestream", "").is_ok());
    }
}
