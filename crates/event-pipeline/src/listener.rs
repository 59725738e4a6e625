// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Callbacks a producer attaches to its client.
//!
//! [`ClientListener`] callbacks run on the publishing task. [`EventListener`]
//! callbacks may also run on an output task (`ack_events`) or on the task
//! closing the client (`client_closed`), so implementations must be
//! thread safe. Calls for one client never overlap.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::errors::RegistryError;
use crate::event::{Event, Private};
use crate::monitoring::{Counter, Registry};

/// Tracks the fate of every event published through one client.
pub trait EventListener: Send + Sync {
    /// Called exactly once per published event. `published` is false if the
    /// event was filtered or dropped before reaching the queue.
    fn add_event(&self, event: &Event, published: bool);

    /// The oldest `n` still pending published events were delivered.
    fn ack_events(&self, n: usize);

    /// The oldest `n` still pending published events were given up on by an
    /// output. Interleaves with `ack_events` in publish order.
    fn drop_events(&self, _n: usize) {}

    /// No more callbacks follow.
    fn client_closed(&self);
}

/// Lifecycle and per-event outcome notifications of one client.
pub trait ClientListener: Send + Sync {
    fn closing(&self) {}
    fn closed(&self) {}
    fn new_event(&self) {}
    fn filtered(&self) {}
    fn published(&self) {}
    fn dropped_on_publish(&self, _event: &Event) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl EventListener for NoopListener {
    fn add_event(&self, _event: &Event, _published: bool) {}
    fn ack_events(&self, _n: usize) {}
    fn client_closed(&self) {}
}

impl ClientListener for NoopListener {}

/// Forwards every callback to `a`, then to `b`.
pub struct CombinedClientListener {
    a: Arc<dyn ClientListener>,
    b: Arc<dyn ClientListener>,
}

impl CombinedClientListener {
    pub fn new(a: Arc<dyn ClientListener>, b: Arc<dyn ClientListener>) -> Self {
        Self { a, b }
    }
}

impl ClientListener for CombinedClientListener {
    fn closing(&self) {
        self.a.closing();
        self.b.closing();
    }

    fn closed(&self) {
        self.a.closed();
        self.b.closed();
    }

    fn new_event(&self) {
        self.a.new_event();
        self.b.new_event();
    }

    fn filtered(&self) {
        self.a.filtered();
        self.b.filtered();
    }

    fn published(&self) {
        self.a.published();
        self.b.published();
    }

    fn dropped_on_publish(&self, event: &Event) {
        self.a.dropped_on_publish(event);
        self.b.dropped_on_publish(event);
    }
}

/// Forwards every callback to `a`, then to `b`.
pub struct CombinedEventListener {
    a: Arc<dyn EventListener>,
    b: Arc<dyn EventListener>,
}

impl CombinedEventListener {
    pub fn new(a: Arc<dyn EventListener>, b: Arc<dyn EventListener>) -> Self {
        Self { a, b }
    }
}

impl EventListener for CombinedEventListener {
    fn add_event(&self, event: &Event, published: bool) {
        self.a.add_event(event, published);
        self.b.add_event(event, published);
    }

    fn ack_events(&self, n: usize) {
        self.a.ack_events(n);
        self.b.ack_events(n);
    }

    fn drop_events(&self, n: usize) {
        self.a.drop_events(n);
        self.b.drop_events(n);
    }

    fn client_closed(&self) {
        self.a.client_closed();
        self.b.client_closed();
    }
}

/// Counts every callback it receives. Usable as both listener kinds, and
/// optionally reported through a monitoring registry.
#[derive(Debug, Default)]
pub struct CountingListener {
    total: Arc<Counter>,
    filtered: Arc<Counter>,
    published: Arc<Counter>,
    dropped: Arc<Counter>,
    added: Arc<Counter>,
    acked: Arc<Counter>,
    failed: Arc<Counter>,
    closing: Arc<Counter>,
    closed: Arc<Counter>,
    client_closed: Arc<Counter>,
}

impl CountingListener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters are registered under `events.*` and `client.*` in `registry`.
    pub fn registered(registry: &Registry) -> Result<Self, RegistryError> {
        Ok(Self {
            total: registry.new_counter("events.total")?,
            filtered: registry.new_counter("events.filtered")?,
            published: registry.new_counter("events.published")?,
            dropped: registry.new_counter("events.dropped")?,
            added: registry.new_counter("events.added")?,
            acked: registry.new_counter("events.acked")?,
            failed: registry.new_counter("events.failed")?,
            closing: registry.new_counter("client.closing")?,
            closed: registry.new_counter("client.closed")?,
            client_closed: registry.new_counter("client.acker_closed")?,
        })
    }

    pub fn total(&self) -> u64 {
        self.total.get()
    }

    pub fn filtered(&self) -> u64 {
        self.filtered.get()
    }

    pub fn published(&self) -> u64 {
        self.published.get()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }

    pub fn added(&self) -> u64 {
        self.added.get()
    }

    pub fn acked(&self) -> u64 {
        self.acked.get()
    }

    /// Published events an output gave up on.
    pub fn failed(&self) -> u64 {
        self.failed.get()
    }

    /// Published events neither acknowledged nor given up on yet.
    pub fn pending(&self) -> u64 {
        self.published
            .get()
            .saturating_sub(self.acked.get() + self.failed.get())
    }

    pub fn closing_calls(&self) -> u64 {
        self.closing.get()
    }

    pub fn closed_calls(&self) -> u64 {
        self.closed.get()
    }

    pub fn client_closed_calls(&self) -> u64 {
        self.client_closed.get()
    }
}

impl ClientListener for CountingListener {
    fn closing(&self) {
        self.closing.inc();
    }

    fn closed(&self) {
        self.closed.inc();
    }

    fn new_event(&self) {
        self.total.inc();
    }

    fn filtered(&self) {
        self.filtered.inc();
    }

    fn published(&self) {
        self.published.inc();
    }

    fn dropped_on_publish(&self, _event: &Event) {
        self.dropped.inc();
    }
}

impl EventListener for CountingListener {
    fn add_event(&self, _event: &Event, _published: bool) {
        self.added.inc();
    }

    fn ack_events(&self, n: usize) {
        self.acked.add(n as u64);
    }

    fn drop_events(&self, n: usize) {
        self.failed.add(n as u64);
    }

    fn client_closed(&self) {
        self.client_closed.inc();
    }
}

/// Reports the private value of the most recently resolved event.
///
/// Producers attach their own bookkeeping (a file offset, a partition cursor)
/// as the event private value. Once a prefix of events is resolved the
/// callback receives the prefix length and the last private value found in
/// it, which is safe to persist. Events that never reached the queue resolve
/// as soon as everything before them is resolved.
pub struct LastEventPrivateReporter<F> {
    pending: Mutex<VecDeque<(bool, Option<Private>)>>,
    callback: F,
}

impl<F> LastEventPrivateReporter<F>
where
    F: Fn(usize, Option<Private>) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            callback,
        }
    }

    fn resolve(&self, mut settled: usize) {
        #[allow(clippy::expect_used)]
        let mut pending = self.pending.lock().expect("lock poisoned");
        let mut resolved = 0;
        let mut last = None;
        while let Some((published, _)) = pending.front() {
            if *published {
                if settled == 0 {
                    break;
                }
                settled -= 1;
            }
            if let Some((_, Some(private))) = pending.pop_front() {
                last = Some(private);
            }
            resolved += 1;
        }
        if resolved > 0 {
            // still holding the lock: reports stay in resolution order
            (self.callback)(resolved, last);
        }
    }
}

impl<F> EventListener for LastEventPrivateReporter<F>
where
    F: Fn(usize, Option<Private>) + Send + Sync,
{
    fn add_event(&self, event: &Event, published: bool) {
        {
            #[allow(clippy::expect_used)]
            let mut pending = self.pending.lock().expect("lock poisoned");
            pending.push_back((published, event.private.clone()));
        }
        if !published {
            self.resolve(0);
        }
    }

    fn ack_events(&self, n: usize) {
        self.resolve(n);
    }

    fn drop_events(&self, n: usize) {
        self.resolve(n);
    }

    fn client_closed(&self) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn with_offset(offset: u64) -> Event {
        Event::new(Map::new()).with_private(Arc::new(offset))
    }

    fn offset(private: Option<Private>) -> Option<u64> {
        private.and_then(|p| p.downcast_ref::<u64>().copied())
    }

    #[test]
    fn test_combined_listeners_forward_in_order() {
        let a = Arc::new(CountingListener::new());
        let b = Arc::new(CountingListener::new());
        let client = CombinedClientListener::new(a.clone(), b.clone());
        let events = CombinedEventListener::new(a.clone(), b.clone());

        client.new_event();
        client.published();
        events.add_event(&Event::new(Map::new()), true);
        events.ack_events(1);
        events.drop_events(2);
        client.closing();
        events.client_closed();
        client.closed();

        for listener in [a, b] {
            assert_eq!(listener.total(), 1);
            assert_eq!(listener.published(), 1);
            assert_eq!(listener.acked(), 1);
            assert_eq!(listener.failed(), 2);
            assert_eq!(listener.pending(), 0);
            assert_eq!(listener.closing_calls(), 1);
            assert_eq!(listener.client_closed_calls(), 1);
            assert_eq!(listener.closed_calls(), 1);
        }
    }

    #[test]
    fn test_counting_listener_registered() {
        let registry = Registry::new();
        let listener = CountingListener::registered(&registry).unwrap();
        listener.new_event();
        listener.dropped_on_publish(&Event::new(Map::new()));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot["events"]["total"], 1);
        assert_eq!(snapshot["events"]["dropped"], 1);
        assert!(CountingListener::registered(&registry).is_err());
    }

    #[test]
    fn test_private_reporter_reports_last_resolved() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let reporter = LastEventPrivateReporter::new(move |n, private| {
            sink.lock().unwrap().push((n, offset(private)));
        });

        reporter.add_event(&with_offset(10), true);
        reporter.add_event(&with_offset(20), true);
        reporter.add_event(&with_offset(30), true);
        reporter.ack_events(2);
        reporter.ack_events(1);

        assert_eq!(*reports.lock().unwrap(), vec![(2, Some(20)), (1, Some(30))]);
    }

    #[test]
    fn test_private_reporter_unpublished_resolve_in_order() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let reporter = LastEventPrivateReporter::new(move |n, private| {
            sink.lock().unwrap().push((n, offset(private)));
        });

        // filtered event with nothing pending before it resolves immediately
        reporter.add_event(&with_offset(1), false);
        reporter.add_event(&with_offset(2), true);
        // must wait for offset 2
        reporter.add_event(&with_offset(3), false);
        assert_eq!(reports.lock().unwrap().len(), 1);

        reporter.ack_events(1);
        assert_eq!(*reports.lock().unwrap(), vec![(1, Some(1)), (2, Some(3))]);
    }

    #[test]
    fn test_private_reporter_counts_dropped_events() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let reporter = LastEventPrivateReporter::new(move |n, private| {
            sink.lock().unwrap().push((n, offset(private)));
        });

        reporter.add_event(&with_offset(1), true);
        reporter.add_event(&with_offset(2), true);
        reporter.drop_events(1);
        reporter.ack_events(1);

        assert_eq!(*reports.lock().unwrap(), vec![(1, Some(1)), (1, Some(2))]);
    }
}
