// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded in-memory queue between clients and outputs.
//!
//! Occupancy counts both buffered entries and entries handed out in a
//! [`Batch`] that has not been resolved yet, so a slow output applies
//! backpressure even while the buffer itself looks empty. Admission fails if
//! either the event count or the byte budget would be exceeded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ack::{AckCoordinator, ClientAcks, Resolution};
use crate::errors::RegistryError;
use crate::event::Event;
use crate::monitoring::{Counter, FloatGauge, Gauge, Registry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    pub max_events: usize,
    pub max_bytes: Option<usize>,
}

/// Why an event was not admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Rejected {
    Full,
    /// Larger than the byte budget on its own; can never be admitted.
    TooLarge,
    Closed,
    Cancelled,
}

/// An event ready to enter the queue.
pub(crate) struct Admission {
    pub event: Arc<Event>,
    pub client: Arc<ClientAcks>,
    pub bytes: usize,
    /// Retried by outputs regardless of their retry limit.
    pub guaranteed: bool,
}

/// What happens to the entries of a batch that were not acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnFailure {
    /// Put every failed entry back at the head of the queue.
    Retry,
    /// Put failed entries back unless they already failed this many times.
    /// Entries published with guaranteed delivery are always put back.
    RetryUpTo(u32),
    /// Give up on every failed entry.
    Drop,
}

struct Entry {
    event: Arc<Event>,
    client: Arc<ClientAcks>,
    seq: u64,
    bytes: usize,
    guaranteed: bool,
    retries: u32,
}

#[derive(Default)]
struct State {
    buffer: VecDeque<Entry>,
    /// Buffered plus in flight.
    events: usize,
    bytes: usize,
    closed: bool,
}

struct QueueMetrics {
    added_events: Arc<Counter>,
    added_bytes: Arc<Counter>,
    consumed_events: Arc<Counter>,
    removed_events: Arc<Counter>,
    acked: Arc<Counter>,
    failed: Arc<Counter>,
    dropped: Arc<Counter>,
    filled_events: Arc<Gauge>,
    filled_bytes: Arc<Gauge>,
    filled_pct: Arc<FloatGauge>,
}

impl QueueMetrics {
    fn new(registry: &Registry, settings: &QueueSettings) -> Result<Self, RegistryError> {
        registry
            .new_gauge("max_events")?
            .set(i64::try_from(settings.max_events).unwrap_or(i64::MAX));
        registry
            .new_gauge("max_bytes")?
            .set(settings.max_bytes.map_or(0, |b| i64::try_from(b).unwrap_or(i64::MAX)));
        Ok(Self {
            added_events: registry.new_counter("added.events")?,
            added_bytes: registry.new_counter("added.bytes")?,
            consumed_events: registry.new_counter("consumed.events")?,
            removed_events: registry.new_counter("removed.events")?,
            acked: registry.new_counter("acked")?,
            failed: registry.new_counter("failed")?,
            dropped: registry.new_counter("dropped")?,
            filled_events: registry.new_gauge("filled.events")?,
            filled_bytes: registry.new_gauge("filled.bytes")?,
            filled_pct: registry.new_float_gauge("filled.pct")?,
        })
    }

    fn observe(&self, state: &State, settings: &QueueSettings) {
        self.filled_events
            .set(i64::try_from(state.events).unwrap_or(i64::MAX));
        self.filled_bytes
            .set(i64::try_from(state.bytes).unwrap_or(i64::MAX));
        self.filled_pct
            .set(state.events as f64 / settings.max_events.max(1) as f64);
    }
}

struct Inner {
    settings: QueueSettings,
    state: Mutex<State>,
    acks: Arc<AckCoordinator>,
    metrics: QueueMetrics,
    /// Capacity was released.
    space: Notify,
    /// Entries were added or the queue was closed.
    items: Notify,
    /// Occupancy dropped to zero.
    empty: Notify,
}

/// Shared handle to the pipeline queue. Outputs consume it with
/// [`Queue::get`].
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl Queue {
    pub(crate) fn new(
        settings: QueueSettings,
        acks: Arc<AckCoordinator>,
        registry: &Registry,
    ) -> Result<Self, RegistryError> {
        let metrics = QueueMetrics::new(registry, &settings)?;
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                state: Mutex::new(State::default()),
                acks,
                metrics,
                space: Notify::new(),
                items: Notify::new(),
                empty: Notify::new(),
            }),
        })
    }

    #[must_use]
    pub fn settings(&self) -> QueueSettings {
        self.inner.settings
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().expect("lock poisoned")
    }

    /// Events currently held, buffered or in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().events
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held, buffered or in flight.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    /// Admits the event if there is room, without waiting.
    pub(crate) fn try_push(&self, item: &Admission) -> Result<u64, Rejected> {
        let settings = &self.inner.settings;
        let seq = {
            let mut state = self.lock();
            if state.closed {
                return Err(Rejected::Closed);
            }
            if settings.max_bytes.is_some_and(|max| item.bytes > max) {
                return Err(Rejected::TooLarge);
            }
            let over_bytes = settings
                .max_bytes
                .is_some_and(|max| state.bytes + item.bytes > max);
            if state.events >= settings.max_events || over_bytes {
                return Err(Rejected::Full);
            }

            // reserved under the queue lock so sequence numbers follow
            // queue order for this client
            let seq = item.client.reserve();
            state.buffer.push_back(Entry {
                event: Arc::clone(&item.event),
                client: Arc::clone(&item.client),
                seq,
                bytes: item.bytes,
                guaranteed: item.guaranteed,
                retries: 0,
            });
            state.events += 1;
            state.bytes += item.bytes;
            self.inner.metrics.observe(&state, settings);
            seq
        };
        self.inner.metrics.added_events.inc();
        self.inner.metrics.added_bytes.add(item.bytes as u64);
        self.inner.items.notify_waiters();
        Ok(seq)
    }

    /// Admits the event, waiting for room until `cancel` fires.
    pub(crate) async fn push(
        &self,
        item: &Admission,
        cancel: &CancellationToken,
    ) -> Result<u64, Rejected> {
        loop {
            let space = self.inner.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_push(item) {
                Err(Rejected::Full) => {}
                other => return other,
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(Rejected::Cancelled),
                () = &mut space => {}
            }
        }
    }

    /// Waits for entries and hands out up to `max_events` of them, staying
    /// within `max_bytes` unless a single entry is larger. Returns `None` once
    /// the queue is closed and drained.
    pub async fn get(&self, max_events: usize, max_bytes: Option<usize>) -> Option<Batch> {
        let max_events = max_events.max(1);
        loop {
            let items = self.inner.items.notified();
            tokio::pin!(items);
            items.as_mut().enable();

            {
                let mut state = self.lock();
                if !state.buffer.is_empty() {
                    let mut entries = Vec::new();
                    let mut bytes = 0;
                    while let Some(front) = state.buffer.front() {
                        let within_bytes = max_bytes.map_or(true, |max| bytes + front.bytes <= max);
                        if entries.len() == max_events || (!entries.is_empty() && !within_bytes) {
                            break;
                        }
                        bytes += front.bytes;
                        if let Some(entry) = state.buffer.pop_front() {
                            entries.push(entry);
                        }
                    }
                    drop(state);
                    self.inner.metrics.consumed_events.add(entries.len() as u64);
                    return Some(Batch {
                        queue: self.clone(),
                        entries,
                        resolved: false,
                    });
                }
                if state.closed {
                    return None;
                }
            }

            items.await;
        }
    }

    /// Waits until every admitted event was resolved. Returns false on
    /// timeout.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let empty = self.inner.empty.notified();
            tokio::pin!(empty);
            empty.as_mut().enable();
            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, empty).await.is_err() {
                return self.is_empty();
            }
        }
    }

    /// Rejects further admission. Buffered entries can still be consumed.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        debug!("queue closed");
        self.inner.items.notify_waiters();
        self.inner.space.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn complete(&self, entries: Vec<Entry>, acked: usize, on_failure: OnFailure) -> usize {
        let acked = acked.min(entries.len());
        let failed = entries.len() - acked;
        let mut resolved = Vec::with_capacity(entries.len());
        let mut requeue = Vec::new();

        for (index, mut entry) in entries.into_iter().enumerate() {
            if index < acked {
                resolved.push((entry, Resolution::Acked));
                continue;
            }
            let retry = match on_failure {
                OnFailure::Retry => true,
                OnFailure::RetryUpTo(max) => entry.guaranteed || entry.retries < max,
                OnFailure::Drop => false,
            };
            if retry {
                entry.retries += 1;
                requeue.push(entry);
            } else {
                resolved.push((entry, Resolution::Dropped));
            }
        }

        let dropped = resolved
            .iter()
            .filter(|(_, r)| *r == Resolution::Dropped)
            .count();
        let settled = {
            let mut state = self.lock();
            for (entry, _) in &resolved {
                state.events -= 1;
                state.bytes -= entry.bytes;
            }
            for entry in requeue.into_iter().rev() {
                state.buffer.push_front(entry);
            }
            self.inner.metrics.observe(&state, &self.inner.settings);
            state.events == 0
        };

        let metrics = &self.inner.metrics;
        metrics.acked.add(acked as u64);
        metrics.failed.add(failed as u64);
        metrics.dropped.add(dropped as u64);
        metrics.removed_events.add(resolved.len() as u64);
        if dropped > 0 {
            debug!(dropped, "dropping failed queue entries");
        }

        if failed > dropped {
            self.inner.items.notify_waiters();
        }
        if !resolved.is_empty() {
            self.inner.space.notify_waiters();
        }
        if settled {
            self.inner.empty.notify_waiters();
        }

        self.inner.acks.resolve(
            resolved
                .into_iter()
                .map(|(entry, resolution)| (entry.client, entry.seq, resolution)),
        );
        dropped
    }
}

/// Entries handed to a consumer. They keep counting against the queue
/// capacity until the batch is resolved; a batch dropped unresolved puts its
/// entries back.
pub struct Batch {
    queue: Queue,
    entries: Vec<Entry>,
    resolved: bool,
}

impl Batch {
    pub fn events(&self) -> Vec<Arc<Event>> {
        self.entries.iter().map(|e| Arc::clone(&e.event)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.entries.iter().map(|e| e.bytes).sum()
    }

    /// Highest number of delivery attempts that already failed for an entry
    /// of this batch.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.entries.iter().map(|e| e.retries).max().unwrap_or(0)
    }

    /// Every entry was delivered.
    pub fn ack(mut self) {
        let len = self.entries.len();
        let _ = self.finish(len, OnFailure::Drop);
    }

    /// The first `acked` entries were delivered, the rest are handled per
    /// `on_failure`. Returns how many entries were given up on.
    pub fn done(mut self, acked: usize, on_failure: OnFailure) -> usize {
        self.finish(acked, on_failure)
    }

    fn finish(&mut self, acked: usize, on_failure: OnFailure) -> usize {
        if self.resolved {
            return 0;
        }
        self.resolved = true;
        let entries = std::mem::take(&mut self.entries);
        self.queue.complete(entries, acked, on_failure)
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        let _ = self.finish(0, OnFailure::Retry);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::listener::CountingListener;
    use serde_json::json;

    fn queue(max_events: usize, max_bytes: Option<usize>) -> (Queue, Arc<AckCoordinator>, Arc<Registry>) {
        let acks = Arc::new(AckCoordinator::default());
        let registry = Registry::new();
        let queue = Queue::new(
            QueueSettings {
                max_events,
                max_bytes,
            },
            Arc::clone(&acks),
            &registry,
        )
        .unwrap();
        (queue, acks, registry)
    }

    fn admission(client: &Arc<ClientAcks>, n: u64, bytes: usize) -> Admission {
        Admission {
            event: Arc::new(Event::from_value(json!({ "n": n }))),
            client: Arc::clone(client),
            bytes,
            guaranteed: false,
        }
    }

    fn push_announced(queue: &Queue, client: &Arc<ClientAcks>, n: u64) {
        let item = admission(client, n, 10);
        let seq = queue.try_push(&item).unwrap();
        client.announce(seq, &item.event);
    }

    fn numbers(batch: &Batch) -> Vec<u64> {
        batch
            .events()
            .iter()
            .map(|e| e.get_value("n").and_then(|v| v.as_u64()).unwrap())
            .collect()
    }

    #[test]
    fn test_capacity_by_count() {
        let (queue, acks, _) = queue(2, None);
        let client = acks.register(None);
        assert!(queue.try_push(&admission(&client, 0, 1)).is_ok());
        assert!(queue.try_push(&admission(&client, 1, 1)).is_ok());
        assert_eq!(queue.try_push(&admission(&client, 2, 1)), Err(Rejected::Full));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_capacity_by_bytes() {
        let (queue, acks, _) = queue(100, Some(100));
        let client = acks.register(None);
        assert!(queue.try_push(&admission(&client, 0, 60)).is_ok());
        assert_eq!(queue.try_push(&admission(&client, 1, 60)), Err(Rejected::Full));
        assert_eq!(queue.try_push(&admission(&client, 2, 101)), Err(Rejected::TooLarge));
        assert!(queue.try_push(&admission(&client, 3, 40)).is_ok());
        assert_eq!(queue.bytes(), 100);
    }

    #[test]
    fn test_closed_rejects() {
        let (queue, acks, _) = queue(2, None);
        let client = acks.register(None);
        queue.close();
        assert_eq!(queue.try_push(&admission(&client, 0, 1)), Err(Rejected::Closed));
    }

    #[tokio::test]
    async fn test_in_flight_counts_against_capacity() {
        let (queue, acks, registry) = queue(1, None);
        let client = acks.register(None);
        push_announced(&queue, &client, 0);

        let batch = queue.get(10, None).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(queue.try_push(&admission(&client, 1, 1)), Err(Rejected::Full));

        batch.ack();
        assert!(queue.is_empty());
        assert!(queue.try_push(&admission(&client, 1, 1)).is_ok());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot["added"]["events"], 2);
        assert_eq!(snapshot["acked"], 1);
        assert_eq!(snapshot["filled"]["events"], 1);
        assert_eq!(snapshot["max_events"], 1);
    }

    #[tokio::test]
    async fn test_batch_limits() {
        let (queue, acks, _) = queue(10, None);
        let client = acks.register(None);
        for n in 0..5 {
            push_announced(&queue, &client, n);
        }
        let first = queue.get(2, None).await.unwrap();
        assert_eq!(numbers(&first), vec![0, 1]);
        let second = queue.get(10, Some(25)).await.unwrap();
        assert_eq!(numbers(&second), vec![2, 3]);
        // a single oversized entry is still handed out
        let third = queue.get(10, Some(5)).await.unwrap();
        assert_eq!(numbers(&third), vec![4]);
        first.ack();
        second.ack();
        third.ack();
    }

    #[tokio::test]
    async fn test_retry_requeues_at_head_in_order() {
        let (queue, acks, _) = queue(10, None);
        let listener = Arc::new(CountingListener::new());
        let client = acks.register(Some(listener.clone()));
        for n in 0..4 {
            push_announced(&queue, &client, n);
        }

        let batch = queue.get(3, None).await.unwrap();
        assert_eq!(batch.done(1, OnFailure::Retry), 0);
        assert_eq!(listener.acked(), 1);
        assert_eq!(queue.len(), 3);

        let batch = queue.get(10, None).await.unwrap();
        assert_eq!(numbers(&batch), vec![1, 2, 3]);
        assert_eq!(batch.retries(), 1);
        batch.ack();
        assert_eq!(listener.acked(), 4);
    }

    #[tokio::test]
    async fn test_retry_limit_drops_without_ack() {
        let (queue, acks, registry) = queue(10, None);
        let listener = Arc::new(CountingListener::new());
        let client = acks.register(Some(listener.clone()));
        push_announced(&queue, &client, 0);

        assert_eq!(queue.get(1, None).await.unwrap().done(0, OnFailure::RetryUpTo(1)), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(1, None).await.unwrap().done(0, OnFailure::RetryUpTo(1)), 1);
        assert!(queue.is_empty());
        assert_eq!(listener.acked(), 0);
        assert_eq!(client.outstanding(), 0);
        assert_eq!(registry.snapshot()["dropped"], 1);
    }

    #[tokio::test]
    async fn test_guaranteed_entries_ignore_retry_limit() {
        let (queue, acks, _) = queue(10, None);
        let client = acks.register(None);
        let mut item = admission(&client, 0, 1);
        item.guaranteed = true;
        let seq = queue.try_push(&item).unwrap();
        client.announce(seq, &item.event);

        for _ in 0..5 {
            let _ = queue.get(1, None).await.unwrap().done(0, OnFailure::RetryUpTo(0));
        }
        assert_eq!(queue.len(), 1);
        let _ = queue.get(1, None).await.unwrap().done(0, OnFailure::Drop);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_batch_is_requeued_on_drop() {
        let (queue, acks, _) = queue(10, None);
        let client = acks.register(None);
        push_announced(&queue, &client, 0);
        drop(queue.get(1, None).await.unwrap());
        let batch = queue.get(1, None).await.unwrap();
        assert_eq!(numbers(&batch), vec![0]);
        batch.ack();
    }

    #[tokio::test]
    async fn test_push_waits_for_space_and_cancels() {
        let (queue, acks, _) = queue(1, None);
        let client = acks.register(None);
        push_announced(&queue, &client, 0);

        let cancel = CancellationToken::new();
        let blocked = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            let item = admission(&client, 1, 1);
            tokio::spawn(async move { queue.push(&item, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        queue.get(1, None).await.unwrap().ack();
        assert!(blocked.await.unwrap().is_ok());

        let item = admission(&client, 2, 1);
        let cancelled = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.push(&item, &cancel).await })
        };
        cancel.cancel();
        assert_eq!(cancelled.await.unwrap(), Err(Rejected::Cancelled));
    }

    #[tokio::test]
    async fn test_get_returns_none_when_closed_and_drained() {
        let (queue, acks, _) = queue(10, None);
        let client = acks.register(None);
        push_announced(&queue, &client, 0);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let batch = queue.get(10, None).await.unwrap();
                batch.ack();
                queue.get(10, None).await.is_none()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_empty() {
        let (queue, acks, _) = queue(10, None);
        let client = acks.register(None);
        assert!(queue.wait_empty(Duration::from_millis(1)).await);
        push_announced(&queue, &client, 0);
        assert!(!queue.wait_empty(Duration::from_millis(10)).await);

        let consumer = queue.clone();
        tokio::spawn(async move {
            consumer.get(1, None).await.unwrap().ack();
        });
        assert!(queue.wait_empty(Duration::from_secs(5)).await);
    }
}
