// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! ACK fan-out.
//!
//! Every event admitted to the queue reserves the next sequence number of its
//! client. Each client keeps a window of slots starting at its oldest
//! unresolved sequence number; resolving an entry only flips its slot, and
//! the listener is told about the contiguous resolved prefix. That keeps
//! `ack_events(n)` meaning "the oldest n pending events" even when outputs
//! complete batches out of order or a batch interleaves many clients.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use derive_more::Display;
use hashbrown::HashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::event::Event;
use crate::listener::EventListener;
use crate::monitoring::Gauge;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("client-{_0}")]
pub struct ClientId(u64);

/// How a queue entry left the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Delivered; counted towards `ack_events`.
    Acked,
    /// Given up on; reported through `drop_events`, never `ack_events`.
    Dropped,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    announced: bool,
    resolution: Option<Resolution>,
}

#[derive(Debug, Default)]
struct AckWindow {
    /// Sequence number of `slots[0]`.
    base: u64,
    slots: VecDeque<Slot>,
    acked: u64,
    dropped: u64,
    closed: bool,
}

impl AckWindow {
    fn slot_mut(&mut self, seq: u64) -> Option<&mut Slot> {
        let index = usize::try_from(seq.checked_sub(self.base)?).ok()?;
        self.slots.get_mut(index)
    }

    /// Pops the announced and resolved prefix, returning it as runs of equal
    /// resolutions in sequence order.
    fn advance(&mut self) -> Vec<(Resolution, usize)> {
        let mut runs: Vec<(Resolution, usize)> = Vec::new();
        while let Some(slot) = self.slots.front() {
            if !slot.announced {
                break;
            }
            let Some(resolution) = slot.resolution else {
                break;
            };
            match resolution {
                Resolution::Acked => self.acked += 1,
                Resolution::Dropped => self.dropped += 1,
            }
            match runs.last_mut() {
                Some((last, n)) if *last == resolution => *n += 1,
                _ => runs.push((resolution, 1)),
            }
            self.slots.pop_front();
            self.base += 1;
        }
        runs
    }
}

/// Outstanding events of one client, in submission order.
pub(crate) struct ClientAcks {
    id: ClientId,
    listener: Option<Arc<dyn EventListener>>,
    window: Mutex<AckWindow>,
    settled: Notify,
    /// Pipeline wide count of unresolved events.
    active: Arc<Gauge>,
}

impl ClientAcks {
    pub(crate) fn id(&self) -> ClientId {
        self.id
    }

    pub(crate) fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Reserves the sequence number of an event entering the queue.
    pub(crate) fn reserve(&self) -> u64 {
        #[allow(clippy::expect_used)]
        let mut window = self.window.lock().expect("lock poisoned");
        let seq = window.base + window.slots.len() as u64;
        window.slots.push_back(Slot {
            announced: false,
            resolution: None,
        });
        self.active.add(1);
        seq
    }

    /// Reports an admitted event to the listener. Its ACK, if it already
    /// arrived, is delivered right after.
    pub(crate) fn announce(&self, seq: u64, event: &Event) {
        #[allow(clippy::expect_used)]
        let mut window = self.window.lock().expect("lock poisoned");
        if !window.closed {
            if let Some(listener) = &self.listener {
                listener.add_event(event, true);
            }
        }
        if let Some(slot) = window.slot_mut(seq) {
            slot.announced = true;
        }
        self.deliver(&mut window);
    }

    /// Reports an event that never reached the queue.
    pub(crate) fn add_unpublished(&self, event: &Event) {
        #[allow(clippy::expect_used)]
        let window = self.window.lock().expect("lock poisoned");
        if window.closed {
            return;
        }
        if let Some(listener) = &self.listener {
            listener.add_event(event, false);
        }
    }

    fn resolve(&self, resolved: &[(u64, Resolution)]) {
        #[allow(clippy::expect_used)]
        let mut window = self.window.lock().expect("lock poisoned");
        for &(seq, resolution) in resolved {
            match window.slot_mut(seq) {
                Some(slot) if slot.resolution.is_none() => slot.resolution = Some(resolution),
                _ => debug!(client = %self.id, seq, "ignoring resolution of unknown entry"),
            }
        }
        self.deliver(&mut window);
    }

    fn deliver(&self, window: &mut AckWindow) {
        let runs = window.advance();
        let popped: usize = runs.iter().map(|(_, n)| n).sum();
        self.active.add(-i64::try_from(popped).unwrap_or(i64::MAX));
        if let (false, Some(listener)) = (window.closed, &self.listener) {
            for (resolution, n) in runs {
                match resolution {
                    Resolution::Acked => listener.ack_events(n),
                    Resolution::Dropped => listener.drop_events(n),
                }
            }
        }
        if window.slots.is_empty() {
            self.settled.notify_waiters();
        }
    }

    /// Events admitted to the queue and not resolved yet.
    pub(crate) fn outstanding(&self) -> usize {
        #[allow(clippy::expect_used)]
        let window = self.window.lock().expect("lock poisoned");
        window.slots.len()
    }

    /// Totals of acknowledged and dropped events since the client connected.
    pub(crate) fn totals(&self) -> (u64, u64) {
        #[allow(clippy::expect_used)]
        let window = self.window.lock().expect("lock poisoned");
        (window.acked, window.dropped)
    }

    /// Waits until nothing is outstanding. Returns false on timeout.
    pub(crate) async fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.outstanding() == 0;
            }
        }
    }

    /// Fires `client_closed` once. Later ACKs are still tracked but no
    /// longer reported.
    pub(crate) fn close(&self) -> bool {
        #[allow(clippy::expect_used)]
        let mut window = self.window.lock().expect("lock poisoned");
        if window.closed {
            return false;
        }
        window.closed = true;
        if let Some(listener) = &self.listener {
            listener.client_closed();
        }
        true
    }
}

/// Owns the ACK state of every connected client and routes queue
/// resolutions back to them.
#[derive(Default)]
pub(crate) struct AckCoordinator {
    next_id: AtomicU64,
    clients: Mutex<HashMap<ClientId, Arc<ClientAcks>>>,
    active: Arc<Gauge>,
}

impl AckCoordinator {
    pub(crate) fn new(active: Arc<Gauge>) -> Self {
        Self {
            active,
            ..Default::default()
        }
    }

    pub(crate) fn register(&self, listener: Option<Arc<dyn EventListener>>) -> Arc<ClientAcks> {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let acks = Arc::new(ClientAcks {
            id,
            listener,
            window: Mutex::new(AckWindow::default()),
            settled: Notify::new(),
            active: Arc::clone(&self.active),
        });
        #[allow(clippy::expect_used)]
        let mut clients = self.clients.lock().expect("lock poisoned");
        clients.insert(id, Arc::clone(&acks));
        acks
    }

    pub(crate) fn deregister(&self, id: ClientId) {
        #[allow(clippy::expect_used)]
        let mut clients = self.clients.lock().expect("lock poisoned");
        clients.remove(&id);
    }

    /// Applies the outcome of a consumed batch. Entries are grouped per
    /// client keeping batch order, and every client is updated once.
    pub(crate) fn resolve<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (Arc<ClientAcks>, u64, Resolution)>,
    {
        let mut groups: Vec<(Arc<ClientAcks>, Vec<(u64, Resolution)>)> = Vec::new();
        let mut index: HashMap<ClientId, usize> = HashMap::new();
        for (client, seq, resolution) in entries {
            let position = *index.entry(client.id()).or_insert_with(|| {
                groups.push((Arc::clone(&client), Vec::new()));
                groups.len() - 1
            });
            groups[position].1.push((seq, resolution));
        }
        for (client, resolved) in groups {
            client.resolve(&resolved);
        }
    }
}
