// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ack::{AckCoordinator, ClientAcks, ClientId};
use crate::errors::{ClientClosedError, ConfigError, ProcessorError};
use crate::event::Event;
use crate::listener::{ClientListener, EventListener, NoopListener};
use crate::pipeline::PipelineMetrics;
use crate::processing::{Chain, ProcessingConfig, Verdict};
use crate::queue::{Admission, Queue, Rejected};

/// What happens to an event when the queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PublishMode {
    /// Wait for room, like [`PublishMode::GuaranteedSend`]. Outputs may still
    /// drop the event once their retry limit is reached.
    #[default]
    DefaultGuarantees,
    /// Wait for room and retry delivery until the event is acknowledged. Only
    /// closing the client or the pipeline drops a waiting event.
    GuaranteedSend,
    /// Drop the event right away.
    DropIfFull,
}

impl TryFrom<u8> for PublishMode {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PublishMode::DefaultGuarantees),
            1 => Ok(PublishMode::GuaranteedSend),
            2 => Ok(PublishMode::DropIfFull),
            other => Err(ConfigError::InvalidPublishMode(other)),
        }
    }
}

/// Delivery contract of a client, fixed on connect.
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub publish_mode: PublishMode,
    pub processing: ProcessingConfig,
    /// How long `close` waits for outstanding ACKs. Only applies when an
    /// event listener is set.
    pub wait_close: Duration,
    pub event_listener: Option<Arc<dyn EventListener>>,
    pub client_listener: Option<Arc<dyn ClientListener>>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("publish_mode", &self.publish_mode)
            .field("wait_close", &self.wait_close)
            .field("event_listener", &self.event_listener.is_some())
            .field("client_listener", &self.client_listener.is_some())
            .finish_non_exhaustive()
    }
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

pub(crate) type ClientMap = Arc<Mutex<HashMap<ClientId, Weak<ClientInner>>>>;

pub(crate) struct ClientInner {
    mode: PublishMode,
    chain: Chain,
    queue: Queue,
    acks: Arc<ClientAcks>,
    coordinator: Arc<AckCoordinator>,
    listener: Arc<dyn ClientListener>,
    wait_close: Duration,
    state: AtomicU8,
    cancel: CancellationToken,
    /// Serializes publishing, and lets `close` wait for an in-flight publish.
    publishing: tokio::sync::Mutex<()>,
    metrics: Arc<PipelineMetrics>,
    clients: ClientMap,
}

pub(crate) struct ClientParts {
    pub config: ClientConfig,
    pub chain: Chain,
    pub queue: Queue,
    pub coordinator: Arc<AckCoordinator>,
    pub cancel: CancellationToken,
    pub metrics: Arc<PipelineMetrics>,
    pub clients: ClientMap,
}

/// A producer's handle on the pipeline. Cheap to clone; clones publish
/// through the same client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub(crate) fn new(parts: ClientParts) -> Self {
        let ClientParts {
            config,
            chain,
            queue,
            coordinator,
            cancel,
            metrics,
            clients,
        } = parts;
        let acks = coordinator.register(config.event_listener);
        let inner = Arc::new(ClientInner {
            mode: config.publish_mode,
            chain,
            queue,
            acks,
            coordinator,
            listener: config
                .client_listener
                .unwrap_or_else(|| Arc::new(NoopListener)),
            wait_close: config.wait_close,
            state: AtomicU8::new(OPEN),
            cancel,
            publishing: tokio::sync::Mutex::new(()),
            metrics,
            clients,
        });
        inner.metrics.clients.add(1);
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.inner.acks.id()
    }

    #[must_use]
    pub fn publish_mode(&self) -> PublishMode {
        self.inner.mode
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != OPEN
    }

    /// Published events not acknowledged or dropped by an output yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.acks.outstanding()
    }

    /// Processes the event and hands it to the queue.
    ///
    /// Only fails if the client no longer accepts events. Whatever happens to
    /// an accepted event is reported through the listeners: `new_event`, then
    /// one of `filtered`, `published` or `dropped_on_publish`, and
    /// `add_event` exactly once.
    pub async fn publish(&self, event: Event) -> Result<(), ClientClosedError> {
        self.inner.publish(event).await
    }

    /// Publishes events in order, stopping at the first rejected one.
    pub async fn publish_all<I>(&self, events: I) -> Result<(), ClientClosedError>
    where
        I: IntoIterator<Item = Event>,
    {
        for event in events {
            self.inner.publish(event).await?;
        }
        Ok(())
    }

    /// Stops accepting events, waits up to the configured `wait_close` for
    /// outstanding ACKs, then fires `closing`, `client_closed` and `closed`.
    /// Idempotent; later calls return right away.
    pub async fn close(&self) -> Result<(), ProcessorError> {
        self.inner.close(self.inner.wait_close).await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("publish_mode", &self.inner.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientInner {
    async fn publish(&self, mut event: Event) -> Result<(), ClientClosedError> {
        let _publishing = self.publishing.lock().await;
        if self.state.load(Ordering::Acquire) != OPEN || self.cancel.is_cancelled() {
            return Err(ClientClosedError);
        }

        self.metrics.total.inc();
        self.listener.new_event();

        match self.chain.run(&mut event) {
            Ok(Verdict::Keep) => {}
            Ok(Verdict::Drop) => {
                self.filtered(&event);
                return Ok(());
            }
            Err(e) => {
                warn!(client = %self.acks.id(), error = %e, "dropping event after processor failure");
                self.filtered(&event);
                return Ok(());
            }
        }

        let bytes = event.approx_size();
        let event = Arc::new(event);
        let item = Admission {
            event: Arc::clone(&event),
            client: Arc::clone(&self.acks),
            bytes,
            guaranteed: self.mode == PublishMode::GuaranteedSend,
        };
        let admitted = match self.mode {
            PublishMode::DropIfFull => self.queue.try_push(&item),
            PublishMode::DefaultGuarantees | PublishMode::GuaranteedSend => {
                self.queue.push(&item, &self.cancel).await
            }
        };

        match admitted {
            Ok(seq) => {
                self.metrics.published.inc();
                self.listener.published();
                self.acks.announce(seq, &event);
            }
            Err(reason) => {
                if reason == Rejected::TooLarge {
                    warn!(client = %self.acks.id(), bytes, "dropping event larger than the queue byte budget");
                } else {
                    debug!(client = %self.acks.id(), ?reason, "dropping event on publish");
                }
                self.metrics.dropped.inc();
                self.listener.dropped_on_publish(&event);
                self.acks.add_unpublished(&event);
            }
        }
        Ok(())
    }

    fn filtered(&self, event: &Event) {
        self.metrics.filtered.inc();
        self.listener.filtered();
        self.acks.add_unpublished(event);
    }

    /// Safe to cancel: a close dropped while waiting leaves the client in
    /// `CLOSING`, and the next `close` (or the pipeline force-close) finishes
    /// it. Callbacks run after the last await.
    pub(crate) async fn close(&self, wait: Duration) -> Result<(), ProcessorError> {
        if self.state.load(Ordering::Acquire) == CLOSED {
            return Ok(());
        }
        let first = self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        let id = self.acks.id();
        if first {
            debug!(client = %id, "closing client");
        } else {
            debug!(client = %id, "resuming interrupted client close");
        }

        // wakes a publish blocked on a full queue, which then drops its event
        self.cancel.cancel();
        let _publishing = self.publishing.lock().await;
        if self.state.load(Ordering::Acquire) == CLOSED {
            // finished by a concurrent close
            return Ok(());
        }

        if self.acks.has_listener() && !wait.is_zero() && !self.acks.wait_settled(wait).await {
            debug!(
                client = %id,
                pending = self.acks.outstanding(),
                "closing client with unacknowledged events"
            );
        }

        self.listener.closing();
        self.acks.close();
        self.listener.closed();
        self.state.store(CLOSED, Ordering::Release);

        self.coordinator.deregister(id);
        {
            #[allow(clippy::expect_used)]
            let mut clients = self.clients.lock().expect("lock poisoned");
            clients.remove(&id);
        }
        self.metrics.clients.add(-1);

        let (acked, dropped) = self.acks.totals();
        debug!(client = %id, acked, dropped, "client closed");

        self.chain.close().map_err(|e| {
            warn!(client = %id, error = %e, "failed to close client processors");
            e
        })
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // dropped without close: release the registration and processors
        if *self.state.get_mut() != CLOSED {
            let id = self.acks.id();
            self.coordinator.deregister(id);
            if let Ok(mut clients) = self.clients.lock() {
                clients.remove(&id);
            }
            self.metrics.clients.add(-1);
            if let Err(e) = self.chain.close() {
                warn!(client = %id, error = %e, "failed to close client processors");
            }
        }
    }
}
