// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ack::AckCoordinator;
use crate::client::{Client, ClientConfig, ClientInner, ClientMap, ClientParts};
use crate::config::PipelineConfig;
use crate::errors::{PipelineError, ProcessorError, RegistryError};
use crate::monitoring::{Counter, Gauge, Registry};
use crate::processing::{Chain, ChainSettings, ProcessorList};
use crate::queue::Queue;

/// Pipeline wide publish counters, registered under `pipeline`.
pub(crate) struct PipelineMetrics {
    pub clients: Arc<Gauge>,
    pub total: Arc<Counter>,
    pub filtered: Arc<Counter>,
    pub published: Arc<Counter>,
    pub dropped: Arc<Counter>,
    pub active: Arc<Gauge>,
}

impl PipelineMetrics {
    fn new(registry: &Registry) -> Result<Self, RegistryError> {
        Ok(Self {
            clients: registry.new_gauge("clients")?,
            total: registry.new_counter("events.total")?,
            filtered: registry.new_counter("events.filtered")?,
            published: registry.new_counter("events.published")?,
            dropped: registry.new_counter("events.dropped")?,
            active: registry.new_gauge("events.active")?,
        })
    }
}

/// Connects producers to the shared queue and owns shutdown.
pub struct Pipeline {
    queue: Queue,
    acks: Arc<AckCoordinator>,
    chain: ChainSettings,
    clients: ClientMap,
    shutdown: CancellationToken,
    closed: AtomicBool,
    drain_timeout: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    /// Builds the queue and registers the `queue` and `pipeline` metric
    /// namespaces under `registry`. `processors` run on every event after the
    /// client processors and are closed on shutdown.
    pub fn new(
        config: &PipelineConfig,
        processors: ProcessorList,
        registry: &Arc<Registry>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let metrics = Arc::new(PipelineMetrics::new(&*registry.new_registry("pipeline")?)?);
        let acks = Arc::new(AckCoordinator::new(Arc::clone(&metrics.active)));
        let queue = Queue::new(
            config.queue_settings(),
            Arc::clone(&acks),
            &*registry.new_registry("queue")?,
        )?;

        debug!(
            max_events = config.queue_max_events,
            max_bytes = ?config.queue_max_bytes,
            processors = %processors,
            "pipeline created"
        );

        Ok(Self {
            queue,
            acks,
            chain: ChainSettings {
                host_name: config.host_name.clone(),
                normalize: config.event_normalization,
                global: processors,
            },
            clients: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            drain_timeout: config.drain_timeout(),
            metrics,
        })
    }

    /// The queue outputs consume from.
    #[must_use]
    pub fn queue(&self) -> Queue {
        self.queue.clone()
    }

    /// Connects a client with default settings.
    pub fn connect(&self) -> Result<Client, PipelineError> {
        self.connect_with(ClientConfig::default())
    }

    pub fn connect_with(&self, config: ClientConfig) -> Result<Client, PipelineError> {
        config.processing.validate()?;
        if !config.wait_close.is_zero() && config.event_listener.is_none() {
            warn!(
                wait_close = ?config.wait_close,
                "wait_close has no effect without an event listener"
            );
        }

        // shutdown snapshots the map after setting `closed`: checking under the
        // same lock the client is inserted with means it is either rejected
        // here or force-closed there
        #[allow(clippy::expect_used)]
        let mut clients = self.clients.lock().expect("lock poisoned");
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::Closed);
        }

        let chain = Chain::build(&self.chain, &config.processing);
        let mode = config.publish_mode;
        let client = Client::new(ClientParts {
            config,
            chain,
            queue: self.queue.clone(),
            coordinator: Arc::clone(&self.acks),
            cancel: self.shutdown.child_token(),
            metrics: Arc::clone(&self.metrics),
            clients: Arc::clone(&self.clients),
        });
        clients.insert(client.id(), client.downgrade());
        drop(clients);

        debug!(client = %client.id(), ?mode, "client connected");
        Ok(client)
    }

    /// Clients connected and not closed yet.
    #[must_use]
    pub fn client_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        let clients = self.clients.lock().expect("lock poisoned");
        clients.len()
    }

    /// Events published and not resolved by an output yet, closed clients
    /// included.
    #[must_use]
    pub fn pending(&self) -> usize {
        usize::try_from(self.metrics.active.get()).unwrap_or(0)
    }

    /// Stops the pipeline: rejects new clients and events, waits up to the
    /// drain timeout for the queue to empty, then closes every remaining
    /// client without waiting for its ACKs, closes the queue and finally the
    /// pipeline processors. Calling it again does nothing.
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(pending = self.queue.len(), "pipeline shutting down");

        // blocked publishes resolve as dropped
        self.shutdown.cancel();

        if !self.queue.wait_empty(self.drain_timeout).await {
            warn!(
                remaining = self.queue.len(),
                timeout = ?self.drain_timeout,
                "queue not drained before timeout"
            );
        }

        let clients: Vec<Arc<ClientInner>> = {
            #[allow(clippy::expect_used)]
            let clients = self.clients.lock().expect("lock poisoned");
            clients.values().filter_map(std::sync::Weak::upgrade).collect()
        };
        for client in clients {
            // client processor failures are logged by the client
            let _ = client.close(Duration::ZERO).await;
        }

        self.queue.close();
        info!("pipeline shut down");

        self.chain.global.close().map_err(|e| {
            warn!(error = %e, "failed to close pipeline processors");
            e
        })
    }
}
