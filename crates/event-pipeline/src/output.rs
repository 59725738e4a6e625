// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reference consumer of the queue.
//!
//! An [`OutputWorker`] pulls batches, hands them to an [`Output`] and reports
//! the outcome back to the queue. Temporary failures are retried with
//! exponential backoff; entries that keep failing are dropped once they
//! reach the retry limit, unless they were published with guaranteed
//! delivery. Permanent failures are dropped right away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::PipelineConfig;
use crate::errors::{DeliveryError, RegistryError};
use crate::event::Event;
use crate::monitoring::{Counter, Histogram, Registry};
use crate::queue::{OnFailure, Queue};

/// A sink events are delivered to.
#[async_trait]
pub trait Output: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, events: &[Arc<Event>]) -> Result<(), DeliveryError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputSettings {
    pub batch_max_events: usize,
    pub batch_max_bytes: Option<usize>,
    pub max_retries: u32,
    pub backoff_init: Duration,
    pub backoff_max: Duration,
}

impl From<&PipelineConfig> for OutputSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_max_events: config.batch_max_events,
            batch_max_bytes: config.batch_max_bytes,
            max_retries: config.max_retries,
            backoff_init: config.backoff_init(),
            backoff_max: config.backoff_max(),
        }
    }
}

impl OutputSettings {
    /// `backoff_init * 2^(failures - 1)`, capped at `backoff_max`.
    fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.backoff_init
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

struct OutputMetrics {
    batches: Arc<Counter>,
    total: Arc<Counter>,
    acked: Arc<Counter>,
    failed: Arc<Counter>,
    dropped: Arc<Counter>,
    retry: Arc<Counter>,
    write_bytes: Arc<Counter>,
    write_errors: Arc<Counter>,
    latency: Arc<Histogram>,
}

impl OutputMetrics {
    fn new(registry: &Registry) -> Result<Self, RegistryError> {
        Ok(Self {
            batches: registry.new_counter("events.batches")?,
            total: registry.new_counter("events.total")?,
            acked: registry.new_counter("events.acked")?,
            failed: registry.new_counter("events.failed")?,
            dropped: registry.new_counter("events.dropped")?,
            retry: registry.new_counter("events.retry")?,
            write_bytes: registry.new_counter("write.bytes")?,
            write_errors: registry.new_counter("write.errors")?,
            latency: registry.new_histogram("write.latency")?,
        })
    }
}

pub struct OutputWorker {
    queue: Queue,
    output: Arc<dyn Output>,
    settings: OutputSettings,
    metrics: OutputMetrics,
}

impl OutputWorker {
    /// Registers the output counters directly under `registry`.
    pub fn new(
        queue: Queue,
        output: Arc<dyn Output>,
        settings: OutputSettings,
        registry: &Registry,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            queue,
            output,
            settings,
            metrics: OutputMetrics::new(registry)?,
        })
    }

    /// Consumes the queue until it is closed and drained, or until `cancel`
    /// fires. A batch being published when `cancel` fires is still resolved.
    pub async fn run(&self, cancel: CancellationToken) {
        let name = self.output.name();
        debug!(output = name, "output worker started");
        let mut failures: u32 = 0;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = self.queue.get(self.settings.batch_max_events, self.settings.batch_max_bytes) => next,
            };
            let Some(batch) = next else {
                debug!(output = name, "queue closed, output worker exiting");
                break;
            };

            let events = batch.events();
            let len = events.len();
            let bytes = batch.bytes();
            self.metrics.batches.inc();
            self.metrics.total.add(len as u64);

            let start = Instant::now();
            let result = self.output.publish(&events).await;
            self.metrics
                .latency
                .record(start.elapsed().as_secs_f64() * 1000.0);

            let retry = OnFailure::RetryUpTo(self.settings.max_retries);
            let failed = match result {
                Ok(()) => {
                    self.metrics.acked.add(len as u64);
                    self.metrics.write_bytes.add(bytes as u64);
                    batch.ack();
                    failures = 0;
                    continue;
                }
                Err(DeliveryError::Partial { acked, reason }) => {
                    let acked = acked.min(len);
                    warn!(output = name, acked, failed = len - acked, %reason, "partial delivery");
                    self.metrics.acked.add(acked as u64);
                    let dropped = batch.done(acked, retry);
                    self.record_failure(len - acked, dropped);
                    true
                }
                Err(DeliveryError::Temporary(reason)) => {
                    warn!(output = name, events = len, %reason, "failed to publish batch, retrying");
                    let dropped = batch.done(0, retry);
                    self.record_failure(len, dropped);
                    true
                }
                Err(DeliveryError::Permanent(reason)) => {
                    error!(output = name, events = len, %reason, "batch rejected, dropping events");
                    let dropped = batch.done(0, OnFailure::Drop);
                    self.record_failure(len, dropped);
                    false
                }
            };
            self.metrics.write_errors.inc();

            if failed {
                failures = failures.saturating_add(1);
                let backoff = self.settings.backoff(failures);
                debug!(output = name, ?backoff, failures, "backing off");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
        debug!(output = name, "output worker stopped");
    }

    fn record_failure(&self, failed: usize, dropped: usize) {
        self.metrics.failed.add(failed as u64);
        self.metrics.dropped.add(dropped as u64);
        self.metrics.retry.add(failed.saturating_sub(dropped) as u64);
        if dropped > 0 {
            warn!(output = self.output.name(), dropped, "dropping events after failed delivery");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, PublishMode};
    use crate::listener::CountingListener;
    use crate::pipeline::Pipeline;
    use crate::processing::ProcessorList;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    /// Replies with scripted results, then succeeds.
    struct ScriptedOutput {
        replies: Mutex<VecDeque<Result<(), DeliveryError>>>,
        delivered: Mutex<Vec<u64>>,
    }

    impl ScriptedOutput {
        fn new(replies: Vec<Result<(), DeliveryError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Output for ScriptedOutput {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn publish(&self, events: &[Arc<Event>]) -> Result<(), DeliveryError> {
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Ok(()));
            let accepted = match &reply {
                Ok(()) => events.len(),
                Err(DeliveryError::Partial { acked, .. }) => *acked,
                Err(_) => 0,
            };
            let mut delivered = self.delivered.lock().unwrap();
            for event in &events[..accepted] {
                delivered.push(event.get_value("n").and_then(|v| v.as_u64()).unwrap());
            }
            reply
        }
    }

    fn settings(max_retries: u32) -> OutputSettings {
        OutputSettings {
            batch_max_events: 10,
            batch_max_bytes: None,
            max_retries,
            backoff_init: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        }
    }

    async fn publish(pipeline: &Pipeline, mode: PublishMode, n: u64) -> Arc<CountingListener> {
        let listener = Arc::new(CountingListener::new());
        let client = pipeline
            .connect_with(ClientConfig {
                publish_mode: mode,
                event_listener: Some(listener.clone()),
                client_listener: Some(listener.clone()),
                ..Default::default()
            })
            .unwrap();
        client
            .publish_all((0..n).map(|n| Event::from_value(json!({ "n": n }))))
            .await
            .unwrap();
        listener
    }

    async fn run_until_empty(worker: OutputWorker, queue: &Queue) {
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await })
        };
        assert!(queue.wait_empty(Duration::from_secs(5)).await);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_backoff_is_capped() {
        let settings = OutputSettings {
            backoff_init: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            ..settings(3)
        };
        assert_eq!(settings.backoff(1), Duration::from_secs(1));
        assert_eq!(settings.backoff(3), Duration::from_secs(4));
        assert_eq!(settings.backoff(100), Duration::from_secs(60));
    }

    #[test]
    fn test_settings_from_config() {
        let settings = OutputSettings::from(&PipelineConfig::default());
        assert_eq!(settings.batch_max_events, 50);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.backoff_init, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_temporary_failure_is_retried() {
        let registry = Registry::new();
        let pipeline = Pipeline::new(&PipelineConfig::default(), ProcessorList::default(), &registry).unwrap();
        let listener = publish(&pipeline, PublishMode::DefaultGuarantees, 3).await;
        let output = ScriptedOutput::new(vec![
            Err(DeliveryError::Temporary("503".to_string())),
            Err(DeliveryError::Partial {
                acked: 1,
                reason: "429".to_string(),
            }),
        ]);
        let worker = OutputWorker::new(
            pipeline.queue(),
            output.clone(),
            settings(3),
            &registry.new_registry("output").unwrap(),
        )
        .unwrap();

        run_until_empty(worker, &pipeline.queue()).await;

        assert_eq!(*output.delivered.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(listener.acked(), 3);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot["output"]["events"]["batches"], 3);
        assert_eq!(snapshot["output"]["events"]["acked"], 3);
        assert_eq!(snapshot["output"]["events"]["retry"], 5);
        assert_eq!(snapshot["output"]["write"]["latency"]["count"], 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retry_limit_drops_default_but_not_guaranteed() {
        let registry = Registry::new();
        let pipeline = Pipeline::new(&PipelineConfig::default(), ProcessorList::default(), &registry).unwrap();
        let best_effort = publish(&pipeline, PublishMode::DefaultGuarantees, 1).await;
        let guaranteed = publish(&pipeline, PublishMode::GuaranteedSend, 1).await;
        let output = ScriptedOutput::new(
            (0..4)
                .map(|_| Err(DeliveryError::Temporary("down".to_string())))
                .collect(),
        );
        let worker = OutputWorker::new(
            pipeline.queue(),
            output.clone(),
            settings(2),
            &registry.new_registry("output").unwrap(),
        )
        .unwrap();

        run_until_empty(worker, &pipeline.queue()).await;

        assert_eq!(best_effort.acked(), 0);
        assert_eq!(guaranteed.acked(), 1);
        assert_eq!(registry.snapshot()["output"]["events"]["dropped"], 1);
        assert!(logs_contain("dropping events after failed delivery"));
    }

    #[tokio::test]
    async fn test_permanent_failure_drops_batch() {
        let registry = Registry::new();
        let pipeline = Pipeline::new(&PipelineConfig::default(), ProcessorList::default(), &registry).unwrap();
        let listener = publish(&pipeline, PublishMode::DefaultGuarantees, 2).await;
        let output = ScriptedOutput::new(vec![Err(DeliveryError::Permanent("400".to_string()))]);
        let worker = OutputWorker::new(
            pipeline.queue(),
            output.clone(),
            settings(3),
            &registry.new_registry("output").unwrap(),
        )
        .unwrap();

        run_until_empty(worker, &pipeline.queue()).await;

        assert_eq!(listener.acked(), 0);
        assert_eq!(listener.published(), 2);
        assert!(output.delivered.lock().unwrap().is_empty());
        assert_eq!(registry.snapshot()["output"]["events"]["dropped"], 2);
    }

    #[tokio::test]
    async fn test_worker_exits_when_queue_closes() {
        let pipeline = Pipeline::new(&PipelineConfig::default(), ProcessorList::default(), &Registry::new()).unwrap();
        let worker = OutputWorker::new(
            pipeline.queue(),
            ScriptedOutput::new(Vec::new()),
            settings(3),
            &Registry::new(),
        )
        .unwrap();
        let handle = tokio::spawn(async move { worker.run(CancellationToken::new()).await });
        pipeline.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
