// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use async_trait::async_trait;
use serde_json::json;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use event_pipeline::listener::{CombinedClientListener, CountingListener};
use event_pipeline::monitoring::InputRegistration;
use event_pipeline::{
    ClientConfig, ClientListener, DeliveryError, Event, EventListener, Output, OutputSettings,
    OutputWorker, Pipeline, PipelineConfig, ProcessingConfig, ProcessorList, PublishMode,
    Registry,
};

const DEFAULT_DURATION_SECS: u64 = 10;
const DEFAULT_PRODUCERS: usize = 4;
const DEFAULT_WAIT_CLOSE: Duration = Duration::from_secs(5);

/// Accepts every batch after an optional delay.
struct DiscardOutput {
    delay: Duration,
}

#[async_trait]
impl Output for DiscardOutput {
    fn name(&self) -> &str {
        "discard"
    }

    async fn publish(&self, _events: &[Arc<Event>]) -> Result<(), DeliveryError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        Ok(())
    }
}

struct StressConfig {
    duration: Duration,
    producers: usize,
    publish_mode: PublishMode,
    output_delay: Duration,
}

impl StressConfig {
    fn from_env() -> Result<Self, String> {
        let duration = env::var("STRESS_DURATION_SECS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .unwrap_or(DEFAULT_DURATION_SECS);
        let producers = env::var("STRESS_PRODUCERS")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or(DEFAULT_PRODUCERS);
        let publish_mode = match env::var("STRESS_PUBLISH_MODE") {
            Ok(val) => {
                let raw = val
                    .parse::<u8>()
                    .map_err(|e| format!("invalid STRESS_PUBLISH_MODE '{val}': {e}"))?;
                PublishMode::try_from(raw).map_err(|e| e.to_string())?
            }
            Err(_) => PublishMode::DefaultGuarantees,
        };
        let output_delay = env::var("STRESS_OUTPUT_DELAY_MS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Self {
            duration: Duration::from_secs(duration),
            producers: producers.max(1),
            publish_mode,
            output_delay: Duration::from_millis(output_delay),
        })
    }
}

#[tokio::main]
pub async fn main() {
    let pipeline_config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid pipeline configuration: {e}");
            return;
        }
    };

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(&pipeline_config.log_level)
                .expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let stress_config = match StressConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid stress configuration: {e}");
            return;
        }
    };

    if let Err(e) = run(&pipeline_config, &stress_config).await {
        error!("stress run failed: {e}");
    }
}

async fn run(
    pipeline_config: &PipelineConfig,
    stress_config: &StressConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Registry::new();
    let pipeline = Pipeline::new(pipeline_config, ProcessorList::default(), &registry)?;

    let worker_cancel = CancellationToken::new();
    let worker = OutputWorker::new(
        pipeline.queue(),
        Arc::new(DiscardOutput {
            delay: stress_config.output_delay,
        }),
        OutputSettings::from(pipeline_config),
        &*registry.new_registry("output")?,
    )?;
    let worker_handle = tokio::spawn({
        let cancel = worker_cancel.clone();
        async move { worker.run(cancel).await }
    });

    let inputs = registry.new_registry("inputs")?;
    let producer_cancel = CancellationToken::new();
    let mut producers = Vec::with_capacity(stress_config.producers);
    for index in 0..stress_config.producers {
        let input = InputRegistration::new(&inputs, "stress", &format!("producer.{index}"))?;
        let counters = Arc::new(CountingListener::registered(input.registry())?);
        let client_listener: Arc<dyn ClientListener> = counters.clone();
        let event_listener: Arc<dyn EventListener> = counters;
        let client = pipeline.connect_with(ClientConfig {
            publish_mode: stress_config.publish_mode,
            processing: ProcessingConfig {
                input_type: Some("stress".to_string()),
                ..Default::default()
            },
            wait_close: DEFAULT_WAIT_CLOSE,
            event_listener: Some(event_listener),
            client_listener: Some(Arc::new(CombinedClientListener::new(
                client_listener,
                Arc::new(ClosedLogger { index }),
            ))),
        })?;

        let cancel = producer_cancel.clone();
        producers.push(tokio::spawn(async move {
            let mut seq: u64 = 0;
            while !cancel.is_cancelled() {
                let event = Event::from_value(json!({
                    "message": format!("stress event {seq}"),
                    "producer": index,
                    "seq": seq,
                }));
                if client.publish(event).await.is_err() {
                    break;
                }
                seq += 1;
                // keep DropIfFull producers from starving the runtime
                if seq % 1024 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            if let Err(e) = client.close().await {
                warn!(producer = index, "failed to close client: {e}");
            }
            drop(input);
            seq
        }));
    }

    info!(
        producers = stress_config.producers,
        mode = ?stress_config.publish_mode,
        duration = ?stress_config.duration,
        "stress test started"
    );
    tokio::select! {
        () = sleep(stress_config.duration) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    // take the snapshot while inputs are still registered
    producer_cancel.cancel();
    let snapshot_before_close = registry.snapshot();

    let mut total = 0;
    for producer in producers {
        match producer.await {
            Ok(sent) => total += sent,
            Err(e) => error!("producer task failed: {e}"),
        }
    }

    pipeline.shutdown().await?;
    worker_cancel.cancel();
    worker_handle.await?;

    info!(total, "stress test finished");
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "inputs": snapshot_before_close["inputs"],
            "pipeline": registry.snapshot()["pipeline"],
            "queue": registry.snapshot()["queue"],
            "output": registry.snapshot()["output"],
        }))?
    );
    Ok(())
}

/// Logs the close of every producer client.
struct ClosedLogger {
    index: usize,
}

impl ClientListener for ClosedLogger {
    fn closed(&self) {
        debug!(producer = self.index, "producer client closed");
    }
}
