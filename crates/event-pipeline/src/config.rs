// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::ConfigError;
use crate::queue::QueueSettings;

const DEFAULT_QUEUE_MAX_EVENTS: usize = 4096;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5000;
const DEFAULT_BATCH_MAX_EVENTS: usize = 50;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_INIT_MS: u64 = 1000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;

/// Pipeline and output worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of events held by the queue, in flight included
    pub queue_max_events: usize,
    /// Optional byte budget of the queue
    pub queue_max_bytes: Option<usize>,
    /// How long shutdown waits for the queue to drain
    pub drain_timeout_ms: u64,
    /// Maximum number of events per output batch
    pub batch_max_events: usize,
    /// Optional byte budget per output batch
    pub batch_max_bytes: Option<usize>,
    /// Delivery attempts before a failed event is dropped
    pub max_retries: u32,
    pub backoff_init_ms: u64,
    pub backoff_max_ms: u64,
    /// Injected as `host.name` into events that do not carry one
    pub host_name: Option<String>,
    /// Normalize dotted keys into nested objects unless a client opts out
    pub event_normalization: bool,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_max_events: DEFAULT_QUEUE_MAX_EVENTS,
            queue_max_bytes: None,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            batch_max_events: DEFAULT_BATCH_MAX_EVENTS,
            batch_max_bytes: None,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_init_ms: DEFAULT_BACKOFF_INIT_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            host_name: None,
            event_normalization: true,
            log_level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Create configuration from `PIPELINE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`PipelineConfig::from_env`], reading variables through `lookup`.
    /// Unset or unparsable values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|val| val.trim().parse::<u64>().ok());
        let parse_usize = |key: &str| parse(key).and_then(|val| usize::try_from(val).ok());

        let config = Self {
            queue_max_events: parse_usize("PIPELINE_QUEUE_MAX_EVENTS")
                .unwrap_or(defaults.queue_max_events),
            queue_max_bytes: parse_usize("PIPELINE_QUEUE_MAX_BYTES"),
            drain_timeout_ms: parse("PIPELINE_DRAIN_TIMEOUT_MS")
                .unwrap_or(defaults.drain_timeout_ms),
            batch_max_events: parse_usize("PIPELINE_BATCH_MAX_EVENTS")
                .unwrap_or(defaults.batch_max_events),
            batch_max_bytes: parse_usize("PIPELINE_BATCH_MAX_BYTES"),
            max_retries: parse("PIPELINE_MAX_RETRIES")
                .and_then(|val| u32::try_from(val).ok())
                .unwrap_or(defaults.max_retries),
            backoff_init_ms: parse("PIPELINE_BACKOFF_INIT_MS").unwrap_or(defaults.backoff_init_ms),
            backoff_max_ms: parse("PIPELINE_BACKOFF_MAX_MS").unwrap_or(defaults.backoff_max_ms),
            host_name: lookup("PIPELINE_HOST_NAME").filter(|val| !val.trim().is_empty()),
            event_normalization: lookup("PIPELINE_EVENT_NORMALIZATION")
                .map(|val| val.to_lowercase() != "false")
                .unwrap_or(defaults.event_normalization),
            log_level: lookup("PIPELINE_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_max_events == 0 {
            return Err(ConfigError::Invalid(
                "queue_max_events must be greater than 0".to_string(),
            ));
        }
        if self.queue_max_bytes == Some(0) {
            return Err(ConfigError::Invalid(
                "queue_max_bytes must be greater than 0 when set".to_string(),
            ));
        }
        if self.batch_max_events == 0 {
            return Err(ConfigError::Invalid(
                "batch_max_events must be greater than 0".to_string(),
            ));
        }
        if self.backoff_init_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_init_ms ({}) must not exceed backoff_max_ms ({})",
                self.backoff_init_ms, self.backoff_max_ms
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_events: self.queue_max_events,
            max_bytes: self.queue_max_bytes,
        }
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    #[must_use]
    pub fn backoff_init(&self) -> Duration {
        Duration::from_millis(self.backoff_init_ms)
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}
