// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Invalid client, queue or output configuration. Surfaced synchronously at
/// connect or construction time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown publish mode {0}")]
    InvalidPublishMode(u8),

    #[error("invalid field key {0:?}: keys must be non-empty and must not contain empty path segments")]
    InvalidFieldKey(String),

    #[error("invalid processing rule '{name}': {reason}")]
    InvalidRule { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Returned by `publish` once the client (or the whole pipeline) stopped
/// accepting events. The rejected event is not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client is closed")]
pub struct ClientClosedError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to register pipeline metrics: {0}")]
    Registry(#[from] RegistryError),

    #[error("pipeline is shut down")]
    Closed,
}

/// A processor failed on an event. Recovered locally: the event is dropped
/// for the publishing client and the failure is logged.
#[derive(Debug, thiserror::Error)]
#[error("processor '{processor}' failed: {reason}")]
pub struct ProcessorError {
    pub processor: String,
    pub reason: String,
}

impl ProcessorError {
    pub fn new(processor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            processor: processor.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("name '{0}' is already registered")]
    Duplicate(String),

    #[error("invalid metric name {0:?}")]
    InvalidName(String),
}

/// Delivery failure reported by an output for one batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The sink could not be reached or asked us to retry later.
    #[error("temporary delivery failure: {0}")]
    Temporary(String),

    /// The sink rejected the payload; retrying will not help.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    /// The first `acked` events were accepted, the rest failed temporarily.
    #[error("partial delivery ({acked} accepted): {reason}")]
    Partial { acked: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::InvalidPublishMode(7);
        assert_eq!(error.to_string(), "unknown publish mode 7");

        let error = ProcessorError::new("add_fields", "boom");
        assert_eq!(error.to_string(), "processor 'add_fields' failed: boom");
    }

    #[test]
    fn test_pipeline_error_from_config() {
        let error: PipelineError = ConfigError::Invalid("queue_max_events must be > 0".into()).into();
        assert!(matches!(error, PipelineError::Config(_)));
        assert_eq!(
            error.to_string(),
            "invalid configuration: queue_max_events must be > 0"
        );
    }
}
