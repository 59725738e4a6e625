// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-event transformation applied before queue admission.
//!
//! ```text
//!   client processors
//!          │
//!   normalization ── fields/tags/meta ── dynamic fields ── host.name ── input.type
//!          │
//!   pipeline processors
//!          │
//!   null pruning ──> queue
//! ```
//!
//! A processor returning [`Verdict::Drop`] filters the event. A processor
//! error stops the chain for that event and the event is dropped.

pub mod builtin;
pub mod rules;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::dynamic::DynamicFields;
use crate::errors::{ConfigError, ProcessorError};
use crate::event::{validate_keys, Event};
use builtin::{AddDynamicFields, AddFields, DropNulls, Normalize, SetField};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Drop,
}

pub trait Processor: fmt::Display + Send + Sync {
    fn run(&self, event: &mut Event) -> Result<Verdict, ProcessorError>;

    /// Releases held resources. Called once, after no event can reach the
    /// processor anymore.
    fn close(&self) -> Result<(), ProcessorError> {
        Ok(())
    }
}

/// An ordered list of processors, itself a processor. Clones share the
/// closed state so the list is closed at most once. A list handed to several
/// clients is closed when the last of them closes.
#[derive(Clone, Default)]
pub struct ProcessorList {
    processors: Vec<Arc<dyn Processor>>,
    closed: Arc<AtomicBool>,
    /// Client chains running this list.
    owners: Arc<AtomicUsize>,
}

impl ProcessorList {
    #[must_use]
    pub fn new(processors: Vec<Arc<dyn Processor>>) -> Self {
        Self {
            processors,
            closed: Arc::new(AtomicBool::new(false)),
            owners: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&mut self, processor: Arc<dyn Processor>) {
        self.processors.push(processor);
    }

    #[must_use]
    pub fn all(&self) -> &[Arc<dyn Processor>] {
        &self.processors
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn retain(&self) {
        self.owners.fetch_add(1, Ordering::AcqRel);
    }

    /// Closes the list once no owner is left.
    fn release(&self) -> Result<(), ProcessorError> {
        if self.owners.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.close()
        } else {
            Ok(())
        }
    }

    pub fn close(&self) -> Result<(), ProcessorError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let failures: Vec<String> = self
            .processors
            .iter()
            .filter_map(|p| p.close().err())
            .map(|e| e.to_string())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProcessorError::new(self.to_string(), failures.join("; ")))
        }
    }
}

impl Processor for ProcessorList {
    fn run(&self, event: &mut Event) -> Result<Verdict, ProcessorError> {
        for processor in &self.processors {
            if processor.run(event)? == Verdict::Drop {
                return Ok(Verdict::Drop);
            }
        }
        Ok(Verdict::Keep)
    }

    fn close(&self) -> Result<(), ProcessorError> {
        ProcessorList::close(self)
    }
}

impl fmt::Display for ProcessorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.processors.iter().map(|p| p.to_string()).collect();
        write!(f, "processors=[{}]", names.join(", "))
    }
}

impl FromIterator<Arc<dyn Processor>> for ProcessorList {
    fn from_iter<T: IntoIterator<Item = Arc<dyn Processor>>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Wraps a closure as a processor.
pub struct FnProcessor<F> {
    name: String,
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&mut Event) -> Result<Verdict, ProcessorError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Event) -> Result<Verdict, ProcessorError> + Send + Sync,
{
    fn run(&self, event: &mut Event) -> Result<Verdict, ProcessorError> {
        (self.f)(event)
    }
}

impl<F> fmt::Display for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Processing settings a client passes on connect. Merged into every event
/// published through that client.
#[derive(Clone, Default)]
pub struct ProcessingConfig {
    /// Fields merged into every event.
    pub fields: Map<String, Value>,
    /// Appended to the event `tags` array, without duplicates.
    pub tags: Vec<String>,
    /// Merged into the event metadata.
    pub meta: Map<String, Value>,
    /// Fields resolved when the event is processed, not on connect.
    pub dynamic_fields: Option<DynamicFields>,
    /// Run before the pipeline processors. Closed when the client closes.
    pub processors: ProcessorList,
    pub keep_null: bool,
    pub disable_host: bool,
    pub disable_type: bool,
    /// Overrides the pipeline default for dotted key expansion.
    pub event_normalization: Option<bool>,
    /// Written to `input.type` unless `disable_type` is set.
    pub input_type: Option<String>,
}

impl ProcessingConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        validate_keys(&self.fields).map_err(ConfigError::InvalidFieldKey)?;
        validate_keys(&self.meta).map_err(ConfigError::InvalidFieldKey)?;
        if let Some(tag) = self.tags.iter().find(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("empty tag {tag:?}")));
        }
        Ok(())
    }
}

/// Pipeline wide settings used to assemble every client's chain.
#[derive(Clone, Default)]
pub(crate) struct ChainSettings {
    pub host_name: Option<String>,
    pub normalize: bool,
    pub global: ProcessorList,
}

/// The processors one client's events run through.
pub(crate) struct Chain {
    stages: Vec<Arc<dyn Processor>>,
    client: ProcessorList,
    released: AtomicBool,
}

impl Chain {
    pub(crate) fn build(settings: &ChainSettings, config: &ProcessingConfig) -> Self {
        let mut stages: Vec<Arc<dyn Processor>> = Vec::new();

        if !config.processors.is_empty() {
            stages.push(Arc::new(config.processors.clone()));
        }
        if config.event_normalization.unwrap_or(settings.normalize) {
            stages.push(Arc::new(Normalize));
        }
        if !config.fields.is_empty() || !config.tags.is_empty() || !config.meta.is_empty() {
            stages.push(Arc::new(AddFields::new(
                config.fields.clone(),
                config.tags.clone(),
                config.meta.clone(),
            )));
        }
        if let Some(dynamic) = &config.dynamic_fields {
            stages.push(Arc::new(AddDynamicFields::new(dynamic.clone())));
        }
        if let (false, Some(host)) = (config.disable_host, &settings.host_name) {
            stages.push(Arc::new(SetField::new(
                "host.name",
                Value::String(host.clone()),
                false,
            )));
        }
        if let (false, Some(input_type)) = (config.disable_type, &config.input_type) {
            stages.push(Arc::new(SetField::new(
                "input.type",
                Value::String(input_type.clone()),
                true,
            )));
        }
        if !settings.global.is_empty() {
            stages.push(Arc::new(settings.global.clone()));
        }
        if !config.keep_null {
            stages.push(Arc::new(DropNulls));
        }

        config.processors.retain();
        Self {
            stages,
            client: config.processors.clone(),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn run(&self, event: &mut Event) -> Result<Verdict, ProcessorError> {
        for stage in &self.stages {
            if stage.run(event)? == Verdict::Drop {
                return Ok(Verdict::Drop);
            }
        }
        Ok(Verdict::Keep)
    }

    /// Releases the client processors, closing them if no other client runs
    /// them. Pipeline processors are closed by the pipeline on shutdown.
    pub(crate) fn close(&self) -> Result<(), ProcessorError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client.release()
    }
}
