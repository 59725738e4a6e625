// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Event Pipeline
//!
//! In-process publishing pipeline of a telemetry agent. Producers connect a
//! [`Client`] to the [`Pipeline`] and publish [`Event`]s; each event runs
//! through the client's processor chain, waits in a bounded [`Queue`] and is
//! delivered by an output, which reports back so the producer's listener
//! learns which events were acknowledged.
//!
//! ```text
//!  Client::publish ─> processors ─> Queue ─> OutputWorker ─> Output
//!        ▲                                        │
//!        └──────── EventListener::ack_events ◄────┘
//! ```
//!
//! Delivery is at-least-once for [`PublishMode::GuaranteedSend`] and best
//! effort for the other modes.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod ack;
pub mod client;
pub mod config;
pub mod dynamic;
pub mod errors;
pub mod event;
pub mod listener;
pub mod monitoring;
pub mod output;
pub mod pipeline;
pub mod processing;
pub mod queue;

pub use ack::ClientId;
pub use client::{Client, ClientConfig, PublishMode};
pub use config::PipelineConfig;
pub use dynamic::DynamicFields;
pub use errors::{
    ClientClosedError, ConfigError, DeliveryError, PipelineError, ProcessorError, RegistryError,
};
pub use event::Event;
pub use listener::{ClientListener, EventListener};
pub use monitoring::Registry;
pub use output::{Output, OutputSettings, OutputWorker};
pub use pipeline::Pipeline;
pub use processing::{ProcessingConfig, Processor, ProcessorList, Verdict};
pub use queue::{Batch, OnFailure, Queue};
