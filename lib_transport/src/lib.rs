//! # lib_transport
//!
//! Adaptive realtime transport layer for the WorldMates messenger client.
//!
//! The crate decides, moment to moment, whether messages travel over the
//! persistent Socket.IO channel or over stateless REST polling, and which media
//! bytes are worth fetching under the current connection.
//!
//! ## Layout
//! - [`configs`]: serde configuration tree with defaults and JSON loading.
//! - [`loggers`]: console + rolling JSON file `tracing` subscriber (feature `loggers`).
//! - [`core`]: shared types, errors, the watermark, the coordinator and the engine.
//! - [`quality`]: latency sampling, classification and transport policy.
//! - [`wire`]: Socket.IO framing and inbound payload validation.
//! - [`ingestors`]: the persistent channel and polling fallback clients.
//! - [`retrieve`]: the REST business API client.
//! - [`media`]: the prioritised, cached media fetch scheduler.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod core;
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;
pub mod media;
pub mod quality;
pub mod retrieve;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

// --- Public API Re-exports ---
pub use crate::configs::TransportConfig;
pub use crate::core::{
    ConnectionQuality, ConnectionState, InboundMessageEvent, MediaLoadMode, TransportCoordinator,
    TransportEngine, TransportError, TransportEvent, TransportMode, TransportResult,
};
pub use crate::media::{MediaFetchScheduler, MediaKind, MediaLoadState, MediaProgress};
pub use crate::quality::{QualitySampler, TransportPolicy};
