//! # Core Engine Module
//!
//! Shared types and the pieces that tie the transport layer together.
//!
//! ## Core Components:
//!
//! - **`types`** / **`events`** / **`errors`**: the value types, the single
//!   event enum delivered to the application, and the crate error.
//! - **`watermark`**: the highest message id seen across both transports.
//! - **`dispatcher`**: the watermark check between the clients and the
//!   application's event stream.
//! - **`collaborators`**: traits for the session provider and local
//!   persistence the host application supplies.
//! - **`coordinator`**: the mode-switching state machine and the send API.
//! - **`engine`**: builds, starts and tears down the whole stack.

/// Host application interfaces.
pub mod collaborators;
/// The mode-switching coordinator.
pub mod coordinator;
/// Watermark-filtered delivery to the application.
pub mod dispatcher;
/// Stack assembly and lifecycle.
pub mod engine;
/// Crate error type.
pub mod errors;
/// Application event enum.
pub mod events;
/// Shared value types.
pub mod types;
/// Highest-seen message id.
pub mod watermark;

// --- Public API Re-exports ---
pub use collaborators::{LocalPersistence, NoopPersistence, SessionProvider, StaticSession};
pub use coordinator::TransportCoordinator;
pub use dispatcher::InboundDispatcher;
pub use engine::TransportEngine;
pub use errors::{TransportError, TransportResult};
pub use events::{SendRoute, TransportEvent};
pub use types::{
    ConnectionQuality, ConnectionState, InboundMessageEvent, Latency, MediaLoadMode, MessageTarget,
    OutboundMessage, QualitySample, TransportMode,
};
pub use watermark::Watermark;
