//! # Delivery Clients Module
//!
//! The two ways inbound messages reach the client. Exactly one of them is
//! active at a time; the [`crate::core::coordinator`] decides which.
//!
//! ## Contained Modules:
//! - **`channel_client`**: the persistent Socket.IO session with automatic
//!   reconnection, query-parameter auth and the mandatory `join` emit.
//! - **`polling_client`**: the REST fallback that fetches "messages after
//!   cursor" on a fixed interval.
//!
//! Both push [`crate::core::TransportEvent`]s into a channel owned by the
//! coordinator, which applies the watermark before anything reaches the
//! application.

/// The persistent WebSocket channel.
pub mod channel_client;
/// The REST polling fallback.
pub mod polling_client;

// --- Public API Re-exports ---
pub use channel_client::{ChannelState, PersistentChannelClient};
pub use polling_client::{PollResult, PollingFallbackClient};
