//! # Wire Module
//!
//! Everything that touches raw bytes or raw JSON from the network.
//!
//! ## Contained Modules:
//! - **`socketio`**: Engine.IO / Socket.IO v4 text packet codec.
//! - **`events`**: schema validation turning channel and REST payloads into
//!   typed events, including the legacy presence markup.

/// Engine.IO / Socket.IO v4 text packet codec.
pub mod socketio;
/// Inbound payload validation.
pub mod events;

// --- Public API Re-exports ---
pub use events::{parse_channel_event, parse_message};
pub use socketio::{decode, encode_event, Packet};
