//! # Loggers Module
//!
//! Subscriber setup for the `tracing` events emitted throughout the crate.
//! Library code only ever uses the `tracing` macros; installing a subscriber
//! is left to binaries, which call [`setup_logging`] once at startup.

/// Console + daily rolling JSON file subscriber.
pub mod tracing_setup;

// --- Public API Re-exports ---
pub use tracing_setup::setup_logging;
