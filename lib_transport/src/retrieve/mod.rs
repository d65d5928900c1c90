//! # Data Retrieval Module
//!
//! The REST side of the business API: sending messages when the persistent
//! channel is not carrying them, fetching "messages after cursor" for the
//! polling fallback, and downloading media bytes.
//!
//! ## Contained Modules:
//!
//! - **`rest_api`**: the [`BusinessApi`] seam and its `reqwest`
//!   implementation. Every call is a single attempt; retrying is the caller's
//!   business (the polling loop retries by its own cadence).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// REST business API client.
pub mod rest_api;

// --- Public API Re-exports ---
pub use rest_api::{BusinessApi, FetchFilter, RestApiClient};
