//! # Connection Quality Module
//!
//! Everything that turns raw round trips into the single published
//! [`crate::core::ConnectionState`].
//!
//! - **`probe`**: the health endpoint probe and the interface check, behind traits.
//! - **`sampler`**: the periodic sampling loop with its smoothing ring.
//! - **`policy`**: pure classification and switching rules.

/// Pure decision functions.
pub mod policy;
/// Health probe and link monitor.
pub mod probe;
/// The sampling loop.
pub mod sampler;

// --- Public API Re-exports ---
pub use policy::TransportPolicy;
pub use probe::{HealthProbe, HttpHealthProbe, LinkMonitor, SystemLink};
pub use sampler::{ConnectivityEvent, QualitySampler};
