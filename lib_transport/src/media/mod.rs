//! # Media Fetch Module
//!
//! Opportunistic, quality-aware downloading of thumbnails and full-size media.
//!
//! ## Contained Modules:
//! - **`queue`**: the single shared intake queue, priority first with a FIFO
//!   turn every few dequeues so nothing starves.
//! - **`cache`**: the on-disk cache keyed by item id and kind.
//! - **`registry`**: per-item progress observables and cancellation generations.
//! - **`scheduler`**: the fixed worker pool tying the three together.

/// On-disk media cache.
pub mod cache;
/// Shared intake queue.
pub mod queue;
/// Per-item progress observables.
pub mod registry;
/// Worker pool and public fetch API.
pub mod scheduler;

// --- Public API Re-exports ---
pub use cache::MediaCache;
pub use queue::{IntakeQueue, MediaFetchTask};
pub use registry::{MediaKind, MediaLoadState, MediaProgress, ProgressRegistry};
pub use scheduler::MediaFetchScheduler;
