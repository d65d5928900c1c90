//! # Transport Policy
//!
//! Pure decision functions over the connection signal: quality
//! classification, media load mode, channel vs. polling, and the derived
//! helpers the application queries. No I/O, no hidden state.

use crate::core::types::{ConnectionQuality, ConnectionState, Latency, MediaLoadMode};

/// Upper bound (exclusive) of the Excellent bucket.
pub const EXCELLENT_BELOW_MS: u64 = 200;
/// Upper bound (exclusive) of the Good bucket.
pub const GOOD_BELOW_MS: u64 = 500;
/// Upper bound (exclusive) of the Poor bucket.
pub const POOR_BELOW_MS: u64 = 2_000;

/// Handshake and reconnect timings for a channel opened at some quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimings {
    /// First reconnect delay.
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap.
    pub reconnect_max_ms: u64,
    /// Handshake bound.
    pub connect_timeout_ms: u64,
}

/// Namespace for the policy functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportPolicy;

impl TransportPolicy {
    /// Buckets a smoothed latency.
    pub fn classify(latency: Latency) -> ConnectionQuality {
        match latency {
            Latency::Millis(ms) if ms < EXCELLENT_BELOW_MS => ConnectionQuality::Excellent,
            Latency::Millis(ms) if ms < GOOD_BELOW_MS => ConnectionQuality::Good,
            Latency::Millis(ms) if ms < POOR_BELOW_MS => ConnectionQuality::Poor,
            _ => ConnectionQuality::Offline,
        }
    }

    /// Media allowance for a quality on a metered or unmetered link.
    pub fn media_load_mode(quality: ConnectionQuality, is_metered: bool) -> MediaLoadMode {
        match quality {
            ConnectionQuality::Excellent if is_metered => MediaLoadMode::ThumbnailsOnly,
            ConnectionQuality::Excellent => MediaLoadMode::Full,
            ConnectionQuality::Good => MediaLoadMode::ThumbnailsOnly,
            ConnectionQuality::Poor | ConnectionQuality::Offline => MediaLoadMode::None,
        }
    }

    /// `true` when the persistent channel should carry traffic.
    pub fn decide(quality: ConnectionQuality) -> bool {
        matches!(quality, ConnectionQuality::Excellent | ConnectionQuality::Good)
    }

    /// Whether outbound messages may carry a media URL.
    pub fn allows_outbound_media(quality: ConnectionQuality) -> bool {
        Self::decide(quality)
    }

    /// Channel timings for `quality`. Worse links back off longer and wait
    /// longer for the handshake.
    pub fn channel_timings(quality: ConnectionQuality) -> ChannelTimings {
        let (reconnect_initial_ms, reconnect_max_ms, connect_timeout_ms) = match quality {
            ConnectionQuality::Excellent => (500, 2_000, 10_000),
            ConnectionQuality::Good => (1_000, 5_000, 15_000),
            ConnectionQuality::Poor => (2_000, 10_000, 30_000),
            ConnectionQuality::Offline => (5_000, 20_000, 60_000),
        };
        ChannelTimings {
            reconnect_initial_ms,
            reconnect_max_ms,
            connect_timeout_ms,
        }
    }

    /// Page size the application should request when listing messages.
    pub fn recommended_batch_size(quality: ConnectionQuality) -> u32 {
        match quality {
            ConnectionQuality::Excellent => 50,
            ConnectionQuality::Good => 30,
            ConnectionQuality::Poor => 10,
            ConnectionQuality::Offline => 0,
        }
    }

    /// Any media (thumbnails at least) may be fetched.
    pub fn can_load_media(mode: MediaLoadMode) -> bool {
        mode != MediaLoadMode::None
    }

    /// Full-size media may be fetched.
    pub fn can_load_full_media(mode: MediaLoadMode) -> bool {
        mode == MediaLoadMode::Full
    }

    /// Short human readable summary of a state.
    pub fn describe(state: &ConnectionState) -> String {
        let latency = state.smoothed_latency();
        match state.quality() {
            ConnectionQuality::Excellent => format!("Excellent connection ({latency})"),
            ConnectionQuality::Good => format!("Good connection ({latency})"),
            ConnectionQuality::Poor => format!("Poor connection ({latency})"),
            ConnectionQuality::Offline => "No connection".to_string(),
        }
    }
}

/// Consecutive trailing failures that force the smoothed value to unreachable.
pub const FAILURE_STREAK: usize = 2;

/// # Smooth
///
/// Arithmetic mean of the numeric samples, oldest first. An isolated failed
/// sample is absorbed; once the newest [`FAILURE_STREAK`] samples all failed,
/// or no numeric sample exists, the result is [`Latency::Unreachable`].
pub fn smooth<'a, I>(samples: I) -> Latency
where
    I: IntoIterator<Item = &'a Latency>,
{
    let mut sum = 0_u64;
    let mut count = 0_u64;
    let mut trailing_failures = 0_usize;
    for sample in samples {
        match sample.millis() {
            Some(ms) => {
                sum = sum.saturating_add(ms);
                count += 1;
                trailing_failures = 0;
            }
            None => trailing_failures += 1,
        }
    }
    if count == 0 || trailing_failures >= FAILURE_STREAK {
        Latency::Unreachable
    } else {
        Latency::Millis(sum / count)
    }
}
