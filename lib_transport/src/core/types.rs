//! # Shared Transport Types
//!
//! Value types that flow between the sampler, the policy, the two delivery
//! clients and the application.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::quality::policy::TransportPolicy;

/// Quality bucket derived from smoothed probe latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionQuality {
    /// Mean latency below 200ms.
    Excellent,
    /// Mean latency below 500ms.
    Good,
    /// Mean latency below 2000ms.
    Poor,
    /// Unreachable, no interface, or 2000ms and above.
    Offline,
}

/// How much media the client may fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaLoadMode {
    /// Thumbnails and full-size media.
    Full,
    /// Thumbnails only.
    ThumbnailsOnly,
    /// No media bytes at all.
    None,
}

/// Round-trip latency of one probe, or the lack of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Latency {
    /// Measured round trip in milliseconds.
    Millis(u64),
    /// The probe timed out, failed, or no interface was up.
    Unreachable,
}

impl Latency {
    /// Numeric value, if any.
    pub fn millis(self) -> Option<u64> {
        match self {
            Latency::Millis(ms) => Some(ms),
            Latency::Unreachable => None,
        }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Latency::Millis(ms) => write!(f, "{ms}ms"),
            Latency::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// One entry of the sampler's history ring.
#[derive(Debug, Clone, Copy)]
pub struct QualitySample {
    /// Probe outcome.
    pub latency: Latency,
    /// Monotonic time the sample was taken.
    pub taken_at: Instant,
}

/// # Connection State
///
/// The single published connection signal. The media load mode is never
/// stored independently: every constructor derives it from quality and
/// meteredness, so the two can not drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    quality: ConnectionQuality,
    media_load_mode: MediaLoadMode,
    smoothed_latency: Latency,
    is_metered: bool,
    downstream_kbps: u32,
}

impl ConnectionState {
    /// Builds a state, deriving the media load mode.
    pub fn new(
        quality: ConnectionQuality,
        smoothed_latency: Latency,
        is_metered: bool,
        downstream_kbps: u32,
    ) -> Self {
        Self {
            quality,
            media_load_mode: TransportPolicy::media_load_mode(quality, is_metered),
            smoothed_latency,
            is_metered,
            downstream_kbps,
        }
    }

    /// State before the first sample: offline, nothing measured.
    pub fn initial() -> Self {
        Self::new(ConnectionQuality::Offline, Latency::Unreachable, false, 0)
    }

    /// Current quality bucket.
    pub fn quality(&self) -> ConnectionQuality {
        self.quality
    }

    /// Media load mode derived from quality and meteredness.
    pub fn media_load_mode(&self) -> MediaLoadMode {
        self.media_load_mode
    }

    /// Smoothed latency the quality was classified from.
    pub fn smoothed_latency(&self) -> Latency {
        self.smoothed_latency
    }

    /// Whether the active link is metered.
    pub fn is_metered(&self) -> bool {
        self.is_metered
    }

    /// Last downstream bandwidth estimate reported by the platform.
    pub fn downstream_kbps(&self) -> u32 {
        self.downstream_kbps
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::initial()
    }
}

/// Which delivery client is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportMode {
    /// Long-lived Socket.IO session.
    PersistentChannel,
    /// Periodic REST fetches of "messages after cursor".
    Polling,
}

/// Where an inbound message was addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageTarget {
    /// One-to-one chat; `to_id` is the recipient user.
    Direct {
        /// Recipient user id.
        to_id: u64,
    },
    /// Group chat.
    Group {
        /// Group id.
        group_id: u64,
    },
}

/// A validated inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessageEvent {
    /// Server message id. Totally ordered; identity of the message.
    pub id: u64,
    /// Sender user id.
    pub from_id: u64,
    /// Recipient user or group.
    pub target: MessageTarget,
    /// Message text (plain or ciphertext, passed through untouched).
    pub body: String,
    /// Server timestamp, unix seconds.
    pub timestamp: i64,
    /// Server message type (`text`, `image`, ...).
    pub kind: String,
    /// Media URL when the transport carried one.
    pub media_url: Option<String>,
    /// Transport that delivered it.
    pub via: TransportMode,
}

/// An outbound chat message after the media policy has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Recipient user id.
    pub recipient_id: u64,
    /// Message text.
    pub text: String,
    /// Media URL; `None` when stripped by policy.
    pub media_url: Option<String>,
    /// Client generated id used by the server for echo/dedup.
    pub client_message_id: String,
}
