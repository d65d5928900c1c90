//! # Transport Events
//!
//! A single tagged union for everything the transport layer reports, both
//! from the delivery clients to the coordinator and from the coordinator to
//! the application.

use crate::core::types::{ConnectionState, InboundMessageEvent, TransportMode};

/// # Transport Event
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A new chat message. Already deduplicated against the watermark when it
    /// reaches the application.
    Message(InboundMessageEvent),
    /// A peer started or stopped typing.
    Typing {
        /// User who is typing.
        sender_id: u64,
        /// `true` while typing.
        is_typing: bool,
    },
    /// A user came online or went offline.
    Presence {
        /// Affected user.
        user_id: u64,
        /// `true` when online.
        online: bool,
    },
    /// Last-seen heartbeat of a user.
    LastSeen {
        /// Affected user.
        user_id: u64,
        /// Unix seconds.
        last_seen: i64,
    },
    /// A message was read by its recipient.
    ReadReceipt {
        /// Message that was read.
        message_id: u64,
        /// Reader.
        user_id: u64,
    },
    /// The persistent channel finished its handshake and join.
    ChannelConnected,
    /// The persistent channel lost its session (it will reconnect on its own).
    ChannelDisconnected,
    /// The persistent channel could not be opened repeatedly.
    ChannelUnavailable {
        /// Consecutive failed attempts.
        attempts: u32,
        /// Last connect error.
        reason: String,
    },
    /// The active delivery client changed.
    ModeChanged(TransportMode),
    /// The sampler published a new connection state.
    QualityChanged(ConnectionState),
    /// A failure that changes what the application can rely on.
    Error(String),
}

/// Path an outbound message actually took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRoute {
    /// Emitted over the persistent channel.
    Channel,
    /// Sent through the REST API because polling is active.
    Rest,
    /// The channel rejected the send; the REST API took it instead.
    RestFallback,
}
