//! # Inbound Dispatcher
//!
//! The last hop between the delivery clients and the application. Every
//! message from either client is checked for duplicates before it is handed
//! to the single application subscriber; all other event kinds pass straight
//! through.
//!
//! ## Duplicate rules
//! - Polling pages arrive in ascending order from the watermark, so a polled
//!   id at or below the [`Watermark`] is dropped.
//! - The channel pushes in arrival order, which may be out of id order. A
//!   pushed id is only dropped when it is at or below the watermark captured
//!   when the channel started (polling already covered it) or when it was
//!   delivered recently.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::core::events::TransportEvent;
use crate::core::types::{InboundMessageEvent, TransportMode};
use crate::core::watermark::Watermark;

/// Delivered ids remembered for exact-repeat suppression.
pub const RECENT_IDS: usize = 512;

#[derive(Default)]
struct RecentIds {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl RecentIds {
    fn contains(&self, id: u64) -> bool {
        self.seen.contains(&id)
    }

    fn insert(&mut self, id: u64) {
        if !self.seen.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > RECENT_IDS {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

/// # Inbound Dispatcher
pub struct InboundDispatcher {
    watermark: Arc<Watermark>,
    channel_floor: AtomicU64,
    recent: Mutex<RecentIds>,
    app_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl InboundDispatcher {
    /// Creates the dispatcher and the receiver the application reads from.
    pub fn new(watermark: Arc<Watermark>) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            channel_floor: AtomicU64::new(watermark.get()),
            watermark,
            recent: Mutex::new(RecentIds::default()),
            app_tx,
        };
        (dispatcher, app_rx)
    }

    /// Captures the watermark as the floor for pushed messages. Called each
    /// time a channel client is started.
    pub fn begin_channel(&self) {
        let floor = self.watermark.get();
        self.channel_floor.store(floor, Ordering::Release);
        debug!(floor, "Channel floor captured");
    }

    /// # Dispatch
    ///
    /// Forwards `event` to the application.
    ///
    /// # Returns
    /// `false` when a message was dropped as already seen, `true` otherwise.
    pub fn dispatch(&self, event: TransportEvent) -> bool {
        if let TransportEvent::Message(ref msg) = event {
            if !self.accept(msg) {
                trace!(id = msg.id, via = ?msg.via, watermark = self.watermark.get(), "Dropping already delivered message");
                return false;
            }
        }
        if self.app_tx.send(event).is_err() {
            debug!("Application event receiver dropped; event discarded");
        }
        true
    }

    fn accept(&self, msg: &InboundMessageEvent) -> bool {
        let mut recent = self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if recent.contains(msg.id) {
            return false;
        }
        let raised = self.watermark.observe(msg.id);
        let fresh = match msg.via {
            TransportMode::Polling => raised,
            TransportMode::PersistentChannel => msg.id > self.channel_floor.load(Ordering::Acquire),
        };
        if fresh {
            recent.insert(msg.id);
        }
        fresh
    }

    /// Shared watermark handle.
    pub fn watermark(&self) -> &Arc<Watermark> {
        &self.watermark
    }
}
