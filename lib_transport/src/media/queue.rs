//! # Intake Queue
//!
//! Many producers (UI-triggered fetches), a few consumers (the worker pool).
//! Tasks are ordered by `(priority, arrival)`, lower priority value first.
//! Every `fifo_every`-th dequeue serves the oldest eligible task instead, which
//! bounds how long a low-urgency task can wait behind a stream of urgent ones.
//!
//! Consumers pass a predicate so tasks the current media load mode forbids
//! stay queued instead of being dropped; [`IntakeQueue::wake_all`] makes
//! waiting consumers re-check after the predicate's inputs change.
//!
//! A dequeued task stays registered as running until the consumer calls
//! [`IntakeQueue::finish`]. Pushes are refused while the same item and kind
//! is waiting or running, and the check and the insert happen under one lock.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::core::errors::{TransportError, TransportResult};
use crate::media::registry::MediaKind;

/// One unit of media work. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFetchTask {
    /// Message the media belongs to.
    pub item_id: u64,
    /// Absolute source URL.
    pub url: String,
    /// Thumbnail or full-size.
    pub kind: MediaKind,
    /// Lower is more urgent.
    pub priority: i32,
    /// Cancellation generation captured at enqueue time.
    pub generation: u64,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<(i32, u64), MediaFetchTask>,
    running: HashSet<(u64, MediaKind)>,
    next_seq: u64,
    dequeued: u64,
    closed: bool,
}

impl QueueState {
    fn take_next<F>(&mut self, allowed: &F, fifo_every: u32) -> Option<MediaFetchTask>
    where
        F: Fn(MediaKind) -> bool,
    {
        let fifo_turn = fifo_every > 0 && (self.dequeued + 1) % u64::from(fifo_every) == 0;
        let key = if fifo_turn {
            self.pending
                .iter()
                .filter(|(_, task)| allowed(task.kind))
                .min_by_key(|((_, seq), _)| *seq)
                .map(|(key, _)| *key)
        } else {
            self.pending
                .iter()
                .find(|(_, task)| allowed(task.kind))
                .map(|(key, _)| *key)
        }?;
        self.dequeued += 1;
        let task = self.pending.remove(&key)?;
        self.running.insert((task.item_id, task.kind));
        Some(task)
    }

    fn is_known(&self, item_id: u64, kind: MediaKind) -> bool {
        self.running.contains(&(item_id, kind))
            || self
                .pending
                .values()
                .any(|task| task.item_id == item_id && task.kind == kind)
    }
}

/// # Intake Queue
pub struct IntakeQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    fifo_every: u32,
}

impl IntakeQueue {
    /// Empty, open queue. `fifo_every == 0` disables the FIFO turn.
    pub fn new(fifo_every: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            fifo_every,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// # Push
    ///
    /// Enqueues a task unless one for the same item and kind is waiting or
    /// running.
    ///
    /// # Returns
    /// `true` if queued, `false` for a duplicate. Fails once the queue is
    /// closed.
    pub fn push(&self, task: MediaFetchTask) -> TransportResult<bool> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(TransportError::QueueClosed);
            }
            if state.is_known(task.item_id, task.kind) {
                trace!(item_id = task.item_id, kind = ?task.kind, "Media task already queued or running");
                return Ok(false);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            trace!(item_id = task.item_id, kind = ?task.kind, priority = task.priority, "Media task queued");
            state.pending.insert((task.priority, seq), task);
        }
        self.notify.notify_one();
        Ok(true)
    }

    /// Non-blocking dequeue of the next task `allowed` accepts.
    pub fn try_pop<F>(&self, allowed: F) -> Option<MediaFetchTask>
    where
        F: Fn(MediaKind) -> bool,
    {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.take_next(&allowed, self.fifo_every)
    }

    /// # Pop
    ///
    /// Waits for a task `allowed` accepts.
    ///
    /// # Returns
    /// `None` once the queue is closed or `cancel` fires.
    pub async fn pop<F>(&self, allowed: F, cancel: &CancellationToken) -> Option<MediaFetchTask>
    where
        F: Fn(MediaKind) -> bool,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed.
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(task) = state.take_next(&allowed, self.fifo_every) {
                    return Some(task);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Whether a task for `item_id`/`kind` is waiting or running.
    pub fn contains(&self, item_id: u64, kind: MediaKind) -> bool {
        self.lock().is_known(item_id, kind)
    }

    /// Whether any task of `item_id` is waiting or running.
    pub fn holds_item(&self, item_id: u64) -> bool {
        let state = self.lock();
        state.running.iter().any(|(id, _)| *id == item_id)
            || state.pending.values().any(|task| task.item_id == item_id)
    }

    /// Marks a dequeued task as done.
    pub fn finish(&self, item_id: u64, kind: MediaKind) {
        self.lock().running.remove(&(item_id, kind));
    }

    /// # Withdraw
    ///
    /// Drops every pending task of `item_id`.
    ///
    /// # Returns
    /// How many tasks were removed, and whether a task of the item is
    /// running, both read under the same lock.
    pub fn withdraw(&self, item_id: u64) -> (usize, bool) {
        let mut state = self.lock();
        let before = state.pending.len();
        state.pending.retain(|_, task| task.item_id != item_id);
        let running = state.running.iter().any(|(id, _)| *id == item_id);
        (before - state.pending.len(), running)
    }

    /// Wakes every waiting consumer so it re-evaluates its predicate.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    /// Rejects further pushes, drops pending work and releases all consumers.
    /// Returns the number of tasks dropped.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            state.closed = true;
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        };
        self.notify.notify_waiters();
        dropped
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of waiting tasks.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// `true` when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
