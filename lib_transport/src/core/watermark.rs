//! # Message Watermark
//!
//! Lock-free record of the highest message id observed across both delivery
//! clients. Ids are totally ordered, so one integer replaces a per-message
//! dedup set: anything at or below the watermark has already been delivered.
//!
//! ## Ordering
//! Updates go through `fetch_max`, so concurrent observers from the channel
//! session and the polling loop can never move the watermark backwards.
//! `AcqRel` is enough: the counter itself is the only shared datum.

use std::sync::atomic::{AtomicU64, Ordering};

/// # Watermark
#[derive(Debug, Default)]
pub struct Watermark {
    highest: AtomicU64,
}

impl Watermark {
    /// Creates a watermark starting at `initial` (0 means nothing seen yet).
    pub fn new(initial: u64) -> Self {
        Self {
            highest: AtomicU64::new(initial),
        }
    }

    /// # Observe
    ///
    /// Raises the watermark to `max(watermark, id)`.
    ///
    /// # Returns
    /// `true` when `id` was above the previous watermark, i.e. the message is
    /// new and must be delivered; `false` for a duplicate or stale id.
    pub fn observe(&self, id: u64) -> bool {
        // `fetch_max` returns the value *before* the update.
        let previous = self.highest.fetch_max(id, Ordering::AcqRel);
        id > previous
    }

    /// Current watermark.
    pub fn get(&self) -> u64 {
        self.highest.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn watermark_is_max_of_observed_ids() {
        let mark = Watermark::default();
        let ids = [5_u64, 3, 9, 9, 1, 12, 7];
        let delivered: Vec<u64> = ids.iter().copied().filter(|id| mark.observe(*id)).collect();

        assert_eq!(mark.get(), 12);
        assert_eq!(delivered, vec![5, 9, 12]);
    }

    #[test]
    fn concurrent_observers_never_move_backwards() {
        let mark = Arc::new(Watermark::new(100));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let mark = Arc::clone(&mark);
                std::thread::spawn(move || {
                    for i in 0..1_000_u64 {
                        mark.observe(i * 4 + t);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(mark.get(), 3_999);
        assert!(!mark.observe(100));
    }
}
