//! # Progress Registry
//!
//! One `watch` channel per media item, created on first interest and kept for
//! the life of the scheduler. Next to the observable, each entry carries a
//! cancellation generation: a worker finishing a fetch whose generation is no
//! longer current drops the result instead of surfacing it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::watch;

/// Which rendition of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MediaKind {
    /// Small preview.
    Thumbnail,
    /// Original file.
    Full,
}

/// Lifecycle of one media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaLoadState {
    /// Nothing requested, queued, or a cancelled fetch.
    Idle,
    /// A worker is downloading the thumbnail.
    FetchingThumbnail,
    /// Thumbnail is on disk.
    ThumbnailReady,
    /// A worker is downloading the full file.
    FetchingFull,
    /// Full file is on disk.
    FullReady,
    /// Last attempt failed; see [`MediaProgress::error`].
    Error,
}

impl MediaLoadState {
    /// In-flight state for `kind`.
    pub fn fetching(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Thumbnail => MediaLoadState::FetchingThumbnail,
            MediaKind::Full => MediaLoadState::FetchingFull,
        }
    }

    /// Completed state for `kind`.
    pub fn ready(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Thumbnail => MediaLoadState::ThumbnailReady,
            MediaKind::Full => MediaLoadState::FullReady,
        }
    }

    /// A worker currently owns the item.
    pub fn is_fetching(self) -> bool {
        matches!(self, MediaLoadState::FetchingThumbnail | MediaLoadState::FetchingFull)
    }
}

/// Observable per-item progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaProgress {
    /// Message the media belongs to.
    pub item_id: u64,
    /// Current state.
    pub state: MediaLoadState,
    /// 0..=100.
    pub progress: u8,
    /// Cached thumbnail, once known.
    pub thumbnail_path: Option<PathBuf>,
    /// Cached full file, once known.
    pub full_path: Option<PathBuf>,
    /// Reason of the last failure.
    pub error: Option<String>,
}

impl MediaProgress {
    /// Fresh record.
    pub fn idle(item_id: u64) -> Self {
        Self {
            item_id,
            state: MediaLoadState::Idle,
            progress: 0,
            thumbnail_path: None,
            full_path: None,
            error: None,
        }
    }

    /// Marks `kind` as in flight at `progress` percent.
    pub fn fetching(&mut self, kind: MediaKind, progress: u8) {
        self.state = MediaLoadState::fetching(kind);
        self.progress = progress;
        self.error = None;
    }

    /// Marks `kind` as cached at `path`. A ready thumbnail never hides an
    /// already cached full file.
    pub fn ready(&mut self, kind: MediaKind, path: PathBuf) {
        match kind {
            MediaKind::Thumbnail => self.thumbnail_path = Some(path),
            MediaKind::Full => self.full_path = Some(path),
        }
        self.state = if self.full_path.is_some() {
            MediaLoadState::FullReady
        } else {
            MediaLoadState::ready(kind)
        };
        self.progress = 100;
        self.error = None;
    }

    /// Marks the item failed.
    pub fn failed(&mut self, reason: impl Into<String>) {
        self.state = MediaLoadState::Error;
        self.progress = 0;
        self.error = Some(reason.into());
    }
}

struct Entry {
    tx: watch::Sender<MediaProgress>,
    generation: u64,
}

/// # Progress Registry
#[derive(Default)]
pub struct ProgressRegistry {
    entries: Mutex<HashMap<u64, Entry>>,
}

impl ProgressRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<R>(&self, item_id: u64, f: impl FnOnce(&mut Entry) -> R) -> R {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = entries.entry(item_id).or_insert_with(|| Entry {
            tx: watch::channel(MediaProgress::idle(item_id)).0,
            generation: 0,
        });
        f(entry)
    }

    /// Observer for `item_id`, creating an Idle record on first use.
    pub fn subscribe(&self, item_id: u64) -> watch::Receiver<MediaProgress> {
        self.with_entry(item_id, |entry| entry.tx.subscribe())
    }

    /// Current record, if the item was ever requested.
    pub fn get(&self, item_id: u64) -> Option<MediaProgress> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(&item_id).map(|entry| entry.tx.borrow().clone())
    }

    /// Applies `update` and notifies observers.
    pub fn update(&self, item_id: u64, update: impl FnOnce(&mut MediaProgress)) {
        self.with_entry(item_id, |entry| entry.tx.send_modify(update));
    }

    /// Applies `update` only while `generation` is still current.
    ///
    /// # Returns
    /// `false` when the work was cancelled and nothing changed.
    pub fn update_if_current(&self, item_id: u64, generation: u64, update: impl FnOnce(&mut MediaProgress)) -> bool {
        self.with_entry(item_id, |entry| {
            if entry.generation != generation {
                return false;
            }
            entry.tx.send_modify(update);
            true
        })
    }

    /// # Prune
    ///
    /// Drops Idle records that hold no cached path and have no observers,
    /// unless `busy` reports outstanding work for the item.
    ///
    /// # Returns
    /// Number of records dropped.
    pub fn prune(&self, busy: impl Fn(u64) -> bool) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|item_id, entry| {
            let progress = entry.tx.borrow();
            let idle = progress.state == MediaLoadState::Idle
                && progress.thumbnail_path.is_none()
                && progress.full_path.is_none();
            !idle || entry.tx.receiver_count() > 0 || busy(*item_id)
        });
        before - entries.len()
    }

    /// Number of tracked items.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    /// `true` when no item is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current cancellation generation.
    pub fn generation(&self, item_id: u64) -> u64 {
        self.with_entry(item_id, |entry| entry.generation)
    }

    /// Whether a task captured at `generation` may still surface its result.
    pub fn is_current(&self, item_id: u64, generation: u64) -> bool {
        self.generation(item_id) == generation
    }

    /// Invalidates outstanding work for `item_id` and resets it to Idle.
    /// Cached paths are kept; they are still valid files.
    pub fn cancel(&self, item_id: u64) {
        self.with_entry(item_id, |entry| {
            entry.generation += 1;
            entry.tx.send_modify(|progress| {
                progress.state = MediaLoadState::Idle;
                progress.progress = 0;
                progress.error = None;
            });
        });
    }

    /// Forgets every cached path, e.g. after the cache was cleared.
    pub fn forget_paths(&self, kind: Option<MediaKind>) {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in entries.values() {
            entry.tx.send_if_modified(|progress| {
                let had_thumb = progress.thumbnail_path.is_some();
                let had_full = progress.full_path.is_some();
                if kind != Some(MediaKind::Full) {
                    progress.thumbnail_path = None;
                }
                if kind != Some(MediaKind::Thumbnail) {
                    progress.full_path = None;
                }
                let changed = had_thumb != progress.thumbnail_path.is_some() || had_full != progress.full_path.is_some();
                if changed && !progress.state.is_fetching() && progress.state != MediaLoadState::Error {
                    progress.state = match (&progress.thumbnail_path, &progress.full_path) {
                        (_, Some(_)) => MediaLoadState::FullReady,
                        (Some(_), None) => MediaLoadState::ThumbnailReady,
                        (None, None) => MediaLoadState::Idle,
                    };
                    if progress.state == MediaLoadState::Idle {
                        progress.progress = 0;
                    }
                }
                changed
            });
        }
    }
}
