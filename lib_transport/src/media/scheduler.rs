//! # Media Fetch Scheduler
//!
//! A fixed pool of workers draining the shared [`IntakeQueue`]. Requests hit
//! the on-disk cache first; a hit resolves before the call returns and never
//! touches the queue.
//!
//! ## Worker cycle
//! 1. Take the next task the current media load mode permits.
//! 2. Drop it if it was cancelled while queued.
//! 3. Download with a bounded timeout, reporting 10 → 50 → 100.
//! 4. Write the cache file, publish the ready state and, for full media,
//!    tell the persistence collaborator where the file lives.
//!
//! Failures end in [`MediaLoadState::Error`](crate::media::registry::MediaLoadState::Error) for that item only; the worker
//! moves on. Cancellation of an in-flight fetch is best effort: the download
//! may finish, but its result is discarded and the item stays Idle.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::configs::MediaConfig;
use crate::core::collaborators::LocalPersistence;
use crate::core::errors::{TransportError, TransportResult};
use crate::core::types::ConnectionState;
use crate::media::cache::MediaCache;
use crate::media::queue::{IntakeQueue, MediaFetchTask};
use crate::media::registry::{MediaKind, MediaProgress, ProgressRegistry};
use crate::quality::policy::TransportPolicy;
use crate::retrieve::rest_api::BusinessApi;

/// Priority used by [`MediaFetchScheduler::fetch_thumbnail`] when none is given.
pub const DEFAULT_THUMBNAIL_PRIORITY: i32 = 0;
/// Priority used by [`MediaFetchScheduler::fetch_full`] when none is given.
pub const DEFAULT_FULL_PRIORITY: i32 = 5;

const PROGRESS_STARTED: u8 = 10;
const PROGRESS_DOWNLOADED: u8 = 50;
const WORKER_GRACE: Duration = Duration::from_secs(5);

/// # Media Fetch Scheduler
pub struct MediaFetchScheduler {
    config: MediaConfig,
    api: Arc<dyn BusinessApi>,
    persistence: Arc<dyn LocalPersistence>,
    state_rx: watch::Receiver<ConnectionState>,
    cache: Option<MediaCache>,
    queue: IntakeQueue,
    registry: ProgressRegistry,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaFetchScheduler {
    /// Opens the cache and builds an idle scheduler. If the cache directory can
    /// not be created the scheduler still works, degraded: every request
    /// resolves to Error.
    pub async fn new(
        config: MediaConfig,
        api: Arc<dyn BusinessApi>,
        persistence: Arc<dyn LocalPersistence>,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        let cache = match MediaCache::open(&config.cache_dir).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                error!(dir = %config.cache_dir.display(), error = %e, "Media cache unavailable; media disabled");
                None
            }
        };
        Self {
            queue: IntakeQueue::new(config.fifo_every),
            config,
            api,
            persistence,
            state_rx,
            cache,
            registry: ProgressRegistry::new(),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// `true` when the cache could not be opened.
    pub fn is_degraded(&self) -> bool {
        self.cache.is_none()
    }

    /// # Start
    ///
    /// Spawns the worker pool and the load-mode watcher. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !workers.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        let count = self.config.workers.max(1);
        for worker_id in 0..count {
            workers.push(tokio::spawn(Arc::clone(self).worker(worker_id)));
        }
        workers.push(tokio::spawn(Arc::clone(self).watch_load_mode()));
        info!(workers = count, degraded = self.is_degraded(), "Media scheduler started");
    }

    /// Requests the thumbnail of `item_id`. Priority defaults to 0.
    pub async fn fetch_thumbnail(
        &self,
        item_id: u64,
        url: &str,
        priority: Option<i32>,
    ) -> TransportResult<watch::Receiver<MediaProgress>> {
        self.request(item_id, url, MediaKind::Thumbnail, priority.unwrap_or(DEFAULT_THUMBNAIL_PRIORITY))
            .await
    }

    /// Requests the full file of `item_id`. Priority defaults to 5.
    pub async fn fetch_full(
        &self,
        item_id: u64,
        url: &str,
        priority: Option<i32>,
    ) -> TransportResult<watch::Receiver<MediaProgress>> {
        self.request(item_id, url, MediaKind::Full, priority.unwrap_or(DEFAULT_FULL_PRIORITY))
            .await
    }

    async fn request(
        &self,
        item_id: u64,
        url: &str,
        kind: MediaKind,
        priority: i32,
    ) -> TransportResult<watch::Receiver<MediaProgress>> {
        if self.queue.is_closed() {
            return Err(TransportError::QueueClosed);
        }
        let rx = self.registry.subscribe(item_id);

        let Some(cache) = &self.cache else {
            self.registry
                .update(item_id, |p| p.failed(TransportError::CacheUnavailable.to_string()));
            return Ok(rx);
        };

        if let Some(path) = cache.lookup(item_id, kind, url).await {
            debug!(item_id, ?kind, "Media cache hit");
            self.registry.update(item_id, |p| p.ready(kind, path));
            return Ok(rx);
        }

        let queued = self.queue.push(MediaFetchTask {
            item_id,
            url: url.to_string(),
            kind,
            priority,
            generation: self.registry.generation(item_id),
        })?;
        if !queued {
            debug!(item_id, ?kind, "Media already requested");
        }
        Ok(rx)
    }

    /// # Cancel Download
    ///
    /// Removes queued work for `item_id` and invalidates any running fetch,
    /// including one dequeued but not yet marked as fetching.
    ///
    /// # Returns
    /// `true` if anything was queued or running.
    pub fn cancel_download(&self, item_id: u64) -> bool {
        let (removed, running) = self.queue.withdraw(item_id);
        if removed == 0 && !running {
            return false;
        }
        self.registry.cancel(item_id);
        debug!(item_id, removed, running, "Media download cancelled");
        self.prune_registry();
        true
    }

    /// Current progress record of `item_id`.
    pub fn progress(&self, item_id: u64) -> Option<MediaProgress> {
        self.registry.get(item_id)
    }

    /// Observer for `item_id` without requesting anything.
    pub fn subscribe(&self, item_id: u64) -> watch::Receiver<MediaProgress> {
        self.registry.subscribe(item_id)
    }

    /// Number of tasks waiting for a worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Deletes cached thumbnails.
    pub async fn clear_thumbnail_cache(&self) -> TransportResult<u64> {
        let removed = self.cache()?.clear_thumbnails().await?;
        self.registry.forget_paths(Some(MediaKind::Thumbnail));
        Ok(removed)
    }

    /// Deletes every cached file.
    pub async fn clear_all_cache(&self) -> TransportResult<u64> {
        let removed = self.cache()?.clear_all().await?;
        self.registry.forget_paths(None);
        Ok(removed)
    }

    /// Bytes currently held by the cache.
    pub async fn cache_size(&self) -> TransportResult<u64> {
        self.cache()?.size_bytes().await
    }

    fn cache(&self) -> TransportResult<&MediaCache> {
        self.cache.as_ref().ok_or(TransportError::CacheUnavailable)
    }

    /// # Shutdown
    ///
    /// Closes intake (later requests fail with `QueueClosed`) and joins the
    /// workers. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let dropped = self.queue.close();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            if tokio::time::timeout(WORKER_GRACE, worker).await.is_err() {
                warn!("Media worker did not stop in time");
            }
        }
        if dropped > 0 {
            debug!(dropped, "Pending media tasks dropped");
        }
        info!("Media scheduler stopped");
    }

    fn allows(&self, kind: MediaKind) -> bool {
        if !self.config.gate_on_load_mode {
            return true;
        }
        let mode = self.state_rx.borrow().media_load_mode();
        match kind {
            MediaKind::Thumbnail => TransportPolicy::can_load_media(mode),
            MediaKind::Full => TransportPolicy::can_load_full_media(mode),
        }
    }

    async fn worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Media worker started");
        while let Some(task) = self.queue.pop(|kind| self.allows(kind), &self.cancel).await {
            let (item_id, kind) = (task.item_id, task.kind);
            self.process(task).await;
            self.queue.finish(item_id, kind);
            self.prune_registry();
        }
        debug!(worker_id, "Media worker stopped");
    }

    fn prune_registry(&self) {
        let dropped = self.registry.prune(|item_id| self.queue.holds_item(item_id));
        if dropped > 0 {
            trace!(dropped, tracked = self.registry.len(), "Idle media records dropped");
        }
    }

    /// Wakes workers whenever the load mode may have widened.
    async fn watch_load_mode(self: Arc<Self>) {
        let mut state_rx = self.state_rx.clone();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let mode = state_rx.borrow_and_update().media_load_mode();
                    debug!(?mode, pending = self.queue.len(), "Media load mode observed");
                    self.queue.wake_all();
                }
            }
        }
    }

    async fn process(&self, task: MediaFetchTask) {
        let MediaFetchTask {
            item_id,
            url,
            kind,
            generation,
            ..
        } = task;
        let Some(cache) = &self.cache else {
            return;
        };

        if !self
            .registry
            .update_if_current(item_id, generation, |p| p.fetching(kind, PROGRESS_STARTED))
        {
            debug!(item_id, "Skipping cancelled media task");
            return;
        }

        let timeout = self.config.fetch_timeout();
        let download = async {
            match kind {
                MediaKind::Thumbnail => self.api.fetch_thumbnail(&url).await,
                MediaKind::Full => self.api.fetch_full(&url).await,
            }
        };
        let result = tokio::time::timeout(timeout, download)
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout)));

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                if self.registry.update_if_current(item_id, generation, |p| p.failed(e.to_string())) {
                    warn!(item_id, ?kind, error = %e, "Media fetch failed");
                }
                return;
            }
        };
        if !self
            .registry
            .update_if_current(item_id, generation, |p| p.progress = PROGRESS_DOWNLOADED)
        {
            debug!(item_id, "Discarding result of cancelled fetch");
            return;
        }

        match cache.store(item_id, kind, &url, &bytes).await {
            Ok(path) => {
                debug!(item_id, ?kind, bytes = bytes.len(), "Media cached");
                let surfaced = self.registry.update_if_current(item_id, generation, |p| p.ready(kind, path.clone()));
                if surfaced && kind == MediaKind::Full {
                    self.notify_persistence(item_id, path);
                }
            }
            Err(e) => {
                error!(item_id, error = %e, "Media cache write failed");
                self.registry.update_if_current(item_id, generation, |p| p.failed(e.to_string()));
            }
        }
    }

    fn notify_persistence(&self, item_id: u64, path: PathBuf) {
        let persistence = Arc::clone(&self.persistence);
        tokio::spawn(async move {
            if let Err(e) = persistence.update_local_media_path(item_id, &path).await {
                warn!(item_id, error = %e, "Local media path update failed");
            }
        });
    }
}
