//! # Transport Engine
//!
//! Builds and owns the whole transport stack: the quality sampler, the
//! coordinator with its two delivery clients, and the media scheduler. This is
//! what a host application holds on to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::configs::TransportConfig;
use crate::core::collaborators::{LocalPersistence, SessionProvider};
use crate::core::coordinator::TransportCoordinator;
use crate::core::errors::TransportResult;
use crate::core::events::TransportEvent;
use crate::media::scheduler::MediaFetchScheduler;
use crate::quality::probe::{HealthProbe, HttpHealthProbe, LinkMonitor, SystemLink};
use crate::quality::sampler::{ConnectivityEvent, QualitySampler};
use crate::retrieve::rest_api::{BusinessApi, RestApiClient};

/// # Transport Engine
pub struct TransportEngine {
    sampler: Arc<QualitySampler>,
    coordinator: Arc<TransportCoordinator>,
    media: Arc<MediaFetchScheduler>,
    sampler_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    cleaned_up: AtomicBool,
}

impl TransportEngine {
    /// # Build
    ///
    /// Validates `config` and wires the production collaborators: `HEAD`
    /// health probe, OS interface check and the REST business API.
    pub async fn build(
        config: TransportConfig,
        session: Arc<dyn SessionProvider>,
        persistence: Arc<dyn LocalPersistence>,
    ) -> TransportResult<Self> {
        config.validate()?;
        let probe = HttpHealthProbe::new(
            config.health_url.clone(),
            config.sampler.probe_timeout(),
            &config.rest.user_agent,
        )?;
        let api = RestApiClient::new(&config.api_base_url, &config.rest, Arc::clone(&session))?;
        Ok(Self::with_parts(
            config,
            session,
            persistence,
            Arc::new(api),
            Arc::new(probe),
            Arc::new(SystemLink),
        )
        .await)
    }

    /// Wires the stack from explicit collaborators.
    pub async fn with_parts(
        config: TransportConfig,
        session: Arc<dyn SessionProvider>,
        persistence: Arc<dyn LocalPersistence>,
        api: Arc<dyn BusinessApi>,
        probe: Arc<dyn HealthProbe>,
        link: Arc<dyn LinkMonitor>,
    ) -> Self {
        let sampler = Arc::new(QualitySampler::new(config.sampler.clone(), probe, link));
        let media = Arc::new(
            MediaFetchScheduler::new(config.media.clone(), Arc::clone(&api), persistence, sampler.subscribe()).await,
        );
        let coordinator = Arc::new(
            TransportCoordinator::new(config, session, api, sampler.subscribe()).with_resampler(Arc::clone(&sampler)),
        );
        Self {
            sampler,
            coordinator,
            media,
            sampler_task: Mutex::new(None),
            started: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// # Start
    ///
    /// Spawns the sampler, the coordinator and the media workers. Idempotent;
    /// a no-op after [`Self::cleanup`].
    pub fn start(&self) {
        if self.cleaned_up.load(Ordering::Acquire) || self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = tokio::spawn(Arc::clone(&self.sampler).run());
        *self.sampler_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
        self.coordinator.start();
        self.media.start();
        if self.media.is_degraded() {
            self.coordinator
                .report_error("media cache directory unavailable; media loading disabled");
        }
        info!("Transport engine started");
    }

    /// Application event stream; `Some` once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.coordinator.take_events()
    }

    /// Forwards a platform connectivity notification to the sampler.
    pub fn notify_connectivity(&self, event: ConnectivityEvent) {
        self.sampler.on_connectivity(event);
    }

    /// The send/receive surface.
    pub fn coordinator(&self) -> &Arc<TransportCoordinator> {
        &self.coordinator
    }

    /// The media fetch surface.
    pub fn media(&self) -> &Arc<MediaFetchScheduler> {
        &self.media
    }

    /// The quality sampler.
    pub fn sampler(&self) -> &Arc<QualitySampler> {
        &self.sampler
    }

    /// # Cleanup
    ///
    /// Stops the sampler, disconnects the active client, cancels polling,
    /// closes media intake and joins every background task. Safe to call more
    /// than once and before [`Self::start`].
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Transport engine shutting down");
        self.sampler.stop();
        self.coordinator.shutdown().await;
        self.media.shutdown().await;

        let task = self
            .sampler_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Sampler task ended abnormally");
            }
        }
        info!("Transport engine stopped");
    }
}
