//! # Quality Sampler
//!
//! Periodically probes the health endpoint, smooths the last few round trips
//! and publishes a [`ConnectionState`] through a `watch` channel.
//!
//! ## Cycle
//! 1. No active interface: publish Offline at once, skip the probe, clear history.
//! 2. Otherwise `HEAD` the health endpoint with a bounded timeout; a failure
//!    records an unreachable sample.
//! 3. Push into the ring (oldest evicted) and average the numeric samples.
//!    A single failed sample is absorbed; two in a row read as unreachable.
//! 4. Classify, derive the media load mode, publish only if something changed.
//!
//! Besides the fixed interval, [`QualitySampler::force_check`] and platform
//! connectivity events wake the loop for an out-of-cycle sample.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::configs::SamplerConfig;
use crate::core::types::{ConnectionQuality, ConnectionState, Latency, QualitySample};
use crate::quality::policy::{smooth, TransportPolicy};
use crate::quality::probe::{HealthProbe, LinkMonitor};

/// Connectivity notifications pushed by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// The last network interface went away.
    LinkLost,
    /// An interface became available.
    LinkAvailable,
    /// Meteredness or bandwidth estimate of the active link changed.
    CapabilitiesChanged {
        /// Link is metered (mobile data, hotspot).
        metered: bool,
        /// Downstream bandwidth estimate.
        downstream_kbps: u32,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct LinkProperties {
    metered: bool,
    downstream_kbps: u32,
}

/// # Quality Sampler
pub struct QualitySampler {
    config: SamplerConfig,
    probe: Arc<dyn HealthProbe>,
    link: Arc<dyn LinkMonitor>,
    history: Mutex<VecDeque<QualitySample>>,
    link_props: Mutex<LinkProperties>,
    state_tx: watch::Sender<ConnectionState>,
    wake: Notify,
    cancel: CancellationToken,
}

impl QualitySampler {
    /// Creates a sampler in the initial Offline state. Nothing runs until
    /// [`QualitySampler::run`] is spawned.
    pub fn new(config: SamplerConfig, probe: Arc<dyn HealthProbe>, link: Arc<dyn LinkMonitor>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::initial());
        let capacity = config.history_capacity.max(1);
        Self {
            config,
            probe,
            link,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            link_props: Mutex::new(LinkProperties::default()),
            state_tx,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Observer of the published state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Last published state.
    pub fn current(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Requests an immediate sample from the running loop.
    pub fn force_check(&self) {
        debug!("Out-of-cycle quality check requested");
        self.wake.notify_one();
    }

    /// Stops the loop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether [`QualitySampler::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// # On Connectivity
    ///
    /// Handles a platform notification. Link loss publishes Offline right away
    /// instead of waiting for a probe to time out; every event also wakes the
    /// loop for a fresh sample.
    pub fn on_connectivity(&self, event: ConnectivityEvent) {
        info!(?event, "Connectivity changed");
        match event {
            ConnectivityEvent::LinkLost => {
                self.clear_history();
                let props = self.link_properties();
                self.publish(ConnectionState::new(
                    ConnectionQuality::Offline,
                    Latency::Unreachable,
                    props.metered,
                    props.downstream_kbps,
                ));
            }
            ConnectivityEvent::LinkAvailable => {}
            ConnectivityEvent::CapabilitiesChanged { metered, downstream_kbps } => {
                if let Ok(mut props) = self.link_props.lock() {
                    *props = LinkProperties { metered, downstream_kbps };
                }
                // Meteredness alone can change the media load mode.
                let current = self.current();
                self.publish(ConnectionState::new(
                    current.quality(),
                    current.smoothed_latency(),
                    metered,
                    downstream_kbps,
                ));
            }
        }
        self.wake.notify_one();
    }

    /// # Main Sampling Loop
    ///
    /// Samples immediately, then on every interval tick or wake-up, until
    /// stopped.
    pub async fn run(self: Arc<Self>) {
        info!(interval_ms = self.config.interval_ms, "Quality sampler started");
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {
                    // A forced sample restarts the regular cadence.
                    ticker.reset();
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.sample_once().await;
        }
        info!("Quality sampler stopped");
    }

    /// # Sample Once
    ///
    /// Runs one full cycle and returns the resulting state (published or not).
    pub async fn sample_once(&self) -> ConnectionState {
        let props = self.link_properties();

        if !self.link.has_active_interface() {
            self.clear_history();
            let state = ConnectionState::new(
                ConnectionQuality::Offline,
                Latency::Unreachable,
                props.metered,
                props.downstream_kbps,
            );
            self.publish(state);
            return state;
        }

        let latency = self.measure().await;
        let smoothed = {
            let mut history = match self.history.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            while history.len() >= self.config.history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(QualitySample {
                latency,
                taken_at: Instant::now(),
            });
            smooth(history.iter().map(|s| &s.latency))
        };

        let quality = TransportPolicy::classify(smoothed);
        let state = ConnectionState::new(quality, smoothed, props.metered, props.downstream_kbps);
        debug!(sample = %latency, smoothed = %smoothed, ?quality, "Quality sampled");
        self.publish(state);
        state
    }

    async fn measure(&self) -> Latency {
        let timeout = self.config.probe_timeout();
        match tokio::time::timeout(timeout, self.probe.probe()).await {
            Ok(Ok(rtt)) => Latency::Millis(duration_millis(rtt)),
            Ok(Err(e)) => {
                debug!(error = %e, "Health probe failed");
                Latency::Unreachable
            }
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Health probe timed out");
                Latency::Unreachable
            }
        }
    }

    fn publish(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(
                quality = ?state.quality(),
                media = ?state.media_load_mode(),
                latency = %state.smoothed_latency(),
                metered = state.is_metered(),
                "Connection state changed"
            );
        }
    }

    fn clear_history(&self) {
        match self.history.lock() {
            Ok(mut history) => history.clear(),
            Err(poisoned) => {
                warn!("Sample history lock poisoned; resetting");
                poisoned.into_inner().clear();
            }
        }
    }

    fn link_properties(&self) -> LinkProperties {
        self.link_props.lock().map(|p| *p).unwrap_or_default()
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
