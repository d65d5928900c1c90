//! # Transport Coordinator
//!
//! Owns the switch between the persistent channel and the polling fallback,
//! and gives the application a single send/receive surface that hides which
//! one is active.
//!
//! ## Responsibilities
//! - Follows the published [`ConnectionState`] and switches clients whenever
//!   [`TransportPolicy::decide`] flips relative to the active mode. The old
//!   client is fully stopped before the new one starts.
//! - Owns the watermark: every inbound message from either client passes the
//!   [`InboundDispatcher`], and polling always starts from the watermark.
//! - Applies the outbound media policy centrally.
//! - Degrades to polling when the channel reports it can not be set up, until
//!   the published quality changes again.
//!
//! The active client reference is guarded by one `tokio::sync::Mutex`; sends
//! clone what they need under the lock and do their I/O after releasing it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::configs::{ChannelConfig, TransportConfig};
use crate::core::collaborators::SessionProvider;
use crate::core::dispatcher::InboundDispatcher;
use crate::core::errors::{TransportError, TransportResult};
use crate::core::events::{SendRoute, TransportEvent};
use crate::core::types::{ConnectionQuality, ConnectionState, OutboundMessage, TransportMode};
use crate::core::watermark::Watermark;
use crate::ingestors::channel_client::PersistentChannelClient;
use crate::ingestors::polling_client::PollingFallbackClient;
use crate::quality::policy::TransportPolicy;
use crate::quality::sampler::QualitySampler;
use crate::retrieve::rest_api::BusinessApi;

const TASK_GRACE: Duration = Duration::from_secs(3);

#[derive(Default)]
struct ActiveTransport {
    mode: Option<TransportMode>,
    channel: Option<Arc<PersistentChannelClient>>,
    last_quality: Option<ConnectionQuality>,
}

/// # Transport Coordinator
pub struct TransportCoordinator {
    config: TransportConfig,
    session: Arc<dyn SessionProvider>,
    api: Arc<dyn BusinessApi>,
    state_rx: watch::Receiver<ConnectionState>,
    resampler: Option<Arc<QualitySampler>>,
    dispatcher: InboundDispatcher,
    client_tx: mpsc::UnboundedSender<TransportEvent>,
    client_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    app_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    active: tokio::sync::Mutex<ActiveTransport>,
    mode_tx: watch::Sender<Option<TransportMode>>,
    polling: PollingFallbackClient,
    channel_degraded: AtomicBool,
    switches: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransportCoordinator {
    /// Creates a coordinator following `state_rx`. No client runs until
    /// [`Self::start`].
    pub fn new(
        config: TransportConfig,
        session: Arc<dyn SessionProvider>,
        api: Arc<dyn BusinessApi>,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        let (dispatcher, app_rx) = InboundDispatcher::new(Arc::new(Watermark::default()));
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let polling = PollingFallbackClient::new(
            config.polling.clone(),
            Arc::clone(&api),
            Arc::clone(&session),
            client_tx.clone(),
        );
        let (mode_tx, _) = watch::channel(None);
        Self {
            config,
            session,
            api,
            state_rx,
            resampler: None,
            dispatcher,
            client_tx,
            client_rx: Mutex::new(Some(client_rx)),
            app_rx: Mutex::new(Some(app_rx)),
            active: tokio::sync::Mutex::new(ActiveTransport::default()),
            mode_tx,
            polling,
            channel_degraded: AtomicBool::new(false),
            switches: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Sampler asked for an immediate re-sample when the channel drops.
    pub fn with_resampler(mut self, sampler: Arc<QualitySampler>) -> Self {
        self.resampler = Some(sampler);
        self
    }

    /// # Start
    ///
    /// Spawns the quality follower and the inbound event pump. Idempotent;
    /// a no-op after [`Self::shutdown`].
    pub fn start(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(client_rx) = lock(&self.client_rx).take() else {
            debug!("Coordinator already started");
            return;
        };
        let pump = tokio::spawn(Arc::clone(self).pump(client_rx));
        let follower = tokio::spawn(Arc::clone(self).follow_quality());
        lock(&self.tasks).extend([pump, follower]);
        info!("Transport coordinator started");
    }

    /// The application's event stream. Single subscriber: `Some` once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        lock(&self.app_rx).take()
    }

    /// # Apply Quality
    ///
    /// Reconciles the active mode with `quality`.
    ///
    /// # Returns
    /// `true` if a switch was performed; repeated identical decisions return
    /// `false` and touch nothing.
    pub async fn apply_quality(&self, quality: ConnectionQuality) -> bool {
        let mut active = self.active.lock().await;
        if self.cancel.is_cancelled() {
            return false;
        }
        if active.last_quality != Some(quality) {
            if active.last_quality.is_some() && self.channel_degraded.swap(false, Ordering::AcqRel) {
                info!(?quality, "Quality changed; persistent channel may be retried");
            }
            active.last_quality = Some(quality);
        }

        let target = if TransportPolicy::decide(quality) && !self.channel_degraded.load(Ordering::Acquire) {
            TransportMode::PersistentChannel
        } else {
            TransportMode::Polling
        };
        if active.mode == Some(target) {
            trace!(?target, "Transport decision unchanged");
            return false;
        }
        self.switch_to(&mut active, target).await;
        true
    }

    /// Channel settings for a channel opened at `quality`.
    fn channel_config(&self, quality: ConnectionQuality) -> ChannelConfig {
        let mut config = self.config.channel.clone();
        if config.adaptive_timing {
            let timings = TransportPolicy::channel_timings(quality);
            config.reconnect_initial_ms = timings.reconnect_initial_ms;
            config.reconnect_max_ms = timings.reconnect_max_ms;
            config.connect_timeout_ms = timings.connect_timeout_ms;
        }
        config
    }

    async fn switch_to(&self, active: &mut ActiveTransport, target: TransportMode) {
        let from = active.mode;
        match target {
            TransportMode::PersistentChannel => {
                self.polling.stop().await;
                self.dispatcher.begin_channel();
                let quality = active.last_quality.unwrap_or(ConnectionQuality::Offline);
                let channel = Arc::new(PersistentChannelClient::new(
                    self.channel_config(quality),
                    self.config.socket_url.clone(),
                    Arc::clone(&self.session),
                    self.client_tx.clone(),
                ));
                if let Err(e) = channel.connect() {
                    warn!(error = %e, "Persistent channel refused to start");
                }
                active.channel = Some(channel);
            }
            TransportMode::Polling => {
                if let Some(channel) = active.channel.take() {
                    channel.close().await;
                }
                self.polling.start(self.dispatcher.watermark().get()).await;
            }
        }
        active.mode = Some(target);
        self.mode_tx.send_replace(Some(target));
        self.switches.fetch_add(1, Ordering::Relaxed);
        info!(?from, to = ?target, watermark = self.watermark(), "Transport switched");
        self.dispatcher.dispatch(TransportEvent::ModeChanged(target));
    }

    /// # Send Message
    ///
    /// Sends a direct message over whichever path the active mode allows.
    /// `media_url` is dropped unless the current quality is Excellent or Good.
    ///
    /// # Returns
    /// The route the message took, or `SendFailed` once every allowed path
    /// has been tried.
    pub async fn send_message(
        &self,
        recipient_id: u64,
        text: &str,
        media_url: Option<String>,
    ) -> TransportResult<SendRoute> {
        let quality = self.state_rx.borrow().quality();
        let allows_media = TransportPolicy::allows_outbound_media(quality);
        if media_url.is_some() && !allows_media {
            debug!(?quality, "Stripping media from outbound message");
        }
        let message = OutboundMessage {
            recipient_id,
            text: text.to_string(),
            media_url: media_url.filter(|_| allows_media),
            client_message_id: Uuid::new_v4().to_string(),
        };

        let (mode, channel) = self.snapshot().await;
        match (mode, channel) {
            (Some(TransportMode::PersistentChannel), Some(channel)) => match channel.send_message(&message) {
                Ok(()) => Ok(SendRoute::Channel),
                Err(e) => {
                    warn!(error = %e, id = %message.client_message_id, "Channel rejected send; trying REST");
                    self.send_rest(&message).await.map(|()| SendRoute::RestFallback)
                }
            },
            _ => self.send_rest(&message).await.map(|()| SendRoute::Rest),
        }
    }

    async fn send_rest(&self, message: &OutboundMessage) -> TransportResult<()> {
        self.api.send(message).await.map_err(|e| {
            error!(error = %e, id = %message.client_message_id, "Send failed");
            TransportError::SendFailed {
                client_message_id: message.client_message_id.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Typing indicator. A no-op under polling and while the channel is
    /// between sessions.
    pub async fn send_typing(&self, recipient_id: u64, is_typing: bool) -> TransportResult<()> {
        let Some(channel) = self.active_channel().await else {
            trace!("Typing indicator skipped outside channel mode");
            return Ok(());
        };
        ignore_disconnected(channel.send_typing(recipient_id, is_typing))
    }

    /// Read receipt. A no-op under polling.
    pub async fn mark_seen(&self, message_id: u64, sender_id: u64) -> TransportResult<()> {
        match self.active_channel().await {
            Some(channel) => ignore_disconnected(channel.send_seen(message_id, sender_id)),
            None => Ok(()),
        }
    }

    /// Group message; only the persistent channel carries these.
    pub async fn send_group_message(&self, group_id: u64, text: &str) -> TransportResult<()> {
        self.active_channel()
            .await
            .ok_or(TransportError::NotConnected)?
            .send_group_message(group_id, text)
    }

    /// Emits an arbitrary event on the persistent channel.
    pub async fn emit_raw(&self, event: &str, data: Value) -> TransportResult<()> {
        self.active_channel()
            .await
            .ok_or(TransportError::NotConnected)?
            .emit(event, data)
    }

    /// Active mode; `None` before the first decision.
    pub fn mode(&self) -> Option<TransportMode> {
        *self.mode_tx.borrow()
    }

    /// Observer of mode changes.
    pub fn subscribe_mode(&self) -> watch::Receiver<Option<TransportMode>> {
        self.mode_tx.subscribe()
    }

    /// Last published connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Thumbnails may be fetched.
    pub fn can_load_media(&self) -> bool {
        TransportPolicy::can_load_media(self.connection_state().media_load_mode())
    }

    /// Full-size media may be fetched.
    pub fn can_load_full_media(&self) -> bool {
        TransportPolicy::can_load_full_media(self.connection_state().media_load_mode())
    }

    /// Page size for history loads under the current quality.
    pub fn recommended_batch_size(&self) -> u32 {
        TransportPolicy::recommended_batch_size(self.connection_state().quality())
    }

    /// Human readable connection summary.
    pub fn quality_description(&self) -> String {
        TransportPolicy::describe(&self.connection_state())
    }

    /// Highest message id delivered to the application.
    pub fn watermark(&self) -> u64 {
        self.dispatcher.watermark().get()
    }

    /// Number of switches performed so far.
    pub fn switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Surfaces a failure to the application event stream.
    pub fn report_error(&self, message: impl Into<String>) {
        self.dispatcher.dispatch(TransportEvent::Error(message.into()));
    }

    /// # Shutdown
    ///
    /// Stops the active client and the background tasks. Idempotent and safe
    /// when [`Self::start`] was never called.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        {
            let mut active = self.active.lock().await;
            if let Some(channel) = active.channel.take() {
                channel.close().await;
            }
            active.mode = None;
        }
        self.polling.stop().await;

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            match tokio::time::timeout(TASK_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Coordinator task ended abnormally"),
                Err(_) => warn!("Coordinator task did not stop in time"),
            }
        }
        self.mode_tx.send_replace(None);
        info!("Transport coordinator stopped");
    }

    async fn snapshot(&self) -> (Option<TransportMode>, Option<Arc<PersistentChannelClient>>) {
        let active = self.active.lock().await;
        (active.mode, active.channel.clone())
    }

    async fn active_channel(&self) -> Option<Arc<PersistentChannelClient>> {
        match self.snapshot().await {
            (Some(TransportMode::PersistentChannel), channel) => channel,
            _ => None,
        }
    }

    /// Follows the published connection state until cancelled.
    async fn follow_quality(self: Arc<Self>) {
        let mut state_rx = self.state_rx.clone();
        let initial = *state_rx.borrow_and_update();
        self.on_state(initial).await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        debug!("Connection state publisher dropped");
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    self.on_state(state).await;
                }
            }
        }
    }

    async fn on_state(&self, state: ConnectionState) {
        self.dispatcher.dispatch(TransportEvent::QualityChanged(state));
        self.apply_quality(state.quality()).await;
    }

    /// Moves client events through the watermark to the application.
    async fn pump(self: Arc<Self>, mut client_rx: mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = client_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let disconnected = event == TransportEvent::ChannelDisconnected;
            let unavailable = match &event {
                TransportEvent::ChannelUnavailable { attempts, reason } => {
                    Some(format!("persistent channel unavailable after {attempts} attempts: {reason}"))
                }
                _ => None,
            };
            self.dispatcher.dispatch(event);

            if disconnected {
                if let Some(sampler) = &self.resampler {
                    sampler.force_check();
                }
            }
            if let Some(message) = unavailable {
                self.degrade_channel().await;
                self.report_error(message);
            }
        }
    }

    async fn degrade_channel(&self) {
        self.channel_degraded.store(true, Ordering::Release);
        let mut active = self.active.lock().await;
        if active.mode == Some(TransportMode::PersistentChannel) {
            warn!("Degrading to polling until connection quality changes");
            self.switch_to(&mut active, TransportMode::Polling).await;
        }
    }
}

fn ignore_disconnected(result: TransportResult<()>) -> TransportResult<()> {
    match result {
        Err(TransportError::NotConnected) => {
            trace!("Ephemeral signal dropped; channel between sessions");
            Ok(())
        }
        other => other,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::PollingConfig;
    use crate::core::collaborators::StaticSession;
    use crate::core::types::Latency;
    use crate::test_support::{text_message, MockApi, PollStep};

    fn state(quality: ConnectionQuality) -> ConnectionState {
        let latency = match quality {
            ConnectionQuality::Excellent => Latency::Millis(80),
            ConnectionQuality::Good => Latency::Millis(300),
            ConnectionQuality::Poor => Latency::Millis(900),
            ConnectionQuality::Offline => Latency::Unreachable,
        };
        ConnectionState::new(quality, latency, false, 0)
    }

    fn config() -> TransportConfig {
        TransportConfig {
            // Nothing listens here; the channel keeps failing quietly.
            socket_url: "ws://127.0.0.1:9/".to_string(),
            channel: ChannelConfig {
                connect_timeout_ms: 200,
                reconnect_initial_ms: 50,
                reconnect_max_ms: 100,
                setup_failure_threshold: 1_000,
                adaptive_timing: false,
                ..ChannelConfig::default()
            },
            polling: PollingConfig {
                interval_ms: 20,
                ..PollingConfig::default()
            },
            ..TransportConfig::default()
        }
    }

    fn coordinator(
        quality: ConnectionQuality,
        api: Arc<MockApi>,
    ) -> (Arc<TransportCoordinator>, watch::Sender<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(state(quality));
        let coordinator = TransportCoordinator::new(config(), Arc::new(StaticSession::new("tok", 1)), api, state_rx);
        (Arc::new(coordinator), state_tx)
    }

    async fn wait_mode(coordinator: &TransportCoordinator, mode: TransportMode) {
        let mut rx = coordinator.subscribe_mode();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|m| *m == Some(mode)))
            .await
            .expect("mode switch timed out")
            .expect("mode publisher dropped");
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> u64 {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("no message in time")
                .expect("event stream closed");
            if let TransportEvent::Message(msg) = event {
                return msg.id;
            }
        }
    }

    #[tokio::test]
    async fn identical_decisions_switch_once() {
        let api = Arc::new(MockApi::new());
        let (coordinator, _state_tx) = coordinator(ConnectionQuality::Poor, api);

        assert!(coordinator.apply_quality(ConnectionQuality::Poor).await);
        assert!(!coordinator.apply_quality(ConnectionQuality::Poor).await);
        assert!(!coordinator.apply_quality(ConnectionQuality::Offline).await);
        assert_eq!(coordinator.switch_count(), 1);
        assert_eq!(coordinator.mode(), Some(TransportMode::Polling));

        assert!(coordinator.apply_quality(ConnectionQuality::Good).await);
        assert!(!coordinator.apply_quality(ConnectionQuality::Excellent).await);
        assert_eq!(coordinator.switch_count(), 2);
        assert_eq!(coordinator.mode(), Some(TransportMode::PersistentChannel));

        coordinator.shutdown().await;
        assert_eq!(coordinator.mode(), None);
    }

    #[tokio::test]
    async fn channel_timings_follow_quality_when_adaptive() {
        let api = Arc::new(MockApi::new());
        let (state_tx, state_rx) = watch::channel(state(ConnectionQuality::Good));
        let mut adaptive = config();
        adaptive.channel.adaptive_timing = true;
        let coordinator = TransportCoordinator::new(adaptive, Arc::new(StaticSession::new("tok", 1)), api, state_rx);

        let excellent = coordinator.channel_config(ConnectionQuality::Excellent);
        assert_eq!(excellent.reconnect_initial(), Duration::from_millis(500));
        assert_eq!(excellent.reconnect_max(), Duration::from_secs(2));
        assert_eq!(excellent.connect_timeout(), Duration::from_secs(10));

        let good = coordinator.channel_config(ConnectionQuality::Good);
        assert_eq!(
            (good.reconnect_initial_ms, good.reconnect_max_ms, good.connect_timeout_ms),
            (1_000, 5_000, 15_000)
        );
        let offline = coordinator.channel_config(ConnectionQuality::Offline);
        assert_eq!(
            (offline.reconnect_initial_ms, offline.reconnect_max_ms, offline.connect_timeout_ms),
            (5_000, 20_000, 60_000)
        );
        // untouched fields survive
        assert_eq!(offline.setup_failure_threshold, 1_000);
        drop(state_tx);
    }

    #[tokio::test]
    async fn fixed_channel_timings_ignore_quality() {
        let api = Arc::new(MockApi::new());
        let (coordinator, _state_tx) = coordinator(ConnectionQuality::Poor, api);
        let channel = coordinator.channel_config(ConnectionQuality::Poor);
        assert_eq!(channel, config().channel);
    }

    #[tokio::test]
    async fn polling_send_strips_media_and_skips_typing() {
        let api = Arc::new(MockApi::new());
        let (coordinator, _state_tx) = coordinator(ConnectionQuality::Poor, Arc::clone(&api));
        coordinator.apply_quality(ConnectionQuality::Poor).await;

        let route = coordinator
            .send_message(7, "hi", Some("https://cdn.example/p.jpg".to_string()))
            .await
            .unwrap();
        assert_eq!(route, SendRoute::Rest);
        coordinator.send_typing(7, true).await.unwrap();

        let sent = api.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient_id, 7);
        assert_eq!(sent[0].text, "hi");
        assert_eq!(sent[0].media_url, None);
        assert!(Uuid::parse_str(&sent[0].client_message_id).is_ok());

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn channel_rejection_falls_back_to_rest_keeping_media() {
        let api = Arc::new(MockApi::new());
        let (coordinator, _state_tx) = coordinator(ConnectionQuality::Excellent, Arc::clone(&api));
        coordinator.apply_quality(ConnectionQuality::Excellent).await;

        let route = coordinator
            .send_message(3, "pic", Some("https://cdn.example/p.jpg".to_string()))
            .await
            .unwrap();
        assert_eq!(route, SendRoute::RestFallback);
        assert_eq!(
            api.sent.lock().unwrap()[0].media_url.as_deref(),
            Some("https://cdn.example/p.jpg")
        );

        api.fail_sends.store(true, Ordering::SeqCst);
        let err = coordinator.send_message(3, "again", None).await.unwrap_err();
        assert!(matches!(err, TransportError::SendFailed { .. }));

        assert!(matches!(
            coordinator.send_group_message(1, "x").await,
            Err(TransportError::NotConnected)
        ));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn polling_resumes_from_the_watermark() {
        let api = Arc::new(MockApi::new());
        let (coordinator, state_tx) = coordinator(ConnectionQuality::Excellent, Arc::clone(&api));
        let mut events = coordinator.take_events().unwrap();
        assert!(coordinator.take_events().is_none());
        coordinator.start();
        wait_mode(&coordinator, TransportMode::PersistentChannel).await;

        coordinator
            .client_tx
            .send(TransportEvent::Message(text_message(42, TransportMode::PersistentChannel)))
            .unwrap();
        assert_eq!(next_message(&mut events).await, 42);

        api.script_polls(vec![PollStep::Messages(vec![40, 42, 43])]);
        state_tx.send_replace(state(ConnectionQuality::Poor));
        wait_mode(&coordinator, TransportMode::Polling).await;

        assert_eq!(next_message(&mut events).await, 43);
        assert_eq!(api.poll_cursors.lock().unwrap()[0], 42);
        assert_eq!(coordinator.watermark(), 43);

        // A late channel duplicate is dropped as well.
        coordinator
            .client_tx
            .send(TransportEvent::Message(text_message(43, TransportMode::PersistentChannel)))
            .unwrap();
        coordinator.client_tx.send(TransportEvent::Error("marker".into())).unwrap();
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Message(msg) => panic!("unexpected redelivery of {}", msg.id),
                TransportEvent::Error(m) if m == "marker" => break,
                _ => {}
            }
        }
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn out_of_order_channel_pushes_are_all_delivered() {
        let api = Arc::new(MockApi::new());
        let (coordinator, _state_tx) = coordinator(ConnectionQuality::Excellent, api);
        let mut events = coordinator.take_events().unwrap();
        coordinator.start();
        wait_mode(&coordinator, TransportMode::PersistentChannel).await;

        for id in [101, 100, 101] {
            coordinator
                .client_tx
                .send(TransportEvent::Message(text_message(id, TransportMode::PersistentChannel)))
                .unwrap();
        }
        assert_eq!(next_message(&mut events).await, 101);
        assert_eq!(next_message(&mut events).await, 100);
        assert_eq!(coordinator.watermark(), 101);

        coordinator.client_tx.send(TransportEvent::Error("marker".into())).unwrap();
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Message(msg) => panic!("unexpected redelivery of {}", msg.id),
                TransportEvent::Error(m) if m == "marker" => break,
                _ => {}
            }
        }
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn unavailable_channel_degrades_until_quality_changes() {
        let api = Arc::new(MockApi::new());
        let (coordinator, state_tx) = coordinator(ConnectionQuality::Excellent, api);
        let mut events = coordinator.take_events().unwrap();
        coordinator.start();
        wait_mode(&coordinator, TransportMode::PersistentChannel).await;

        coordinator
            .client_tx
            .send(TransportEvent::ChannelUnavailable {
                attempts: 3,
                reason: "refused".into(),
            })
            .unwrap();
        wait_mode(&coordinator, TransportMode::Polling).await;

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("no error event")
                .unwrap();
            if matches!(event, TransportEvent::Error(_)) {
                break;
            }
        }

        // Same quality again: stay degraded.
        assert!(!coordinator.apply_quality(ConnectionQuality::Excellent).await);

        state_tx.send_replace(state(ConnectionQuality::Good));
        wait_mode(&coordinator, TransportMode::PersistentChannel).await;
        coordinator.shutdown().await;
        coordinator.shutdown().await;
    }
}
