//! # Polling Fallback Client
//!
//! A self-scheduling REST poller used while the persistent channel is not
//! trusted. Every tick it asks the business API for text-only messages above
//! its cursor, hands them on in ascending id order and advances the cursor.
//!
//! ## Key Design Principles:
//! - **Text only**: media is never requested in this mode; the filter is
//!   fixed, not configurable.
//! - **Resilience**: a failed or timed-out poll is logged and the loop waits
//!   for the next tick. Nothing but [`PollingFallbackClient::stop`] ends it.
//! - **Clean hand-off**: `stop` cancels before the next tick and waits for the
//!   loop to exit; results of a poll that was in flight when `stop` was called
//!   are discarded, so nothing is delivered after `stop` returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::configs::PollingConfig;
use crate::core::collaborators::SessionProvider;
use crate::core::errors::{TransportError, TransportResult};
use crate::core::events::TransportEvent;
use crate::core::types::InboundMessageEvent;
use crate::retrieve::rest_api::{BusinessApi, FetchFilter};

/// # Poll Result
///
/// Output of one successful cycle.
#[derive(Debug)]
pub struct PollResult {
    /// New messages, ascending by id, all above the cursor the poll started from.
    pub messages: Vec<InboundMessageEvent>,
    /// Cursor after this poll.
    pub cursor: u64,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// # Polling Fallback Client
pub struct PollingFallbackClient {
    inner: Arc<PollLoop>,
    running: Mutex<Option<Running>>,
}

struct PollLoop {
    config: PollingConfig,
    api: Arc<dyn BusinessApi>,
    session: Arc<dyn SessionProvider>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    cursor: AtomicU64,
}

impl PollingFallbackClient {
    /// Creates an idle client; nothing is fetched until [`Self::start`].
    pub fn new(
        config: PollingConfig,
        api: Arc<dyn BusinessApi>,
        session: Arc<dyn SessionProvider>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(PollLoop {
                config,
                api,
                session,
                events_tx,
                cursor: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// # Start
    ///
    /// Begins polling for messages above `since_id`. A loop that is already
    /// running is stopped first, so the new cursor always wins.
    pub async fn start(&self, since_id: u64) {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            shutdown(previous).await;
        }

        self.inner.cursor.store(since_id, Ordering::Release);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.inner).run(cancel.clone()));
        *running = Some(Running { cancel, handle });
        info!(since_id, interval_ms = self.inner.config.interval_ms, "Polling fallback started");
    }

    /// Stops the loop and waits until it has exited. Idempotent.
    pub async fn stop(&self) {
        if let Some(previous) = self.running.lock().await.take() {
            shutdown(previous).await;
            info!(cursor = self.cursor(), "Polling fallback stopped");
        }
    }

    /// Whether a loop is active.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Highest id handed on so far.
    pub fn cursor(&self) -> u64 {
        self.inner.cursor.load(Ordering::Acquire)
    }
}

async fn shutdown(running: Running) {
    running.cancel.cancel();
    if let Err(e) = running.handle.await {
        warn!(error = %e, "Polling task ended abnormally");
    }
}

impl PollLoop {
    /// # Main Execution Loop
    ///
    /// Tick, poll, deliver; on error log and wait for the next tick.
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            let outcome = self.execute_poll().await;
            if cancel.is_cancelled() {
                debug!("Discarding poll result after stop");
                break;
            }

            match outcome {
                Ok(Some(result)) => {
                    consecutive_failures = 0;
                    let delivered = result.messages.len();
                    for message in result.messages {
                        if self.events_tx.send(TransportEvent::Message(message)).is_err() {
                            debug!("Inbound receiver dropped; stopping poll loop");
                            return;
                        }
                    }
                    self.cursor.fetch_max(result.cursor, Ordering::AcqRel);
                    if delivered > 0 {
                        debug!(delivered, cursor = result.cursor, elapsed_ms = started.elapsed().as_millis() as u64, "Poll delivered messages");
                    }
                }
                Ok(None) => debug!("No credential; poll skipped"),
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(error = %e, consecutive_failures, "Poll failed; retrying next tick");
                }
            }
        }
    }

    /// # Execute Poll
    ///
    /// One bounded fetch. `Ok(None)` when there is no session to poll for.
    async fn execute_poll(&self) -> TransportResult<Option<PollResult>> {
        if self.session.access_token().is_none() {
            return Ok(None);
        }
        let cursor = self.cursor.load(Ordering::Acquire);
        let timeout = self.config.fetch_timeout();
        let mut messages = tokio::time::timeout(
            timeout,
            self.api.fetch_since(cursor, FetchFilter::TextOnly, self.config.page_limit),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

        messages.retain(|m| m.id > cursor);
        messages.sort_by_key(|m| m.id);
        messages.dedup_by_key(|m| m.id);
        let next_cursor = messages.last().map_or(cursor, |m| m.id);

        Ok(Some(PollResult {
            messages,
            cursor: next_cursor,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::StaticSession;
    use crate::test_support::{MockApi, PollStep};
    use std::time::Duration;

    fn client(api: Arc<MockApi>, session: StaticSession) -> (PollingFallbackClient, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = PollingFallbackClient::new(PollingConfig::default(), api, Arc::new(session), tx);
        (client, rx)
    }

    fn drain_ids(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Ok(TransportEvent::Message(m)) = rx.try_recv() {
            ids.push(m.id);
        }
        ids
    }

    #[tokio::test(start_paused = true)]
    async fn survives_three_failures_then_delivers() {
        let api = Arc::new(MockApi::new());
        api.script_polls(vec![PollStep::Fail, PollStep::Fail, PollStep::Fail, PollStep::Messages(vec![11, 12])]);
        let (client, mut rx) = client(api.clone(), StaticSession::new("t", 1));

        client.start(10).await;
        // Ticks at 0s, 3s, 6s, 9s.
        tokio::time::sleep(Duration::from_millis(9_500)).await;

        assert_eq!(api.poll_count(), 4);
        assert!(client.is_running().await);
        assert_eq!(drain_ids(&mut rx), vec![11, 12]);
        assert_eq!(client.cursor(), 12);

        // Next cycle asks from the advanced cursor.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(api.poll_cursors.lock().unwrap().last().copied(), Some(12));
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_ascending_and_skips_at_or_below_cursor() {
        let api = Arc::new(MockApi::new());
        api.script_polls(vec![PollStep::Messages(vec![43, 40, 42, 44, 43])]);
        let (client, mut rx) = client(api, StaticSession::new("t", 1));

        client.start(42).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(drain_ids(&mut rx), vec![43, 44]);
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_ticks() {
        let api = Arc::new(MockApi::new());
        let (client, _rx) = client(api.clone(), StaticSession::new("t", 1));

        client.start(0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.stop().await;
        let polls = api.poll_count();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.poll_count(), polls);
        assert!(!client.is_running().await);
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn without_credential_nothing_is_fetched() {
        let api = Arc::new(MockApi::new());
        let (client, _rx) = client(api.clone(), StaticSession::anonymous());

        client.start(0).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(api.poll_count(), 0);
        assert!(client.is_running().await);
        client.stop().await;
    }
}
