//! Scripted collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::collaborators::LocalPersistence;
use crate::core::errors::{TransportError, TransportResult};
use crate::core::types::{InboundMessageEvent, MessageTarget, OutboundMessage, TransportMode};
use crate::quality::probe::{HealthProbe, LinkMonitor};
use crate::retrieve::rest_api::{BusinessApi, FetchFilter};

/// Probe that replays latencies; `None` is a failed probe. Repeats the last
/// entry once the script runs out.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<Option<u64>>>,
    last: Mutex<Option<u64>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(script: &[Option<u64>]) -> Self {
        Self {
            script: Mutex::new(script.iter().copied().collect()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self) -> TransportResult<Duration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let value = match next {
            Some(v) => {
                *self.last.lock().unwrap() = v;
                v
            }
            None => *self.last.lock().unwrap(),
        };
        value
            .map(Duration::from_millis)
            .ok_or_else(|| TransportError::Malformed("scripted probe failure".into()))
    }
}

/// Link whose state is flipped by the test.
pub struct FixedLink(AtomicBool);

impl FixedLink {
    pub fn up() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn set(&self, up: bool) {
        self.0.store(up, Ordering::SeqCst);
    }
}

impl LinkMonitor for FixedLink {
    fn has_active_interface(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One scripted poll reply.
pub enum PollStep {
    Fail,
    Messages(Vec<u64>),
}

pub fn text_message(id: u64, via: TransportMode) -> InboundMessageEvent {
    InboundMessageEvent {
        id,
        from_id: 7,
        target: MessageTarget::Direct { to_id: 1 },
        body: format!("message {id}"),
        timestamp: 1_700_000_000 + id as i64,
        kind: "text".to_string(),
        media_url: None,
        via,
    }
}

/// In-memory business API.
#[derive(Default)]
pub struct MockApi {
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub fail_sends: AtomicBool,
    polls: Mutex<VecDeque<PollStep>>,
    pub poll_cursors: Mutex<Vec<u64>>,
    media: Mutex<HashMap<String, Option<Bytes>>>,
    pub media_fetches: AtomicUsize,
    media_delay: Mutex<Option<Duration>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_polls(&self, steps: Vec<PollStep>) {
        self.polls.lock().unwrap().extend(steps);
    }

    /// `None` makes the download fail.
    pub fn serve_media(&self, url: &str, body: Option<&'static [u8]>) {
        self.media
            .lock()
            .unwrap()
            .insert(url.to_string(), body.map(Bytes::from_static));
    }

    pub fn delay_media(&self, delay: Duration) {
        *self.media_delay.lock().unwrap() = Some(delay);
    }

    pub fn poll_count(&self) -> usize {
        self.poll_cursors.lock().unwrap().len()
    }

    async fn media(&self, url: &str) -> TransportResult<Bytes> {
        self.media_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.media_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.media.lock().unwrap().get(url) {
            Some(Some(bytes)) => Ok(bytes.clone()),
            _ => Err(TransportError::Api {
                status: 404,
                message: format!("no media at {url}"),
            }),
        }
    }
}

#[async_trait]
impl BusinessApi for MockApi {
    async fn send(&self, message: &OutboundMessage) -> TransportResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Api {
                status: 500,
                message: "send rejected".into(),
            });
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn fetch_since(&self, cursor: u64, _filter: FetchFilter, _limit: u32) -> TransportResult<Vec<InboundMessageEvent>> {
        self.poll_cursors.lock().unwrap().push(cursor);
        match self.polls.lock().unwrap().pop_front() {
            Some(PollStep::Fail) => Err(TransportError::Api {
                status: 502,
                message: "bad gateway".into(),
            }),
            Some(PollStep::Messages(ids)) => Ok(ids.into_iter().map(|id| text_message(id, TransportMode::Polling)).collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_thumbnail(&self, url: &str) -> TransportResult<Bytes> {
        self.media(url).await
    }

    async fn fetch_full(&self, url: &str) -> TransportResult<Bytes> {
        self.media(url).await
    }
}

/// Persistence that remembers every update.
#[derive(Default)]
pub struct RecordingPersistence {
    pub updates: Mutex<Vec<(u64, PathBuf)>>,
}

#[async_trait]
impl LocalPersistence for RecordingPersistence {
    async fn update_local_media_path(&self, item_id: u64, path: &Path) -> anyhow::Result<()> {
        self.updates.lock().unwrap().push((item_id, path.to_path_buf()));
        Ok(())
    }
}
