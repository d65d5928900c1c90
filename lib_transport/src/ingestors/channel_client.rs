//! # Persistent Channel Client
//!
//! One long-lived Socket.IO session over a WebSocket, with unbounded
//! automatic reconnection.
//!
//! ## State machine
//! `Disconnected → Connecting → Connected → (Reconnecting ⇄ Connected)`, and
//! back to `Disconnected` for good once [`PersistentChannelClient::close`]
//! has been called.
//!
//! ## Protocol duties
//! - The access token travels as a URL query parameter, never in a message.
//! - After every successful (re)connection a `join` event is emitted before
//!   anything else; the server treats each physical connection as anonymous
//!   until then.
//! - Server pings (`2`) are answered with pongs (`3`); a session silent for
//!   longer than the ping timeout is dropped and reconnected.
//!
//! Outbound calls never queue: without an open session they fail at once with
//! [`TransportError::NotConnected`] and the caller decides what to do.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::configs::ChannelConfig;
use crate::core::collaborators::SessionProvider;
use crate::core::errors::{TransportError, TransportResult};
use crate::core::events::TransportEvent;
use crate::core::types::OutboundMessage;
use crate::wire::events::parse_channel_event;
use crate::wire::socketio::{self, OpenHandshake, Packet};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Event emitted right after every (re)connection.
pub const JOIN_EVENT: &str = "join";
/// Outbound direct message.
pub const SEND_MESSAGE_EVENT: &str = "private_message";
/// Outbound group message.
pub const SEND_GROUP_MESSAGE_EVENT: &str = "group_message";
/// Outbound typing indicator.
pub const SEND_TYPING_EVENT: &str = "typing";
/// Outbound read receipt.
pub const SEND_SEEN_EVENT: &str = "seen_messages";

const TYPING_ACTIVE: u16 = 200;
const TYPING_DONE: u16 = 300;
const WATCHDOG_TICK: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const LEAVE_GRACE: Duration = Duration::from_millis(500);

/// Connection lifecycle of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected; initial state and final state after `close`.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Joined and ready to send.
    Connected,
    /// Session lost; retrying with backoff.
    Reconnecting,
}

/// # Persistent Channel Client
pub struct PersistentChannelClient {
    config: ChannelConfig,
    url: String,
    session: Arc<dyn SessionProvider>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    state_tx: watch::Sender<ChannelState>,
    /// Present only while a joined session is open.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum SessionEnd {
    Closed,
    Lost(String),
}

impl PersistentChannelClient {
    /// Creates a disconnected client. `url` may use `ws(s)://` or `http(s)://`.
    pub fn new(
        config: ChannelConfig,
        url: impl Into<String>,
        session: Arc<dyn SessionProvider>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            config,
            url: url.into(),
            session,
            events_tx,
            state_tx,
            outbound: Mutex::new(None),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// # Connect
    ///
    /// Spawns the connection loop. Calling it again while the loop runs is a
    /// no-op; after [`Self::close`] it fails with `NotConnected`.
    pub fn connect(self: &Arc<Self>) -> TransportResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::NotConnected);
        }
        let mut task = lock(&self.task);
        if task.is_none() {
            *task = Some(tokio::spawn(Arc::clone(self).run()));
        }
        Ok(())
    }

    /// # Close
    ///
    /// Terminal: leaves the namespace, closes the socket and waits (bounded)
    /// for the loop to finish. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            stop_within(handle, CLOSE_GRACE).await;
        }
        lock(&self.outbound).take();
        self.state_tx.send_replace(ChannelState::Disconnected);
        info!("Persistent channel closed");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Observer of lifecycle changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fire-and-forget direct message.
    pub fn send_message(&self, message: &OutboundMessage) -> TransportResult<()> {
        let from_id = self.session.user_id().ok_or(TransportError::MissingCredential)?;
        let mut payload = json!({
            "msg": message.text,
            "from_id": from_id,
            "to_id": message.recipient_id,
            "message_hash_id": message.client_message_id,
        });
        if let (Some(url), Some(map)) = (&message.media_url, payload.as_object_mut()) {
            map.insert("media_url".to_string(), Value::String(url.clone()));
        }
        self.emit(SEND_MESSAGE_EVENT, payload)
    }

    /// Fire-and-forget group message.
    pub fn send_group_message(&self, group_id: u64, text: &str) -> TransportResult<()> {
        let from_id = self.session.user_id().ok_or(TransportError::MissingCredential)?;
        self.emit(
            SEND_GROUP_MESSAGE_EVENT,
            json!({ "msg": text, "from_id": from_id, "group_id": group_id }),
        )
    }

    /// Typing indicator towards one peer.
    pub fn send_typing(&self, recipient_id: u64, is_typing: bool) -> TransportResult<()> {
        let (token, user_id) = self.credentials()?;
        self.emit(
            SEND_TYPING_EVENT,
            json!({
                "access_token": token,
                "user_id": user_id,
                "recipient_id": recipient_id,
                "is_typing": if is_typing { TYPING_ACTIVE } else { TYPING_DONE },
            }),
        )
    }

    /// Read receipt for a message from `sender_id`.
    pub fn send_seen(&self, message_id: u64, sender_id: u64) -> TransportResult<()> {
        let (token, user_id) = self.credentials()?;
        self.emit(
            SEND_SEEN_EVENT,
            json!({
                "access_token": token,
                "user_id": user_id,
                "message_id": message_id,
                "sender_id": sender_id,
            }),
        )
    }

    /// # Emit
    ///
    /// Queues one event on the open session's writer. Rejected synchronously
    /// when no joined session exists.
    pub fn emit(&self, event: &str, data: Value) -> TransportResult<()> {
        let frame = socketio::encode_event(event, &data);
        let outbound = lock(&self.outbound);
        match outbound.as_ref() {
            Some(tx) if self.state() == ChannelState::Connected => {
                tx.send(frame).map_err(|_| TransportError::NotConnected)?;
                trace!(event, "Emitted");
                Ok(())
            }
            _ => Err(TransportError::NotConnected),
        }
    }

    fn credentials(&self) -> TransportResult<(String, u64)> {
        match (self.session.access_token(), self.session.user_id()) {
            (Some(token), Some(user_id)) => Ok((token, user_id)),
            _ => Err(TransportError::MissingCredential),
        }
    }

    /// Primary execution loop with reconnection logic.
    async fn run(self: Arc<Self>) {
        let initial = self.config.reconnect_initial();
        let cap = self.config.reconnect_max();
        let mut backoff = initial;
        let mut failures: u32 = 0;
        let mut ever_connected = false;
        let mut reported_unavailable = false;

        while !self.cancel.is_cancelled() {
            self.state_tx.send_replace(if ever_connected {
                ChannelState::Reconnecting
            } else {
                ChannelState::Connecting
            });

            match self.session.access_token() {
                None => debug!("No credential; channel waits"),
                Some(token) => {
                    let timeout = self.config.connect_timeout();
                    let attempt = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        res = tokio::time::timeout(timeout, self.handshake(&token)) => {
                            res.unwrap_or(Err(TransportError::Timeout(timeout)))
                        }
                    };
                    match attempt {
                        Ok((write, read, open)) => {
                            failures = 0;
                            backoff = initial;
                            ever_connected = true;
                            match self.session_loop(&token, write, read, &open).await {
                                SessionEnd::Closed => break,
                                SessionEnd::Lost(reason) => warn!(%reason, "Channel session lost; reconnecting"),
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(error = %e, attempt = failures, "Channel connect failed");
                            if !ever_connected
                                && !reported_unavailable
                                && failures >= self.config.setup_failure_threshold.max(1)
                            {
                                reported_unavailable = true;
                                error!(attempts = failures, "Persistent channel unavailable");
                                let _ = self.events_tx.send(TransportEvent::ChannelUnavailable {
                                    attempts: failures,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                }
            }

            let delay = with_jitter(backoff, cap);
            debug!(delay_ms = delay.as_millis() as u64, "Channel reconnect scheduled");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = (backoff * 2).min(cap);
        }

        self.state_tx.send_replace(ChannelState::Disconnected);
        debug!("Channel loop exited");
    }

    /// Opens the socket and completes the Engine.IO and Socket.IO handshakes.
    async fn handshake(&self, token: &str) -> TransportResult<(WsWrite, WsRead, OpenHandshake)> {
        let url = socket_url(&self.url, token, self.session.user_id())?;
        info!(host = url.host_str().unwrap_or_default(), "Connecting persistent channel");
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let open = match next_packet(&mut read).await? {
            Packet::Open(open) => open,
            other => return Err(TransportError::Malformed(format!("expected open packet, got {other:?}"))),
        };
        write.send(Message::Text(socketio::CONNECT.into())).await?;

        loop {
            match next_packet(&mut read).await? {
                Packet::Connect => break,
                Packet::Ping => write.send(Message::Text(socketio::PONG.into())).await?,
                Packet::ConnectError(message) => return Err(TransportError::Api { status: 401, message }),
                Packet::Close => return Err(TransportError::NotConnected),
                other => trace!(?other, "Ignoring packet during handshake"),
            }
        }
        Ok((write, read, open))
    }

    /// Runs one joined session until it ends.
    async fn session_loop(&self, token: &str, mut write: WsWrite, mut read: WsRead, open: &OpenHandshake) -> SessionEnd {
        let join = socketio::encode_event(JOIN_EVENT, &json!({ "user_id": token }));
        if let Err(e) = write.send(Message::Text(join.into())).await {
            return SessionEnd::Lost(format!("join failed: {e}"));
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        *lock(&self.outbound) = Some(out_tx);
        self.state_tx.send_replace(ChannelState::Connected);
        let _ = self.events_tx.send(TransportEvent::ChannelConnected);
        info!(sid = %open.sid, "Persistent channel joined");

        let silence_limit = self
            .config
            .ping_timeout()
            .max(Duration::from_millis(open.ping_interval + open.ping_timeout));
        let mut last_activity = Instant::now();
        // Watchdog: detects sessions the server stopped talking on.
        let mut watchdog = tokio::time::interval(WATCHDOG_TICK);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    leave_session(&mut write, LEAVE_GRACE).await;
                    break SessionEnd::Closed;
                }
                Some(frame) = out_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(frame.into())).await {
                        break SessionEnd::Lost(format!("write failed: {e}"));
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_activity = Instant::now();
                            if let Some(end) = self.handle_text(text.as_str(), &mut write).await {
                                break end;
                            }
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            last_activity = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break SessionEnd::Lost(format!("closed by server: {frame:?}"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break SessionEnd::Lost(format!("read error: {e}")),
                        None => break SessionEnd::Lost("stream ended".to_string()),
                    }
                }
                _ = watchdog.tick() => {
                    if last_activity.elapsed() > silence_limit {
                        break SessionEnd::Lost(format!("silent for {}s", silence_limit.as_secs()));
                    }
                }
            }
        };

        lock(&self.outbound).take();
        if matches!(end, SessionEnd::Lost(_)) {
            self.state_tx.send_replace(ChannelState::Reconnecting);
            let _ = self.events_tx.send(TransportEvent::ChannelDisconnected);
        }
        end
    }

    /// Handles one text frame; `Some` ends the session.
    async fn handle_text(&self, text: &str, write: &mut WsWrite) -> Option<SessionEnd> {
        let packet = match socketio::decode(text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return None;
            }
        };
        match packet {
            Packet::Ping => {
                if let Err(e) = write.send(Message::Text(socketio::PONG.into())).await {
                    return Some(SessionEnd::Lost(format!("pong failed: {e}")));
                }
            }
            Packet::Event { name, args, .. } => match parse_channel_event(&name, &args) {
                Ok(events) => {
                    for event in events {
                        let _ = self.events_tx.send(event);
                    }
                }
                Err(e) => warn!(event = %name, error = %e, "Dropping malformed event"),
            },
            Packet::Disconnect => return Some(SessionEnd::Lost("server left namespace".to_string())),
            Packet::Close => return Some(SessionEnd::Lost("engine close".to_string())),
            other => trace!(?other, "Ignoring packet"),
        }
        None
    }
}

/// Builds the WebSocket URL: `ws(s)` scheme, Socket.IO path and transport
/// query, plus the credential parameters.
pub fn socket_url(base: &str, token: &str, user_id: Option<u64>) -> TransportResult<Url> {
    let mut url = Url::parse(base)?;
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| TransportError::Malformed(format!("can not use {base} as websocket url")))?;
    }
    if url.path() == "/" {
        url.set_path("/socket.io/");
    }
    let has_eio = url.query_pairs().any(|(k, _)| k == "EIO");
    {
        let mut query = url.query_pairs_mut();
        if !has_eio {
            query.append_pair("EIO", "4").append_pair("transport", "websocket");
        }
        query.append_pair("access_token", token);
        if let Some(user_id) = user_id {
            query.append_pair("user_id", &user_id.to_string());
        }
    }
    Ok(url)
}

async fn next_packet(read: &mut WsRead) -> TransportResult<Packet> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => return socketio::decode(text.as_str()),
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::NotConnected),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Sends the namespace disconnect and closes the socket, giving up after
/// `grace` if the peer stopped reading.
async fn leave_session<S>(write: &mut S, grace: Duration) -> bool
where
    S: Sink<Message> + Unpin,
{
    let leave = async {
        let _ = write.send(Message::Text(socketio::DISCONNECT.into())).await;
        let _ = write.close().await;
    };
    if tokio::time::timeout(grace, leave).await.is_err() {
        warn!(grace_ms = grace.as_millis() as u64, "Socket did not close in time; dropping it");
        return false;
    }
    true
}

/// Waits up to `grace` for the loop task, then aborts it.
///
/// # Returns
/// `true` if the task ended on its own.
async fn stop_within(mut handle: JoinHandle<()>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "Channel task ended abnormally");
            true
        }
        Err(_) => {
            warn!("Channel task did not stop within grace period; aborting");
            handle.abort();
            false
        }
    }
}

fn with_jitter(base: Duration, cap: Duration) -> Duration {
    let spread = (base.as_millis() / 4) as u64;
    let jitter = if spread == 0 { 0 } else { rand::rng().random_range(0..=spread) };
    (base + Duration::from_millis(jitter)).min(cap)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
