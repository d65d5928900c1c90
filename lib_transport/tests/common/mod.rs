//! # Integration Test Harness
//!
//! A minimal in-process Socket.IO v4 server over `tokio-tungstenite`, and an
//! in-memory business API, so the transport can be driven end to end without
//! a network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use lib_transport::core::{InboundMessageEvent, MessageTarget, OutboundMessage};
use lib_transport::retrieve::{BusinessApi, FetchFilter};
use lib_transport::{TransportError, TransportEvent, TransportMode, TransportResult};

fn open_packet(ping_interval_ms: u64, ping_timeout_ms: u64) -> String {
    format!(
        r#"0{{"sid":"test-sid","upgrades":[],"pingInterval":{ping_interval_ms},"pingTimeout":{ping_timeout_ms},"maxPayload":1000000}}"#
    )
}

/// Commands for the currently connected client.
enum Control {
    Send(String),
    Drop,
}

/// # Mock Socket.IO Server
pub struct MockSocketServer {
    /// `ws://` URL clients should use.
    pub url: String,
    /// Request URIs of every accepted connection, in order.
    pub uris: Arc<Mutex<Vec<String>>>,
    /// Every text frame the clients sent after the handshake, tagged with the
    /// connection number (0-based).
    pub received: mpsc::UnboundedReceiver<(usize, String)>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Control>>>>,
    connections: Arc<AtomicUsize>,
}

impl MockSocketServer {
    /// Starts a server that accepts the namespace connection.
    pub async fn start() -> Self {
        Self::start_with(false, open_packet(25_000, 20_000)).await
    }

    /// Starts a server that answers the namespace connect with `44` (refused).
    pub async fn start_refusing() -> Self {
        Self::start_with(true, open_packet(25_000, 20_000)).await
    }

    /// Starts a server advertising short ping timings. It never pings.
    pub async fn start_with_ping(ping_interval_ms: u64, ping_timeout_ms: u64) -> Self {
        Self::start_with(false, open_packet(ping_interval_ms, ping_timeout_ms)).await
    }

    async fn start_with(refuse: bool, open: String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let uris = Arc::new(Mutex::new(Vec::new()));
        let current = Arc::new(Mutex::new(None));
        let connections = Arc::new(AtomicUsize::new(0));
        let (received_tx, received) = mpsc::unbounded_channel();

        {
            let uris = Arc::clone(&uris);
            let current = Arc::clone(&current);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let uris = Arc::clone(&uris);
                    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        uris.lock().unwrap().push(req.uri().to_string());
                        Ok(resp)
                    };
                    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                        continue;
                    };
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    let (control_tx, control_rx) = mpsc::unbounded_channel();
                    *current.lock().unwrap() = Some(control_tx);
                    tokio::spawn(serve_connection(ws, index, refuse, open.clone(), control_rx, received_tx.clone()));
                }
            });
        }

        Self {
            url: format!("ws://{addr}/socket.io/?EIO=4&transport=websocket"),
            uris,
            received,
            current,
            connections,
        }
    }

    /// Number of WebSocket connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Sends a raw frame to the latest connection.
    pub fn push(&self, frame: impl Into<String>) {
        if let Some(tx) = self.current.lock().unwrap().as_ref() {
            let _ = tx.send(Control::Send(frame.into()));
        }
    }

    /// Sends a `42[...]` event to the latest connection.
    pub fn push_event(&self, name: &str, data: serde_json::Value) {
        self.push(format!("42{}", serde_json::json!([name, data])));
    }

    /// Closes the latest connection from the server side.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.current.lock().unwrap().take() {
            let _ = tx.send(Control::Drop);
        }
    }

    /// Waits for the next client frame matching `pred`.
    pub async fn expect_frame<F>(&mut self, pred: F) -> (usize, String)
    where
        F: Fn(&str) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (index, frame) = self.received.recv().await.expect("server stopped");
                if pred(&frame) {
                    return (index, frame);
                }
            }
        })
        .await
        .expect("expected frame not received")
    }
}

async fn serve_connection(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    index: usize,
    refuse: bool,
    open: String,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    received_tx: mpsc::UnboundedSender<(usize, String)>,
) {
    let (mut write, mut read) = ws.split();
    if write.send(Message::Text(open.into())).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            control = control_rx.recv() => match control {
                Some(Control::Send(frame)) => {
                    if write.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Some(Control::Drop) | None => {
                    let _ = write.close().await;
                    break;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str().to_string();
                    if text == "40" {
                        let reply = if refuse { r#"44{"message":"unauthorized"}"# } else { r#"40{"sid":"ns-sid"}"# };
                        if write.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    let _ = received_tx.send((index, text));
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// A direct chat message payload as the server emits it.
pub fn wire_message(id: u64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "from_id": 7,
        "to_id": 1,
        "text": format!("message {id}"),
        "time": 1_700_000_000 + id as i64,
        "type": "text",
    })
}

/// # Mock Business API
#[derive(Default)]
pub struct MockApi {
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub poll_cursors: Mutex<Vec<u64>>,
    polls: Mutex<VecDeque<Vec<u64>>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues one poll reply with the given ids.
    pub fn script_poll(&self, ids: Vec<u64>) {
        self.polls.lock().unwrap().push_back(ids);
    }
}

#[async_trait]
impl BusinessApi for MockApi {
    async fn send(&self, message: &OutboundMessage) -> TransportResult<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn fetch_since(&self, cursor: u64, _filter: FetchFilter, _limit: u32) -> TransportResult<Vec<InboundMessageEvent>> {
        self.poll_cursors.lock().unwrap().push(cursor);
        let ids = self.polls.lock().unwrap().pop_front().unwrap_or_default();
        Ok(ids
            .into_iter()
            .map(|id| InboundMessageEvent {
                id,
                from_id: 7,
                target: MessageTarget::Direct { to_id: 1 },
                body: format!("message {id}"),
                timestamp: 0,
                kind: "text".to_string(),
                media_url: None,
                via: TransportMode::Polling,
            })
            .collect())
    }

    async fn fetch_thumbnail(&self, url: &str) -> TransportResult<Bytes> {
        Err(TransportError::Api { status: 404, message: url.to_string() })
    }

    async fn fetch_full(&self, url: &str) -> TransportResult<Bytes> {
        Err(TransportError::Api { status: 404, message: url.to_string() })
    }
}

/// Next event matching `pred`, skipping others.
pub async fn next_event<F>(events: &mut mpsc::UnboundedReceiver<TransportEvent>, pred: F) -> TransportEvent
where
    F: Fn(&TransportEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event not received")
}

/// Next delivered message id.
pub async fn next_message_id(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> u64 {
    match next_event(events, |e| matches!(e, TransportEvent::Message(_))).await {
        TransportEvent::Message(msg) => msg.id,
        _ => unreachable!(),
    }
}
