//! # REST Business API
//!
//! WoWonder-style v2 endpoints: every call is a `POST` to the API base with a
//! `type` query selecting the operation and `access_token` carrying the
//! session. Replies wrap their payload in an envelope whose `api_status`
//! (number or string) must be 200.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::configs::RestConfig;
use crate::core::collaborators::SessionProvider;
use crate::core::errors::{TransportError, TransportResult};
use crate::core::types::{InboundMessageEvent, OutboundMessage, TransportMode};
use crate::wire::events::{lenient_u64, parse_message};

const SEND_MESSAGE_TYPE: &str = "send-message";
const GET_MESSAGES_TYPE: &str = "get_user_messages";
const API_STATUS_OK: u64 = 200;

/// Content filter for `fetch_since`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFilter {
    /// Text only; media fields are left out server side.
    TextOnly,
    /// Everything.
    All,
}

impl FetchFilter {
    /// Wire value of the `load_mode` form field.
    pub fn as_str(self) -> &'static str {
        match self {
            FetchFilter::TextOnly => "text_only",
            FetchFilter::All => "all",
        }
    }
}

/// # Business API
///
/// The request/response operations the transport layer needs. All calls are
/// single attempts.
#[async_trait]
pub trait BusinessApi: Send + Sync {
    /// Sends one message.
    async fn send(&self, message: &OutboundMessage) -> TransportResult<()>;
    /// Messages with an id above `cursor`, across all chats.
    async fn fetch_since(&self, cursor: u64, filter: FetchFilter, limit: u32) -> TransportResult<Vec<InboundMessageEvent>>;
    /// Thumbnail bytes.
    async fn fetch_thumbnail(&self, url: &str) -> TransportResult<Bytes>;
    /// Full media bytes.
    async fn fetch_full(&self, url: &str) -> TransportResult<Bytes>;
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    api_status: Value,
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    errors: Option<Value>,
}

impl ApiEnvelope {
    fn into_result(self) -> TransportResult<Self> {
        match lenient_u64(&self.api_status) {
            Some(API_STATUS_OK) => Ok(self),
            status => Err(TransportError::Api {
                status: status.and_then(|s| u16::try_from(s).ok()).unwrap_or(0),
                message: self
                    .error_message
                    .clone()
                    .or_else(|| self.errors.as_ref().map(Value::to_string))
                    .unwrap_or_else(|| "unknown api error".to_string()),
            }),
        }
    }
}

/// # REST API Client
pub struct RestApiClient {
    client: Client,
    base_url: Url,
    session: Arc<dyn SessionProvider>,
}

impl RestApiClient {
    /// Creates a client rooted at `base_url` (must be absolute).
    pub fn new(base_url: &str, config: &RestConfig, session: Arc<dyn SessionProvider>) -> TransportResult<Self> {
        let base_url = Url::parse(base_url)?;
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self {
            client,
            base_url,
            session,
        })
    }

    fn token(&self) -> TransportResult<String> {
        self.session.access_token().ok_or(TransportError::MissingCredential)
    }

    async fn call(&self, op: &str, form: &[(&str, String)]) -> TransportResult<ApiEnvelope> {
        let token = self.token()?;
        let url = self.base_url.join(&format!("?type={op}"))?;
        let response = self
            .client
            .post(url)
            .query(&[("access_token", token.as_str())])
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        let envelope: ApiEnvelope = response.json().await?;
        envelope.into_result()
    }

    async fn download(&self, url: &str) -> TransportResult<Bytes> {
        let url = match Url::parse(url) {
            Ok(absolute) => absolute,
            Err(url::ParseError::RelativeUrlWithoutBase) => self.base_url.join(url)?,
            Err(e) => return Err(e.into()),
        };
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: format!("media download returned {status}"),
            });
        }
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl BusinessApi for RestApiClient {
    async fn send(&self, message: &OutboundMessage) -> TransportResult<()> {
        let mut form = vec![
            ("user_id", message.recipient_id.to_string()),
            ("text", message.text.clone()),
            ("message_hash_id", message.client_message_id.clone()),
        ];
        if let Some(media_url) = &message.media_url {
            form.push(("media_url", media_url.clone()));
        }
        self.call(SEND_MESSAGE_TYPE, &form).await?;
        debug!(recipient = message.recipient_id, id = %message.client_message_id, "Message sent over REST");
        Ok(())
    }

    async fn fetch_since(&self, cursor: u64, filter: FetchFilter, limit: u32) -> TransportResult<Vec<InboundMessageEvent>> {
        let form = [
            // 0 means every conversation.
            ("recipient_id", "0".to_string()),
            ("limit", limit.to_string()),
            ("after_message_id", cursor.to_string()),
            ("load_mode", filter.as_str().to_string()),
        ];
        let envelope = self.call(GET_MESSAGES_TYPE, &form).await?;

        let mut messages: Vec<InboundMessageEvent> = envelope
            .messages
            .iter()
            .filter_map(|raw| match parse_message(raw, TransportMode::Polling) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "Dropping malformed polled message");
                    None
                }
            })
            .collect();
        if filter == FetchFilter::TextOnly {
            for message in &mut messages {
                message.media_url = None;
            }
        }
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn fetch_thumbnail(&self, url: &str) -> TransportResult<Bytes> {
        self.download(url).await
    }

    async fn fetch_full(&self, url: &str) -> TransportResult<Bytes> {
        self.download(url).await
    }
}
