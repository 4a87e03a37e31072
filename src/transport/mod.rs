//! Outbound request construction and the HTTP transport.
//!
//! The engine talks to the chat backend through the [`ChatTransport`] trait
//! so tests can substitute a scripted transport. [`HttpChatTransport`] is the
//! production implementation on reqwest, with a bounded connect-time retry
//! policy.

pub mod retry;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http::header::{ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::config::AppConfig;
use crate::error::StreamError;
use crate::store::Identity;

use retry::{
    retry_backoff_delay, retry_delay, should_retry_status, should_retry_transport_message,
    RETRY_MAX_ATTEMPTS,
};

const HEADER_USER_ID: &str = "x-user-id";
const HEADER_GUEST_ID: &str = "x-guest-id";
const HEADER_STREAM_ID: &str = "x-stream-id";

/// Raw body bytes arriving from an open stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// One prior message in the conversation history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

impl HistoryMessage {
    #[must_use]
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

/// Everything needed to issue one turn's request, streaming or fallback.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub client_id: String,
    pub user_text: String,
    pub history: Vec<HistoryMessage>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    /// Pre-assigned correlation id, attached as `X-Stream-Id` when present.
    pub stream_id: Option<String>,
}

impl TurnRequest {
    #[must_use]
    pub fn new(client_id: &str, user_text: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            user_text: user_text.to_string(),
            ..Self::default()
        }
    }

    /// JSON body for the chat request. History is trimmed to the most recent
    /// `history_window` entries; `stream` selects the incremental vs. the
    /// forced-JSON path.
    #[must_use]
    pub fn body_json(&self, history_window: usize, stream: bool) -> Value {
        let skip = self.history.len().saturating_sub(history_window);
        let messages: Vec<Value> = self.history[skip..]
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();
        let mut body = json!({
            "messages": messages,
            "message": self.user_text,
            "client_message_id": self.client_id,
            "stream": stream,
        });
        if let Some(locale) = &self.locale {
            body["locale"] = json!(locale);
        }
        if let Some(timezone) = &self.timezone {
            body["timezone"] = json!(timezone);
        }
        body
    }
}

/// Transport boundary for one conversational turn.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open the streaming request and return the raw body byte stream.
    async fn open_stream(
        &self,
        request: &TurnRequest,
        identity: &Identity,
    ) -> Result<ByteStream, StreamError>;

    /// Issue the non-streaming fallback request; the JSON body is interpreted
    /// as an authoritative `done` payload.
    async fn fetch_fallback(
        &self,
        request: &TurnRequest,
        identity: &Identity,
    ) -> Result<Value, StreamError>;
}

/// Production transport over reqwest.
pub struct HttpChatTransport {
    client: reqwest::Client,
    endpoint: Url,
    history_window: usize,
    request_timeout: Duration,
}

impl HttpChatTransport {
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] for an unparseable endpoint URL and
    /// [`StreamError::Transport`] when the HTTP client cannot be built.
    pub fn new(config: &AppConfig) -> Result<Self, StreamError> {
        let endpoint = Url::parse(&config.endpoint.url)
            .map_err(|e| StreamError::Config(format!("Invalid endpoint URL: {e}")))?;
        let client = reqwest::Client::builder()
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(config.endpoint.connect_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StreamError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            history_window: config.chat.history_window,
            request_timeout: Duration::from_secs(config.endpoint.request_timeout_secs),
        })
    }

    fn build_request(
        &self,
        request: &TurnRequest,
        identity: &Identity,
        stream: bool,
    ) -> Result<reqwest::RequestBuilder, StreamError> {
        let body = serde_json::to_vec(&request.body_json(self.history_window, stream))
            .map_err(|e| StreamError::Internal(format!("Failed to encode request body: {e}")))?;
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header(ACCEPT, accept)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(user_id) = &identity.user_id {
            builder = builder.header(HEADER_USER_ID, user_id);
        }
        if let Some(guest_id) = &identity.guest_id {
            builder = builder.header(HEADER_GUEST_ID, guest_id);
        }
        if let Some(stream_id) = &request.stream_id {
            builder = builder.header(HEADER_STREAM_ID, stream_id);
        }
        if !stream {
            // Total-request timeout only for the fallback; a streaming body
            // has no bounded duration and is policed by the watchdogs.
            builder = builder.timeout(self.request_timeout);
        }
        Ok(builder)
    }

    async fn send_with_retry(
        &self,
        request: &TurnRequest,
        identity: &Identity,
        stream: bool,
    ) -> Result<reqwest::Response, StreamError> {
        let mut attempt = 0;
        loop {
            let builder = self.build_request(request, identity, stream)?;
            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if attempt < RETRY_MAX_ATTEMPTS && should_retry_status(status) {
                        let delay = retry_delay(response.headers(), attempt);
                        debug!(
                            status = status.as_u16(),
                            retry_attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "retrying chat request after retriable status"
                        );
                        drop(response);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    let message = response.text().await.unwrap_or_default();
                    return Err(StreamError::Upstream {
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(err) => {
                    let message = err.to_string();
                    if attempt >= RETRY_MAX_ATTEMPTS || !should_retry_transport_message(&message) {
                        return Err(StreamError::Transport(message));
                    }
                    let delay = retry_backoff_delay(attempt);
                    debug!(
                        retry_attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "retrying chat request after transport error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open_stream(
        &self,
        request: &TurnRequest,
        identity: &Identity,
    ) -> Result<ByteStream, StreamError> {
        let response = self.send_with_retry(request, identity, true).await?;
        let stream = response
            .bytes_stream()
            .map_err(|e| StreamError::Transport(e.to_string()));
        Ok(Box::pin(stream))
    }

    async fn fetch_fallback(
        &self,
        request: &TurnRequest,
        identity: &Identity,
    ) -> Result<Value, StreamError> {
        let response = self.send_with_retry(request, identity, false).await?;
        response
            .json()
            .await
            .map_err(|e| StreamError::Transport(format!("Failed to read fallback body: {e}")))
    }
}
