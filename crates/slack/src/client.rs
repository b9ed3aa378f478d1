use std::time::Duration;

use async_trait::async_trait;
use salesrag_core::DiscoveredChannel;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

/// Errors a single gateway call can surface. The gate decides what is
/// retryable; the gateway only classifies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("rate limited (retry hint: {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("access denied: {0}")]
    Access(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("fatal api failure: {0}")]
    Fatal(String),
}

/// One page of channel descriptors from discovery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelPage {
    pub channels: Vec<DiscoveredChannel>,
    pub next_cursor: Option<String>,
}

/// A message as it arrives off the wire, before filtering/normalization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawMessage {
    pub ts: String,
    pub thread_ts: Option<String>,
    pub user: Option<String>,
    pub bot_id: Option<String>,
    pub subtype: Option<String>,
    pub text: String,
}

/// One page of channel history. Slack returns newest-first; the cursor walks
/// backward in time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryPage {
    pub messages: Vec<RawMessage>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// The narrow Slack surface this pipeline consumes. Every call is expected to
/// pass through the [`crate::gate::ApiGate`].
#[async_trait]
pub trait SlackGateway: Send + Sync {
    async fn list_channels(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ChannelPage, ApiError>;

    /// Fetch a history page. `oldest` bounds the walk at the lookback
    /// boundary (epoch seconds, as Slack expects).
    async fn fetch_history(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        oldest: Option<f64>,
        limit: u32,
    ) -> Result<HistoryPage, ApiError>;

    async fn join_channel(&self, channel_id: &str) -> Result<(), ApiError>;
}

/// reqwest-backed gateway against the Slack Web API.
pub struct HttpSlackGateway {
    client: reqwest::Client,
    base_url: String,
    token: SecretString,
}

impl HttpSlackGateway {
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), token }
    }

    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<ApiEnvelope, ApiError> {
        let url = format!("{}/{method}", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.expose_secret())
            .form(params)
            .send()
            .await
            .map_err(|error| ApiError::Transport(error.to_string()))?;

        // Slack signals rate limits both via HTTP 429 + Retry-After and via
        // an `ok: false, error: ratelimited` body; handle both.
        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ApiError::RateLimited { retry_after });
        }

        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|error| ApiError::Transport(error.to_string()))?;

        if envelope.ok {
            return Ok(envelope);
        }

        match envelope.error.as_deref() {
            Some("ratelimited") => Err(ApiError::RateLimited { retry_after: None }),
            Some(
                code @ ("channel_not_found" | "not_in_channel" | "is_archived"
                | "access_denied" | "method_not_supported_for_channel_type"),
            ) => Err(ApiError::Access(code.to_string())),
            Some(code) => Err(ApiError::Fatal(code.to_string())),
            None => Err(ApiError::Fatal("missing error code in failed response".to_string())),
        }
    }
}

#[async_trait]
impl SlackGateway for HttpSlackGateway {
    async fn list_channels(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ChannelPage, ApiError> {
        let mut params = vec![
            ("types", "public_channel".to_string()),
            ("exclude_archived", "false".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }

        let envelope = self.call("conversations.list", &params).await?;
        Ok(envelope.into_channel_page())
    }

    async fn fetch_history(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        oldest: Option<f64>,
        limit: u32,
    ) -> Result<HistoryPage, ApiError> {
        let mut params =
            vec![("channel", channel_id.to_string()), ("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        if let Some(oldest) = oldest {
            params.push(("oldest", format!("{oldest:.6}")));
        }

        let envelope = self.call("conversations.history", &params).await?;
        Ok(envelope.into_history_page())
    }

    async fn join_channel(&self, channel_id: &str) -> Result<(), ApiError> {
        let params = vec![("channel", channel_id.to_string())];
        match self.call("conversations.join", &params).await {
            Ok(_) => Ok(()),
            // Already being a member is success for our purposes.
            Err(ApiError::Fatal(code)) if code == "already_in_channel" => Ok(()),
            Err(error) => Err(error),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    ok: bool,
    error: Option<String>,
    channels: Option<Vec<WireChannel>>,
    messages: Option<Vec<WireMessage>>,
    has_more: Option<bool>,
    response_metadata: Option<ResponseMetadata>,
}

impl ApiEnvelope {
    fn next_cursor(&self) -> Option<String> {
        self.response_metadata
            .as_ref()
            .and_then(|metadata| metadata.next_cursor.clone())
            .filter(|cursor| !cursor.is_empty())
    }

    fn into_channel_page(self) -> ChannelPage {
        // The cursor comes off a borrow before the payload vec is consumed.
        let next_cursor = self.next_cursor();
        ChannelPage {
            channels: self
                .channels
                .unwrap_or_default()
                .into_iter()
                .map(WireChannel::into_discovered)
                .collect(),
            next_cursor,
        }
    }

    fn into_history_page(self) -> HistoryPage {
        let next_cursor = self.next_cursor();
        let has_more = self.has_more.unwrap_or(false);
        HistoryPage {
            messages: self
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(WireMessage::into_raw)
                .collect(),
            next_cursor,
            has_more,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    is_archived: bool,
    #[serde(default)]
    is_private: bool,
}

impl WireChannel {
    fn into_discovered(self) -> DiscoveredChannel {
        DiscoveredChannel {
            id: salesrag_core::ChannelId(self.id),
            name: self.name,
            is_archived: self.is_archived,
            is_private: self.is_private,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    ts: String,
    thread_ts: Option<String>,
    user: Option<String>,
    bot_id: Option<String>,
    subtype: Option<String>,
    #[serde(default)]
    text: String,
}

impl WireMessage {
    fn into_raw(self) -> RawMessage {
        RawMessage {
            ts: self.ts,
            thread_ts: self.thread_ts,
            user: self.user,
            bot_id: self.bot_id,
            subtype: self.subtype,
            text: self.text,
        }
    }
}
