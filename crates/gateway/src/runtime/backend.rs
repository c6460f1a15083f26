//! External collaborators: the conversational backend and the outbound
//! reply channel.
//!
//! The core only sees the [`TurnBackend`] and [`ReplySink`] traits.  The
//! HTTP implementations forward JSON to configured endpoints; the model
//! client and the chat transport themselves live outside this workspace.

use std::time::Duration;

use serde::Deserialize;

use tw_domain::config::BackendConfig;
use tw_domain::error::{Error, Result};
use tw_domain::turn::{Delivery, TurnReply, TurnRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs one conversational turn against the stateful backend.
#[async_trait::async_trait]
pub trait TurnBackend: Send + Sync {
    async fn invoke(&self, req: TurnRequest) -> Result<TurnReply>;

    /// Short name used in logs and errors.
    fn backend_id(&self) -> &str;
}

/// Hands a reply to the chat transport.  Returns the transport message ID
/// when the transport reports one.
#[async_trait::async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, delivery: Delivery) -> Result<Option<String>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP implementations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

fn build_client(cfg: &BackendConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(cfg.timeout_ms))
        .build()
        .map_err(|e| Error::Config(format!("building HTTP client: {e}")))
}

fn bearer_token(cfg: &BackendConfig) -> Option<String> {
    std::env::var(&cfg.api_token_env)
        .ok()
        .filter(|t| !t.trim().is_empty())
}

/// POSTs each [`TurnRequest`] as JSON and expects a [`TurnReply`] back.
pub struct HttpTurnBackend {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpTurnBackend {
    pub fn new(url: &str, cfg: &BackendConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(cfg)?,
            url: url.to_owned(),
            token: bearer_token(cfg),
        })
    }
}

#[async_trait::async_trait]
impl TurnBackend for HttpTurnBackend {
    async fn invoke(&self, req: TurnRequest) -> Result<TurnReply> {
        tracing::debug!(
            user_id = %req.user_id,
            turn_id = %req.turn_id,
            resume = req.handle.is_some(),
            "backend turn request"
        );

        let mut builder = self.client.post(&self.url).json(&req);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await.map_err(from_reqwest)?;

        let status = resp.status();
        let body = resp.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(Error::Backend {
                backend: self.backend_id().to_owned(),
                message: format!("HTTP {} - {}", status.as_u16(), body),
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn backend_id(&self) -> &str {
        "http"
    }
}

/// Used when no backend URL is configured: every turn fails.
pub struct UnconfiguredBackend;

#[async_trait::async_trait]
impl TurnBackend for UnconfiguredBackend {
    async fn invoke(&self, _req: TurnRequest) -> Result<TurnReply> {
        Err(Error::Backend {
            backend: self.backend_id().to_owned(),
            message: "no backend.turn_url configured".into(),
        })
    }

    fn backend_id(&self) -> &str {
        "unconfigured"
    }
}

#[derive(Debug, Deserialize)]
struct DeliveryAck {
    #[serde(default)]
    message_id: Option<String>,
}

/// POSTs each [`Delivery`] as JSON; reads an optional `message_id` back.
pub struct HttpReplySink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpReplySink {
    pub fn new(url: &str, cfg: &BackendConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(cfg)?,
            url: url.to_owned(),
            token: bearer_token(cfg),
        })
    }
}

#[async_trait::async_trait]
impl ReplySink for HttpReplySink {
    async fn deliver(&self, delivery: Delivery) -> Result<Option<String>> {
        let mut builder = self.client.post(&self.url).json(&delivery);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await.map_err(from_reqwest)?;

        let status = resp.status();
        let body = resp.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(Error::Delivery(format!(
                "HTTP {} - {}",
                status.as_u16(),
                body
            )));
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        let ack: DeliveryAck = serde_json::from_str(&body).unwrap_or(DeliveryAck { message_id: None });
        Ok(ack.message_id)
    }
}

/// Logs replies instead of sending them.
pub struct LogReplySink;

#[async_trait::async_trait]
impl ReplySink for LogReplySink {
    async fn deliver(&self, delivery: Delivery) -> Result<Option<String>> {
        tracing::info!(
            user_id = %delivery.user_id,
            chat_id = %delivery.chat_id,
            turn_id = %delivery.turn_id,
            chars = delivery.text.chars().count(),
            "reply ready (no reply_url configured)"
        );
        Ok(None)
    }
}
