//! Backend-facing request/response shapes for a single turn.

use serde::{Deserialize, Serialize};

/// Where a turn came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOrigin {
    /// A coalesced batch of end-user messages.
    #[default]
    User,
    /// A manual message typed by a human operator on the bot's own account.
    Operator,
}

/// One entry of the recent conversation kept by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// `"user"`, `"assistant"` or `"operator"`.
    pub role: String,
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }

    pub fn operator(content: impl Into<String>) -> Self {
        Self {
            role: "operator".into(),
            content: content.into(),
        }
    }
}

/// Running counters reported by the backend for a conversation handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// A single backend invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub turn_id: String,
    pub user_id: String,
    pub chat_id: String,
    /// Handle to resume; `None` starts a fresh conversation.
    pub handle: Option<String>,
    /// The concatenated turn text.
    pub text: String,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub origin: TurnOrigin,
    /// System note replacing raw history (set after a summarize decision).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preamble: Option<String>,
    /// Recent messages to seed a fresh conversation with (set after cleanup).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub carry_over: Vec<ConversationMessage>,
}

/// What the backend returns for a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReply {
    pub handle: String,
    #[serde(default)]
    pub response_text: String,
    #[serde(default)]
    pub usage: UsageStats,
}

/// A reply handed to the outbound transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub turn_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub text: String,
}
