//! Transport-facing event shapes.
//!
//! These are the normalized envelopes the webhook layer hands to the core.
//! Channel-specific payloads are mapped onto them by the transport client,
//! which lives outside this workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One message event delivered by the chat transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport-assigned message ID.  Used for echo and re-delivery checks.
    pub message_id: String,
    /// Conversation the message belongs to (e.g. `573001234567@s.whatsapp.net`).
    pub chat_id: String,
    /// Raw sender ID.  Falls back to `chat_id` when the transport omits it.
    #[serde(default)]
    pub user_id: Option<String>,
    /// `true` when the transport reports the message as sent by our own account.
    #[serde(default)]
    pub from_self: bool,
    #[serde(default)]
    pub text: Option<String>,
    /// Reference to an attached media object (URL or transport media ID).
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Text body with surrounding whitespace removed; `None` when blank.
    pub fn body(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// The raw sender ID, falling back to the chat ID.
    pub fn sender(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.chat_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Presence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Typing,
    Recording,
    Online,
    Paused,
}

impl PresenceStatus {
    /// Whether the status means the user is actively composing.
    pub fn is_composing(self) -> bool {
        matches!(self, Self::Typing | Self::Recording)
    }
}

/// Out-of-band presence signal for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: String,
    pub status: PresenceStatus,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound bookkeeping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reported by the outbound transport after it sent something on our behalf,
/// so the echo of that message can be recognised when it comes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentMessage {
    pub chat_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}
