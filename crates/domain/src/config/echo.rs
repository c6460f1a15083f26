use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Self-echo suppression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sizing and lifetimes of the echo caches.  Every store is bounded by
/// `max_entries` in addition to its TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoConfig {
    #[serde(default = "d_500")]
    pub max_entries: usize,
    /// Pending media waiting for a caption.
    #[serde(default = "d_600")]
    pub image_ttl_secs: u64,
    /// Per-user IDs of messages we sent, and accepted inbound IDs.
    #[serde(default = "d_3600")]
    pub message_ttl_secs: u64,
    /// Global sent-message IDs are removed after this long.
    #[serde(default = "d_600")]
    pub global_id_ttl_secs: u64,
    /// Content fingerprints of messages we sent, per chat.
    #[serde(default = "d_300")]
    pub content_ttl_secs: u64,
    /// Dispatch non-echo messages typed on the bot's own account as
    /// operator turns instead of ignoring them.
    #[serde(default)]
    pub forward_operator_messages: bool,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            max_entries: d_500(),
            image_ttl_secs: d_600(),
            message_ttl_secs: d_3600(),
            global_id_ttl_secs: d_600(),
            content_ttl_secs: d_300(),
            forward_operator_messages: false,
        }
    }
}

fn d_500() -> usize {
    500
}
fn d_600() -> u64 {
    600
}
fn d_3600() -> u64 {
    3_600
}
fn d_300() -> u64 {
    300
}
