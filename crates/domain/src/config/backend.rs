use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation backend & reply channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where coalesced turns are sent and where replies go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// JSON endpoint that runs one conversational turn.  Unset means every
    /// turn fails with a backend error (useful only for dry runs).
    #[serde(default)]
    pub turn_url: Option<String>,
    /// JSON endpoint that delivers a reply to the messaging channel.  When
    /// unset, replies are only logged.
    #[serde(default)]
    pub reply_url: Option<String>,
    /// Environment variable holding a bearer token sent to both endpoints.
    #[serde(default = "d_backend_token_env")]
    pub api_token_env: String,
    /// Per-request timeout for the backend and reply calls.
    #[serde(default = "d_60000")]
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            turn_url: None,
            reply_url: None,
            api_token_env: d_backend_token_env(),
            timeout_ms: d_60000(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thread handles & identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistence of per-user conversation handles, plus the identity rules
/// used to key them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadsConfig {
    /// JSON file holding the handle index.  `None` keeps handles in memory.
    #[serde(default = "d_state_path")]
    pub state_path: Option<PathBuf>,
    /// Seconds between background flushes of the handle index.
    #[serde(default = "d_30")]
    pub flush_interval_secs: u64,
    /// Transport suffixes stripped from raw user ids
    /// (`"5511999@s.whatsapp.net"` → `"5511999"`).
    #[serde(default = "d_suffixes")]
    pub strip_suffixes: Vec<String>,
    /// Collapse several raw ids into one canonical user.
    #[serde(default)]
    pub identity_links: Vec<IdentityLink>,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
            flush_interval_secs: d_30(),
            strip_suffixes: d_suffixes(),
            identity_links: Vec::new(),
        }
    }
}

/// Maps many raw user ids to one canonical identity, so a person reaching
/// the service from two numbers shares one conversation handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityLink {
    /// The canonical identity key (e.g. `"alice"`).
    pub canonical: String,
    /// Raw ids (after suffix stripping) that all resolve to `canonical`.
    pub peer_ids: Vec<String>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_backend_token_env() -> String {
    "TW_BACKEND_TOKEN".into()
}
fn d_60000() -> u64 {
    60_000
}
fn d_state_path() -> Option<PathBuf> {
    Some(PathBuf::from("./data/threads.json"))
}
fn d_30() -> u64 {
    30
}
fn d_suffixes() -> Vec<String> {
    vec![
        "@s.whatsapp.net".into(),
        "@c.us".into(),
        "@g.us".into(),
        "@lid".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_links_parse_from_toml() {
        let cfg: ThreadsConfig = toml::from_str(
            r#"
            [[identity_links]]
            canonical = "alice"
            peer_ids = ["5511999", "5511888"]
        "#,
        )
        .unwrap();
        assert_eq!(cfg.identity_links.len(), 1);
        assert_eq!(cfg.identity_links[0].peer_ids.len(), 2);
        assert!(cfg.strip_suffixes.contains(&"@s.whatsapp.net".to_string()));
        assert_eq!(cfg.flush_interval_secs, 30);
    }
}
