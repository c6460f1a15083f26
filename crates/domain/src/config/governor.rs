use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation growth governor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ceilings that decide when a conversation handle is summarized, pruned
/// or reset before the next backend call.
///
/// Fields are signed so that a bad value in the file still parses and can
/// be reported; see [`GovernorConfig::resolved`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Summarize once the handle's running token count exceeds this.
    #[serde(default = "d_8000")]
    pub max_tokens_before_summary: i64,
    /// Prune once the handle holds more messages than this.
    #[serde(default = "d_20")]
    pub max_messages_before_cleanup: i64,
    /// Messages kept verbatim by a cleanup.
    #[serde(default = "d_10")]
    pub keep_last_messages: i64,
    /// Backend price per 1000 tokens, in USD.
    #[serde(default = "d_cost_per_1k")]
    pub cost_per_1k_tokens: f64,
    /// Reset the chain once its estimated cost exceeds this, in USD.
    #[serde(default = "d_max_cost")]
    pub max_cost_usd: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_tokens_before_summary: d_8000(),
            max_messages_before_cleanup: d_20(),
            keep_last_messages: d_10(),
            cost_per_1k_tokens: d_cost_per_1k(),
            max_cost_usd: d_max_cost(),
        }
    }
}

/// Governor ceilings after sanitizing: every value is strictly positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernorLimits {
    pub max_tokens_before_summary: u64,
    pub max_messages_before_cleanup: u64,
    pub keep_last_messages: usize,
    pub cost_per_1k_tokens: f64,
    pub max_cost_usd: f64,
}

impl GovernorConfig {
    /// Names and values of every ceiling that is not strictly positive.
    pub fn non_positive_fields(&self) -> Vec<(&'static str, String)> {
        let mut bad = Vec::new();
        if self.max_tokens_before_summary <= 0 {
            bad.push((
                "governor.max_tokens_before_summary",
                self.max_tokens_before_summary.to_string(),
            ));
        }
        if self.max_messages_before_cleanup <= 0 {
            bad.push((
                "governor.max_messages_before_cleanup",
                self.max_messages_before_cleanup.to_string(),
            ));
        }
        if self.keep_last_messages <= 0 {
            bad.push((
                "governor.keep_last_messages",
                self.keep_last_messages.to_string(),
            ));
        }
        if !(self.cost_per_1k_tokens > 0.0) {
            bad.push((
                "governor.cost_per_1k_tokens",
                self.cost_per_1k_tokens.to_string(),
            ));
        }
        if !(self.max_cost_usd > 0.0) {
            bad.push(("governor.max_cost_usd", self.max_cost_usd.to_string()));
        }
        bad
    }

    /// Resolve to usable limits, replacing non-positive (or NaN) values
    /// with the defaults.
    pub fn resolved(&self) -> GovernorLimits {
        fn pos_int(v: i64, default: i64) -> u64 {
            if v > 0 {
                v as u64
            } else {
                default as u64
            }
        }
        fn pos_f64(v: f64, default: f64) -> f64 {
            if v > 0.0 {
                v
            } else {
                default
            }
        }

        GovernorLimits {
            max_tokens_before_summary: pos_int(self.max_tokens_before_summary, d_8000()),
            max_messages_before_cleanup: pos_int(self.max_messages_before_cleanup, d_20()),
            keep_last_messages: pos_int(self.keep_last_messages, d_10()) as usize,
            cost_per_1k_tokens: pos_f64(self.cost_per_1k_tokens, d_cost_per_1k()),
            max_cost_usd: pos_f64(self.max_cost_usd, d_max_cost()),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_8000() -> i64 {
    8_000
}
fn d_20() -> i64 {
    20
}
fn d_10() -> i64 {
    10
}
fn d_cost_per_1k() -> f64 {
    0.0015
}
fn d_max_cost() -> f64 {
    1.0
}
