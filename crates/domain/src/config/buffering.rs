use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Burst buffering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Controls how inbound bursts are coalesced into one turn.
///
/// The per-message wait itself is adaptive (length + typing capability);
/// these knobs bound it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferingConfig {
    /// Operational override: when `true` every wait is 0 and each message
    /// becomes its own turn.  `TW_DISABLE_MESSAGE_BUFFER=true` sets it too.
    #[serde(default)]
    pub disabled: bool,
    /// Hard cap on how long a batch may stay open, measured from its first
    /// message.
    #[serde(default = "d_10000")]
    pub max_window_ms: u64,
    /// Minimum remaining wait after a typing/recording presence event.
    #[serde(default = "d_2000")]
    pub typing_extension_ms: u64,
    /// A batch that reaches this many messages flushes at once.
    #[serde(default = "d_50")]
    pub max_batch_messages: usize,
    /// Two or more pending messages all shorter than this many characters
    /// read as a chatty burst and get the short-burst wait instead of the
    /// length tier.  `0` turns the rule off.
    #[serde(default = "d_20_chars")]
    pub short_burst_chars: usize,
    /// Skip a message whose text equals the previous one in the batch.
    #[serde(default = "d_true")]
    pub collapse_repeats: bool,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            max_window_ms: d_10000(),
            typing_extension_ms: d_2000(),
            max_batch_messages: d_50(),
            short_burst_chars: d_20_chars(),
            collapse_repeats: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typing capability learning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scoring policy for learning whether a user's transport delivers
/// presence events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Minimum confidence (0..=100) before typing support is trusted.
    #[serde(default = "d_70")]
    pub confidence_threshold: u8,
    /// Confidence added per observed typing event.
    #[serde(default = "d_20")]
    pub event_boost: u8,
    /// Confidence removed per message that arrives without recent typing.
    #[serde(default = "d_10")]
    pub silence_penalty: u8,
    /// A message counts as "silent" when the last typing event is older
    /// than this.
    #[serde(default = "d_60")]
    pub silence_window_secs: u64,
    /// Silent messages in a row before typing support is revoked.
    #[serde(default = "d_5")]
    pub max_silent_messages: u32,
    /// Profiles idle for longer than this are dropped by the cleanup task.
    #[serde(default = "d_86400")]
    pub inactivity_cleanup_secs: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: d_70(),
            event_boost: d_20(),
            silence_penalty: d_10(),
            silence_window_secs: d_60(),
            max_silent_messages: d_5(),
            inactivity_cleanup_secs: d_86400(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_10000() -> u64 {
    10_000
}
fn d_2000() -> u64 {
    2_000
}
fn d_true() -> bool {
    true
}
fn d_50() -> usize {
    50
}
fn d_20_chars() -> usize {
    20
}
fn d_70() -> u8 {
    70
}
fn d_20() -> u8 {
    20
}
fn d_10() -> u8 {
    10
}
fn d_60() -> u64 {
    60
}
fn d_5() -> u32 {
    5
}
fn d_86400() -> u64 {
    86_400
}
