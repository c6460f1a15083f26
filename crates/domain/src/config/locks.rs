use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-user locks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease length of a user lock.  An unreleased lock older than this is
    /// treated as free; the in-flight turn is not aborted.
    #[serde(default = "d_15000")]
    pub timeout_ms: u64,
    /// Queues longer than this are reported by the issue detector.
    #[serde(default = "d_5")]
    pub long_queue_threshold: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: d_15000(),
            long_queue_threshold: d_5(),
        }
    }
}

fn d_15000() -> u64 {
    15_000
}
fn d_5() -> usize {
    5
}
