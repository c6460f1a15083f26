use serde::Serialize;

/// Structured trace events emitted across all turnwise crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    EchoSuppressed {
        user_id: String,
        message_id: String,
        /// `"message_id"`, `"content"` or `"redelivery"`.
        matched_by: String,
    },
    TypingCapabilityChanged {
        user_id: String,
        has_typing_support: bool,
        confidence_score: u8,
    },
    BatchFlushed {
        user_id: String,
        messages: usize,
        turn_chars: usize,
        waited_ms: u64,
    },
    TurnQueued {
        user_id: String,
        message_id: String,
        queue_len: usize,
    },
    QueueDrained {
        user_id: String,
        processed: usize,
        failed: usize,
        duration_ms: u64,
    },
    StaleLockExpired {
        user_id: String,
        held_ms: u64,
    },
    GovernorDecision {
        user_id: String,
        strategy: String,
        reason: String,
        total_tokens: u64,
        message_count: u64,
    },
    TurnCompleted {
        user_id: String,
        turn_id: String,
        duration_ms: u64,
        total_tokens: u64,
    },
    ThreadHandleSet {
        user_id: String,
        handle: String,
        is_new: bool,
    },
    IdentityResolved {
        raw_id: String,
        canonical: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "tw_event");
    }
}
