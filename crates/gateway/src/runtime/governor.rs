//! Conversation growth governor: keeps a user's backend conversation from
//! growing without bound.
//!
//! Before each turn the running usage of the user's handle is checked
//! against three ceilings, in priority order: token count (summarize),
//! message count (prune to the most recent messages) and estimated cost
//! (reset the chain).  The summary is built locally from the recent history
//! the orchestrator keeps; no extra backend call is made.

use std::collections::HashMap;

use serde::Serialize;

use tw_domain::config::{GovernorConfig, GovernorLimits};
use tw_domain::turn::{ConversationMessage, UsageStats};

/// Messages the summary is built from, oldest first.
const SUMMARY_SOURCE_MESSAGES: usize = 10;
const LAST_EXCHANGE_CHARS: usize = 50;
const KEY_POINT_CHARS: usize = 40;
const MAX_KEY_POINTS: usize = 3;
const MIN_TOPIC_WORD_CHARS: usize = 5;

const STOPWORDS: &[&str] = &[
    "about", "could", "there", "these", "thanks", "would", "please", "where", "which",
    "quiero", "quisiera", "gracias", "tengo", "tienen", "puedo", "sobre", "donde", "cuando",
    "hola", "buenas", "buenos", "porque", "entonces", "estoy", "necesito",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthStrategy {
    /// Replace the raw history with a locally generated summary.
    Summarize,
    /// Keep only the most recent messages.
    Cleanup,
    /// Drop the chain and start a fresh conversation.
    Reset,
}

impl GrowthStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::Cleanup => "cleanup",
            Self::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GovernorDecision {
    /// `None` when no action is needed.
    pub strategy: Option<GrowthStrategy>,
    pub reason: Option<String>,
    pub estimated_cost: f64,
}

impl GovernorDecision {
    pub fn needs_action(&self) -> bool {
        self.strategy.is_some()
    }
}

pub struct ConversationGovernor {
    limits: GovernorLimits,
}

impl ConversationGovernor {
    /// Non-positive ceilings are replaced by their defaults, with a warning.
    pub fn new(cfg: &GovernorConfig) -> Self {
        for (field, value) in cfg.non_positive_fields() {
            tracing::warn!(
                field = field,
                value = %value,
                "governor ceiling is not positive; using the default"
            );
        }
        Self {
            limits: cfg.resolved(),
        }
    }

    pub fn limits(&self) -> &GovernorLimits {
        &self.limits
    }

    pub fn estimated_cost(&self, stats: &UsageStats) -> f64 {
        (stats.total_tokens as f64 / 1000.0) * self.limits.cost_per_1k_tokens
    }

    /// Pick the growth strategy for the next turn.
    pub fn evaluate(&self, stats: &UsageStats) -> GovernorDecision {
        let l = &self.limits;
        let estimated_cost = self.estimated_cost(stats);

        let (strategy, reason) = if stats.total_tokens > l.max_tokens_before_summary {
            (
                Some(GrowthStrategy::Summarize),
                Some(format!(
                    "tokens exceeded: {} > {}",
                    stats.total_tokens, l.max_tokens_before_summary
                )),
            )
        } else if stats.message_count > l.max_messages_before_cleanup {
            (
                Some(GrowthStrategy::Cleanup),
                Some(format!(
                    "too many messages: {} > {}",
                    stats.message_count, l.max_messages_before_cleanup
                )),
            )
        } else if estimated_cost > l.max_cost_usd {
            (
                Some(GrowthStrategy::Reset),
                Some(format!("high cost: ${estimated_cost:.2}")),
            )
        } else {
            (None, None)
        };

        GovernorDecision {
            strategy,
            reason,
            estimated_cost,
        }
    }

    /// `true` exactly when the decision is to reset the chain.
    pub fn should_break_chain(&self, stats: &UsageStats) -> bool {
        let decision = self.evaluate(stats);
        let reset = decision.strategy == Some(GrowthStrategy::Reset);
        if reset {
            tracing::warn!(
                reason = decision.reason.as_deref().unwrap_or_default(),
                "breaking conversation chain"
            );
        }
        reset
    }

    /// Short system note standing in for the raw history, built from the
    /// oldest messages.
    pub fn generate_conversation_summary(
        &self,
        user_id: &str,
        messages: &[ConversationMessage],
    ) -> String {
        let source = &messages[..messages.len().min(SUMMARY_SOURCE_MESSAGES)];
        let user_texts: Vec<&str> = source
            .iter()
            .filter(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .collect();

        let topic = main_topic(&user_texts).unwrap_or_else(|| "general enquiry".into());
        let key_points = key_points(&user_texts);
        let last = user_texts
            .last()
            .map(|t| truncate(t, LAST_EXCHANGE_CHARS))
            .unwrap_or_else(|| "no previous interaction".into());

        let summary = format!(
            "Summary of the previous conversation:\n\
             - User: {user_id}\n\
             - Main topic: {topic}\n\
             - Key points: {key_points}\n\
             - Last relevant exchange: {last}"
        );

        tracing::info!(
            user_id = %user_id,
            original_messages = messages.len(),
            summary_len = summary.len(),
            "conversation summary generated"
        );
        summary
    }

    /// Keep the most recent `keep_last` messages.
    pub fn cleanup_old_messages(
        &self,
        messages: &[ConversationMessage],
        keep_last: usize,
    ) -> Vec<ConversationMessage> {
        if messages.len() <= keep_last {
            return messages.to_vec();
        }
        let kept = messages[messages.len() - keep_last..].to_vec();
        tracing::info!(
            original = messages.len(),
            kept = kept.len(),
            removed = messages.len() - kept.len(),
            "old conversation messages dropped"
        );
        kept
    }
}

/// Most frequent long word across the user's messages (ties go to the
/// earliest one seen).
fn main_topic(texts: &[&str]) -> Option<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut order = 0usize;
    for text in texts {
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if word.chars().count() < MIN_TOPIC_WORD_CHARS {
                continue;
            }
            let word = word.to_lowercase();
            if STOPWORDS.contains(&word.as_str()) {
                continue;
            }
            let entry = counts.entry(word).or_insert((0, order));
            entry.0 += 1;
            order += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|(_, (ca, fa)), (_, (cb, fb))| ca.cmp(cb).then(fb.cmp(fa)))
        .map(|(word, _)| word)
}

fn key_points(texts: &[&str]) -> String {
    let mut points: Vec<String> = Vec::new();
    for text in texts {
        let point = truncate(text.trim(), KEY_POINT_CHARS);
        if !point.is_empty() && !points.contains(&point) {
            points.push(point);
        }
        if points.len() == MAX_KEY_POINTS {
            break;
        }
    }
    if points.is_empty() {
        "none recorded".into()
    } else {
        points.join("; ")
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
