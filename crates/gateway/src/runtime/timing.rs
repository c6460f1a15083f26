//! Adaptive wait computation for burst buffering.
//!
//! How long to hold a user's batch open depends on the length of the last
//! message and on whether the user's transport sends typing events.  A
//! message that reads as "complete" shortens the wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use tw_domain::config::BufferingConfig;

/// Environment switch that disables buffering regardless of the file config.
pub const DISABLE_BUFFER_ENV: &str = "TW_DISABLE_MESSAGE_BUFFER";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Operational override
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
/// Shared on/off switch for buffering.  While disabled every computed wait
/// is zero, so each message becomes its own turn.
#[derive(Debug, Clone, Default)]
pub struct BufferingSwitch(Arc<AtomicBool>);

impl BufferingSwitch {
    pub fn new(disabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(disabled)))
    }

    /// Disabled when the config says so or `TW_DISABLE_MESSAGE_BUFFER=true`.
    pub fn from_config(cfg: &BufferingConfig) -> Self {
        let env_disabled = std::env::var(DISABLE_BUFFER_ENV)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self::new(cfg.disabled || env_disabled)
    }

    pub fn is_disabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, disabled: bool) {
        let was = self.0.swap(disabled, Ordering::Relaxed);
        if was != disabled {
            tracing::info!(disabled, "message buffering override changed");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Finality heuristics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decides whether a message reads like the end of a burst.
pub trait FinalityClassifier: Send + Sync {
    fn is_likely_final(&self, text: &str) -> bool;
}

/// Curated endings and short complete replies (Spanish-first, as used by the
/// deployed channels).
#[derive(Debug, Clone)]
pub struct CuratedFinality {
    /// Terminal punctuation, informal closings and emoji.
    pub endings: Vec<String>,
    /// Whole messages that are complete replies on their own.
    pub complete_phrases: Vec<String>,
}

impl Default for CuratedFinality {
    fn default() -> Self {
        let endings = [
            // questions
            "?", "¿",
            // statements
            ".", "!", "!!", "...",
            // informal closings
            "ok", "gracias", "bye", "chao", "vale", "listo", "perfecto",
            // emoji
            "👍", "😊", "🙏", "✅", "👌", "💯", "🤝", "😄", "😁",
        ];
        let complete_phrases = [
            "si", "no", "bueno", "dale", "ya", "ah ok", "entiendo", "de acuerdo",
            "esta bien", "claro", "por supuesto",
        ];
        Self {
            endings: endings.iter().map(|s| s.to_string()).collect(),
            complete_phrases: complete_phrases.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FinalityClassifier for CuratedFinality {
    fn is_likely_final(&self, text: &str) -> bool {
        let trimmed = text.trim();
        let len = trimmed.chars().count();
        if len < 3 {
            return false;
        }
        if len > 100 {
            return true;
        }

        let lower = trimmed.to_lowercase();
        let ends = self.endings.iter().any(|end| {
            if end.chars().count() == 1 {
                trimmed.ends_with(end.as_str())
            } else {
                lower == *end
                    || lower.ends_with(&format!(" {end}"))
                    || trimmed.ends_with(end.as_str())
            }
        });

        ends || self.complete_phrases.iter().any(|p| lower == *p)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timeout calculator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferAction {
    ProcessNow,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferStats {
    pub message_count: usize,
    pub total_length: usize,
    pub average_length: usize,
    pub has_likely_final: bool,
    pub recommended_action: BufferAction,
}

/// Characters under which every message of a multi-message batch counts
/// as part of a chatty burst.
const DEFAULT_SHORT_BURST_CHARS: usize = 20;

pub struct TimeoutCalculator {
    classifier: Arc<dyn FinalityClassifier>,
    switch: BufferingSwitch,
    short_burst_chars: usize,
}

impl TimeoutCalculator {
    pub fn new(classifier: Arc<dyn FinalityClassifier>, switch: BufferingSwitch) -> Self {
        Self {
            classifier,
            switch,
            short_burst_chars: DEFAULT_SHORT_BURST_CHARS,
        }
    }

    /// Override the short-burst threshold; `0` disables the rule.
    pub fn with_short_burst_chars(mut self, chars: usize) -> Self {
        self.short_burst_chars = chars;
        self
    }

    pub fn switch(&self) -> &BufferingSwitch {
        &self.switch
    }

    pub fn is_likely_final(&self, text: &str) -> bool {
        self.classifier.is_likely_final(text)
    }

    /// Tiered wait by message length (in characters).
    pub fn dynamic_timeout(&self, len: usize, typing: bool) -> Duration {
        if self.switch.is_disabled() {
            return Duration::ZERO;
        }
        let ms = match (typing, len) {
            (true, 0..=5) => 1_000,
            (true, 6..=20) => 1_500,
            (true, 21..=50) => 2_000,
            (true, _) => 3_000,
            (false, 0..=5) => 3_000,
            (false, 6..=20) => 4_000,
            (false, 21..=50) => 5_000,
            (false, _) => 6_000,
        };
        Duration::from_millis(ms)
    }

    /// Wait to apply after `last` arrives.  A likely-final message
    /// overrides the tier: 800ms with typing support, 2000ms without.
    pub fn recommended_timeout(&self, last: &str, typing: bool) -> Duration {
        if self.switch.is_disabled() {
            return Duration::ZERO;
        }
        if self.is_likely_final(last) {
            return Duration::from_millis(if typing { 800 } else { 2_000 });
        }
        self.dynamic_timeout(last.chars().count(), typing)
    }

    /// Wait to apply to a batch whose newest message is the last element.
    /// A final-looking last message wins; otherwise a run of two or more
    /// short messages waits 1500ms with typing support and 3000ms without;
    /// otherwise the length tier of the last message applies.
    pub fn batch_timeout(&self, batch: &[String], typing: bool) -> Duration {
        let Some(last) = batch.last() else {
            return self.dynamic_timeout(0, typing);
        };
        if self.switch.is_disabled() || self.is_likely_final(last) {
            return self.recommended_timeout(last, typing);
        }
        if self.is_short_burst(batch) {
            return Duration::from_millis(if typing { 1_500 } else { 3_000 });
        }
        self.dynamic_timeout(last.chars().count(), typing)
    }

    fn is_short_burst(&self, batch: &[String]) -> bool {
        self.short_burst_chars > 0
            && batch.len() >= 2
            && batch
                .iter()
                .all(|m| m.chars().count() < self.short_burst_chars)
    }

    /// Advisory: does the batch look like more messages are on the way?
    pub fn should_wait_for_more(
        &self,
        batch: &[String],
        last_message_at: Instant,
        now: Instant,
    ) -> bool {
        let Some(last) = batch.last() else {
            return false;
        };
        let elapsed = now.saturating_duration_since(last_message_at);

        if elapsed > Duration::from_millis(5_000) {
            return false;
        }
        if self.is_likely_final(last) {
            return false;
        }
        if last.chars().count() < 5 && elapsed < Duration::from_millis(1_000) {
            return true;
        }
        if batch.len() >= 2 {
            let recent = &batch[batch.len().saturating_sub(3)..];
            let all_short = recent.iter().all(|m| m.chars().count() < 20);
            if all_short && elapsed < Duration::from_millis(2_000) {
                return true;
            }
        }
        false
    }

    pub fn buffer_stats(&self, batch: &[String]) -> BufferStats {
        let total_length: usize = batch.iter().map(|m| m.chars().count()).sum();
        let average_length = if batch.is_empty() {
            0
        } else {
            ((total_length as f64) / (batch.len() as f64)).round() as usize
        };
        let last_final = batch.last().is_some_and(|m| self.is_likely_final(m));
        BufferStats {
            message_count: batch.len(),
            total_length,
            average_length,
            has_likely_final: batch.iter().any(|m| self.is_likely_final(m)),
            recommended_action: if last_final {
                BufferAction::ProcessNow
            } else {
                BufferAction::Wait
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> TimeoutCalculator {
        TimeoutCalculator::new(Arc::new(CuratedFinality::default()), BufferingSwitch::new(false))
    }

    fn batch(msgs: &[&str]) -> Vec<String> {
        msgs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn typing_tier_boundaries() {
        let c = calc();
        assert_eq!(c.dynamic_timeout(5, true), Duration::from_millis(1_000));
        assert_eq!(c.dynamic_timeout(6, true), Duration::from_millis(1_500));
        assert_eq!(c.dynamic_timeout(20, true), Duration::from_millis(1_500));
        assert_eq!(c.dynamic_timeout(50, true), Duration::from_millis(2_000));
        assert_eq!(c.dynamic_timeout(51, true), Duration::from_millis(3_000));
    }

    #[test]
    fn no_typing_tier_boundaries() {
        let c = calc();
        assert_eq!(c.dynamic_timeout(0, false), Duration::from_millis(3_000));
        assert_eq!(c.dynamic_timeout(5, false), Duration::from_millis(3_000));
        assert_eq!(c.dynamic_timeout(6, false), Duration::from_millis(4_000));
        assert_eq!(c.dynamic_timeout(21, false), Duration::from_millis(5_000));
        assert_eq!(c.dynamic_timeout(500, false), Duration::from_millis(6_000));
    }

    #[test]
    fn disabled_switch_zeroes_every_wait() {
        let c = calc();
        c.switch().set_disabled(true);
        assert_eq!(c.dynamic_timeout(5, false), Duration::ZERO);
        assert_eq!(c.recommended_timeout("hola que tal", true), Duration::ZERO);

        c.switch().set_disabled(false);
        assert_eq!(c.dynamic_timeout(5, false), Duration::from_millis(3_000));
    }

    #[test]
    fn finality_rules() {
        let c = calc();
        // Too short, even if it is a complete phrase.
        assert!(!c.is_likely_final("si"));
        assert!(!c.is_likely_final("ok"));
        assert!(c.is_likely_final("dale"));
        assert!(c.is_likely_final("De acuerdo"));
        assert!(c.is_likely_final("cuanto cuesta?"));
        assert!(c.is_likely_final("muchas gracias"));
        assert!(c.is_likely_final("perfecto 👍"));
        assert!(c.is_likely_final("Esta bien OK"));
        assert!(!c.is_likely_final("quiero reservar"));
        assert!(c.is_likely_final(&"x".repeat(101)));
        assert!(!c.is_likely_final(&"x".repeat(100)));
    }

    #[test]
    fn final_message_shortens_wait() {
        let c = calc();
        assert_eq!(c.recommended_timeout("listo.", true), Duration::from_millis(800));
        assert_eq!(c.recommended_timeout("listo.", false), Duration::from_millis(2_000));
        assert_eq!(c.recommended_timeout("hola", false), Duration::from_millis(3_000));
    }

    #[test]
    fn short_burst_waits_less_than_the_tier() {
        let c = calc();
        // "que tal" alone sits in the 4000ms tier.
        assert_eq!(
            c.batch_timeout(&batch(&["que tal"]), false),
            Duration::from_millis(4_000)
        );
        assert_eq!(
            c.batch_timeout(&batch(&["hola", "que tal"]), false),
            Duration::from_millis(3_000)
        );
        assert_eq!(
            c.batch_timeout(&batch(&["hola", "que tal"]), true),
            Duration::from_millis(1_500)
        );
        // One long message breaks the run.
        let mixed = batch(&["hola", "te escribo por lo de la reserva de"]);
        assert_eq!(c.batch_timeout(&mixed, false), Duration::from_millis(5_000));
        // Finality still wins.
        assert_eq!(
            c.batch_timeout(&batch(&["hola", "gracias"]), true),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn short_burst_rule_can_be_turned_off() {
        let c = calc().with_short_burst_chars(0);
        assert_eq!(
            c.batch_timeout(&batch(&["hola", "que tal"]), false),
            Duration::from_millis(4_000)
        );
        c.switch().set_disabled(true);
        assert_eq!(c.batch_timeout(&batch(&["hola", "que tal"]), false), Duration::ZERO);
    }

    #[test]
    fn should_wait_for_more_rules() {
        let c = calc();
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        assert!(!c.should_wait_for_more(&[], t0, t0));
        // Stale.
        assert!(!c.should_wait_for_more(&batch(&["hol"]), t0, t0 + ms(5_001)));
        // Last message is final.
        assert!(!c.should_wait_for_more(&batch(&["hola", "gracias"]), t0, t0 + ms(100)));
        // Very short and very recent.
        assert!(c.should_wait_for_more(&batch(&["hol"]), t0, t0 + ms(500)));
        // A single short message past 1s: the run-of-short rule needs two.
        assert!(!c.should_wait_for_more(&batch(&["hola"]), t0, t0 + ms(1_500)));
        // Run of short messages within 2s.
        assert!(c.should_wait_for_more(&batch(&["hola", "quiero"]), t0, t0 + ms(1_500)));
        assert!(!c.should_wait_for_more(&batch(&["hola", "quiero"]), t0, t0 + ms(2_500)));
        // Only the last three are considered.
        let long_then_short = batch(&["esto es un mensaje bastante largo", "a1", "b2c", "d3e"]);
        assert!(c.should_wait_for_more(&long_then_short, t0, t0 + ms(1_500)));
    }

    #[test]
    fn buffer_stats_recommend_processing_after_final() {
        let c = calc();
        let stats = c.buffer_stats(&batch(&["hola", "quiero una habitacion."]));
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.total_length, 26);
        assert_eq!(stats.average_length, 13);
        assert!(stats.has_likely_final);
        assert_eq!(stats.recommended_action, BufferAction::ProcessNow);

        let empty = c.buffer_stats(&[]);
        assert_eq!(empty.average_length, 0);
        assert_eq!(empty.recommended_action, BufferAction::Wait);
    }

    struct NeverFinal;
    impl FinalityClassifier for NeverFinal {
        fn is_likely_final(&self, _text: &str) -> bool {
            false
        }
    }

    #[test]
    fn classifier_is_replaceable() {
        let c = TimeoutCalculator::new(Arc::new(NeverFinal), BufferingSwitch::new(false));
        assert_eq!(c.recommended_timeout("gracias!", true), Duration::from_millis(1_500));
    }
}
