//! Per-user typing capability learning.
//!
//! Some transports deliver "typing…" presence events, some never do, and
//! some only for certain clients.  We start every user as "no presence
//! signal" and let observed events raise a confidence score; messages that
//! arrive after a long silence lower it again.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use tw_domain::config::TypingConfig;
use tw_domain::trace::TraceEvent;

/// What we have learned about one user's presence signalling.
#[derive(Debug, Clone)]
pub struct UserTypingProfile {
    pub user_id: String,
    pub has_typing_support: bool,
    /// 0..=100.
    pub confidence_score: u8,
    /// `None` until the first presence event; counts as silent.
    pub last_typing_event_at: Option<Instant>,
    pub messages_without_typing_streak: u32,
    pub typing_events_received: u64,
    /// Last event or message of any kind; drives inactivity cleanup.
    pub last_seen_at: Instant,
}

impl UserTypingProfile {
    fn new(user_id: &str, now: Instant) -> Self {
        Self {
            user_id: user_id.to_owned(),
            has_typing_support: false,
            confidence_score: 0,
            last_typing_event_at: None,
            messages_without_typing_streak: 0,
            typing_events_received: 0,
            last_seen_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypingStats {
    pub total_users: usize,
    pub users_with_typing: usize,
    pub users_without_typing: usize,
    pub average_confidence: u8,
}

pub struct TypingTracker {
    cfg: TypingConfig,
    profiles: Mutex<HashMap<String, UserTypingProfile>>,
}

impl TypingTracker {
    pub fn new(cfg: TypingConfig) -> Self {
        Self {
            cfg,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    /// A presence "typing"/"recording" event was observed for the user.
    pub fn record_typing_event(&self, user_id: &str) {
        let now = Instant::now();
        let (before, after, score) = {
            let mut profiles = self.profiles.lock();
            let p = profiles
                .entry(user_id.to_owned())
                .or_insert_with(|| UserTypingProfile::new(user_id, now));
            let before = self.supported(p);

            p.has_typing_support = true;
            p.last_typing_event_at = Some(now);
            p.last_seen_at = now;
            p.typing_events_received += 1;
            p.confidence_score = p
                .confidence_score
                .saturating_add(self.cfg.event_boost)
                .min(100);

            (before, self.supported(p), p.confidence_score)
        };
        self.announce(user_id, before, after, score);
    }

    /// A message arrived from the user.  Penalizes confidence when no
    /// presence event was seen within the silence window.
    pub fn record_message(&self, user_id: &str) {
        let now = Instant::now();
        let silence = Duration::from_secs(self.cfg.silence_window_secs);
        let (before, after, score) = {
            let mut profiles = self.profiles.lock();
            let p = profiles
                .entry(user_id.to_owned())
                .or_insert_with(|| UserTypingProfile::new(user_id, now));
            let before = self.supported(p);
            p.last_seen_at = now;

            let silent = match p.last_typing_event_at {
                Some(at) => now.duration_since(at) > silence,
                None => true,
            };
            if silent {
                p.messages_without_typing_streak += 1;
                p.confidence_score = p.confidence_score.saturating_sub(self.cfg.silence_penalty);
            }
            if p.messages_without_typing_streak >= self.cfg.max_silent_messages {
                p.has_typing_support = false;
                p.confidence_score = 0;
            }

            (before, self.supported(p), p.confidence_score)
        };
        self.announce(user_id, before, after, score);
    }

    /// Whether the user's presence events can be trusted.  Unknown users
    /// report `false`.
    pub fn has_typing_support(&self, user_id: &str) -> bool {
        self.profiles
            .lock()
            .get(user_id)
            .is_some_and(|p| self.supported(p))
    }

    pub fn profile(&self, user_id: &str) -> Option<UserTypingProfile> {
        self.profiles.lock().get(user_id).cloned()
    }

    pub fn stats(&self) -> TypingStats {
        let profiles = self.profiles.lock();
        let total_users = profiles.len();
        let users_with_typing = profiles.values().filter(|p| self.supported(p)).count();
        let confidence_sum: u64 = profiles.values().map(|p| u64::from(p.confidence_score)).sum();
        let average_confidence = if total_users > 0 {
            ((confidence_sum as f64) / (total_users as f64)).round() as u8
        } else {
            0
        };
        TypingStats {
            total_users,
            users_with_typing,
            users_without_typing: total_users - users_with_typing,
            average_confidence,
        }
    }

    /// Drop profiles with no activity for longer than `max_inactivity`.
    /// Returns how many were removed.
    pub fn cleanup(&self, max_inactivity: Duration) -> usize {
        let now = Instant::now();
        let mut profiles = self.profiles.lock();
        let before = profiles.len();
        profiles.retain(|_, p| now.duration_since(p.last_seen_at) <= max_inactivity);
        before - profiles.len()
    }

    fn supported(&self, p: &UserTypingProfile) -> bool {
        p.has_typing_support && p.confidence_score >= self.cfg.confidence_threshold
    }

    fn announce(&self, user_id: &str, before: bool, after: bool, score: u8) {
        if before != after {
            TraceEvent::TypingCapabilityChanged {
                user_id: user_id.to_owned(),
                has_typing_support: after,
                confidence_score: score,
            }
            .emit();
        }
    }
}
