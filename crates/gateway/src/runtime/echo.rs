//! Self-echo suppression and inbound idempotency.
//!
//! Transports echo the messages we send back to the webhook as if they were
//! new inbound events, sometimes with the original message ID and sometimes
//! without.  We remember what we sent three ways (per-user IDs, global IDs
//! and per-chat content fingerprints) and also hold media that arrived
//! without a caption until the user's next text.
//!
//! Every store is an [`ExpiringLru`], so memory stays bounded under load.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use tw_domain::config::EchoConfig;

use crate::cache::ExpiringLru;

/// Internal identifiers the backend embeds in replies (`[th_abc]`,
/// `[run_42]`, …) that the transport may strip or keep.
const INTERNAL_ID_PATTERN: &str = r"\[(?:th_|run_|msg_|thread_|asst_)[^\]]+\]";
const FINGERPRINT_CHARS: usize = 200;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reduces a message body to the form used for content fingerprints.
#[derive(Debug, Clone)]
pub struct ContentNormalizer {
    internal_ids: Regex,
    whitespace: Regex,
}

impl ContentNormalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            internal_ids: Regex::new(INTERNAL_ID_PATTERN)?,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    /// Strip internal IDs, collapse whitespace, trim, lowercase and keep the
    /// first 200 characters.
    pub fn normalize(&self, content: &str) -> String {
        let stripped = self.internal_ids.replace_all(content, "");
        let collapsed = self.whitespace.replace_all(&stripped, " ");
        collapsed
            .trim()
            .to_lowercase()
            .chars()
            .take(FINGERPRINT_CHARS)
            .collect()
    }

    /// SHA-256 hex of the normalized content.
    pub fn fingerprint(&self, content: &str) -> String {
        hex::encode(Sha256::digest(self.normalize(content).as_bytes()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Echo cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EchoStats {
    pub pending_media_users: usize,
    pub sent_ids: usize,
    pub global_ids: usize,
    pub content_fingerprints: usize,
    pub inbound_ids: usize,
}

pub struct EchoCache {
    normalizer: ContentNormalizer,
    global_id_ttl: Duration,
    /// user → media refs waiting for a caption
    pending_media: Mutex<ExpiringLru<String, Vec<String>>>,
    /// (user, message ID) of messages we sent; each ID expires on its own
    sent_ids: Mutex<ExpiringLru<(String, String), ()>>,
    /// IDs we sent without a reliable user; shared with removal tasks
    global_ids: Arc<Mutex<ExpiringLru<String, ()>>>,
    /// `"{chat}\n{fingerprint}"` of content we sent
    content: Mutex<ExpiringLru<String, ()>>,
    /// inbound message IDs already accepted
    inbound: Mutex<ExpiringLru<String, ()>>,
}

impl EchoCache {
    pub fn new(cfg: &EchoConfig) -> Result<Self, regex::Error> {
        let cap = cfg.max_entries;
        let secs = Duration::from_secs;
        Ok(Self {
            normalizer: ContentNormalizer::new()?,
            global_id_ttl: secs(cfg.global_id_ttl_secs),
            pending_media: Mutex::new(ExpiringLru::new(cap, secs(cfg.image_ttl_secs))),
            sent_ids: Mutex::new(ExpiringLru::new(cap, secs(cfg.message_ttl_secs))),
            global_ids: Arc::new(Mutex::new(ExpiringLru::new(
                cap,
                secs(cfg.message_ttl_secs),
            ))),
            content: Mutex::new(ExpiringLru::new(cap, secs(cfg.content_ttl_secs))),
            inbound: Mutex::new(ExpiringLru::new(cap, secs(cfg.message_ttl_secs))),
        })
    }

    pub fn normalizer(&self) -> &ContentNormalizer {
        &self.normalizer
    }

    // ── pending media ──────────────────────────────────────────────

    pub fn add_pending_image(&self, user_id: &str, media_ref: &str) {
        self.pending_media
            .lock()
            .get_or_insert_with(user_id.to_owned(), Vec::new)
            .push(media_ref.to_owned());
    }

    pub fn get_pending_images(&self, user_id: &str) -> Vec<String> {
        self.pending_media
            .lock()
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_pending_images(&self, user_id: &str) {
        self.pending_media.lock().remove(user_id);
    }

    /// Return and clear the user's pending media in one step.
    pub fn take_pending_images(&self, user_id: &str) -> Vec<String> {
        self.pending_media.lock().remove(user_id).unwrap_or_default()
    }

    // ── sent message IDs ───────────────────────────────────────────

    pub fn mark_message_as_sent(&self, user_id: &str, message_id: &str) {
        if message_id.is_empty() {
            return;
        }
        self.sent_ids
            .lock()
            .insert((user_id.to_owned(), message_id.to_owned()), ());
    }

    pub fn is_message_from_bot(&self, user_id: &str, message_id: &str) -> bool {
        if message_id.is_empty() {
            return false;
        }
        self.sent_ids
            .lock()
            .contains_key(&(user_id.to_owned(), message_id.to_owned()))
    }

    /// Remember an ID we sent when the recipient is not known.  Besides the
    /// store TTL, the ID is dropped by a timer after the global ID lifetime.
    pub fn add_bot_sent_message(&self, message_id: &str) {
        self.global_ids.lock().insert(message_id.to_owned(), ());

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store: Weak<Mutex<ExpiringLru<String, ()>>> = Arc::downgrade(&self.global_ids);
        let id = message_id.to_owned();
        let after = self.global_id_ttl;
        handle.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(store) = store.upgrade() {
                store.lock().remove(&id);
            }
        });
    }

    /// Whether `message_id` is known as ours, globally or for any user.
    pub fn is_bot_sent_message(&self, message_id: &str) -> bool {
        if self.global_ids.lock().contains_key(message_id) {
            return true;
        }
        self.sent_ids
            .lock()
            .iter()
            .any(|((_, id), _)| id == message_id)
    }

    // ── content fingerprints ───────────────────────────────────────

    /// Remember the content we sent to `chat_id`.  Empty input is ignored.
    pub fn add_bot_sent_content(&self, chat_id: &str, content: &str) {
        if let Some(key) = self.content_key(chat_id, content) {
            self.content.lock().insert(key, ());
        }
    }

    pub fn is_bot_sent_content(&self, chat_id: &str, content: &str) -> bool {
        match self.content_key(chat_id, content) {
            Some(key) => self.content.lock().contains_key(&key),
            None => false,
        }
    }

    fn content_key(&self, chat_id: &str, content: &str) -> Option<String> {
        if chat_id.is_empty() || content.is_empty() {
            return None;
        }
        Some(format!(
            "{}\n{}",
            chat_id.to_lowercase(),
            self.normalizer.fingerprint(content)
        ))
    }

    // ── inbound idempotency ────────────────────────────────────────

    /// Record an inbound message ID.  Returns `false` when it was already
    /// accepted (a transport re-delivery).
    pub fn accept_inbound(&self, message_id: &str) -> bool {
        if message_id.is_empty() {
            return true;
        }
        let mut inbound = self.inbound.lock();
        if inbound.contains_key(message_id) {
            return false;
        }
        inbound.insert(message_id.to_owned(), ());
        true
    }

    // ── maintenance ────────────────────────────────────────────────

    /// Purge expired entries from every store.  Returns the total removed.
    pub fn purge_expired(&self) -> usize {
        self.pending_media.lock().purge_expired()
            + self.sent_ids.lock().purge_expired()
            + self.global_ids.lock().purge_expired()
            + self.content.lock().purge_expired()
            + self.inbound.lock().purge_expired()
    }

    pub fn stats(&self) -> EchoStats {
        EchoStats {
            pending_media_users: self.pending_media.lock().len(),
            sent_ids: self.sent_ids.lock().len(),
            global_ids: self.global_ids.lock().len(),
            content_fingerprints: self.content.lock().len(),
            inbound_ids: self.inbound.lock().len(),
        }
    }

    pub fn clear(&self) {
        self.pending_media.lock().clear();
        self.sent_ids.lock().clear();
        self.global_ids.lock().clear();
        self.content.lock().clear();
        self.inbound.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> EchoCache {
        EchoCache::new(&EchoConfig::default()).unwrap()
    }

    #[test]
    fn normalization_strips_internal_ids() {
        let n = ContentNormalizer::new().unwrap();
        assert_eq!(
            n.normalize("  Hola [th_abc123]   Mundo\n[run_9] OK  "),
            "hola mundo ok"
        );
        assert_eq!(n.normalize(&"a".repeat(300)).chars().count(), 200);
        assert_eq!(
            n.fingerprint("Hola   mundo"),
            n.fingerprint("hola mundo [msg_1]")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn content_echo_expires_after_five_minutes() {
        let c = cache();
        c.add_bot_sent_content("Chat@S.Whatsapp.Net", "Tu reserva está confirmada.");
        assert!(c.is_bot_sent_content("chat@s.whatsapp.net", "tu reserva   está confirmada."));
        assert!(!c.is_bot_sent_content("other-chat", "Tu reserva está confirmada."));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!c.is_bot_sent_content("chat@s.whatsapp.net", "Tu reserva está confirmada."));
    }

    #[test]
    fn empty_content_is_never_an_echo() {
        let c = cache();
        c.add_bot_sent_content("", "hola");
        c.add_bot_sent_content("chat", "");
        assert_eq!(c.stats().content_fingerprints, 0);
        assert!(!c.is_bot_sent_content("chat", ""));
    }

    #[tokio::test(start_paused = true)]
    async fn per_user_ids_live_one_hour() {
        let c = cache();
        c.mark_message_as_sent("u1", "m1");
        c.mark_message_as_sent("u1", "m2");
        assert!(c.is_message_from_bot("u1", "m1"));
        assert!(!c.is_message_from_bot("u2", "m1"));
        // Global lookup consults per-user sets too.
        assert!(c.is_bot_sent_message("m2"));

        tokio::time::advance(Duration::from_secs(3_601)).await;
        assert!(!c.is_message_from_bot("u1", "m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn each_sent_id_keeps_its_own_hour() {
        let c = cache();
        c.mark_message_as_sent("u1", "old");
        // A steady stream of replies to the same user.
        for i in 0..4 {
            tokio::time::advance(Duration::from_secs(20 * 60)).await;
            c.mark_message_as_sent("u1", &format!("new-{i}"));
        }

        assert!(!c.is_message_from_bot("u1", "old"));
        assert!(!c.is_bot_sent_message("old"));
        assert!(c.is_message_from_bot("u1", "new-1"));
        assert!(c.is_message_from_bot("u1", "new-3"));

        c.purge_expired();
        assert_eq!(c.stats().sent_ids, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn global_ids_are_removed_after_ten_minutes() {
        let c = cache();
        c.add_bot_sent_message("g1");
        assert!(c.is_bot_sent_message("g1"));

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert!(c.is_bot_sent_message("g1"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!c.is_bot_sent_message("g1"));
        assert_eq!(c.stats().global_ids, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_images_accumulate_and_expire() {
        let c = cache();
        c.add_pending_image("u1", "img-1");
        c.add_pending_image("u1", "img-2");
        assert_eq!(c.get_pending_images("u1"), vec!["img-1", "img-2"]);
        assert!(c.get_pending_images("u2").is_empty());

        c.clear_pending_images("u1");
        assert!(c.get_pending_images("u1").is_empty());

        c.add_pending_image("u1", "img-3");
        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(c.take_pending_images("u1").is_empty());
    }

    #[test]
    fn inbound_redelivery_is_rejected() {
        let c = cache();
        assert!(c.accept_inbound("wamid.1"));
        assert!(!c.accept_inbound("wamid.1"));
        assert!(c.accept_inbound("wamid.2"));
    }

    #[test]
    fn stores_stay_bounded() {
        let c = EchoCache::new(&EchoConfig {
            max_entries: 3,
            ..EchoConfig::default()
        })
        .unwrap();
        for i in 0..10 {
            c.add_bot_sent_content("chat", &format!("message {i}"));
            c.mark_message_as_sent(&format!("u{i}"), "m");
        }
        let stats = c.stats();
        assert_eq!(stats.content_fingerprints, 3);
        assert_eq!(stats.sent_ids, 3);
        // The most recent content survives eviction.
        assert!(c.is_bot_sent_content("chat", "message 9"));
        assert!(!c.is_bot_sent_content("chat", "message 0"));
    }
}
