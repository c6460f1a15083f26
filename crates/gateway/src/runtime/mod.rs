//! Core runtime: the [`Orchestrator`] that turns inbound transport events
//! into backend turns.
//!
//! Per message: identity normalisation, echo and re-delivery filtering,
//! typing-capability learning, then an adaptive wait in the burst buffer.
//! When a batch flushes it becomes one [`Turn`], run under the user's
//! single-flight lock so turns for one user never overlap and keep their
//! arrival order.  Everything lives on one explicitly constructed instance;
//! there are no process-wide singletons.

pub mod backend;
pub mod buffer;
pub mod echo;
pub mod governor;
pub mod timing;
pub mod turn;
pub mod typing;
pub mod user_lock;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use tw_domain::config::Config;
use tw_domain::error::{Error, Result};
use tw_domain::event::{InboundMessage, PresenceEvent, SentMessage};
use tw_domain::trace::TraceEvent;
use tw_domain::turn::TurnOrigin;
use tw_sessions::{IdentityResolver, ThreadStore};

use self::backend::{ReplySink, TurnBackend};
use self::buffer::{BufferedMessage, MessageBuffer, PendingBatch, Pushed};
use self::echo::{EchoCache, EchoStats};
use self::governor::ConversationGovernor;
use self::timing::{BufferingSwitch, CuratedFinality, FinalityClassifier, TimeoutCalculator};
use self::turn::Conversation;
use self::typing::{TypingStats, TypingTracker};
use self::user_lock::{DispatchOutcome, LockIssues, LockStats, UserLockManager};

pub use self::turn::Turn;

/// External collaborators the orchestrator calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn TurnBackend>,
    pub sink: Arc<dyn ReplySink>,
    pub threads: Arc<dyn ThreadStore>,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InboundOutcome {
    /// The transport delivered this message ID before.
    Duplicate,
    /// Our own outbound message came back.
    EchoSuppressed { matched_by: &'static str },
    Ignored { reason: &'static str },
    /// Media without a caption, held until the next text message.
    MediaPending,
    /// Waiting for more messages.
    Buffered { wait_ms: u64, pending: usize },
    /// Handed to the user's lock as a turn.
    Dispatched { turn_id: String, queued: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub buffering_disabled: bool,
    pub pending_batches: usize,
    pub conversations: usize,
    pub typing: TypingStats,
    pub locks: LockStats,
    pub echo: EchoStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub typing_profiles_removed: usize,
    pub conversations_removed: usize,
    pub echo_entries_purged: usize,
    pub lock_issues: LockIssues,
}

pub struct Orchestrator {
    identity: IdentityResolver,
    typing: TypingTracker,
    timing: TimeoutCalculator,
    echo: EchoCache,
    buffer: MessageBuffer,
    locks: Arc<UserLockManager<Turn>>,
    governor: ConversationGovernor,
    conversations: Mutex<HashMap<String, Conversation>>,
    backend: Arc<dyn TurnBackend>,
    sink: Arc<dyn ReplySink>,
    threads: Arc<dyn ThreadStore>,
    typing_extension: Duration,
    /// Idle time after which typing profiles and governor state are dropped.
    inactivity: Duration,
    forward_operator_messages: bool,
}

impl Orchestrator {
    pub fn new(cfg: &Config, collaborators: Collaborators) -> Result<Arc<Self>> {
        Self::with_classifier(cfg, collaborators, Arc::new(CuratedFinality::default()))
    }

    /// Build with a custom finality heuristic.
    pub fn with_classifier(
        cfg: &Config,
        collaborators: Collaborators,
        classifier: Arc<dyn FinalityClassifier>,
    ) -> Result<Arc<Self>> {
        let echo = EchoCache::new(&cfg.echo)
            .map_err(|e| Error::Config(format!("echo normalizer: {e}")))?;
        let switch = BufferingSwitch::from_config(&cfg.buffering);
        if switch.is_disabled() {
            tracing::warn!("message buffering disabled; every message is its own turn");
        }

        Ok(Arc::new(Self {
            identity: IdentityResolver::from_config(&cfg.threads),
            typing: TypingTracker::new(cfg.typing.clone()),
            timing: TimeoutCalculator::new(classifier, switch)
                .with_short_burst_chars(cfg.buffering.short_burst_chars),
            echo,
            buffer: MessageBuffer::new(&cfg.buffering),
            locks: Arc::new(UserLockManager::new(&cfg.locks)),
            governor: ConversationGovernor::new(&cfg.governor),
            conversations: Mutex::new(HashMap::new()),
            backend: collaborators.backend,
            sink: collaborators.sink,
            threads: collaborators.threads,
            typing_extension: Duration::from_millis(cfg.buffering.typing_extension_ms),
            inactivity: Duration::from_secs(cfg.typing.inactivity_cleanup_secs),
            forward_operator_messages: cfg.echo.forward_operator_messages,
        }))
    }

    // ── accessors ──────────────────────────────────────────────────

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn timing(&self) -> &TimeoutCalculator {
        &self.timing
    }

    pub fn echo(&self) -> &EchoCache {
        &self.echo
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    pub fn locks(&self) -> &Arc<UserLockManager<Turn>> {
        &self.locks
    }

    pub fn governor(&self) -> &ConversationGovernor {
        &self.governor
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    /// Runtime override for buffering.
    pub fn set_buffering_disabled(&self, disabled: bool) {
        self.timing.switch().set_disabled(disabled);
    }

    // ── inbound ────────────────────────────────────────────────────

    pub fn handle_message(self: &Arc<Self>, msg: InboundMessage) -> InboundOutcome {
        // Our own messages are keyed by the chat they went to.
        let user_id = if msg.from_self {
            self.identity.resolve(&msg.chat_id)
        } else {
            self.identity.resolve(msg.sender())
        };

        if self.echo.is_bot_sent_message(&msg.message_id)
            || self.echo.is_message_from_bot(&user_id, &msg.message_id)
        {
            suppressed(&user_id, &msg.message_id, "message_id");
            return InboundOutcome::EchoSuppressed {
                matched_by: "message_id",
            };
        }
        if !self.echo.accept_inbound(&msg.message_id) {
            suppressed(&user_id, &msg.message_id, "redelivery");
            return InboundOutcome::Duplicate;
        }

        let body = msg.body();
        if msg.from_self {
            // Only our own account can echo; a user repeating our words is
            // still a user message.
            if body.is_some_and(|text| self.echo.is_bot_sent_content(&msg.chat_id, text)) {
                suppressed(&user_id, &msg.message_id, "content");
                return InboundOutcome::EchoSuppressed {
                    matched_by: "content",
                };
            }
            return self.handle_operator_message(&user_id, &msg);
        }

        self.typing.record_message(&user_id);

        let Some(text) = body else {
            return match msg.media_ref.as_deref() {
                Some(media) => {
                    self.echo.add_pending_image(&user_id, media);
                    tracing::debug!(user_id = %user_id, "media held for the next text");
                    InboundOutcome::MediaPending
                }
                None => InboundOutcome::Ignored { reason: "empty" },
            };
        };

        let typing = self.typing.has_typing_support(&user_id);
        let mut pending = self.buffer.pending_messages(&user_id);
        pending.push(text.to_owned());
        let timeout = self.timing.batch_timeout(&pending, typing);
        let buffered = BufferedMessage {
            user_id: &user_id,
            chat_id: &msg.chat_id,
            message_id: &msg.message_id,
            text,
            media: msg.media_ref.as_deref(),
        };

        if timeout.is_zero() {
            // Buffering is off.  Anything still pending from before the
            // switch goes out with this message so order holds.
            self.buffer.push(buffered, timeout, |_, _| noop_timer());
            return match self.buffer.take_now(&user_id) {
                Some(batch) => self.flush_batch(batch),
                None => InboundOutcome::Ignored { reason: "empty" },
            };
        }

        let pushed = self.buffer.push(buffered, timeout, |generation, deadline| {
            self.arm_flush(user_id.clone(), generation, deadline)
        });
        let deadline = match pushed {
            Pushed::Waiting(deadline) => deadline,
            Pushed::Repeated(_) => {
                tracing::debug!(user_id = %user_id, "repeated text skipped");
                return InboundOutcome::Ignored { reason: "repeated" };
            }
            Pushed::Full => {
                tracing::warn!(user_id = %user_id, "batch message cap reached, flushing now");
                return match self.buffer.take_now(&user_id) {
                    Some(batch) => self.flush_batch(batch),
                    None => InboundOutcome::Ignored { reason: "empty" },
                };
            }
        };
        let wait = deadline.saturating_duration_since(Instant::now());
        tracing::debug!(
            user_id = %user_id,
            typing,
            wait_ms = wait.as_millis() as u64,
            "message buffered"
        );
        InboundOutcome::Buffered {
            wait_ms: wait.as_millis() as u64,
            pending: self.buffer.pending_messages(&user_id).len(),
        }
    }

    fn handle_operator_message(self: &Arc<Self>, user_id: &str, msg: &InboundMessage) -> InboundOutcome {
        if !self.forward_operator_messages {
            return InboundOutcome::Ignored {
                reason: "operator_message",
            };
        }
        let Some(text) = msg.body() else {
            return InboundOutcome::Ignored {
                reason: "operator_media",
            };
        };
        tracing::info!(user_id = %user_id, "forwarding operator message");
        let mut turn = Turn::new(user_id, &msg.chat_id, text.to_owned(), TurnOrigin::Operator);
        turn.message_ids.push(msg.message_id.clone());
        self.dispatch_turn(turn)
    }

    /// A typing/recording signal while a batch is pending keeps it open a
    /// little longer.  Returns whether the deadline moved.
    pub fn handle_presence(self: &Arc<Self>, ev: PresenceEvent) -> bool {
        if !ev.status.is_composing() {
            return false;
        }
        let user_id = self.identity.resolve(&ev.user_id);
        self.typing.record_typing_event(&user_id);
        if self.timing.switch().is_disabled() {
            return false;
        }
        self.buffer.extend(&user_id, self.typing_extension, |generation, deadline| {
            self.arm_flush(user_id.clone(), generation, deadline)
        })
    }

    /// Remember something the outbound transport sent for us.
    pub fn record_outbound(&self, sent: &SentMessage) {
        if let Some(content) = sent.content.as_deref().filter(|c| !c.trim().is_empty()) {
            self.echo.add_bot_sent_content(&sent.chat_id, content);
        }
        if let Some(message_id) = sent.message_id.as_deref() {
            let user_id = self
                .identity
                .resolve(sent.user_id.as_deref().unwrap_or(&sent.chat_id));
            self.echo.mark_message_as_sent(&user_id, message_id);
            self.echo.add_bot_sent_message(message_id);
        }
    }

    /// Forget the user's conversation: drop the thread handle and the
    /// usage and history kept for the governor.
    pub async fn reset_conversation(&self, user_id: &str) -> Result<String> {
        let user_id = self.identity.resolve(user_id);
        self.conversations.lock().remove(&user_id);
        self.threads.clear_handle(&user_id).await?;
        tracing::info!(user_id = %user_id, "conversation reset");
        Ok(user_id)
    }

    // ── flushing ───────────────────────────────────────────────────

    fn arm_flush(self: &Arc<Self>, user_id: String, generation: u64, deadline: Instant) -> AbortHandle {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(batch) = this.buffer.take(&user_id, generation) {
                this.flush_batch(batch);
            }
        })
        .abort_handle()
    }

    fn flush_batch(self: &Arc<Self>, batch: PendingBatch) -> InboundOutcome {
        let stats = self.timing.buffer_stats(&batch.messages);
        let text = batch.text();

        let mut media = self.echo.take_pending_images(&batch.user_id);
        media.extend(batch.media.iter().cloned());

        tracing::debug!(
            user_id = %batch.user_id,
            messages = stats.message_count,
            average_length = stats.average_length,
            has_likely_final = stats.has_likely_final,
            media = media.len(),
            "flushing batch"
        );
        TraceEvent::BatchFlushed {
            user_id: batch.user_id.clone(),
            messages: batch.messages.len(),
            turn_chars: text.chars().count(),
            waited_ms: batch.first_message_at.elapsed().as_millis() as u64,
        }
        .emit();

        let mut turn = Turn::new(&batch.user_id, &batch.chat_id, text, TurnOrigin::User);
        turn.media = media;
        turn.message_ids = batch.message_ids;
        self.dispatch_turn(turn)
    }

    /// Flush the user's pending batch now instead of waiting for its timer.
    pub fn flush_now(self: &Arc<Self>, user_id: &str) -> Option<InboundOutcome> {
        let user_id = self.identity.resolve(user_id);
        self.buffer
            .take_now(&user_id)
            .map(|batch| self.flush_batch(batch))
    }

    fn dispatch_turn(self: &Arc<Self>, turn: Turn) -> InboundOutcome {
        let turn_id = turn.turn_id.clone();
        let user_id = turn.user_id.clone();
        let queue_id = turn.queue_id().to_owned();
        let this = Arc::clone(self);

        let outcome = self
            .locks
            .spawn_dispatch(&user_id, &queue_id, turn, move |turn| {
                this.execute_turn(turn).boxed()
            });
        InboundOutcome::Dispatched {
            turn_id,
            queued: matches!(outcome, DispatchOutcome::Queued { .. }),
        }
    }

    // ── housekeeping ───────────────────────────────────────────────

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            buffering_disabled: self.timing.switch().is_disabled(),
            pending_batches: self.buffer.pending_users(),
            conversations: self.conversations.lock().len(),
            typing: self.typing.stats(),
            locks: self.locks.stats(),
            echo: self.echo.stats(),
        }
    }

    /// Periodic cleanup: idle typing profiles and conversations, expired
    /// echo entries, and a scan for stuck locks and long queues.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            typing_profiles_removed: self.typing.cleanup(self.inactivity),
            conversations_removed: self.prune_conversations(),
            echo_entries_purged: self.echo.purge_expired(),
            lock_issues: self.locks.detect_issues(),
        };
        if report.typing_profiles_removed + report.conversations_removed + report.echo_entries_purged
            > 0
        {
            tracing::debug!(
                typing_profiles_removed = report.typing_profiles_removed,
                conversations_removed = report.conversations_removed,
                echo_entries_purged = report.echo_entries_purged,
                "maintenance pass"
            );
        }
        report
    }

    /// Drop governor state for users idle longer than the inactivity window.
    /// The thread handle stays in the store; only the local counters go.
    fn prune_conversations(&self) -> usize {
        let now = Instant::now();
        let mut conversations = self.conversations.lock();
        let before = conversations.len();
        conversations.retain(|_, c| !c.is_idle(now, self.inactivity));
        before - conversations.len()
    }
}

fn suppressed(user_id: &str, message_id: &str, matched_by: &str) {
    tracing::debug!(
        user_id = %user_id,
        message_id = %message_id,
        matched_by,
        "inbound message suppressed"
    );
    TraceEvent::EchoSuppressed {
        user_id: user_id.to_owned(),
        message_id: message_id.to_owned(),
        matched_by: matched_by.to_owned(),
    }
    .emit();
}

fn noop_timer() -> AbortHandle {
    tokio::spawn(async {}).abort_handle()
}
