//! Executes one turn under the user's lock: thread lookup, growth check,
//! backend call, handle persistence, reply delivery and echo bookkeeping.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::time::Instant;

use tw_domain::trace::TraceEvent;
use tw_domain::turn::{ConversationMessage, Delivery, TurnOrigin, TurnRequest, UsageStats};

use super::governor::GrowthStrategy;
use super::Orchestrator;

/// Recent history entries kept per user for summarize/cleanup.
pub const HISTORY_LIMIT: usize = 40;

/// A unit of work for the backend.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub turn_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub text: String,
    pub media: Vec<String>,
    pub origin: TurnOrigin,
    /// Inbound message IDs folded into this turn.
    pub message_ids: Vec<String>,
}

impl Turn {
    pub fn new(user_id: &str, chat_id: &str, text: String, origin: TurnOrigin) -> Self {
        Self {
            turn_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            chat_id: chat_id.to_owned(),
            text,
            media: Vec::new(),
            origin,
            message_ids: Vec::new(),
        }
    }

    /// ID used for queue bookkeeping: the last inbound message, or the turn ID.
    pub fn queue_id(&self) -> &str {
        self.message_ids.last().unwrap_or(&self.turn_id)
    }
}

/// Per-user state the governor works from.
#[derive(Debug)]
pub(crate) struct Conversation {
    pub usage: UsageStats,
    pub history: VecDeque<ConversationMessage>,
    pub last_active: Instant,
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            usage: UsageStats::default(),
            history: VecDeque::new(),
            last_active: Instant::now(),
        }
    }
}

impl Conversation {
    fn push(&mut self, message: ConversationMessage) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(message);
        self.last_active = Instant::now();
    }

    pub fn is_idle(&self, now: Instant, max_inactivity: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_active) > max_inactivity
    }
}

impl Orchestrator {
    pub(crate) async fn execute_turn(self: Arc<Self>, turn: Turn) -> anyhow::Result<()> {
        let started = Instant::now();
        let user_id = turn.user_id.as_str();

        let handle = self
            .threads
            .get_handle(user_id)
            .await
            .with_context(|| format!("reading thread handle for {user_id}"))?;

        let (usage, history) = {
            let conversations = self.conversations.lock();
            conversations
                .get(user_id)
                .map(|c| (c.usage, c.history.iter().cloned().collect::<Vec<_>>()))
                .unwrap_or_default()
        };

        let mut request = TurnRequest {
            turn_id: turn.turn_id.clone(),
            user_id: user_id.to_owned(),
            chat_id: turn.chat_id.clone(),
            handle,
            text: turn.text.clone(),
            media: turn.media.clone(),
            origin: turn.origin,
            preamble: None,
            carry_over: Vec::new(),
        };

        let decision = self.governor.evaluate(&usage);
        if let Some(strategy) = decision.strategy {
            let reason = decision.reason.clone().unwrap_or_default();
            tracing::info!(
                user_id = %user_id,
                strategy = strategy.as_str(),
                reason = %reason,
                estimated_cost = decision.estimated_cost,
                "conversation growth action"
            );
            TraceEvent::GovernorDecision {
                user_id: user_id.to_owned(),
                strategy: strategy.as_str().to_owned(),
                reason,
                total_tokens: usage.total_tokens,
                message_count: usage.message_count,
            }
            .emit();

            request.handle = None;
            match strategy {
                GrowthStrategy::Summarize => {
                    request.preamble =
                        Some(self.governor.generate_conversation_summary(user_id, &history));
                }
                GrowthStrategy::Cleanup => {
                    let keep = self.governor.limits().keep_last_messages;
                    request.carry_over = self.governor.cleanup_old_messages(&history, keep);
                }
                GrowthStrategy::Reset => {}
            }

            self.threads
                .clear_handle(user_id)
                .await
                .with_context(|| format!("clearing thread handle for {user_id}"))?;
            if let Some(conversation) = self.conversations.lock().get_mut(user_id) {
                conversation.usage = UsageStats::default();
            }
        }

        let reply = self
            .backend
            .invoke(request)
            .await
            .with_context(|| format!("backend {} turn {}", self.backend.backend_id(), turn.turn_id))?;

        let metadata = serde_json::json!({
            "chat_id": turn.chat_id,
            "last_turn_id": turn.turn_id,
            "origin": turn.origin,
        });
        self.threads
            .set_handle(user_id, &reply.handle, metadata)
            .await
            .with_context(|| format!("storing thread handle for {user_id}"))?;

        {
            let mut conversations = self.conversations.lock();
            let conversation = conversations.entry(user_id.to_owned()).or_default();
            conversation.usage = reply.usage;
            conversation.push(match turn.origin {
                TurnOrigin::User => ConversationMessage::user(&turn.text),
                TurnOrigin::Operator => ConversationMessage::operator(&turn.text),
            });
            if !reply.response_text.is_empty() {
                conversation.push(ConversationMessage::assistant(&reply.response_text));
            }
        }

        // Operator turns only sync the thread; the operator already spoke.
        if turn.origin == TurnOrigin::User && !reply.response_text.trim().is_empty() {
            // Recorded before sending so an early echo is still caught.
            self.echo
                .add_bot_sent_content(&turn.chat_id, &reply.response_text);
            let sent = self
                .sink
                .deliver(Delivery {
                    turn_id: turn.turn_id.clone(),
                    user_id: user_id.to_owned(),
                    chat_id: turn.chat_id.clone(),
                    text: reply.response_text.clone(),
                })
                .await
                .with_context(|| format!("delivering reply for turn {}", turn.turn_id))?;
            if let Some(message_id) = sent {
                self.echo.mark_message_as_sent(user_id, &message_id);
                self.echo.add_bot_sent_message(&message_id);
            }
        }

        TraceEvent::TurnCompleted {
            user_id: user_id.to_owned(),
            turn_id: turn.turn_id.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            total_tokens: reply.usage.total_tokens,
        }
        .emit();
        Ok(())
    }
}
