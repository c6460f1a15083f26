//! Per-user burst buffer.
//!
//! Messages from one user accumulate in a [`PendingBatch`] until its
//! deadline passes.  Every new message restarts the wait with a freshly
//! computed timeout; the previous timer is aborted and a generation
//! counter guards against a timer that already fired.  No batch stays open
//! longer than the maximum window measured from its first message, and a
//! batch that reaches the message cap is handed back for an immediate flush.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use tw_domain::config::BufferingConfig;

/// Messages waiting to become one turn.
#[derive(Debug)]
pub struct PendingBatch {
    pub user_id: String,
    pub chat_id: String,
    pub messages: Vec<String>,
    /// Media refs that arrived together with text.
    pub media: Vec<String>,
    /// Inbound message IDs, in arrival order.
    pub message_ids: Vec<String>,
    pub first_message_at: Instant,
    pub last_message_at: Instant,
    pub deadline: Instant,
    generation: u64,
    timer: Option<AbortHandle>,
}

impl PendingBatch {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Concatenated turn text.
    pub fn text(&self) -> String {
        self.messages.join(" ")
    }
}

/// One message to append to a batch.
#[derive(Debug, Clone)]
pub struct BufferedMessage<'a> {
    pub user_id: &'a str,
    pub chat_id: &'a str,
    pub message_id: &'a str,
    pub text: &'a str,
    pub media: Option<&'a str>,
}

/// What [`MessageBuffer::push`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    /// Appended; the batch flushes at this deadline.
    Waiting(Instant),
    /// Same text as the previous message of the batch, so it was skipped.
    /// The deadline is unchanged.
    Repeated(Instant),
    /// Appended, and the batch reached the message cap.  No timer is armed;
    /// the caller should take the batch now.
    Full,
}

pub struct MessageBuffer {
    max_window: Duration,
    max_messages: usize,
    collapse_repeats: bool,
    batches: Mutex<HashMap<String, PendingBatch>>,
}

impl MessageBuffer {
    pub fn new(cfg: &BufferingConfig) -> Self {
        Self {
            max_window: Duration::from_millis(cfg.max_window_ms),
            max_messages: cfg.max_batch_messages.max(1),
            collapse_repeats: cfg.collapse_repeats,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Append a message and re-arm the flush timer.  `arm` spawns the timer
    /// for `(generation, deadline)` and returns its abort handle; it runs
    /// while the buffer is locked, so it must not block.
    pub fn push<A>(&self, msg: BufferedMessage<'_>, timeout: Duration, arm: A) -> Pushed
    where
        A: FnOnce(u64, Instant) -> AbortHandle,
    {
        let now = Instant::now();
        let mut batches = self.batches.lock();
        let batch = batches
            .entry(msg.user_id.to_owned())
            .or_insert_with(|| PendingBatch {
                user_id: msg.user_id.to_owned(),
                chat_id: msg.chat_id.to_owned(),
                messages: Vec::new(),
                media: Vec::new(),
                message_ids: Vec::new(),
                first_message_at: now,
                last_message_at: now,
                deadline: now,
                generation: 0,
                timer: None,
            });

        if self.collapse_repeats
            && msg.media.is_none()
            && batch.messages.last().is_some_and(|last| last == msg.text)
        {
            return Pushed::Repeated(batch.deadline);
        }

        batch.messages.push(msg.text.to_owned());
        if let Some(media) = msg.media {
            batch.media.push(media.to_owned());
        }
        batch.message_ids.push(msg.message_id.to_owned());
        batch.last_message_at = now;

        if batch.messages.len() >= self.max_messages {
            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }
            return Pushed::Full;
        }

        batch.deadline = (now + timeout).min(batch.first_message_at + self.max_window);
        rearm(batch, arm);
        Pushed::Waiting(batch.deadline)
    }

    /// Push the deadline of a pending batch out to at least `now +
    /// extension` (still capped by the window).  Returns whether the
    /// deadline moved.
    pub fn extend<A>(&self, user_id: &str, extension: Duration, arm: A) -> bool
    where
        A: FnOnce(u64, Instant) -> AbortHandle,
    {
        let now = Instant::now();
        let mut batches = self.batches.lock();
        let Some(batch) = batches.get_mut(user_id) else {
            return false;
        };
        let target = (now + extension).min(batch.first_message_at + self.max_window);
        if target <= batch.deadline {
            return false;
        }
        batch.deadline = target;
        rearm(batch, arm);
        true
    }

    /// Remove the user's batch if it is still at `generation`.
    pub fn take(&self, user_id: &str, generation: u64) -> Option<PendingBatch> {
        let mut batches = self.batches.lock();
        if batches.get(user_id)?.generation != generation {
            return None;
        }
        batches.remove(user_id)
    }

    /// Remove the user's batch regardless of its timer.
    pub fn take_now(&self, user_id: &str) -> Option<PendingBatch> {
        let mut batch = self.batches.lock().remove(user_id)?;
        if let Some(timer) = batch.timer.take() {
            timer.abort();
        }
        Some(batch)
    }

    /// Texts of the user's pending batch, oldest first.
    pub fn pending_messages(&self, user_id: &str) -> Vec<String> {
        self.batches
            .lock()
            .get(user_id)
            .map(|b| b.messages.clone())
            .unwrap_or_default()
    }

    pub fn deadline(&self, user_id: &str) -> Option<Instant> {
        self.batches.lock().get(user_id).map(|b| b.deadline)
    }

    pub fn pending_users(&self) -> usize {
        self.batches.lock().len()
    }
}

fn rearm<A>(batch: &mut PendingBatch, arm: A)
where
    A: FnOnce(u64, Instant) -> AbortHandle,
{
    if let Some(old) = batch.timer.take() {
        old.abort();
    }
    batch.generation += 1;
    batch.timer = Some(arm(batch.generation, batch.deadline));
}
