//! Per-user single-flight control.
//!
//! At most one turn runs per user.  Work that arrives while a user's lock
//! is held waits in that user's FIFO queue and is drained one item at a
//! time once the lock frees up.  Locks are leases: one left unreleased
//! past the timeout counts as free, but the turn still holding it is not
//! aborted.
//!
//! All bookkeeping lives behind one `parking_lot::Mutex` that is never held
//! across an `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use tw_domain::config::LockConfig;
use tw_domain::trace::TraceEvent;

/// Continuation run for a queued item.  Errors and panics are contained.
pub type QueueTask<P> = Box<dyn FnOnce(P) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// One unit of work waiting for the user's lock.
pub struct QueueItem<P> {
    pub message_id: String,
    pub payload: P,
    task: QueueTask<P>,
}

/// A held lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserLock {
    pub acquired_at: Instant,
    pub ticket: LockTicket,
}

/// Identifies one acquisition, so a holder can release its own lease and
/// never a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockTicket(u64);

pub enum Submission<P> {
    /// The lock was free and is now held by the caller, who runs the item.
    Acquired(LockTicket, QueueItem<P>),
    /// The item was appended to the user's queue.  `lock_free` means no
    /// live lease exists, so nobody may be draining yet.
    Queued { queue_len: usize, lock_free: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The item ran immediately (and any backlog was drained after it).
    Ran,
    /// The lock was free; the item was started in a background task.
    Started,
    /// The item was queued behind other work.
    Queued { queue_len: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    pub active_locks: usize,
    pub expired_locks: usize,
    pub queued_users: usize,
    pub queued_items: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockIssues {
    /// `(user_id, held_ms)` of leases past their timeout.
    pub expired_locks: Vec<(String, u64)>,
    /// `(user_id, queue_len)` of unusually long queues.
    pub long_queues: Vec<(String, usize)>,
}

impl LockIssues {
    pub fn is_empty(&self) -> bool {
        self.expired_locks.is_empty() && self.long_queues.is_empty()
    }
}

struct LockState<P> {
    locks: HashMap<String, UserLock>,
    queues: HashMap<String, VecDeque<QueueItem<P>>>,
    next_ticket: u64,
}

impl<P> LockState<P> {
    /// Whether `user_id` holds a live lease.  An expired lease is dropped
    /// and reported.
    fn is_held(&mut self, user_id: &str, timeout: Duration, now: Instant) -> bool {
        let Some(lock) = self.locks.get(user_id) else {
            return false;
        };
        let held = now.saturating_duration_since(lock.acquired_at);
        if held <= timeout {
            return true;
        }
        self.locks.remove(user_id);
        tracing::warn!(
            user_id = %user_id,
            held_ms = held.as_millis() as u64,
            "user lock expired without release"
        );
        TraceEvent::StaleLockExpired {
            user_id: user_id.to_owned(),
            held_ms: held.as_millis() as u64,
        }
        .emit();
        false
    }

    fn grant(&mut self, user_id: &str, now: Instant) -> LockTicket {
        self.next_ticket += 1;
        let ticket = LockTicket(self.next_ticket);
        self.locks.insert(
            user_id.to_owned(),
            UserLock {
                acquired_at: now,
                ticket,
            },
        );
        ticket
    }

    fn enqueue(&mut self, user_id: &str, item: QueueItem<P>) -> usize {
        let queue = self.queues.entry(user_id.to_owned()).or_default();
        queue.push_back(item);
        queue.len()
    }
}

pub struct UserLockManager<P> {
    timeout: Duration,
    long_queue_threshold: usize,
    state: Mutex<LockState<P>>,
}

impl<P: Send + 'static> UserLockManager<P> {
    pub fn new(cfg: &LockConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.timeout_ms),
            long_queue_threshold: cfg.long_queue_threshold,
            state: Mutex::new(LockState {
                locks: HashMap::new(),
                queues: HashMap::new(),
                next_ticket: 0,
            }),
        }
    }

    /// Take the user's lock.  Returns `false` while a live lease exists.
    pub fn acquire_user_lock(&self, user_id: &str) -> bool {
        self.try_acquire(user_id).is_some()
    }

    pub fn try_acquire(&self, user_id: &str) -> Option<LockTicket> {
        let now = Instant::now();
        let mut st = self.state.lock();
        if st.is_held(user_id, self.timeout, now) {
            return None;
        }
        Some(st.grant(user_id, now))
    }

    /// Drop the user's lock, whoever holds it.  Releasing an absent lock is
    /// a no-op.
    pub fn release_user_lock(&self, user_id: &str) {
        if self.state.lock().locks.remove(user_id).is_none() {
            tracing::debug!(user_id = %user_id, "release of a lock that is not held");
        }
    }

    /// Drop the user's lock only if it is still the lease `ticket` names.
    pub fn release(&self, user_id: &str, ticket: LockTicket) -> bool {
        let mut st = self.state.lock();
        let owned = st.locks.get(user_id).is_some_and(|l| l.ticket == ticket);
        if owned {
            st.locks.remove(user_id);
        } else {
            tracing::debug!(
                user_id = %user_id,
                "lease already expired or replaced; release skipped"
            );
        }
        owned
    }

    /// Whether the user holds a live lease.  Expires a stale one.
    pub fn has_active_lock(&self, user_id: &str) -> bool {
        self.state
            .lock()
            .is_held(user_id, self.timeout, Instant::now())
    }

    /// Append work to the user's queue.  Returns the new queue length.
    pub fn add_to_queue<F>(&self, user_id: &str, message_id: &str, payload: P, task: F) -> usize
    where
        F: FnOnce(P) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        let len = self.state.lock().enqueue(
            user_id,
            QueueItem {
                message_id: message_id.to_owned(),
                payload,
                task: Box::new(task),
            },
        );
        TraceEvent::TurnQueued {
            user_id: user_id.to_owned(),
            message_id: message_id.to_owned(),
            queue_len: len,
        }
        .emit();
        len
    }

    /// Atomically take the lock or join the queue.  New work queues behind
    /// waiting items even when the lock happens to be free, so arrival
    /// order holds across the gap between a release and the next drain
    /// step.
    pub fn submit<F>(&self, user_id: &str, message_id: &str, payload: P, task: F) -> Submission<P>
    where
        F: FnOnce(P) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        let now = Instant::now();
        let item = QueueItem {
            message_id: message_id.to_owned(),
            payload,
            task: Box::new(task) as QueueTask<P>,
        };

        let mut st = self.state.lock();
        let held = st.is_held(user_id, self.timeout, now);
        let backlog = st.queues.get(user_id).is_some_and(|q| !q.is_empty());
        if !held && !backlog {
            let ticket = st.grant(user_id, now);
            return Submission::Acquired(ticket, item);
        }

        let queue_len = st.enqueue(user_id, item);
        drop(st);

        TraceEvent::TurnQueued {
            user_id: user_id.to_owned(),
            message_id: message_id.to_owned(),
            queue_len,
        }
        .emit();
        Submission::Queued {
            queue_len,
            lock_free: !held,
        }
    }

    /// Run `task` under the user's lock: immediately when free (draining
    /// any backlog afterwards), otherwise after everything queued before it.
    pub async fn dispatch<F>(
        self: &Arc<Self>,
        user_id: &str,
        message_id: &str,
        payload: P,
        task: F,
    ) -> DispatchOutcome
    where
        F: FnOnce(P) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        match self.submit(user_id, message_id, payload, task) {
            Submission::Acquired(ticket, item) => {
                run_item(user_id, item).await;
                self.release(user_id, ticket);
                self.process_queue(user_id).await;
                DispatchOutcome::Ran
            }
            Submission::Queued { queue_len, lock_free } => {
                if lock_free {
                    let this = Arc::clone(self);
                    let user = user_id.to_owned();
                    tokio::spawn(async move {
                        this.process_queue(&user).await;
                    });
                }
                DispatchOutcome::Queued { queue_len }
            }
        }
    }

    /// Like [`dispatch`](Self::dispatch) but returns as soon as the item's
    /// position is fixed; the work itself runs in a spawned task.  Callers
    /// that submit in order get their items run in that order.
    pub fn spawn_dispatch<F>(
        self: &Arc<Self>,
        user_id: &str,
        message_id: &str,
        payload: P,
        task: F,
    ) -> DispatchOutcome
    where
        F: FnOnce(P) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        let submission = self.submit(user_id, message_id, payload, task);
        let this = Arc::clone(self);
        let user = user_id.to_owned();
        match submission {
            Submission::Acquired(ticket, item) => {
                tokio::spawn(async move {
                    run_item(&user, item).await;
                    this.release(&user, ticket);
                    this.process_queue(&user).await;
                });
                DispatchOutcome::Started
            }
            Submission::Queued { queue_len, lock_free } => {
                if lock_free {
                    tokio::spawn(async move {
                        this.process_queue(&user).await;
                    });
                }
                DispatchOutcome::Queued { queue_len }
            }
        }
    }

    /// Drain the user's queue in order.  Each item runs under a fresh lease
    /// that is released as soon as it finishes, success or not.  Stops when
    /// the queue is empty (and deletes it) or when someone else holds the
    /// lock; that holder drains the rest.
    pub async fn process_queue(&self, user_id: &str) -> DrainReport {
        let started = Instant::now();
        let mut report = DrainReport::default();

        loop {
            let (item, ticket) = {
                let now = Instant::now();
                let mut st = self.state.lock();
                if st.is_held(user_id, self.timeout, now) {
                    break;
                }
                let next = st.queues.get_mut(user_id).and_then(|q| q.pop_front());
                let Some(item) = next else {
                    st.queues.remove(user_id);
                    break;
                };
                if st.queues.get(user_id).is_some_and(|q| q.is_empty()) {
                    st.queues.remove(user_id);
                }
                let ticket = st.grant(user_id, now);
                (item, ticket)
            };

            if run_item(user_id, item).await {
                report.processed += 1;
            } else {
                report.failed += 1;
            }
            self.release(user_id, ticket);
        }

        if report.processed + report.failed > 0 {
            TraceEvent::QueueDrained {
                user_id: user_id.to_owned(),
                processed: report.processed,
                failed: report.failed,
                duration_ms: started.elapsed().as_millis() as u64,
            }
            .emit();
        }
        report
    }

    pub fn queue_len(&self, user_id: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(user_id)
            .map_or(0, VecDeque::len)
    }

    pub fn stats(&self) -> LockStats {
        let now = Instant::now();
        let st = self.state.lock();
        let expired_locks = st
            .locks
            .values()
            .filter(|l| now.saturating_duration_since(l.acquired_at) > self.timeout)
            .count();
        LockStats {
            active_locks: st.locks.len() - expired_locks,
            expired_locks,
            queued_users: st.queues.len(),
            queued_items: st.queues.values().map(VecDeque::len).sum(),
        }
    }

    /// Report expired leases and long queues as warnings.
    pub fn detect_issues(&self) -> LockIssues {
        let now = Instant::now();
        let st = self.state.lock();
        let mut issues = LockIssues::default();

        for (user_id, lock) in &st.locks {
            let held = now.saturating_duration_since(lock.acquired_at);
            if held > self.timeout {
                tracing::warn!(
                    user_id = %user_id,
                    held_ms = held.as_millis() as u64,
                    "user lock held past its timeout"
                );
                issues
                    .expired_locks
                    .push((user_id.clone(), held.as_millis() as u64));
            }
        }
        for (user_id, queue) in &st.queues {
            if queue.len() > self.long_queue_threshold {
                tracing::warn!(
                    user_id = %user_id,
                    queue_len = queue.len(),
                    "user queue is unusually long"
                );
                issues.long_queues.push((user_id.clone(), queue.len()));
            }
        }
        issues
    }

    /// Drop every lock and queued item.
    pub fn clear_all(&self) {
        let mut st = self.state.lock();
        let dropped: usize = st.queues.values().map(VecDeque::len).sum();
        st.locks.clear();
        st.queues.clear();
        tracing::warn!(dropped_items = dropped, "all user locks and queues cleared");
    }
}

/// Run one item in its own task so a panic is contained like an error.
/// Returns whether it succeeded.
async fn run_item<P: Send + 'static>(user_id: &str, item: QueueItem<P>) -> bool {
    let QueueItem {
        message_id,
        payload,
        task,
    } = item;

    match tokio::spawn(task(payload)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(
                user_id = %user_id,
                message_id = %message_id,
                error = %e,
                "queued turn failed"
            );
            false
        }
        Err(e) => {
            tracing::error!(
                user_id = %user_id,
                message_id = %message_id,
                panicked = e.is_panic(),
                "queued turn aborted"
            );
            false
        }
    }
}
