//! Scripted collaborators shared by the gateway integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tw_domain::config::Config;
use tw_domain::error::{Error, Result};
use tw_domain::event::InboundMessage;
use tw_domain::turn::{Delivery, TurnReply, TurnRequest, UsageStats};
use tw_gateway::runtime::backend::{ReplySink, TurnBackend};
use tw_gateway::runtime::{Collaborators, Orchestrator};
use tw_sessions::JsonThreadStore;

/// Backend that answers `echo: <text>` and records every request.
#[derive(Default)]
pub struct ScriptedBackend {
    pub requests: Mutex<Vec<TurnRequest>>,
    /// Usage reported with the next replies.
    pub usage: Mutex<UsageStats>,
    /// Turn texts that fail.
    pub failing: Mutex<Vec<String>>,
    pub delay: Duration,
    active: Mutex<HashMap<String, usize>>,
    /// Highest number of overlapping turns seen per user.
    pub max_overlap: Mutex<HashMap<String, usize>>,
    /// Highest number of overlapping turns seen overall.
    pub max_total_overlap: Mutex<usize>,
}

impl ScriptedBackend {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.text.clone()).collect()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    fn enter(&self, user_id: &str) {
        let mut active = self.active.lock();
        let n = active.entry(user_id.to_owned()).or_default();
        *n += 1;
        let current = *n;
        let total: usize = active.values().sum();
        drop(active);

        let mut max = self.max_overlap.lock();
        let seen = max.entry(user_id.to_owned()).or_default();
        *seen = (*seen).max(current);
        let mut max_total = self.max_total_overlap.lock();
        *max_total = (*max_total).max(total);
    }

    fn leave(&self, user_id: &str) {
        if let Some(n) = self.active.lock().get_mut(user_id) {
            *n -= 1;
        }
    }
}

#[async_trait::async_trait]
impl TurnBackend for ScriptedBackend {
    async fn invoke(&self, req: TurnRequest) -> Result<TurnReply> {
        self.enter(&req.user_id);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.leave(&req.user_id);

        let n = {
            let mut requests = self.requests.lock();
            requests.push(req.clone());
            requests.len()
        };
        if self.failing.lock().contains(&req.text) {
            return Err(Error::Backend {
                backend: "scripted".into(),
                message: format!("refusing {:?}", req.text),
            });
        }
        Ok(TurnReply {
            handle: format!("h-{n}"),
            response_text: format!("echo: {}", req.text),
            usage: *self.usage.lock(),
        })
    }

    fn backend_id(&self) -> &str {
        "scripted"
    }
}

/// Sink that records deliveries and hands out `out-<n>` message IDs.
#[derive(Default)]
pub struct RecordingSink {
    pub deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingSink {
    pub fn texts(&self) -> Vec<String> {
        self.deliveries.lock().iter().map(|d| d.text.clone()).collect()
    }
}

#[async_trait::async_trait]
impl ReplySink for RecordingSink {
    async fn deliver(&self, delivery: Delivery) -> Result<Option<String>> {
        let mut deliveries = self.deliveries.lock();
        deliveries.push(delivery);
        Ok(Some(format!("out-{}", deliveries.len())))
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub backend: Arc<ScriptedBackend>,
    pub sink: Arc<RecordingSink>,
    pub threads: Arc<JsonThreadStore>,
}

pub fn harness(config: &Config, backend: ScriptedBackend) -> Harness {
    let backend = Arc::new(backend);
    let sink = Arc::new(RecordingSink::default());
    let threads = Arc::new(JsonThreadStore::in_memory());
    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            backend: backend.clone(),
            sink: sink.clone(),
            threads: threads.clone(),
        },
    )
    .expect("orchestrator");
    Harness {
        orchestrator,
        backend,
        sink,
        threads,
    }
}

/// A text message from `user` in their own chat.
pub fn text(user: &str, id: &str, body: &str) -> InboundMessage {
    InboundMessage {
        message_id: id.into(),
        chat_id: format!("{user}@s.whatsapp.net"),
        user_id: None,
        from_self: false,
        text: Some(body.into()),
        media_ref: None,
        timestamp: chrono::Utc::now(),
    }
}

pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
