//! Conversation-handle store.
//!
//! The backend is stateful: each canonical user owns one opaque handle that
//! resumes their conversation.  [`ThreadStore`] is the seam the core talks
//! to; [`JsonThreadStore`] is the reference implementation, an in-memory
//! index optionally persisted to a JSON file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tw_domain::error::{Error, Result};
use tw_domain::trace::TraceEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistence of per-user conversation handles.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Current handle for the user, if any.
    async fn get_handle(&self, user_id: &str) -> Result<Option<String>>;

    /// Point the user at `handle`, recording free-form metadata with it.
    async fn set_handle(
        &self,
        user_id: &str,
        handle: &str,
        metadata: serde_json::Value,
    ) -> Result<()>;

    /// Forget the user's handle; the next turn starts a fresh conversation.
    async fn clear_handle(&self, user_id: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thread entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadEntry {
    pub user_id: String,
    pub handle: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// How many times this user has been pointed at a different handle.
    #[serde(default)]
    pub rotations: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSON store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle index kept in memory and written to a JSON file by [`flush`].
///
/// [`flush`]: JsonThreadStore::flush
pub struct JsonThreadStore {
    path: Option<PathBuf>,
    threads: RwLock<HashMap<String, ThreadEntry>>,
    dirty: AtomicBool,
}

impl JsonThreadStore {
    /// Load the index from `path`, creating its parent directory.  A missing
    /// file starts empty; a corrupt one is logged and ignored.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(Error::Io)?;
        }

        let threads: HashMap<String, ThreadEntry> = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
            match serde_json::from_str(&raw) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "thread index unreadable, starting empty"
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        tracing::info!(
            threads = threads.len(),
            path = %path.display(),
            "thread store loaded"
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            threads: RwLock::new(threads),
            dirty: AtomicBool::new(false),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            threads: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<ThreadEntry> {
        self.threads.read().get(user_id).cloned()
    }

    pub fn list(&self) -> Vec<ThreadEntry> {
        self.threads.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    /// Write the index to disk if anything changed since the last flush.
    /// No-op for in-memory stores.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let json = {
            let threads = self.threads.read();
            serde_json::to_string_pretty(&*threads)
                .map_err(|e| Error::Store(format!("serializing thread index: {e}")))?
        };
        if let Err(e) = std::fs::write(path, json) {
            self.dirty.store(true, Ordering::Release);
            return Err(Error::Io(e));
        }
        Ok(())
    }

    fn upsert(&self, user_id: &str, handle: &str, metadata: serde_json::Value) -> bool {
        let now = Utc::now();
        let mut threads = self.threads.write();
        let is_new = match threads.get_mut(user_id) {
            Some(entry) => {
                let rotated = entry.handle != handle;
                if rotated {
                    entry.handle = handle.to_owned();
                    entry.rotations += 1;
                }
                entry.updated_at = now;
                if !metadata.is_null() {
                    entry.metadata = metadata;
                }
                rotated
            }
            None => {
                threads.insert(
                    user_id.to_owned(),
                    ThreadEntry {
                        user_id: user_id.to_owned(),
                        handle: handle.to_owned(),
                        created_at: now,
                        updated_at: now,
                        rotations: 0,
                        metadata,
                    },
                );
                true
            }
        };
        self.dirty.store(true, Ordering::Release);
        is_new
    }
}

#[async_trait]
impl ThreadStore for JsonThreadStore {
    async fn get_handle(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.threads.read().get(user_id).map(|e| e.handle.clone()))
    }

    async fn set_handle(
        &self,
        user_id: &str,
        handle: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let is_new = self.upsert(user_id, handle, metadata);
        if is_new {
            TraceEvent::ThreadHandleSet {
                user_id: user_id.to_owned(),
                handle: handle.to_owned(),
                is_new,
            }
            .emit();
        }
        Ok(())
    }

    async fn clear_handle(&self, user_id: &str) -> Result<()> {
        if self.threads.write().remove(user_id).is_some() {
            self.dirty.store(true, Ordering::Release);
            tracing::debug!(user_id = %user_id, "thread handle cleared");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_handle() {
        let store = JsonThreadStore::in_memory();
        assert_eq!(store.get_handle("u1").await.unwrap(), None);

        store
            .set_handle("u1", "th_1", serde_json::json!({ "chat_id": "c1" }))
            .await
            .unwrap();
        assert_eq!(store.get_handle("u1").await.unwrap().as_deref(), Some("th_1"));

        store
            .set_handle("u1", "th_2", serde_json::Value::Null)
            .await
            .unwrap();
        let entry = store.get("u1").unwrap();
        assert_eq!(entry.handle, "th_2");
        assert_eq!(entry.rotations, 1);
        // Null metadata keeps what was recorded before.
        assert_eq!(entry.metadata["chat_id"], "c1");
    }

    #[tokio::test]
    async fn clear_handle_forgets_user() {
        let store = JsonThreadStore::in_memory();
        store
            .set_handle("u1", "th_1", serde_json::Value::Null)
            .await
            .unwrap();
        store.clear_handle("u1").await.unwrap();
        assert_eq!(store.get_handle("u1").await.unwrap(), None);
        // Clearing twice is fine.
        store.clear_handle("u1").await.unwrap();
    }

    #[tokio::test]
    async fn flush_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("threads.json");

        {
            let store = JsonThreadStore::open(&path).unwrap();
            store
                .set_handle("u1", "th_1", serde_json::Value::Null)
                .await
                .unwrap();
            store.flush().unwrap();
        }

        let reopened = JsonThreadStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(
            reopened.get_handle("u1").await.unwrap().as_deref(),
            Some("th_1")
        );
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threads.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonThreadStore::open(&path).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn in_memory_flush_is_noop() {
        let store = JsonThreadStore::in_memory();
        store.flush().unwrap();
    }
}
