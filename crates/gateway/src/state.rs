use std::sync::Arc;
use std::time::Instant;

use tw_domain::config::Config;
use tw_sessions::JsonThreadStore;

use crate::runtime::Orchestrator;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    /// Concrete handle on the thread store for flushing and listing; the
    /// orchestrator sees it only as a `dyn ThreadStore`.
    pub threads: Arc<JsonThreadStore>,
    /// SHA-256 of the API bearer token.  `None` disables auth (dev mode).
    pub api_token_hash: Option<Vec<u8>>,
    pub started_at: Instant,
}
