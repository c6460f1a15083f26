//! AppState construction and background-task spawning extracted from `main.rs`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use sha2::{Digest, Sha256};

use tw_domain::config::{Config, ConfigSeverity};
use tw_sessions::{JsonThreadStore, ThreadStore};

use crate::runtime::backend::{
    HttpReplySink, HttpTurnBackend, LogReplySink, ReplySink, TurnBackend, UnconfiguredBackend,
};
use crate::runtime::{Collaborators, Orchestrator};
use crate::state::AppState;

/// How often idle typing profiles, expired echo entries and stuck locks
/// are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Validate config, wire the collaborators and the orchestrator, and return
/// a ready [`AppState`].
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Thread store ─────────────────────────────────────────────────
    let threads = Arc::new(match &config.threads.state_path {
        Some(path) => JsonThreadStore::open(path)
            .with_context(|| format!("opening thread store {}", path.display()))?,
        None => {
            tracing::warn!("threads.state_path unset; conversation handles are kept in memory only");
            JsonThreadStore::in_memory()
        }
    });
    tracing::info!(threads = threads.len(), "thread store ready");

    // ── Backend + reply channel ──────────────────────────────────────
    let backend: Arc<dyn TurnBackend> = match &config.backend.turn_url {
        Some(url) => Arc::new(
            HttpTurnBackend::new(url, &config.backend).context("creating turn backend client")?,
        ),
        None => {
            tracing::warn!("backend.turn_url unset; turns will fail until it is configured");
            Arc::new(UnconfiguredBackend)
        }
    };
    let sink: Arc<dyn ReplySink> = match &config.backend.reply_url {
        Some(url) => Arc::new(
            HttpReplySink::new(url, &config.backend).context("creating reply client")?,
        ),
        None => {
            tracing::info!("backend.reply_url unset; replies are logged only");
            Arc::new(LogReplySink)
        }
    };
    tracing::info!(backend = backend.backend_id(), "turn backend ready");

    // ── Orchestrator ─────────────────────────────────────────────────
    let store: Arc<dyn ThreadStore> = threads.clone();
    let orchestrator = Orchestrator::new(
        &config,
        Collaborators {
            backend,
            sink,
            threads: store,
        },
    )
    .context("building orchestrator")?;
    tracing::info!(
        identity_links = orchestrator.identity().len(),
        buffering_disabled = orchestrator.timing().switch().is_disabled(),
        "orchestrator ready"
    );

    // ── API token (read once, stored hashed) ─────────────────────────
    let api_token_hash = match std::env::var(&config.server.api_token_env) {
        Ok(token) if !token.trim().is_empty() => {
            Some(Sha256::digest(token.trim().as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env = %config.server.api_token_env,
                "API token not set; endpoints are unauthenticated"
            );
            None
        }
    };

    Ok(AppState {
        config,
        orchestrator,
        threads,
        api_token_hash,
        started_at: Instant::now(),
    })
}

/// Spawn the long-running background tokio tasks (thread store flush and
/// runtime maintenance).
///
/// Call this **after** [`build_app_state`] when running the HTTP server.
pub fn spawn_background_tasks(state: &AppState) {
    // ── Periodic thread store flush ──────────────────────────────────
    {
        let threads = state.threads.clone();
        let every = Duration::from_secs(state.config.threads.flush_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if let Err(e) = threads.flush() {
                    tracing::warn!(error = %e, "thread store flush failed");
                }
            }
        });
    }

    // ── Periodic runtime maintenance ─────────────────────────────────
    {
        let orchestrator = state.orchestrator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                orchestrator.run_maintenance();
            }
        });
    }

    tracing::info!("background tasks spawned");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_file_store_under_state_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.threads.state_path = Some(dir.path().join("state/threads.json"));
        config.server.api_token_env = "TW_BOOTSTRAP_TEST_TOKEN_UNSET".into();

        let state = build_app_state(Arc::new(config)).await.unwrap();
        assert!(state.threads.is_empty());
        assert!(state.api_token_hash.is_none());
        assert!(dir.path().join("state").is_dir());
        assert_eq!(state.orchestrator.stats().pending_batches, 0);
    }

    #[tokio::test]
    async fn config_errors_abort_startup() {
        let mut config = Config::default();
        config.threads.state_path = None;
        config.locks.timeout_ms = 0;
        assert!(build_app_state(Arc::new(config)).await.is_err());
    }
}
