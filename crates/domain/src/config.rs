mod backend;
mod buffering;
mod echo;
mod governor;
mod locks;
mod observability;
mod server;

pub use backend::*;
pub use buffering::*;
pub use echo::*;
pub use governor::*;
pub use locks::*;
pub use observability::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub buffering: BufferingConfig,
    #[serde(default)]
    pub typing: TypingConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub echo: EchoConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub threads: ThreadsConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Governor ceilings that are not positive are only warnings: the
    /// governor falls back to its defaults for them at construction time.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError::error("server.port", "port must be greater than 0"));
        }
        if self.server.host.is_empty() {
            errors.push(ConfigError::error("server.host", "host must not be empty"));
        }

        if self.locks.timeout_ms == 0 {
            errors.push(ConfigError::error(
                "locks.timeout_ms",
                "lock timeout must be greater than 0",
            ));
        }

        if self.typing.confidence_threshold > 100 {
            errors.push(ConfigError::error(
                "typing.confidence_threshold",
                "threshold must be within 0..=100",
            ));
        }

        if self.echo.max_entries == 0 {
            errors.push(ConfigError::error(
                "echo.max_entries",
                "cache capacity must be greater than 0",
            ));
        }

        if self.buffering.max_batch_messages == 0 {
            errors.push(ConfigError::error(
                "buffering.max_batch_messages",
                "batch cap must be greater than 0",
            ));
        }

        if self.buffering.max_window_ms < 6_000 {
            errors.push(ConfigError::warning(
                "buffering.max_window_ms",
                "window is shorter than the longest adaptive timeout (6000ms); \
                 slow bursts will be split",
            ));
        }

        for (field, bad) in self.governor.non_positive_fields() {
            errors.push(ConfigError::warning(
                field,
                format!("{bad} is not positive; the default will be used"),
            ));
        }

        if self.backend.turn_url.is_none() {
            errors.push(ConfigError::warning(
                "backend.turn_url",
                "no turn backend configured; turns will fail until one is set",
            ));
        }

        errors
    }
}
