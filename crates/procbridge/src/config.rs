//! Session configuration.
//!
//! Resolution order:
//! 1. Built-in defaults
//! 2. Optional JSON config file
//! 3. Environment variables (highest priority)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of a single relayed chunk in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024;

/// Capacity of the internal and mirror queues, in chunks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Tuning knobs for one [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of bytes read from a pipe or forwarded to stdin at once.
    pub chunk_size: usize,
    /// Capacity of every bounded queue created by the session.
    pub queue_capacity: usize,
    /// Termination policy used by `reset`.
    pub escalation: EscalationConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            escalation: EscalationConfig::default(),
        }
    }
}

/// Graceful-then-forceful termination policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// How many times SIGTERM is sent before escalating.
    pub term_attempts: u32,
    /// How many times SIGKILL is sent before releasing the handle.
    pub kill_attempts: u32,
    /// Pause after every attempt, in milliseconds.
    pub interval_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            term_attempts: 4,
            kill_attempts: 2,
            interval_ms: 1000,
        }
    }
}

impl EscalationConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl SessionConfig {
    /// Reject values that would stall the relay.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than zero".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Load a session config: defaults, then `path` if given, then environment.
pub fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => SessionConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<SessionConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut SessionConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("PROCBRIDGE_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
        config.chunk_size = n;
    }
    if let Some(n) = var("PROCBRIDGE_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
        config.queue_capacity = n;
    }
    if let Some(n) = var("PROCBRIDGE_TERM_ATTEMPTS").and_then(|v| v.parse().ok()) {
        config.escalation.term_attempts = n;
    }
    if let Some(n) = var("PROCBRIDGE_KILL_ATTEMPTS").and_then(|v| v.parse().ok()) {
        config.escalation.kill_attempts = n;
    }
    if let Some(n) = var("PROCBRIDGE_ESCALATION_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.escalation.interval_ms = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_relay_constants() {
        let config = SessionConfig::default();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.escalation.term_attempts, 4);
        assert_eq!(config.escalation.kill_attempts, 2);
        assert_eq!(config.escalation.interval(), Duration::from_secs(1));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procbridge.json");
        std::fs::write(&path, r#"{"chunk_size": 512, "escalation": {"kill_attempts": 3}}"#)
            .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.escalation.kill_attempts, 3);
        assert_eq!(config.escalation.term_attempts, 4);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PROCBRIDGE_CHUNK_SIZE", "16"),
            ("PROCBRIDGE_ESCALATION_INTERVAL_MS", "10"),
            ("PROCBRIDGE_QUEUE_CAPACITY", "not-a-number"),
        ]);
        let mut config = SessionConfig::default();
        apply_env_overrides(&mut config, |key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.chunk_size, 16);
        assert_eq!(config.escalation.interval_ms, 10);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let config = SessionConfig {
            chunk_size: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            queue_capacity: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
