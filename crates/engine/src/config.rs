//! Engine configuration.

use std::time::Duration;

use tracing::warn;

/// Tunable intervals and limits for the queue engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed delay between consecutive dispatches on one session.
    pub pacing_interval: Duration,
    /// How long an idle worker waits before re-checking its queue.
    pub idle_poll_interval: Duration,
    /// Upper bound on a single dispatch call.
    pub dispatch_timeout: Duration,
    /// Quiet period before a debounced snapshot is written.
    pub save_debounce: Duration,
    /// How many backups to retain per persisted collection.
    pub backup_keep: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pacing_interval: Duration::from_secs(60),
            idle_poll_interval: Duration::from_secs(5),
            dispatch_timeout: Duration::from_secs(30),
            save_debounce: Duration::from_secs(2),
            backup_keep: 5,
        }
    }
}

impl EngineConfig {
    /// Build a config from `BULKRELAY_*` environment variables, falling
    /// back to defaults for unset or malformed values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pacing_interval: env_millis("BULKRELAY_PACING_MS", defaults.pacing_interval),
            idle_poll_interval: env_millis("BULKRELAY_IDLE_POLL_MS", defaults.idle_poll_interval),
            dispatch_timeout: env_millis(
                "BULKRELAY_DISPATCH_TIMEOUT_MS",
                defaults.dispatch_timeout,
            ),
            save_debounce: env_millis("BULKRELAY_SAVE_DEBOUNCE_MS", defaults.save_debounce),
            backup_keep: env_usize("BULKRELAY_BACKUP_KEEP", defaults.backup_keep),
        }
    }

    /// A config with all waits collapsed; used by tests that drive the
    /// worker loop to completion quickly.
    pub fn immediate() -> Self {
        Self {
            pacing_interval: Duration::ZERO,
            idle_poll_interval: Duration::from_millis(10),
            dispatch_timeout: Duration::from_secs(5),
            save_debounce: Duration::from_millis(20),
            backup_keep: 5,
        }
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!(var = name, value = %raw, "ignoring malformed duration override");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                warn!(var = name, value = %raw, "ignoring malformed count override");
                default
            }
        },
        Err(_) => default,
    }
}
