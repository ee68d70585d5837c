use crate::core::firewall::Action;
use crate::core::persist::write_atomic;
use crate::core::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.json";

/// Engine configuration
///
/// Every field has a default so partial or older config files still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Action applied when no rule matches
    pub default_policy: Action,
    /// Per-attempt timeout for decision log persistence
    pub append_timeout_ms: u64,
    /// Total attempts for a storage operation, including the first
    pub storage_retry_attempts: u32,
    pub storage_retry_backoff_ms: u64,
    /// Width of a stats time bucket
    pub stats_bucket_secs: u64,
    pub log_segment_capacity: usize,
    /// Retention bound for the in-memory decision log
    pub max_log_entries: usize,
    pub recent_oplog_events: usize,
    /// Write decisions to `decisions.jsonl` (otherwise memory only)
    pub persist_decisions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_policy: Action::Block,
            append_timeout_ms: 500,
            storage_retry_attempts: 3,
            storage_retry_backoff_ms: 25,
            stats_bucket_secs: 60,
            log_segment_capacity: 1024,
            max_log_entries: 100_000,
            recent_oplog_events: 100,
            persist_decisions: true,
        }
    }
}

impl EngineConfig {
    /// Clamps values that would stall or starve the engine.
    ///
    /// Retry attempts are limited to 1..=10 and timeouts to 10 ms..=60 s.
    pub fn sanitized(mut self) -> Self {
        self.append_timeout_ms = self.append_timeout_ms.clamp(10, 60_000);
        self.storage_retry_attempts = self.storage_retry_attempts.clamp(1, 10);
        self.storage_retry_backoff_ms = self.storage_retry_backoff_ms.min(10_000);
        self.stats_bucket_secs = self.stats_bucket_secs.clamp(1, 86_400);
        self.log_segment_capacity = self.log_segment_capacity.clamp(16, 1 << 20);
        self.max_log_entries = self.max_log_entries.max(self.log_segment_capacity);
        self.recent_oplog_events = self.recent_oplog_events.max(1);
        self
    }

    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.storage_retry_attempts,
            backoff: Duration::from_millis(self.storage_retry_backoff_ms),
            timeout: self.append_timeout(),
        }
    }
}

/// Saves the config to `dir/config.json` atomically (0o600 temp file,
/// fsync, rename).
pub async fn save_config(dir: &Path, config: &EngineConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    tokio::fs::create_dir_all(dir).await?;
    write_atomic(&dir.join(CONFIG_FILE), json.as_bytes()).await
}

/// Loads `dir/config.json`, or returns defaults if it is missing or invalid.
pub async fn load_config(dir: &Path) -> EngineConfig {
    let path = dir.join(CONFIG_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(json) => match serde_json::from_str::<EngineConfig>(&json) {
            Ok(config) => config.sanitized(),
            Err(e) => {
                tracing::warn!("Ignoring invalid config {}: {}", path.display(), e);
                EngineConfig::default()
            }
        },
        Err(_) => EngineConfig::default(),
    }
}
