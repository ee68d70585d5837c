/// Operational event log
///
/// Engine-internal diagnostics (rule and profile changes, storage failures,
/// deferred decisions) are recorded here as structured events. This channel
/// is independent of the decision log: it is never consulted when deciding a
/// connection, and failing to write it never fails the caller.
///
/// Every event is mirrored into `tracing` at the matching level, kept in a
/// bounded in-memory ring for inspection, and appended to a JSON-lines file
/// when one is configured.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Severity of an operational event
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// A single operational log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event occurred (UTC)
    pub timestamp: DateTime<Utc>,

    pub level: Level,

    /// Kebab-case event kind, e.g. `rule-add`, `storage-error`
    pub category: String,

    pub message: String,

    /// Additional structured data about the event
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(level: Level, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            category: category.into(),
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    /// Attaches a JSON object's fields as details; non-objects are ignored.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = details {
            self.details = map;
        }
        self
    }
}

/// Operational log sink
pub struct OpLog {
    path: Option<PathBuf>,
    recent: Mutex<VecDeque<Event>>,
    capacity: usize,
    write_lock: tokio::sync::Mutex<()>,
}

impl OpLog {
    /// Creates a sink that only keeps the most recent `capacity` events in memory.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            path: None,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Creates a sink that also appends every event to `path`.
    pub fn with_file(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::in_memory(capacity)
        }
    }

    /// Returns the path to the log file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records an event. Write failures are reported through `tracing` only.
    pub async fn emit(&self, event: Event) {
        match event.level {
            Level::Info => tracing::info!(category = %event.category, "{}", event.message),
            Level::Warning => tracing::warn!(category = %event.category, "{}", event.message),
            Level::Error => tracing::error!(category = %event.category, "{}", event.message),
        }

        {
            let mut recent = self.recent.lock();
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        if let Some(path) = &self.path
            && let Err(e) = self.append_line(path, &event).await
        {
            tracing::warn!("Failed to write operational log: {}", e);
        }
    }

    pub async fn info(&self, category: &str, message: impl Into<String>, details: serde_json::Value) {
        self.emit(Event::new(Level::Info, category, message).with_details(details))
            .await;
    }

    pub async fn error(&self, category: &str, message: impl Into<String>, details: serde_json::Value) {
        self.emit(Event::new(Level::Error, category, message).with_details(details))
            .await;
    }

    async fn append_line(&self, path: &Path, event: &Event) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Returns up to `count` most recent in-memory events, newest first.
    pub fn recent(&self, count: usize) -> Vec<Event> {
        self.recent.lock().iter().rev().take(count).cloned().collect()
    }

    /// Reads the most recent events from the log file, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if no file is configured or it cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<Event>> {
        let path = self.path.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "No operational log file")
        })?;
        let content = tokio::fs::read_to_string(path).await?;

        let events: Vec<Event> = content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect();

        Ok(events)
    }
}

impl Default for OpLog {
    fn default() -> Self {
        Self::in_memory(100)
    }
}
