//! Narrow storage interfaces consulted by the profile store and event log
//!
//! The engine never talks to disks or databases directly. It persists
//! through these traits, wrapped in [`crate::core::retry::with_retry`].
//! File-backed implementations live in [`crate::core::persist`]; the
//! in-memory ones here back tests and ephemeral runs.

use crate::core::error::StorageError;
use crate::core::firewall::{LogRecord, Profile, Rule};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Everything the profile store needs to rebuild itself on startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub rules: Vec<Rule>,
    pub profiles: Vec<Profile>,
    pub active: Option<String>,
}

/// One profile-store mutation, persisted as a unit
///
/// Rule deletions are applied after rule saves, and profile deletions after
/// profile saves. Every entry is keyed by name, so committing the same
/// changeset twice leaves the backend in the same state as committing it once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    pub save_rules: Vec<Rule>,
    pub delete_rules: Vec<String>,
    pub save_profiles: Vec<Profile>,
    pub delete_profiles: Vec<String>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_rule(mut self, rule: Rule) -> Self {
        self.save_rules.push(rule);
        self
    }

    pub fn delete_rule(mut self, name: impl Into<String>) -> Self {
        self.delete_rules.push(name.into());
        self
    }

    pub fn save_profile(mut self, profile: Profile) -> Self {
        self.save_profiles.push(profile);
        self
    }

    pub fn delete_profile(mut self, name: impl Into<String>) -> Self {
        self.delete_profiles.push(name.into());
        self
    }

    pub fn touches_rules(&self) -> bool {
        !self.save_rules.is_empty() || !self.delete_rules.is_empty()
    }

    /// Applies the changeset to an in-memory copy of persisted state.
    pub fn apply_to(&self, state: &mut PersistedState) {
        for rule in &self.save_rules {
            match state.rules.iter_mut().find(|r| r.name == rule.name) {
                Some(existing) => *existing = rule.clone(),
                None => state.rules.push(rule.clone()),
            }
        }
        state.rules.retain(|r| !self.delete_rules.contains(&r.name));
        for profile in &self.save_profiles {
            match state.profiles.iter_mut().find(|p| p.name == profile.name) {
                Some(existing) => *existing = profile.clone(),
                None => state.profiles.push(profile.clone()),
            }
        }
        state
            .profiles
            .retain(|p| !self.delete_profiles.contains(&p.name));
    }
}

/// Persistence for rules and profiles, keyed by name
#[async_trait]
pub trait ProfileBackend: Send + Sync {
    async fn load(&self) -> Result<PersistedState, StorageError>;
    /// Persists every entry of `changes` or none of them.
    async fn commit(&self, changes: &Changeset) -> Result<(), StorageError>;
    async fn save_active(&self, name: Option<&str>) -> Result<(), StorageError>;
}

/// Append-only persistence for event log records, keyed by sequence id
#[async_trait]
pub trait LogBackend: Send + Sync {
    async fn append(&self, record: &LogRecord) -> Result<(), StorageError>;
    /// Returns every stored record in ascending id order.
    async fn load(&self) -> Result<Vec<LogRecord>, StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryProfileBackend {
    state: Mutex<PersistedState>,
}

impl MemoryProfileBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> PersistedState {
        self.state.lock().clone()
    }
}

#[async_trait]
impl ProfileBackend for MemoryProfileBackend {
    async fn load(&self) -> Result<PersistedState, StorageError> {
        Ok(self.state())
    }

    async fn commit(&self, changes: &Changeset) -> Result<(), StorageError> {
        changes.apply_to(&mut self.state.lock());
        Ok(())
    }

    async fn save_active(&self, name: Option<&str>) -> Result<(), StorageError> {
        self.state.lock().active = name.map(str::to_string);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLogBackend {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Stored records in append order.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl LogBackend for MemoryLogBackend {
    async fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<LogRecord>, StorageError> {
        let mut records = self.records.lock().clone();
        records.sort_by_key(LogRecord::id);
        Ok(records)
    }
}
