//! File-backed storage backends
//!
//! Layout under the data directory:
//!
//! ```text
//! profiles/<name>.json         one profile per file (rule names only)
//! profiles/<name>.json.sha256  checksum, verified on load (warn only)
//! rules.json                   the rule library, sorted by name
//! active                       name of the active profile (absent = none)
//! decisions.jsonl              event log records, one JSON object per line
//! ```
//!
//! Every whole-file write goes through [`write_atomic`] (temp file with
//! restrictive permissions, fsync, rename) so a crash or full disk never
//! leaves a half-written profile behind. A profile-store commit that spans
//! several files keeps the prior contents of each file it replaces and puts
//! them back if a later write fails.
//!
//! The decision log is append-only between compactions. Once it holds twice
//! the retention bound it is rewritten, through [`write_atomic`], to the
//! newest records within the bound.

use crate::core::error::StorageError;
use crate::core::firewall::{LogRecord, Profile, Rule};
use crate::core::storage::{Changeset, LogBackend, PersistedState, ProfileBackend};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Writes `bytes` to `path` atomically.
/// Uses a temporary file + rename pattern to prevent data corruption if the
/// process crashes or the disk fills up during write.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;

        // Set restrictive permissions (0o600) BEFORE writing firewall policy
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(bytes).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save firewall state. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn checksum_path(profile_path: &Path) -> PathBuf {
    let mut path = profile_path.to_path_buf();
    path.set_extension("json.sha256");
    path
}

/// Prior contents of the files a commit has replaced so far
#[derive(Debug, Default)]
struct Journal {
    saved: Vec<(PathBuf, Option<Vec<u8>>)>,
}

impl Journal {
    /// Remembers what `path` holds now. Must run before the first write.
    async fn record(&mut self, path: &Path) -> Result<(), StorageError> {
        if self.saved.iter().any(|(p, _)| p == path) {
            return Ok(());
        }
        let prior = match tokio::fs::read(path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        self.saved.push((path.to_path_buf(), prior));
        Ok(())
    }

    /// Restores every recorded file, newest first.
    async fn rollback(self) {
        for (path, prior) in self.saved.into_iter().rev() {
            let restored = match &prior {
                Some(bytes) => write_atomic(&path, bytes).await,
                None => remove_if_exists(&path).await,
            };
            match restored {
                Ok(()) => tracing::debug!("Restored {:?} after failed commit", path),
                Err(e) => tracing::error!("Failed to restore {:?} after failed commit: {}", path, e),
            }
        }
    }
}

/// Rules and profiles stored as JSON files in a directory
#[derive(Debug)]
pub struct FileProfileBackend {
    root: PathBuf,
    // Serializes commits so journals never interleave
    commit_lock: tokio::sync::Mutex<()>,
}

impl FileProfileBackend {
    /// Opens (and creates if needed) the directory layout under `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("profiles")).await?;
        Ok(Self {
            root,
            commit_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn profile_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        // Profile names double as file names
        crate::validators::validate_profile_name(name).map_err(StorageError::Corrupted)?;
        Ok(self.root.join("profiles").join(format!("{name}.json")))
    }

    fn rules_path(&self) -> PathBuf {
        self.root.join("rules.json")
    }

    fn active_path(&self) -> PathBuf {
        self.root.join("active")
    }

    async fn read_rules(&self) -> Result<Vec<Rule>, StorageError> {
        match tokio::fs::read_to_string(self.rules_path()).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_rules(&self, mut rules: Vec<Rule>) -> Result<(), StorageError> {
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        let json = serde_json::to_string_pretty(&rules)?;
        write_atomic(&self.rules_path(), json.as_bytes()).await?;
        Ok(())
    }

    async fn read_profiles(&self) -> Result<Vec<Profile>, StorageError> {
        let mut profiles = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("profiles")).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            let json = tokio::fs::read_to_string(&path).await?;

            // Verify checksum if present (warns but doesn't fail for manually edited profiles)
            if let Ok(expected) = tokio::fs::read_to_string(checksum_path(&path)).await {
                let actual = checksum(json.as_bytes());
                if expected.trim() != actual {
                    tracing::warn!(
                        "Profile file {:?} checksum mismatch (expected: {}, got: {})",
                        path,
                        expected.trim(),
                        actual
                    );
                }
            }

            let mut profile: Profile = serde_json::from_str(&json)
                .map_err(|e| StorageError::Corrupted(format!("{}: {e}", path.display())))?;
            profile.active = false;
            profiles.push(profile);
        }

        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }

    async fn apply(&self, changes: &Changeset, journal: &mut Journal) -> Result<(), StorageError> {
        if changes.touches_rules() {
            let mut rules = self.read_rules().await?;
            for rule in &changes.save_rules {
                match rules.iter_mut().find(|r| r.name == rule.name) {
                    Some(existing) => *existing = rule.clone(),
                    None => rules.push(rule.clone()),
                }
            }
            rules.retain(|r| !changes.delete_rules.contains(&r.name));
            journal.record(&self.rules_path()).await?;
            self.write_rules(rules).await?;
        }

        for profile in &changes.save_profiles {
            let path = self.profile_path(&profile.name)?;
            let stored = Profile {
                active: false,
                ..profile.clone()
            };
            let json = serde_json::to_string_pretty(&stored)?;
            journal.record(&path).await?;
            write_atomic(&path, json.as_bytes()).await?;

            let sum_path = checksum_path(&path);
            journal.record(&sum_path).await?;
            write_atomic(&sum_path, checksum(json.as_bytes()).as_bytes()).await?;
        }

        for name in &changes.delete_profiles {
            let path = self.profile_path(name)?;
            let sum_path = checksum_path(&path);
            journal.record(&path).await?;
            journal.record(&sum_path).await?;
            remove_if_exists(&path).await?;
            remove_if_exists(&sum_path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileBackend for FileProfileBackend {
    async fn load(&self) -> Result<PersistedState, StorageError> {
        let rules = self.read_rules().await?;
        let profiles = self.read_profiles().await?;
        let active = match tokio::fs::read_to_string(self.active_path()).await {
            Ok(name) if !name.trim().is_empty() => Some(name.trim().to_string()),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(PersistedState {
            rules,
            profiles,
            active,
        })
    }

    async fn commit(&self, changes: &Changeset) -> Result<(), StorageError> {
        // Reject bad names before anything is written
        for name in changes
            .save_profiles
            .iter()
            .map(|p| p.name.as_str())
            .chain(changes.delete_profiles.iter().map(String::as_str))
        {
            self.profile_path(name)?;
        }

        let _guard = self.commit_lock.lock().await;
        let mut journal = Journal::default();
        match self.apply(changes, &mut journal).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("Commit failed, restoring previous files: {}", e);
                journal.rollback().await;
                Err(e)
            }
        }
    }

    async fn save_active(&self, name: Option<&str>) -> Result<(), StorageError> {
        match name {
            Some(name) => write_atomic(&self.active_path(), name.as_bytes()).await?,
            None => remove_if_exists(&self.active_path()).await?,
        }
        Ok(())
    }
}

/// Event log records as JSON lines (one JSON object per line)
///
/// A record may appear more than once when an append outlived its caller's
/// timeout and was retried; readers keep the first copy of each id.
#[derive(Debug)]
pub struct FileLogBackend {
    path: PathBuf,
    retention: Option<usize>,
    // Line count once known; the lock also keeps appends from interleaving
    lines: tokio::sync::Mutex<Option<usize>>,
}

impl FileLogBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retention: None,
            lines: tokio::sync::Mutex::new(None),
        }
    }

    /// Keeps at most `max_records` of the newest records on load, and
    /// compacts the file once it grows past twice that.
    pub fn with_retention(mut self, max_records: usize) -> Self {
        self.retention = Some(max_records.max(1));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_content(&self) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable record, sorted by id with duplicates removed.
    async fn read_records(&self) -> Result<Vec<LogRecord>, StorageError> {
        let Some(content) = self.read_content().await? else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    "Skipping unreadable record at {}:{}: {}",
                    self.path.display(),
                    lineno + 1,
                    e
                ),
            }
        }
        records.sort_by_key(LogRecord::id);
        let before = records.len();
        records.dedup_by_key(|r| r.id());
        if records.len() < before {
            tracing::debug!(
                "Ignored {} duplicate record(s) in {}",
                before - records.len(),
                self.path.display()
            );
        }
        Ok(records)
    }

    async fn count_lines(&self) -> Result<usize, StorageError> {
        Ok(self
            .read_content()
            .await?
            .map_or(0, |c| c.lines().filter(|l| !l.trim().is_empty()).count()))
    }

    /// Rewrites the file with the newest `max` records. Returns the new line count.
    async fn compact(&self, max: usize) -> Result<usize, StorageError> {
        let records = self.read_records().await?;
        let keep = &records[records.len().saturating_sub(max)..];
        let mut content = String::new();
        for record in keep {
            content.push_str(&serde_json::to_string(record)?);
            content.push('\n');
        }
        write_atomic(&self.path, content.as_bytes()).await?;
        tracing::info!(
            "Compacted {} to {} record(s)",
            self.path.display(),
            keep.len()
        );
        Ok(keep.len())
    }
}

#[async_trait]
impl LogBackend for FileLogBackend {
    async fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut lines = self.lines.lock().await;
        let count = match *lines {
            Some(count) => count,
            None => self.count_lines().await?,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        let count = count + 1;
        *lines = Some(count);
        if let Some(max) = self.retention
            && count > max.saturating_mul(2)
        {
            // The record is already durable; a failed compaction is retried
            // on the next append
            match self.compact(max).await {
                Ok(kept) => *lines = Some(kept),
                Err(e) => tracing::warn!("Failed to compact {}: {}", self.path.display(), e),
            }
        }
        Ok(())
    }

    async fn load(&self) -> Result<Vec<LogRecord>, StorageError> {
        let mut records = self.read_records().await?;
        if let Some(max) = self.retention {
            let excess = records.len().saturating_sub(max);
            records.drain(..excess);
        }
        Ok(records)
    }
}
