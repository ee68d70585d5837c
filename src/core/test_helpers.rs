//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::error::StorageError;
use crate::core::event_log::EventLog;
use crate::core::firewall::{
    Action, ConnectionEvent, ConnectionEventLog, Direction, LogRecord, Protocol, Rule,
};
use crate::core::pipeline::DecisionPipeline;
use crate::core::profiles::ProfileStore;
use crate::core::storage::{
    Changeset, LogBackend, MemoryLogBackend, MemoryProfileBackend, PersistedState, ProfileBackend,
};
use crate::oplog::OpLog;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Start of a 60-second stats bucket, so `at(0)` is bucket-aligned.
const BASE_SECS: i64 = 1_699_999_980;

/// Fixed point in time `secs` seconds after a bucket-aligned base.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(BASE_SECS + secs, 0).unwrap()
}

/// Rule with any protocol, any port and both directions.
pub fn rule(name: &str, application: &str, action: Action) -> Rule {
    Rule::new(name, application, action)
}

/// Outbound attempt from `app` to 203.0.113.7:`dst_port`.
pub fn outbound(app: &str, protocol: Protocol, dst_port: u16) -> ConnectionEvent {
    ConnectionEvent::new(app, protocol, Direction::Outbound)
        .with_source(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 50_000)
        .with_destination(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), dst_port)
}

/// Inbound attempt to `app` listening on `local_port`.
pub fn inbound(app: &str, protocol: Protocol, local_port: u16) -> ConnectionEvent {
    ConnectionEvent::new(app, protocol, Direction::Inbound)
        .with_source(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), local_port)
        .with_destination(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)), 61_000)
}

/// Unappended decision (id 0) for an outbound tcp attempt.
pub fn decision(app: &str, dst_port: u16, action: Action) -> ConnectionEventLog {
    ConnectionEventLog::new(outbound(app, Protocol::Tcp, dst_port), action, "")
}

/// In-memory store with `profile` holding `rules` (in order) and active.
pub async fn store_with(profile: &str, rules: Vec<Rule>) -> ProfileStore {
    let store = ProfileStore::in_memory();
    store.create_profile(profile, "").await.unwrap();
    for rule in rules {
        store.add_rule(profile, rule).await.unwrap();
    }
    store.set_active(profile).await.unwrap();
    store
}

/// Pipeline over an active "Default" profile with `rules` and an
/// in-memory event log.
pub async fn pipeline_with(
    rules: Vec<Rule>,
) -> (Arc<DecisionPipeline>, Arc<EventLog>, Arc<ProfileStore>) {
    let store = Arc::new(store_with("Default", rules).await);
    let log = Arc::new(EventLog::default());
    let pipeline = Arc::new(DecisionPipeline::new(
        Arc::clone(&store),
        Arc::clone(&log),
        Arc::new(OpLog::default()),
    ));
    (pipeline, log, store)
}

fn injected() -> StorageError {
    StorageError::Unavailable("injected failure".into())
}

/// Log backend that can be switched between healthy and failing.
#[derive(Debug, Default)]
pub struct FlakyLogBackend {
    failing: AtomicBool,
    inner: MemoryLogBackend,
}

impl FlakyLogBackend {
    pub fn failing() -> Self {
        let backend = Self::default();
        backend.fail();
        backend
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Vec<LogRecord> {
        self.inner.records()
    }
}

#[async_trait]
impl LogBackend for FlakyLogBackend {
    async fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.append(record).await
    }

    async fn load(&self) -> Result<Vec<LogRecord>, StorageError> {
        self.inner.load().await
    }
}

/// Log backend whose first `stalls` appends store the record and then hang
/// for `stall` before reporting success.
#[derive(Debug)]
pub struct StallingLogBackend {
    stalls: AtomicUsize,
    stall: Duration,
    inner: MemoryLogBackend,
}

impl StallingLogBackend {
    pub fn new(stalls: usize, stall: Duration) -> Self {
        Self {
            stalls: AtomicUsize::new(stalls),
            stall,
            inner: MemoryLogBackend::new(),
        }
    }

    pub fn stored(&self) -> Vec<LogRecord> {
        self.inner.records()
    }
}

#[async_trait]
impl LogBackend for StallingLogBackend {
    async fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        self.inner.append(record).await?;
        let stall = self
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stall {
            tokio::time::sleep(self.stall).await;
        }
        Ok(())
    }

    async fn load(&self) -> Result<Vec<LogRecord>, StorageError> {
        self.inner.load().await
    }
}

/// Profile backend that can be switched between healthy and failing.
#[derive(Debug, Default)]
pub struct FlakyProfileBackend {
    failing: AtomicBool,
    inner: MemoryProfileBackend,
}

impl FlakyProfileBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    pub fn state(&self) -> PersistedState {
        self.inner.state()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(injected())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProfileBackend for FlakyProfileBackend {
    async fn load(&self) -> Result<PersistedState, StorageError> {
        self.check()?;
        self.inner.load().await
    }

    async fn commit(&self, changes: &Changeset) -> Result<(), StorageError> {
        self.check()?;
        self.inner.commit(changes).await
    }

    async fn save_active(&self, name: Option<&str>) -> Result<(), StorageError> {
        self.check()?;
        self.inner.save_active(name).await
    }
}
