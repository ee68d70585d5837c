//! Append-only decision log
//!
//! Records live in fixed-capacity segments. The open tail segment is sealed
//! into an `Arc` once full, so a reader's snapshot costs one `Arc` clone per
//! sealed segment plus a copy of the (bounded) tail, and the append lock is
//! never held for longer than that.
//!
//! Ids and timestamps are finalized under the append lock. A timestamp that
//! would go backwards (clock step, or a decision constructed just before a
//! concurrent one was appended) is clamped to the previous record's, so the
//! visible log is totally ordered by `(timestamp, id)`.
//!
//! Persistence is best effort with bounded retry: the in-memory append
//! always succeeds, and records the backend could not take are parked in a
//! bounded pending buffer for [`EventLog::flush_pending`]. An append that
//! timed out may still have reached the backend, so restore and flush both
//! skip ids the backend already holds.
//!
//! Segments dropped by retention are handed back to the caller in
//! [`Appended::evicted`] so derived state (stats) can forget them too.

use crate::core::error::Result;
use crate::core::filter::Filter;
use crate::core::firewall::{ConnectionEventLog, LogRecord};
use crate::core::retry::{RetryPolicy, with_retry};
use crate::core::storage::LogBackend;
use crate::oplog::OpLog;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SEGMENT_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Whether an appended record reached durable storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Durability {
    /// Written by the storage backend
    Persisted,
    /// Kept in memory and queued for retry
    Deferred { reason: String },
    /// No storage backend configured
    Volatile,
}

impl Durability {
    pub fn is_durable(&self) -> bool {
        matches!(self, Durability::Persisted)
    }
}

/// Result of [`EventLog::append`]
#[derive(Debug, Clone)]
pub struct Appended {
    /// The record as stored (id and timestamp finalized)
    pub record: LogRecord,
    pub durability: Durability,
    /// Older segments retention dropped to make room, oldest first
    pub evicted: Vec<Arc<Vec<LogRecord>>>,
}

#[derive(Debug)]
struct Segments {
    sealed: VecDeque<Arc<Vec<LogRecord>>>,
    sealed_len: usize,
    tail: Vec<LogRecord>,
    next_id: u64,
    last_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    dropped: u64,
}

impl Segments {
    fn new(capacity: usize) -> Self {
        Self {
            sealed: VecDeque::new(),
            sealed_len: 0,
            tail: Vec::with_capacity(capacity),
            next_id: 1,
            last_timestamp: None,
            dropped: 0,
        }
    }
}

/// Records waiting for the backend, capped at the retention bound
#[derive(Debug, Default)]
struct Pending {
    records: VecDeque<LogRecord>,
    dropped: u64,
    // Set once the cap is hit, cleared when the queue drains
    overflowing: bool,
}

impl Pending {
    /// Queues `record`, dropping the oldest when full. Returns true when
    /// this push started a new overflow episode.
    fn push(&mut self, record: LogRecord, cap: usize) -> bool {
        self.records.push_back(record);
        self.trim(cap)
    }

    fn trim(&mut self, cap: usize) -> bool {
        let mut overflowed = false;
        while self.records.len() > cap {
            self.records.pop_front();
            self.dropped += 1;
            overflowed |= !std::mem::replace(&mut self.overflowing, true);
        }
        overflowed
    }
}

pub struct EventLog {
    segments: Mutex<Segments>,
    segment_capacity: usize,
    max_entries: usize,
    backend: Option<Arc<dyn LogBackend>>,
    retry: RetryPolicy,
    pending: Mutex<Pending>,
    oplog: Option<Arc<OpLog>>,
}

impl EventLog {
    /// Creates an in-memory log.
    pub fn new(segment_capacity: usize, max_entries: usize) -> Self {
        let segment_capacity = segment_capacity.max(1);
        Self {
            segments: Mutex::new(Segments::new(segment_capacity)),
            segment_capacity,
            max_entries: max_entries.max(segment_capacity),
            backend: None,
            retry: RetryPolicy::default(),
            pending: Mutex::new(Pending::default()),
            oplog: None,
        }
    }

    /// Reports retry-queue overflow through `oplog`.
    pub fn with_oplog(mut self, oplog: Arc<OpLog>) -> Self {
        self.oplog = Some(oplog);
        self
    }

    /// Persists every append through `backend` using `retry` (the per-attempt
    /// timeout is supplied per append).
    pub fn with_backend(mut self, backend: Arc<dyn LogBackend>, retry: RetryPolicy) -> Self {
        self.backend = Some(backend);
        self.retry = retry;
        self
    }

    /// Reloads previously persisted records from the backend.
    ///
    /// Call once on startup, before the first append. Returns the number of
    /// records restored.
    pub async fn restore(&self) -> Result<usize> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        let records = with_retry("event log load", self.retry, || backend.load()).await?;

        let mut segs = self.segments.lock();
        let mut count = 0;
        let mut duplicates = 0;
        for record in records {
            // Ids are handed out once, so anything below next_id was seen
            if record.id() < segs.next_id {
                duplicates += 1;
                continue;
            }
            segs.next_id = record.id() + 1;
            segs.last_timestamp = segs.last_timestamp.max(Some(record.timestamp()));
            self.push_locked(&mut segs, record);
            count += 1;
        }
        if duplicates > 0 {
            tracing::warn!("Skipped {duplicates} duplicate event log record(s) on restore");
        }
        tracing::info!("Restored {count} event log record(s)");
        Ok(count)
    }

    /// Appends a record and tries to persist it within `timeout` per attempt.
    ///
    /// The in-memory append never fails; storage trouble is reported through
    /// [`Appended::durability`].
    pub async fn append(&self, mut record: LogRecord, timeout: Duration) -> Appended {
        let evicted = {
            let mut segs = self.segments.lock();
            let id = segs.next_id;
            segs.next_id += 1;
            let timestamp = match segs.last_timestamp {
                Some(last) if last > record.timestamp() => last,
                _ => record.timestamp(),
            };
            segs.last_timestamp = Some(timestamp);
            record.stamp(id, timestamp);
            self.push_locked(&mut segs, record.clone())
        };

        let durability = match &self.backend {
            None => Durability::Volatile,
            Some(backend) => {
                let policy = self.retry.with_timeout(timeout);
                match with_retry("event log append", policy, || backend.append(&record)).await {
                    Ok(()) => Durability::Persisted,
                    Err(e) => {
                        self.defer(record.clone()).await;
                        Durability::Deferred {
                            reason: e.to_string(),
                        }
                    }
                }
            }
        };

        Appended {
            record,
            durability,
            evicted,
        }
    }

    async fn defer(&self, record: LogRecord) {
        let overflowed = self.pending.lock().push(record, self.max_entries);
        if !overflowed {
            return;
        }
        let message = format!(
            "Retry queue full at {} record(s); dropping the oldest unpersisted records",
            self.max_entries
        );
        match &self.oplog {
            Some(oplog) => {
                oplog
                    .error(
                        "storage-error",
                        message,
                        serde_json::json!({
                            "operation": "event log append",
                            "capacity": self.max_entries,
                        }),
                    )
                    .await;
            }
            None => tracing::error!("{message}"),
        }
    }

    /// Convenience wrapper for decision records. Evicted segments are
    /// discarded; use [`append`](Self::append) when derived state needs them.
    pub async fn append_decision(
        &self,
        entry: ConnectionEventLog,
        timeout: Duration,
    ) -> (ConnectionEventLog, Durability) {
        let appended = self.append(LogRecord::Decision(entry), timeout).await;
        match appended.record {
            LogRecord::Decision(entry) => (entry, appended.durability),
            LogRecord::Traffic(_) => unreachable!("decision append returned a traffic record"),
        }
    }

    fn push_locked(&self, segs: &mut Segments, record: LogRecord) -> Vec<Arc<Vec<LogRecord>>> {
        segs.tail.push(record);
        if segs.tail.len() >= self.segment_capacity {
            let full = std::mem::replace(&mut segs.tail, Vec::with_capacity(self.segment_capacity));
            segs.sealed_len += full.len();
            segs.sealed.push_back(Arc::new(full));
        }

        let mut evicted = Vec::new();
        while segs.sealed_len + segs.tail.len() > self.max_entries {
            let Some(oldest) = segs.sealed.pop_front() else {
                break;
            };
            segs.sealed_len -= oldest.len();
            segs.dropped += oldest.len() as u64;
            evicted.push(oldest);
        }
        evicted
    }

    /// Retries records the backend previously refused, in id order.
    ///
    /// Records the backend already holds (an earlier append that timed out
    /// after writing) count as flushed without being written again. Returns
    /// how many were flushed. Stops at the first failure and keeps the
    /// remainder queued.
    pub async fn flush_pending(&self, timeout: Duration) -> Result<usize> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        let mut queued: Vec<LogRecord> = std::mem::take(&mut self.pending.lock().records).into();
        if queued.is_empty() {
            return Ok(0);
        }
        queued.sort_by_key(LogRecord::id);

        let policy = self.retry.with_timeout(timeout);
        let held: HashSet<u64> =
            match with_retry("event log flush", policy, || backend.load()).await {
                Ok(stored) => stored.iter().map(LogRecord::id).collect(),
                Err(e) => {
                    self.requeue(queued);
                    return Err(e);
                }
            };

        let mut flushed = 0;
        let mut iter = queued.into_iter();
        while let Some(record) = iter.next() {
            if held.contains(&record.id()) {
                tracing::debug!("Record {} already persisted, skipping", record.id());
            } else if let Err(e) =
                with_retry("event log flush", policy, || backend.append(&record)).await
            {
                self.requeue(std::iter::once(record).chain(iter).collect());
                return Err(e);
            }
            flushed += 1;
        }

        let mut pending = self.pending.lock();
        if pending.records.is_empty() {
            pending.overflowing = false;
        }
        Ok(flushed)
    }

    /// Puts unflushed records back ahead of anything queued meanwhile.
    fn requeue(&self, records: Vec<LogRecord>) {
        let mut pending = self.pending.lock();
        let newer = std::mem::take(&mut pending.records);
        pending.records = records.into_iter().chain(newer).collect();
        pending.trim(self.max_entries);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().records.len()
    }

    /// Unpersisted records discarded because the retry queue was full.
    pub fn pending_dropped(&self) -> u64 {
        self.pending.lock().dropped
    }

    /// Point-in-time view; appends after this call are not visible in it.
    pub fn snapshot(&self) -> LogSnapshot {
        let segs = self.segments.lock();
        LogSnapshot {
            sealed: segs.sealed.iter().cloned().collect(),
            tail: Arc::new(segs.tail.clone()),
        }
    }

    /// Decisions matching `filter`, ascending by time, evaluated lazily over
    /// a snapshot taken now.
    pub fn query(&self, filter: Filter) -> Query {
        Query {
            snapshot: self.snapshot(),
            filter,
            segment: 0,
            offset: 0,
        }
    }

    /// Every retained record (decisions and traffic) in id order, for replay.
    pub fn records(&self) -> Vec<LogRecord> {
        self.snapshot().iter().cloned().collect()
    }

    /// Number of records currently retained.
    pub fn len(&self) -> usize {
        let segs = self.segments.lock();
        segs.sealed_len + segs.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records discarded by retention since startup.
    pub fn dropped(&self) -> u64 {
        self.segments.lock().dropped
    }

    /// Discards retained records. Ids keep increasing.
    pub fn clear(&self) {
        let mut segs = self.segments.lock();
        segs.dropped += (segs.sealed_len + segs.tail.len()) as u64;
        segs.sealed.clear();
        segs.sealed_len = 0;
        segs.tail.clear();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_CAPACITY, DEFAULT_MAX_ENTRIES)
    }
}

/// Immutable view of the log at one instant
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    sealed: Vec<Arc<Vec<LogRecord>>>,
    tail: Arc<Vec<LogRecord>>,
}

impl LogSnapshot {
    fn segment(&self, index: usize) -> Option<&[LogRecord]> {
        match index.cmp(&self.sealed.len()) {
            std::cmp::Ordering::Less => Some(&self.sealed[index]),
            std::cmp::Ordering::Equal => Some(&self.tail),
            std::cmp::Ordering::Greater => None,
        }
    }

    /// Every record (decisions and traffic) in append order.
    pub fn iter(&self) -> impl Iterator<Item = &LogRecord> {
        self.sealed
            .iter()
            .flat_map(|s| s.iter())
            .chain(self.tail.iter())
    }

    pub fn len(&self) -> usize {
        self.sealed.iter().map(|s| s.len()).sum::<usize>() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lazy iterator returned by [`EventLog::query`]
#[derive(Debug, Clone)]
pub struct Query {
    snapshot: LogSnapshot,
    filter: Filter,
    segment: usize,
    offset: usize,
}

impl Iterator for Query {
    type Item = ConnectionEventLog;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let segment = self.snapshot.segment(self.segment)?;
            let Some(record) = segment.get(self.offset) else {
                self.segment += 1;
                self.offset = 0;
                continue;
            };
            self.offset += 1;
            if let Some(entry) = record.as_decision()
                && self.filter.matches_entry(entry)
            {
                return Some(entry.clone());
            }
        }
    }
}
