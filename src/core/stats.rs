//! Traffic statistics
//!
//! A cache over the event log: every bucket can be rebuilt by replaying the
//! log's records from empty state, and [`StatsAggregator::replay`] does
//! exactly that. Buckets are keyed by time slot, application, protocol,
//! direction and action; each key is synchronized independently by the map
//! shard that holds it.
//!
//! When the log's retention drops old records, [`StatsAggregator::evict`]
//! subtracts their contribution, so live stats and a replay of the retained
//! log agree.

use crate::core::filter::Filter;
use crate::core::firewall::{Action, ConnectionEventLog, Direction, LogRecord, Protocol};
use crate::core::pipeline::Notification;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_BUCKET_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct BucketKey {
    start: DateTime<Utc>,
    application: String,
    protocol: Protocol,
    direction: Direction,
    action: Action,
}

/// Signed so an eviction may be applied before the record it removes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    /// Contributing records; a bucket is visible while this is positive
    records: i64,
    connections: i64,
    bytes_sent: i64,
    bytes_recv: i64,
}

fn signed(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn unsigned(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

impl Counters {
    fn connection() -> Self {
        Self {
            records: 1,
            connections: 1,
            ..Self::default()
        }
    }

    fn bytes(sent: u64, recv: u64) -> Self {
        Self {
            records: 1,
            connections: 0,
            bytes_sent: signed(sent),
            bytes_recv: signed(recv),
        }
    }

    fn add(&mut self, delta: Counters) {
        self.records = self.records.saturating_add(delta.records);
        self.connections = self.connections.saturating_add(delta.connections);
        self.bytes_sent = self.bytes_sent.saturating_add(delta.bytes_sent);
        self.bytes_recv = self.bytes_recv.saturating_add(delta.bytes_recv);
    }

    fn negated(self) -> Self {
        Self {
            records: self.records.saturating_neg(),
            connections: self.connections.saturating_neg(),
            bytes_sent: self.bytes_sent.saturating_neg(),
            bytes_recv: self.bytes_recv.saturating_neg(),
        }
    }

    fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    fn is_visible(&self) -> bool {
        self.records > 0
    }
}

/// One aggregated bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStat {
    /// Start of the time slot (inclusive)
    pub timestamp: DateTime<Utc>,
    /// End of the time slot (exclusive)
    pub until: DateTime<Utc>,
    pub application: String,
    pub protocol: Protocol,
    pub direction: Direction,
    pub action: Action,
    pub connections: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// Totals across every bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total_connections: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_recv: u64,
    pub connections_allowed: u64,
    pub connections_blocked: u64,
}

/// Per-application traffic totals for [`StatsAggregator::top_applications`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppUsage {
    pub application: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub total_bytes: u64,
}

pub struct StatsAggregator {
    buckets: DashMap<BucketKey, Counters>,
    width: chrono::Duration,
}

impl StatsAggregator {
    pub fn new(bucket_secs: u64) -> Self {
        let secs = i64::try_from(bucket_secs.max(1)).unwrap_or(i64::MAX / 2);
        Self {
            buckets: DashMap::new(),
            width: chrono::Duration::seconds(secs),
        }
    }

    fn slot(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.width.num_seconds();
        let secs = at.timestamp();
        DateTime::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap_or(at)
    }

    fn key(
        &self,
        at: DateTime<Utc>,
        application: &str,
        protocol: Protocol,
        direction: Direction,
        action: Action,
    ) -> BucketKey {
        BucketKey {
            start: self.slot(at),
            application: application.to_string(),
            protocol,
            direction,
            action,
        }
    }

    fn entry_key(&self, entry: &ConnectionEventLog) -> BucketKey {
        self.key(
            entry.timestamp,
            &entry.event.app_path,
            entry.event.protocol,
            entry.event.direction,
            entry.decision,
        )
    }

    fn contribution(&self, record: &LogRecord) -> (BucketKey, Counters) {
        match record {
            LogRecord::Decision(entry) => (self.entry_key(entry), Counters::connection()),
            LogRecord::Traffic(update) => (
                self.key(
                    update.decided_at,
                    &update.application,
                    update.protocol,
                    update.direction,
                    update.action,
                ),
                Counters::bytes(update.bytes_sent, update.bytes_recv),
            ),
        }
    }

    fn add(&self, key: BucketKey, delta: Counters) {
        let emptied = {
            let mut counters = self.buckets.entry(key.clone()).or_default();
            counters.add(delta);
            counters.is_zero()
        };
        if emptied {
            self.buckets.remove_if(&key, |_, counters| counters.is_zero());
        }
    }

    /// Counts one connection for a logged decision.
    pub fn record_decision(&self, entry: &ConnectionEventLog) {
        self.add(self.entry_key(entry), Counters::connection());
    }

    /// Adds bytes transferred on the connection behind `entry`.
    ///
    /// Bytes land in the decision's bucket. For the stats to stay
    /// reproducible from the log, the same amounts must also be logged as a
    /// [`TrafficUpdate`](crate::core::firewall::TrafficUpdate).
    pub fn record(&self, entry: &ConnectionEventLog, bytes_sent: u64, bytes_recv: u64) {
        self.add(self.entry_key(entry), Counters::bytes(bytes_sent, bytes_recv));
    }

    pub fn apply(&self, record: &LogRecord) {
        let (key, delta) = self.contribution(record);
        self.add(key, delta);
    }

    /// Takes back what `records` contributed once the event log has
    /// dropped them, so the buckets keep matching a replay of the log.
    pub fn evict<'a>(&self, records: impl IntoIterator<Item = &'a LogRecord>) {
        for record in records {
            let (key, delta) = self.contribution(record);
            self.add(key, delta.negated());
        }
    }

    /// Discards all buckets and rebuilds them from `records`.
    pub fn replay<'a>(&self, records: impl IntoIterator<Item = &'a LogRecord>) {
        self.clear();
        for record in records {
            self.apply(record);
        }
    }

    /// Buckets matching `filter`, ordered by slot then key fields.
    pub fn query(&self, filter: &Filter) -> Vec<ConnectionStat> {
        let matching: BTreeMap<BucketKey, Counters> = self
            .buckets
            .iter()
            .filter(|bucket| {
                let key = bucket.key();
                bucket.value().is_visible()
                    && filter.matches_fields(&key.application, key.protocol, key.direction, key.action)
                    && filter.intersects_span(key.start, key.start + self.width)
            })
            .map(|bucket| (bucket.key().clone(), *bucket.value()))
            .collect();

        matching
            .into_iter()
            .map(|(key, counters)| ConnectionStat {
                timestamp: key.start,
                until: key.start + self.width,
                application: key.application,
                protocol: key.protocol,
                direction: key.direction,
                action: key.action,
                connections: unsigned(counters.connections),
                bytes_sent: unsigned(counters.bytes_sent),
                bytes_recv: unsigned(counters.bytes_recv),
            })
            .collect()
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for bucket in self.buckets.iter().filter(|b| b.value().is_visible()) {
            let (key, c) = (bucket.key(), bucket.value());
            let connections = unsigned(c.connections);
            summary.total_connections += connections;
            summary.total_bytes_sent = summary.total_bytes_sent.saturating_add(unsigned(c.bytes_sent));
            summary.total_bytes_recv = summary.total_bytes_recv.saturating_add(unsigned(c.bytes_recv));
            match key.action {
                Action::Allow => summary.connections_allowed += connections,
                Action::Block => summary.connections_blocked += connections,
            }
        }
        summary
    }

    /// The `n` applications that moved the most bytes, largest first.
    pub fn top_applications(&self, n: usize) -> Vec<AppUsage> {
        let mut per_app: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for bucket in self.buckets.iter() {
            let (key, c) = (bucket.key(), bucket.value());
            if key.application.is_empty() || !c.is_visible() {
                continue;
            }
            let totals = per_app.entry(key.application.clone()).or_default();
            totals.0 = totals.0.saturating_add(unsigned(c.bytes_sent));
            totals.1 = totals.1.saturating_add(unsigned(c.bytes_recv));
        }

        let mut usage: Vec<AppUsage> = per_app
            .into_iter()
            .map(|(application, (bytes_sent, bytes_recv))| AppUsage {
                application,
                bytes_sent,
                bytes_recv,
                total_bytes: bytes_sent.saturating_add(bytes_recv),
            })
            .collect();
        // Stable sort keeps name order among equal totals
        usage.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes));
        usage.truncate(n);
        usage
    }

    /// Number of non-empty buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().filter(|b| b.value().is_visible()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Consumes pipeline notifications until the channel closes.
    pub fn attach(self: Arc<Self>, mut notifications: mpsc::UnboundedReceiver<Notification>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                match notification {
                    Notification::Decision(entry) => self.record_decision(&entry),
                    Notification::Traffic(update) => self.apply(&LogRecord::Traffic(update)),
                    Notification::Evicted(records) => self.evict(records.iter()),
                }
            }
            tracing::debug!("Stats subscriber detached");
        })
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::TrafficUpdate;
    use crate::core::test_helpers::{at, decision};

    fn logged(app: &str, port: u16, action: Action, secs: i64) -> ConnectionEventLog {
        let mut entry = decision(app, port, action);
        entry.timestamp = at(secs);
        entry
    }

    #[test]
    fn test_decisions_share_bucket() {
        let stats = StatsAggregator::new(60);
        stats.record_decision(&logged("/usr/bin/curl", 443, Action::Allow, 5));
        stats.record_decision(&logged("/usr/bin/curl", 80, Action::Allow, 59));
        stats.record_decision(&logged("/usr/bin/curl", 80, Action::Allow, 60));

        let buckets = stats.query(&Filter::default());
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].connections, 2);
        assert_eq!(buckets[0].timestamp, at(0));
        assert_eq!(buckets[0].until, at(60));
        assert_eq!(buckets[1].connections, 1);
    }

    #[test]
    fn test_action_splits_buckets() {
        let stats = StatsAggregator::new(60);
        stats.record_decision(&logged("/usr/bin/curl", 443, Action::Allow, 1));
        stats.record_decision(&logged("/usr/bin/curl", 443, Action::Block, 2));
        assert_eq!(stats.len(), 2);

        let blocked = stats.query(&Filter::default().action(Action::Block));
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].action, Action::Block);
    }

    #[test]
    fn test_bytes_land_in_decision_bucket() {
        let stats = StatsAggregator::new(60);
        let entry = logged("/usr/bin/curl", 443, Action::Allow, 10);
        stats.record_decision(&entry);
        stats.record(&entry, 100, 2000);

        let mut update = TrafficUpdate::for_entry(&entry, 1, 2);
        update.reported_at = at(600);
        stats.apply(&LogRecord::Traffic(update));

        let buckets = stats.query(&Filter::default());
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].bytes_sent, 101);
        assert_eq!(buckets[0].bytes_recv, 2002);
        assert_eq!(buckets[0].connections, 1);
    }

    #[test]
    fn test_time_range_uses_bucket_overlap() {
        let stats = StatsAggregator::new(60);
        stats.record_decision(&logged("/bin/a", 1, Action::Allow, 30));
        stats.record_decision(&logged("/bin/a", 1, Action::Allow, 130));

        // since=59 still overlaps [0, 60)
        let hits = stats.query(&Filter::default().since(at(59)).until(at(100)));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].timestamp, at(0));

        assert!(stats.query(&Filter::default().since(at(60)).until(at(119))).is_empty());
    }

    #[test]
    fn test_replay_matches_incremental() {
        let incremental = StatsAggregator::new(60);
        let mut records = Vec::new();
        for (i, app) in ["/bin/a", "/bin/b", "/bin/a"].iter().enumerate() {
            let mut entry = logged(app, 443, Action::Allow, i as i64 * 45);
            entry.id = i as u64 * 2 + 1;
            incremental.record_decision(&entry);
            records.push(LogRecord::Decision(entry.clone()));

            let update = TrafficUpdate::for_entry(&entry, 10, 20);
            incremental.apply(&LogRecord::Traffic(update.clone()));
            records.push(LogRecord::Traffic(update));
        }

        let rebuilt = StatsAggregator::new(60);
        rebuilt.record_decision(&logged("/bin/stale", 1, Action::Block, 0));
        rebuilt.replay(&records);
        assert_eq!(
            rebuilt.query(&Filter::default()),
            incremental.query(&Filter::default())
        );
    }

    #[test]
    fn test_evict_takes_back_contribution() {
        let stats = StatsAggregator::new(60);
        let kept = LogRecord::Decision(logged("/bin/a", 1, Action::Allow, 0));
        let old = logged("/bin/a", 2, Action::Allow, 5);
        let old_records = vec![
            LogRecord::Decision(old.clone()),
            LogRecord::Traffic(TrafficUpdate::for_entry(&old, 10, 20)),
            LogRecord::Decision(logged("/bin/b", 3, Action::Block, 70)),
        ];
        stats.apply(&kept);
        for record in &old_records {
            stats.apply(record);
        }
        assert_eq!(stats.len(), 2);

        stats.evict(&old_records);
        let buckets = stats.query(&Filter::default());
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].connections, 1);
        assert_eq!(buckets[0].bytes_sent, 0);
        assert_eq!(stats.summary().total_connections, 1);
    }

    #[test]
    fn test_evict_before_apply_cancels_out() {
        let stats = StatsAggregator::new(60);
        let record = LogRecord::Decision(logged("/bin/a", 1, Action::Block, 0));

        stats.evict([&record]);
        assert!(stats.is_empty());
        assert_eq!(stats.summary(), Summary::default());

        stats.apply(&record);
        assert!(stats.is_empty());
        assert!(stats.query(&Filter::default()).is_empty());
    }

    #[test]
    fn test_summary() {
        let stats = StatsAggregator::default();
        let allowed = logged("/bin/a", 1, Action::Allow, 0);
        stats.record_decision(&allowed);
        stats.record(&allowed, 5, 7);
        stats.record_decision(&logged("/bin/b", 1, Action::Block, 0));

        let s = stats.summary();
        assert_eq!(s.total_connections, 2);
        assert_eq!(s.connections_allowed, 1);
        assert_eq!(s.connections_blocked, 1);
        assert_eq!(s.total_bytes_sent, 5);
        assert_eq!(s.total_bytes_recv, 7);

        stats.clear();
        assert_eq!(stats.summary(), Summary::default());
    }

    #[test]
    fn test_top_applications() {
        let stats = StatsAggregator::default();
        for (app, bytes) in [("/bin/a", 10), ("/bin/b", 300), ("/bin/c", 300), ("/bin/a", 5)] {
            stats.record(&logged(app, 1, Action::Allow, 0), bytes, 0);
        }
        let top = stats.top_applications(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].application, "/bin/b");
        assert_eq!(top[1].application, "/bin/c");
        assert_eq!(stats.top_applications(10)[2].total_bytes, 15);
    }

    #[tokio::test]
    async fn test_attach_consumes_notifications() {
        let stats = Arc::new(StatsAggregator::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = stats.clone().attach(rx);

        let entry = logged("/bin/a", 1, Action::Allow, 0);
        tx.send(Notification::Decision(entry.clone())).unwrap();
        tx.send(Notification::Traffic(TrafficUpdate::for_entry(&entry, 3, 4)))
            .unwrap();
        let stale = logged("/bin/b", 1, Action::Block, 0);
        tx.send(Notification::Decision(stale.clone())).unwrap();
        tx.send(Notification::Evicted(Arc::new(vec![LogRecord::Decision(stale)])))
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        let s = stats.summary();
        assert_eq!(s.total_connections, 1);
        assert_eq!(s.total_bytes_sent, 3);
    }
}
