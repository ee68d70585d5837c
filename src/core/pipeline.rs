//! Decision pipeline
//!
//! Turns connection attempts into logged verdicts:
//!
//! 1. load the active rule-set snapshot from the [`ProfileStore`]
//! 2. evaluate it (first match wins, default policy otherwise)
//! 3. append the decision to the [`EventLog`]
//! 4. publish it to every subscriber
//!
//! [`DecisionPipeline::handle`] is safe to call from any number of tasks at
//! once. A storage failure never drops the decision: the entry is still
//! published and returned, marked [`Durability::Deferred`].

use crate::core::error::{Error, Result};
use crate::core::event_log::{Durability, EventLog};
use crate::core::firewall::{Action, ConnectionEvent, ConnectionEventLog, LogRecord, TrafficUpdate};
use crate::core::profiles::ProfileStore;
use crate::oplog::OpLog;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Message delivered to pipeline subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Decision(ConnectionEventLog),
    Traffic(TrafficUpdate),
    /// Records the event log dropped under its retention bound
    Evicted(Arc<Vec<LogRecord>>),
}

/// Outcome of [`DecisionPipeline::handle`]
#[derive(Debug, Clone)]
pub struct Handled {
    pub entry: ConnectionEventLog,
    pub durability: Durability,
}

/// Totals returned by [`DecisionPipeline::run`] once the source is drained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub handled: u64,
    /// Decisions made but not durably logged
    pub deferred: u64,
    /// Handler tasks that panicked
    pub failed: u64,
}

pub struct DecisionPipeline {
    profiles: Arc<ProfileStore>,
    log: Arc<EventLog>,
    oplog: Arc<OpLog>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
    default_policy: Action,
    append_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl DecisionPipeline {
    pub fn new(profiles: Arc<ProfileStore>, log: Arc<EventLog>, oplog: Arc<OpLog>) -> Self {
        Self {
            profiles,
            log,
            oplog,
            subscribers: Mutex::new(Vec::new()),
            default_policy: Action::Block,
            append_timeout: Duration::from_millis(500),
            closed: watch::Sender::new(false),
        }
    }

    /// Action applied when no rule matches
    pub fn with_default_policy(mut self, action: Action) -> Self {
        self.default_policy = action;
        self
    }

    /// Per-attempt bound on event log persistence
    pub fn with_append_timeout(mut self, timeout: Duration) -> Self {
        self.append_timeout = timeout;
        self
    }

    pub fn default_policy(&self) -> Action {
        self.default_policy
    }

    /// Registers a new subscriber. Every decision and traffic report made
    /// after this call is delivered; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Drops every subscriber channel so their receivers see end of stream.
    pub fn disconnect_subscribers(&self) {
        self.subscribers.lock().clear();
    }

    fn publish(&self, notification: &Notification) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    fn publish_evicted(&self, evicted: Vec<Arc<Vec<LogRecord>>>) {
        for segment in evicted {
            tracing::debug!("Event log retention dropped {} record(s)", segment.len());
            self.publish(&Notification::Evicted(segment));
        }
    }

    /// Decides one connection attempt.
    ///
    /// Fails only with [`Error::PipelineClosed`] after [`close`](Self::close).
    pub async fn handle(&self, event: ConnectionEvent) -> Result<Handled> {
        if self.is_closed() {
            return Err(Error::PipelineClosed);
        }
        Ok(self.decide(event).await)
    }

    async fn decide(&self, event: ConnectionEvent) -> Handled {
        let rules = self.profiles.active_rule_set();
        let verdict = rules.evaluate(&event, self.default_policy);
        let entry = ConnectionEventLog::new(event, verdict.action, verdict.rule_name);

        let appended = self
            .log
            .append(LogRecord::Decision(entry), self.append_timeout)
            .await;
        let LogRecord::Decision(entry) = appended.record else {
            unreachable!("decision append returned a traffic record");
        };
        let durability = appended.durability;
        tracing::debug!(
            id = entry.id,
            app = %entry.event.app_path,
            protocol = %entry.event.protocol,
            port = entry.event.relevant_port(),
            rule = %entry.rule_name,
            ruleset = rules.version(),
            "{}",
            entry.decision
        );

        if let Durability::Deferred { reason } = &durability {
            self.oplog
                .error(
                    "decision-deferred",
                    format!("Decision {} made but not durably logged", entry.id),
                    serde_json::json!({
                        "id": entry.id,
                        "application": entry.event.app_path,
                        "decision": entry.decision.as_str(),
                        "reason": reason,
                    }),
                )
                .await;
        }

        self.publish(&Notification::Decision(entry.clone()));
        self.publish_evicted(appended.evicted);
        Handled { entry, durability }
    }

    /// Logs bytes moved on a decided connection and publishes the update.
    pub async fn report_traffic(
        &self,
        entry: &ConnectionEventLog,
        bytes_sent: u64,
        bytes_recv: u64,
    ) -> (TrafficUpdate, Durability) {
        let update = TrafficUpdate::for_entry(entry, bytes_sent, bytes_recv);
        let appended = self
            .log
            .append(LogRecord::Traffic(update), self.append_timeout)
            .await;
        let LogRecord::Traffic(update) = appended.record else {
            unreachable!("traffic append returned a decision record");
        };

        if let Durability::Deferred { reason } = &appended.durability {
            self.oplog
                .error(
                    "storage-error",
                    format!("Traffic report {} not durably logged", update.id),
                    serde_json::json!({ "id": update.id, "entry_id": update.entry_id, "reason": reason }),
                )
                .await;
        }

        self.publish(&Notification::Traffic(update.clone()));
        self.publish_evicted(appended.evicted);
        (update, appended.durability)
    }

    /// Stops accepting new events. In-flight decisions complete normally.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            tracing::info!("Decision pipeline closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Handles every event from `source`, each on its own task, until the
    /// source closes or [`close`](Self::close) is called. Then stops
    /// accepting and waits for in-flight events to finish.
    pub async fn run(self: Arc<Self>, mut source: mpsc::Receiver<ConnectionEvent>) -> RunReport {
        let mut tasks = JoinSet::new();
        let mut report = RunReport::default();
        let mut closed = self.closed.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => break,
                next = source.recv() => {
                    let Some(event) = next else { break };
                    let pipeline = Arc::clone(&self);
                    tasks.spawn(async move { pipeline.decide(event).await });
                }
            }
            while let Some(result) = tasks.try_join_next() {
                report.tally(result);
            }
        }

        self.close();
        source.close();
        let in_flight = tasks.len();
        if in_flight > 0 {
            tracing::debug!("Draining {in_flight} in-flight decision(s)");
        }
        while let Some(result) = tasks.join_next().await {
            report.tally(result);
        }

        tracing::info!(
            "Decision pipeline drained: {} handled, {} deferred, {} failed",
            report.handled,
            report.deferred,
            report.failed
        );
        report
    }
}

impl RunReport {
    fn tally(&mut self, result: std::result::Result<Handled, tokio::task::JoinError>) {
        match result {
            Ok(handled) => {
                self.handled += 1;
                if matches!(handled.durability, Durability::Deferred { .. }) {
                    self.deferred += 1;
                }
            }
            Err(e) => {
                self.failed += 1;
                tracing::error!("Decision task failed: {e}");
            }
        }
    }
}
