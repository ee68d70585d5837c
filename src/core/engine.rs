//! Wires the profile store, event log, stats aggregator and decision
//! pipeline together from an [`EngineConfig`].

use crate::config::EngineConfig;
use crate::core::error::Result;
use crate::core::event_log::EventLog;
use crate::core::persist::{FileLogBackend, FileProfileBackend};
use crate::core::pipeline::DecisionPipeline;
use crate::core::profiles::ProfileStore;
use crate::core::stats::StatsAggregator;
use crate::core::storage::{LogBackend, MemoryProfileBackend, ProfileBackend};
use crate::oplog::OpLog;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const DECISION_LOG_FILE: &str = "decisions.jsonl";
pub const OPERATIONS_LOG_FILE: &str = "operations.jsonl";

pub struct Engine {
    pub config: EngineConfig,
    pub oplog: Arc<OpLog>,
    pub profiles: Arc<ProfileStore>,
    pub log: Arc<EventLog>,
    pub stats: Arc<StatsAggregator>,
    pub pipeline: Arc<DecisionPipeline>,
    stats_task: JoinHandle<()>,
}

impl Engine {
    /// Opens file-backed state under `data_dir`, restores the decision log
    /// and rebuilds stats from it.
    pub async fn open(config: EngineConfig, data_dir: &Path) -> Result<Self> {
        let profile_backend = Arc::new(FileProfileBackend::open(data_dir).await.map_err(|e| {
            crate::Error::Storage {
                operation: "open data directory".to_string(),
                attempts: 1,
                source: e,
            }
        })?);
        let log_backend: Option<Arc<dyn LogBackend>> = config.persist_decisions.then(|| {
            Arc::new(
                FileLogBackend::new(data_dir.join(DECISION_LOG_FILE))
                    .with_retention(config.clone().sanitized().max_log_entries),
            ) as Arc<dyn LogBackend>
        });
        let oplog = Arc::new(OpLog::with_file(
            data_dir.join(OPERATIONS_LOG_FILE),
            config.recent_oplog_events,
        ));
        Self::assemble(config, profile_backend, log_backend, oplog).await
    }

    /// Engine with nothing persisted.
    pub async fn in_memory(config: EngineConfig) -> Result<Self> {
        let oplog = Arc::new(OpLog::in_memory(config.recent_oplog_events));
        Self::assemble(config, Arc::new(MemoryProfileBackend::new()), None, oplog).await
    }

    pub async fn assemble(
        config: EngineConfig,
        profile_backend: Arc<dyn ProfileBackend>,
        log_backend: Option<Arc<dyn LogBackend>>,
        oplog: Arc<OpLog>,
    ) -> Result<Self> {
        let config = config.sanitized();
        let retry = config.retry_policy();

        let profiles =
            Arc::new(ProfileStore::open(profile_backend, retry, Arc::clone(&oplog)).await?);

        let mut log = EventLog::new(config.log_segment_capacity, config.max_log_entries)
            .with_oplog(Arc::clone(&oplog));
        if let Some(backend) = log_backend {
            log = log.with_backend(backend, retry);
        }
        log.restore().await?;
        let log = Arc::new(log);

        let stats = Arc::new(StatsAggregator::new(config.stats_bucket_secs));
        stats.replay(&log.records());

        let pipeline = Arc::new(
            DecisionPipeline::new(Arc::clone(&profiles), Arc::clone(&log), Arc::clone(&oplog))
                .with_default_policy(config.default_policy)
                .with_append_timeout(config.append_timeout()),
        );
        let stats_task = Arc::clone(&stats).attach(pipeline.subscribe());

        Ok(Self {
            config,
            oplog,
            profiles,
            log,
            stats,
            pipeline,
            stats_task,
        })
    }

    /// Closes the pipeline, retries deferred log records once and waits
    /// for the stats subscriber to catch up.
    ///
    /// Call after every in-flight decision has completed.
    pub async fn shutdown(self) -> Result<()> {
        self.pipeline.close();
        let flushed = self.log.flush_pending(self.config.append_timeout()).await;
        self.pipeline.disconnect_subscribers();
        if let Err(e) = self.stats_task.await {
            tracing::error!("Stats subscriber failed: {e}");
        }
        flushed.map(|count| {
            if count > 0 {
                tracing::info!("Flushed {count} deferred log record(s)");
            }
        })
    }
}
