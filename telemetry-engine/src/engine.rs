use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    coordinator::IngestionCoordinator,
    domain::WindowSize,
    error::Result,
    index::{AggregationIndex, IndexSnapshot, RebuildStats, RestoreOutcome},
    query::QueryEngine,
    registry::MeterRegistry,
    store::{FileLog, MemoryLog, ReadingLog, ReadingStore},
};

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_window_sizes")]
    pub window_sizes: Vec<WindowSize>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Durable reading log; readings are kept in memory only when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub registry_path: Option<PathBuf>,
    /// Where index snapshots are written on shutdown and read on start.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
}

fn default_window_sizes() -> Vec<WindowSize> {
    WindowSize::COARSE_TO_FINE.to_vec()
}

fn default_workers() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_sizes: default_window_sizes(),
            workers: default_workers(),
            log_path: None,
            registry_path: None,
            snapshot_dir: None,
        }
    }
}

/// Store, index, coordinator and query engine wired over one registry.
#[derive(Clone)]
pub struct Engine {
    store: Arc<ReadingStore>,
    index: Arc<AggregationIndex>,
    coordinator: IngestionCoordinator,
    query: QueryEngine,
    snapshot_dir: Option<PathBuf>,
}

impl Engine {
    /// Replay the reading log and bring every configured window up to date,
    /// from a snapshot when a current one exists and by rebuilding otherwise.
    pub fn open(config: &EngineConfig, registry: Arc<dyn MeterRegistry>, cancel: &CancellationToken) -> Result<Self> {
        let log: Arc<dyn ReadingLog> = match &config.log_path {
            Some(path) => Arc::new(FileLog::open(path)?),
            None => Arc::new(MemoryLog::new()),
        };
        let store = Arc::new(ReadingStore::open(registry, log)?);
        let index = Arc::new(AggregationIndex::new(store.clone(), &config.window_sizes));

        let engine = Self {
            coordinator: IngestionCoordinator::new(index.clone(), config.workers),
            query: QueryEngine::new(index.clone()),
            store,
            index,
            snapshot_dir: config.snapshot_dir.clone(),
        };
        engine.warm_start(cancel)?;
        Ok(engine)
    }

    fn warm_start(&self, cancel: &CancellationToken) -> Result<()> {
        if self.store.is_empty() {
            return Ok(());
        }
        for size in self.index.window_sizes() {
            let snapshot = self
                .snapshot_dir
                .as_deref()
                .map(|dir| snapshot_path(dir, size))
                .filter(|path| path.exists())
                .map(IndexSnapshot::read_from);

            match snapshot {
                Some(Ok(snap)) => {
                    if let RestoreOutcome::Rebuilt(stats) = self.index.restore(snap, cancel)? {
                        tracing::info!(window = %size, buckets = stats.buckets, "index rebuilt on start");
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(window = %size, error = %e, "unreadable index snapshot, rebuilding");
                    self.index.rebuild(size, cancel)?;
                }
                None => {
                    self.index.rebuild(size, cancel)?;
                }
            }
        }
        Ok(())
    }

    /// Write a snapshot of every window to the snapshot directory, if one is
    /// configured. Returns the number of snapshots written.
    pub fn save_snapshots(&self) -> Result<usize> {
        let Some(dir) = &self.snapshot_dir else {
            return Ok(0);
        };
        let mut written = 0;
        for size in self.index.window_sizes() {
            let snap = self.index.snapshot(size)?;
            snap.write_to(snapshot_path(dir, size))?;
            tracing::info!(window = %size, buckets = snap.buckets.len(), sequence = snap.store_sequence, "index snapshot written");
            written += 1;
        }
        Ok(written)
    }

    pub fn rebuild(&self, size: WindowSize, cancel: &CancellationToken) -> Result<RebuildStats> {
        self.index.rebuild(size, cancel)
    }

    pub fn store(&self) -> &Arc<ReadingStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<AggregationIndex> {
        &self.index
    }

    pub fn coordinator(&self) -> &IngestionCoordinator {
        &self.coordinator
    }

    pub fn query(&self) -> &QueryEngine {
        &self.query
    }
}

pub fn snapshot_path(dir: &Path, size: WindowSize) -> PathBuf {
    dir.join(format!("index-{}.json", size.as_str()))
}
