use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::export::health::HealthMetrics;
use crate::metrics::{self, Readout, SeriesStore, Update, XKey};

/// What produced a commit batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    /// Updates for one performance sample.
    Block { height: u64 },
    /// Updates for one network rate tick.
    Network { timestamp_ms: i64 },
    /// Readouts for one download queue status.
    QueueStatus,
}

/// Every update produced for one event, applied as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitBatch {
    pub kind: CommitKind,
    pub updates: Vec<Update>,
}

/// A job on the single-consumer commit queue.
#[derive(Debug)]
pub enum CommitJob {
    Apply(CommitBatch),
    /// Drop height-keyed points above `height`.
    Truncate { height: u64 },
    /// Resolves once every job queued before it has been applied.
    Barrier(oneshot::Sender<()>),
}

/// Receives committed batches, e.g. a presentation layer.
///
/// Called by the commit consumer while it holds the state's write lock, so
/// implementations must not read the engine snapshot from inside.
pub trait DisplaySink: Send + Sync {
    fn apply(&self, batch: &CommitBatch);

    /// Called after a rollback with the readouts rebuilt from the
    /// truncated series.
    fn truncate(&self, _height: u64, _readouts: &[Readout]) {}
}

/// A display sink that discards everything.
#[derive(Debug, Default)]
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn apply(&self, _batch: &CommitBatch) {}
}

/// Shared display state. Written only by the commit consumer.
#[derive(Debug, Clone)]
pub struct DashboardState {
    pub series: SeriesStore,
    pub readouts: BTreeMap<&'static str, Readout>,
    /// Height of the latest committed sample, lowered by rollbacks.
    pub last_height: Option<u64>,
    pub commits: u64,
}

impl DashboardState {
    pub fn new(series: SeriesStore) -> Self {
        Self {
            series,
            readouts: BTreeMap::new(),
            last_height: None,
            commits: 0,
        }
    }

    /// Applies every update of a batch.
    pub fn apply(&mut self, batch: &CommitBatch) {
        for update in &batch.updates {
            match update {
                Update::Point { series, x, y } => {
                    if !self.series.insert(series, *x, *y) {
                        tracing::debug!(series, x, "dropped out-of-order point");
                    }
                }
                Update::Readout(readout) => {
                    self.readouts.insert(readout.name, readout.clone());
                }
            }
        }

        if let CommitKind::Block { height } = batch.kind {
            self.last_height = Some(height);
        }
        self.commits += 1;
    }

    /// Truncates height-keyed series to `height` and, when points were
    /// removed, rebuilds their readouts from what remains. Returns the
    /// removed point count and the rebuilt readouts.
    pub fn truncate(&mut self, height: u64) -> (usize, Vec<Readout>) {
        let removed = self.series.truncate_keyed(XKey::Height, height as f64);
        if self.last_height.is_some_and(|h| h > height) {
            self.last_height = Some(height);
        }
        if removed == 0 {
            return (0, Vec::new());
        }

        let readouts = metrics::readouts_from_series(&self.series);
        for readout in &readouts {
            self.readouts.insert(readout.name, readout.clone());
        }
        (removed, readouts)
    }
}

/// Applies commit jobs in queue order until every sender is dropped.
///
/// Each batch is applied to the state and forwarded to the display sink
/// under one write lock, so readers never see half a batch.
pub async fn run_commit_consumer(
    mut rx: mpsc::UnboundedReceiver<CommitJob>,
    state: Arc<RwLock<DashboardState>>,
    sink: Arc<dyn DisplaySink>,
    health: Arc<HealthMetrics>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            CommitJob::Apply(batch) => {
                let start = Instant::now();
                {
                    let mut st = state.write();
                    st.apply(&batch);
                    sink.apply(&batch);
                }
                health
                    .commit_duration
                    .observe(start.elapsed().as_secs_f64());
                health.commits_applied.inc();

                if let CommitKind::Block { height } = batch.kind {
                    health.current_height.set(height as f64);
                }
            }
            CommitJob::Truncate { height } => {
                let (removed, last_height) = {
                    let mut st = state.write();
                    let (removed, readouts) = st.truncate(height);
                    sink.truncate(height, &readouts);
                    (removed, st.last_height)
                };
                health.points_truncated.inc_by(removed as f64);
                if let Some(h) = last_height {
                    health.current_height.set(h as f64);
                }

                tracing::info!(height, removed, "truncated series after rollback");
            }
            CommitJob::Barrier(done) => {
                // The waiter may have given up.
                let _ = done.send(());
            }
        }
    }

    tracing::debug!("commit consumer stopped");
}
