use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::{EngineError, ErrorSink};
use crate::export::health::HealthMetrics;
use crate::metrics::Update;

use super::commit::{CommitBatch, CommitJob, CommitKind};
use super::groups::MetricGroup;
use super::queue;
use super::rollback::RollbackCoordinator;
use super::sample::{PerformanceSample, QueueStatus, SampleContext};

/// Events accepted from the node, processed strictly in arrival order.
#[derive(Debug)]
pub enum Ingest {
    /// A performance sample, or `None` when the cycle produced none.
    Sample(Option<(PerformanceSample, SampleContext)>),
    QueueStatus(QueueStatus),
    BlockPopped(u64),
    /// Resolves once everything ingested before it has been committed.
    Flush(oneshot::Sender<()>),
}

/// Reports caught errors through tracing and the health metrics.
pub struct LogErrorSink {
    health: Arc<HealthMetrics>,
}

impl LogErrorSink {
    pub fn new(health: Arc<HealthMetrics>) -> Self {
        Self { health }
    }
}

impl ErrorSink for LogErrorSink {
    fn report(&self, err: &EngineError) {
        let group = match err {
            EngineError::Computation { group, .. } => *group,
            _ => "engine",
        };
        error!(group, error = %err, "metric computation failed");
        self.health
            .computation_errors
            .with_label_values(&[group])
            .inc();
    }
}

/// Fans each sample out to the metric groups on a bounded worker pool and
/// turns the results into one commit batch.
pub struct SampleIngestionPipeline {
    groups: Vec<Arc<dyn MetricGroup>>,
    workers: Arc<Semaphore>,
    errors: Arc<dyn ErrorSink>,
    health: Arc<HealthMetrics>,
}

impl SampleIngestionPipeline {
    pub fn new(
        groups: Vec<Arc<dyn MetricGroup>>,
        workers: usize,
        errors: Arc<dyn ErrorSink>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            groups,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            errors,
            health,
        }
    }

    /// Computes every group for one sample and waits for all of them.
    ///
    /// Updates are concatenated in group order regardless of completion
    /// order. A group that fails or panics contributes nothing; its error
    /// goes to the error sink.
    pub async fn process(&self, sample: PerformanceSample, ctx: SampleContext) -> CommitBatch {
        let height = sample.height;
        let sample = Arc::new(sample);
        let mut in_flight = JoinSet::new();

        for (index, group) in self.groups.iter().enumerate() {
            let kind = group.kind();
            let permit = match Arc::clone(&self.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    self.errors.report(&EngineError::Computation {
                        group: kind.as_str(),
                        reason: format!("worker pool closed: {e}"),
                    });
                    continue;
                }
            };

            let group = Arc::clone(group);
            let sample = Arc::clone(&sample);
            let duration = self
                .health
                .group_compute_duration
                .with_label_values(&[kind.as_str()]);

            in_flight.spawn_blocking(move || {
                let _permit = permit;
                let start = Instant::now();
                let result = catch_unwind(AssertUnwindSafe(|| group.compute(&sample, &ctx)))
                    .unwrap_or_else(|panic| {
                        Err(EngineError::Computation {
                            group: kind.as_str(),
                            reason: panic_message(panic.as_ref()),
                        })
                    });
                duration.observe(start.elapsed().as_secs_f64());
                (index, result)
            });
        }

        let mut results: Vec<Option<Vec<Update>>> = vec![None; self.groups.len()];
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((index, Ok(updates))) => {
                    if let Some(slot) = results.get_mut(index) {
                        *slot = Some(updates);
                    }
                }
                Ok((_, Err(e))) => self.errors.report(&e),
                Err(e) => warn!(height, error = %e, "group worker join failed"),
            }
        }

        CommitBatch {
            kind: CommitKind::Block { height },
            updates: results.into_iter().flatten().flatten().collect(),
        }
    }

    /// Consumes ingested events until the ingest channel closes, posting
    /// one commit job per event.
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<Ingest>,
        commits: mpsc::UnboundedSender<CommitJob>,
        rollback: RollbackCoordinator,
    ) {
        while let Some(event) = rx.recv().await {
            let job = match event {
                Ingest::Sample(Some((sample, ctx))) => {
                    self.health.samples_received.inc();
                    CommitJob::Apply(self.process(sample, ctx).await)
                }
                Ingest::Sample(None) => {
                    debug!("no performance sample this cycle");
                    self.health.samples_missing.inc();
                    continue;
                }
                Ingest::QueueStatus(status) => {
                    self.health.queue_updates.inc();
                    CommitJob::Apply(queue::queue_status_batch(&status))
                }
                Ingest::BlockPopped(height) => {
                    rollback.on_block_popped(height);
                    continue;
                }
                Ingest::Flush(done) => CommitJob::Barrier(done),
            };

            if commits.send(job).is_err() {
                warn!("commit queue closed, stopping dispatcher");
                return;
            }
        }

        debug!("sample dispatcher drained");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
