//! The aggregation engine: per-block sample pipeline, network rate loop,
//! rollback handling and the single-consumer commit queue.

pub mod commit;
pub mod groups;
pub mod pipeline;
pub mod queue;
pub mod rate;
pub mod rollback;
pub mod sample;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorSink};
use crate::export::health::HealthMetrics;
use crate::metrics::{
    AccumulatorSet, AccumulatorSnapshot, GroupKind, Point, Readout, SeriesStore, METRICS,
};

use self::commit::{run_commit_consumer, DashboardState, DisplaySink, NullDisplay};
use self::groups::MetricGroup;
use self::pipeline::{Ingest, LogErrorSink, SampleIngestionPipeline};
use self::rate::{run_rate_loop, RateComputation, VolumeGauge};
use self::rollback::RollbackCoordinator;
use self::sample::{PerformanceSample, QueueStatus, SampleContext};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Read-only view of everything the dashboard displays.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    /// RFC 3339 time the snapshot was taken.
    pub generated_at: String,
    pub last_height: Option<u64>,
    pub window_size: usize,
    pub commits: u64,
    pub series: BTreeMap<String, Vec<Point>>,
    pub accumulators: BTreeMap<String, AccumulatorSnapshot>,
    pub readouts: BTreeMap<String, Readout>,
}

struct Tasks {
    dispatcher: JoinHandle<()>,
    rate: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

/// Engine wires the pipeline, rate loop, rollback coordinator and commit
/// consumer together and owns their lifecycle.
///
/// Events submitted before `start` are queued and processed once it runs.
pub struct Engine {
    cfg: EngineConfig,
    health: Arc<HealthMetrics>,
    accumulators: AccumulatorSet,
    state: Arc<RwLock<DashboardState>>,
    volume: Arc<VolumeGauge>,
    display: Arc<dyn DisplaySink>,
    errors: Arc<dyn ErrorSink>,
    groups: Vec<Arc<dyn MetricGroup>>,
    ingest_tx: Mutex<Option<mpsc::UnboundedSender<Ingest>>>,
    ingest_rx: Mutex<Option<mpsc::UnboundedReceiver<Ingest>>>,
    tasks: Mutex<Option<Tasks>>,
    cancel: CancellationToken,
}

impl Engine {
    /// Builds every accumulator and series. Fails when the window does not
    /// fit the configured history sizes.
    pub fn new(cfg: EngineConfig, health: Arc<HealthMetrics>) -> Result<Self, EngineError> {
        let accumulators = AccumulatorSet::from_descriptors(
            METRICS,
            cfg.chart_history_size,
            cfg.speed_history_size,
            cfg.moving_average_window,
        )?;
        let series = SeriesStore::from_descriptors(
            METRICS,
            cfg.chart_history_size,
            cfg.speed_history_size,
        );
        let groups = groups::block_groups(&accumulators);
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();

        health.window_size.set(cfg.moving_average_window as f64);

        Ok(Self {
            errors: Arc::new(LogErrorSink::new(Arc::clone(&health))),
            cfg,
            health,
            accumulators,
            state: Arc::new(RwLock::new(DashboardState::new(series))),
            volume: Arc::new(VolumeGauge::new()),
            display: Arc::new(NullDisplay),
            groups,
            ingest_tx: Mutex::new(Some(ingest_tx)),
            ingest_rx: Mutex::new(Some(ingest_rx)),
            tasks: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Forwards every committed batch to `sink`.
    pub fn with_display_sink(mut self, sink: Arc<dyn DisplaySink>) -> Self {
        self.display = sink;
        self
    }

    /// Routes caught computation errors to `sink` instead of the log.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.errors = sink;
        self
    }

    /// Replaces the block computation groups.
    pub fn with_groups(mut self, groups: Vec<Arc<dyn MetricGroup>>) -> Self {
        self.groups = groups;
        self
    }

    pub fn accumulators(&self) -> &AccumulatorSet {
        &self.accumulators
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Spawns the dispatcher, rate loop and commit consumer.
    ///
    /// Nothing is spawned or consumed when setup fails.
    pub fn start(&self) -> Result<()> {
        let rate_computation =
            RateComputation::from_group(&self.accumulators.for_group(GroupKind::Network))
                .context("building network rate computation")?;

        let Some(ingest_rx) = self.ingest_rx.lock().take() else {
            bail!("engine start called more than once");
        };

        let (commit_tx, commit_rx) = mpsc::unbounded_channel();

        let consumer = tokio::spawn(run_commit_consumer(
            commit_rx,
            Arc::clone(&self.state),
            Arc::clone(&self.display),
            Arc::clone(&self.health),
        ));

        let pipeline = SampleIngestionPipeline::new(
            self.groups.clone(),
            self.cfg.workers,
            Arc::clone(&self.errors),
            Arc::clone(&self.health),
        );
        let rollback = RollbackCoordinator::new(commit_tx.clone(), Arc::clone(&self.health));
        let dispatcher = tokio::spawn(pipeline.run(ingest_rx, commit_tx.clone(), rollback));

        let rate = tokio::spawn(run_rate_loop(
            rate_computation,
            Arc::clone(&self.volume),
            self.cfg.rate_interval,
            commit_tx,
            self.cancel.clone(),
            Arc::clone(&self.health),
        ));

        *self.tasks.lock() = Some(Tasks {
            dispatcher,
            rate,
            consumer,
        });

        info!(
            window = self.cfg.moving_average_window,
            workers = self.cfg.workers,
            rate_interval = ?self.cfg.rate_interval,
            "engine started",
        );

        Ok(())
    }

    /// Stops the rate loop, drains queued samples and waits for every
    /// queued commit to be applied.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.ingest_tx.lock().take();

        let Some(tasks) = self.tasks.lock().take() else {
            return Ok(());
        };

        tasks.dispatcher.await.context("joining sample dispatcher")?;
        tasks.rate.await.context("joining rate loop")?;
        // Both producers are gone, so the consumer drains and exits.
        tasks.consumer.await.context("joining commit consumer")?;

        info!("engine stopped");

        Ok(())
    }

    fn ingest(&self, event: Ingest) -> bool {
        let guard = self.ingest_tx.lock();
        let Some(tx) = guard.as_ref() else {
            warn!("engine stopped, event dropped");
            return false;
        };

        if tx.send(event).is_err() {
            warn!("sample dispatcher gone, event dropped");
            return false;
        }
        true
    }

    /// Queues a block sample, stamped with the current time. `None` marks
    /// a cycle without a sample. Never blocks.
    pub fn submit_sample(&self, sample: Option<PerformanceSample>) -> bool {
        self.submit_sample_at(sample, now_ms())
    }

    /// Like [`submit_sample`](Self::submit_sample) with an explicit arrival
    /// time, for recorded events.
    pub fn submit_sample_at(&self, sample: Option<PerformanceSample>, received_at_ms: i64) -> bool {
        let ctx = SampleContext { received_at_ms };
        self.ingest(Ingest::Sample(sample.map(|s| (s, ctx))))
    }

    pub fn on_queue_status(&self, status: QueueStatus) -> bool {
        self.ingest(Ingest::QueueStatus(status))
    }

    /// Publishes the node's cumulative byte counters for the rate loop.
    pub fn on_volume_changed(&self, uploaded_bytes: u64, downloaded_bytes: u64) {
        self.volume.set(uploaded_bytes, downloaded_bytes);
    }

    /// Queues a rollback to `height`, ordered after every sample already
    /// submitted.
    pub fn on_block_popped(&self, height: u64) -> bool {
        self.ingest(Ingest::BlockPopped(height))
    }

    /// Changes the moving average window of every accumulator.
    pub fn set_window_size(&self, window_size: usize) -> Result<(), EngineError> {
        self.accumulators.set_window_size(window_size)?;
        self.health.window_size.set(window_size as f64);
        info!(window_size, "moving average window changed");
        Ok(())
    }

    /// Waits until everything submitted so far has been committed.
    ///
    /// Returns false if the engine stopped first.
    pub async fn flush(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if !self.ingest(Ingest::Flush(tx)) {
            return false;
        }
        let flushed = rx.await.is_ok();
        debug!(flushed, "flush completed");
        flushed
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        let (last_height, commits, series, readouts) = {
            let st = self.state.read();
            let readouts = st
                .readouts
                .iter()
                .map(|(name, r)| ((*name).to_string(), r.clone()))
                .collect();
            (st.last_height, st.commits, st.series.snapshot(), readouts)
        };

        DashboardSnapshot {
            generated_at: chrono::Utc::now().to_rfc3339(),
            last_height,
            window_size: self.accumulators.window_size(),
            commits,
            series,
            accumulators: self.accumulators.snapshot(),
            readouts,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serial_test::serial;

    use super::*;
    use crate::metrics::descriptor::{
        ALL_TRANSACTIONS_PER_BLOCK, CACHE_FULLNESS, PUSH_TIME, UPLOAD_SPEED,
    };

    fn engine(cfg: EngineConfig) -> Engine {
        let health = Arc::new(HealthMetrics::new().expect("metrics"));
        Engine::new(cfg, health).expect("engine")
    }

    fn sample(height: u64) -> PerformanceSample {
        PerformanceSample {
            height,
            total_time_ms: 100,
            all_transaction_count: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_rejects_oversized_window() {
        let health = Arc::new(HealthMetrics::new().expect("metrics"));
        let cfg = EngineConfig {
            moving_average_window: 2000,
            ..Default::default()
        };
        let err = Engine::new(cfg, health).err().expect("window too large");
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_failed_start_leaves_engine_startable() {
        let mut engine = engine(EngineConfig::default());
        let full = engine.accumulators.clone();
        engine.accumulators =
            AccumulatorSet::from_descriptors(&[], 10, 10, 1).expect("empty set");

        assert!(engine.submit_sample(Some(sample(1))));
        assert!(engine.start().is_err());
        assert!(engine.tasks.lock().is_none());
        assert!(engine.ingest_rx.lock().is_some());

        engine.accumulators = full;
        engine.start().expect("start after fixing setup");
        assert!(engine.flush().await);
        assert_eq!(engine.snapshot().last_height, Some(1));

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let engine = engine(EngineConfig::default());
        engine.start().expect("first start");
        assert!(engine.start().is_err());
        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_samples_commit_and_snapshot() {
        let engine = engine(EngineConfig::default());
        engine.start().expect("start");

        for h in 1..=3 {
            assert!(engine.submit_sample(Some(sample(h))));
        }
        engine.submit_sample(None);
        engine.on_queue_status(QueueStatus {
            verified_size: 1,
            total_size: 2,
            ..Default::default()
        });
        assert!(engine.flush().await);

        let snap = engine.snapshot();
        assert_eq!(snap.last_height, Some(3));
        assert_eq!(snap.window_size, 100);
        assert_eq!(snap.series[PUSH_TIME].len(), 3);
        assert_eq!(snap.accumulators[ALL_TRANSACTIONS_PER_BLOCK].average, 3.0);
        assert!(snap.readouts.contains_key(CACHE_FULLNESS));
        assert_eq!(engine.health().samples_received.get(), 3.0);
        assert_eq!(engine.health().samples_missing.get(), 1.0);

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_rollback_ordered_after_samples() {
        let engine = engine(EngineConfig::default());
        engine.start().expect("start");

        for h in 10..=13 {
            engine.submit_sample(Some(sample(h)));
        }
        engine.on_block_popped(11);
        engine.submit_sample(Some(sample(12)));
        assert!(engine.flush().await);

        let snap = engine.snapshot();
        let xs: Vec<f64> = snap.series[PUSH_TIME].iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![10.0, 11.0, 12.0]);
        assert_eq!(snap.last_height, Some(12));

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_set_window_size() {
        let engine = engine(EngineConfig::default());
        assert!(engine.set_window_size(0).is_err());
        assert!(engine.set_window_size(1001).is_err());
        assert_eq!(engine.snapshot().window_size, 100);

        engine.set_window_size(10).expect("valid window");
        assert_eq!(engine.snapshot().window_size, 10);
        assert_eq!(engine.health().window_size.get(), 10.0);
    }

    #[tokio::test]
    #[serial]
    async fn test_volume_feeds_rate_loop() {
        let engine = engine(EngineConfig {
            rate_interval: Duration::from_millis(5),
            ..Default::default()
        });
        engine.start().expect("start");

        engine.on_volume_changed(0, 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.on_volume_changed(50_000, 10_000);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let snap = engine.snapshot();
            if snap.series.get(UPLOAD_SPEED).is_some_and(|s| !s.is_empty()) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no rate points");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_rejected() {
        let engine = engine(EngineConfig::default());
        engine.start().expect("start");
        engine.stop().await.expect("stop");

        assert!(!engine.submit_sample(Some(sample(1))));
        assert!(!engine.flush().await);
    }
}
