use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::export::health::HealthMetrics;
use crate::metrics::descriptor::{
    self, DOWNLOAD_SPEED, DOWNLOAD_VOLUME, UPLOAD_SPEED, UPLOAD_VOLUME,
};
use crate::metrics::{GroupAccumulators, GroupKind, LabelArgs, Update, WindowedAccumulator};

use super::commit::{CommitBatch, CommitJob, CommitKind};
use super::now_ms;
use super::sample::VolumeSnapshot;

/// Latest cumulative byte counters published by the network layer.
#[derive(Debug, Default)]
pub struct VolumeGauge {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl VolumeGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, uploaded_bytes: u64, downloaded_bytes: u64) {
        self.uploaded.store(uploaded_bytes, Ordering::Relaxed);
        self.downloaded.store(downloaded_bytes, Ordering::Relaxed);
    }

    /// Reads the counters, stamped with `observed_at_ms`.
    pub fn snapshot(&self, observed_at_ms: i64) -> VolumeSnapshot {
        VolumeSnapshot {
            uploaded_bytes: self.uploaded.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded.load(Ordering::Relaxed),
            observed_at_ms,
        }
    }
}

/// Result of a tick that measured a rate.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSample {
    /// Instantaneous rates in bytes per second.
    pub upload_bps: f64,
    pub download_bps: f64,
    pub batch: CommitBatch,
}

/// Derives transfer rates from successive cumulative counter snapshots.
pub struct RateComputation {
    last: Option<VolumeSnapshot>,
    upload: Arc<WindowedAccumulator>,
    download: Arc<WindowedAccumulator>,
}

impl RateComputation {
    pub fn new(upload: Arc<WindowedAccumulator>, download: Arc<WindowedAccumulator>) -> Self {
        Self {
            last: None,
            upload,
            download,
        }
    }

    /// Builds a computation over the network group's speed accumulators.
    pub fn from_group(accumulators: &GroupAccumulators) -> Result<Self, EngineError> {
        Ok(Self::new(
            accumulators.get_shared(UPLOAD_SPEED)?,
            accumulators.get_shared(DOWNLOAD_SPEED)?,
        ))
    }

    /// Advances the computation to `current`.
    ///
    /// The first snapshot, and any snapshot not strictly later than the
    /// previous one, only becomes the new baseline.
    pub fn tick(&mut self, current: VolumeSnapshot) -> Option<RateSample> {
        let last = self.last.replace(current)?;

        let elapsed_ms = current.observed_at_ms - last.observed_at_ms;
        if elapsed_ms <= 0 {
            return None;
        }

        let per_second = |now: u64, before: u64| {
            // A counter reset reads as no traffic.
            now.saturating_sub(before) as f64 * 1000.0 / elapsed_ms as f64
        };
        let upload_bps = per_second(current.uploaded_bytes, last.uploaded_bytes);
        let download_bps = per_second(current.downloaded_bytes, last.downloaded_bytes);

        self.upload.insert(upload_bps);
        self.download.insert(download_bps);

        let upload_avg = self.upload.average();
        let download_avg = self.download.average();
        let t = current.observed_at_ms as f64;

        let mut updates = Vec::with_capacity(8);
        if current.uploaded_bytes > 0 || current.downloaded_bytes > 0 {
            updates.push(Update::point(UPLOAD_SPEED, t, upload_avg));
            updates.push(Update::point(DOWNLOAD_SPEED, t, download_avg));
            updates.push(Update::point(UPLOAD_VOLUME, t, current.uploaded_bytes as f64));
            updates.push(Update::point(
                DOWNLOAD_VOLUME,
                t,
                current.downloaded_bytes as f64,
            ));
        }

        for desc in descriptor::for_group(GroupKind::Network) {
            let args = match desc.name {
                UPLOAD_SPEED => LabelArgs::new(upload_avg, self.upload.max()),
                DOWNLOAD_SPEED => LabelArgs::new(download_avg, self.download.max()),
                UPLOAD_VOLUME => volume_args(current.uploaded_bytes),
                DOWNLOAD_VOLUME => volume_args(current.downloaded_bytes),
                _ => continue,
            };
            updates.push(Update::readout(desc, args));
        }

        Some(RateSample {
            upload_bps,
            download_bps,
            batch: CommitBatch {
                kind: CommitKind::Network {
                    timestamp_ms: current.observed_at_ms,
                },
                updates,
            },
        })
    }
}

fn volume_args(bytes: u64) -> LabelArgs {
    let bytes = bytes as f64;
    LabelArgs::new(bytes, bytes)
}

/// Samples `gauge` every `period` and posts rate batches until cancelled.
pub async fn run_rate_loop(
    mut rate: RateComputation,
    gauge: Arc<VolumeGauge>,
    period: Duration,
    commits: mpsc::UnboundedSender<CommitJob>,
    cancel: CancellationToken,
    health: Arc<HealthMetrics>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("rate loop stopped");
                return;
            }

            _ = ticker.tick() => {
                let Some(sample) = rate.tick(gauge.snapshot(now_ms())) else {
                    continue;
                };

                health.rate_ticks.inc();
                if commits.send(CommitJob::Apply(sample.batch)).is_err() {
                    warn!("commit queue closed, stopping rate loop");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::metrics::Readout;

    fn computation(window: usize) -> RateComputation {
        RateComputation::new(
            Arc::new(WindowedAccumulator::new(100, window).expect("valid")),
            Arc::new(WindowedAccumulator::new(100, window).expect("valid")),
        )
    }

    fn snap(up: u64, down: u64, at: i64) -> VolumeSnapshot {
        VolumeSnapshot {
            uploaded_bytes: up,
            downloaded_bytes: down,
            observed_at_ms: at,
        }
    }

    fn readout<'a>(batch: &'a CommitBatch, name: &str) -> Option<&'a Readout> {
        batch.updates.iter().find_map(|u| match u {
            Update::Readout(r) if r.name == name => Some(r),
            _ => None,
        })
    }

    #[test]
    fn test_first_tick_sets_baseline() {
        let mut rate = computation(10);
        assert!(rate.tick(snap(0, 0, 1000)).is_none());
        assert!(rate.tick(snap(1000, 0, 1500)).is_some());
    }

    #[test]
    fn test_upload_rate_scenario() {
        let mut rate = computation(10);
        rate.tick(snap(0, 0, 10_000));
        let sample = rate.tick(snap(1000, 0, 10_500)).expect("rate sample");

        assert!((sample.upload_bps - 2000.0).abs() < 1e-9);
        assert_eq!(sample.download_bps, 0.0);
        assert_eq!(
            sample.batch.kind,
            CommitKind::Network {
                timestamp_ms: 10_500
            }
        );
        assert_eq!(
            readout(&sample.batch, UPLOAD_SPEED).map(|r| r.label.as_str()),
            Some("1.95 KB/s")
        );
        assert_eq!(
            readout(&sample.batch, UPLOAD_VOLUME).map(|r| r.label.as_str()),
            Some("1000.00 B")
        );
    }

    #[test]
    fn test_non_positive_elapsed_rebaselines() {
        let mut rate = computation(10);
        rate.tick(snap(0, 0, 1000));
        assert!(rate.tick(snap(500, 0, 1000)).is_none());
        assert!(rate.tick(snap(600, 0, 900)).is_none());

        // Baseline is now (600, t=900).
        let sample = rate.tick(snap(700, 0, 1000)).expect("rate sample");
        assert!((sample.upload_bps - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_counter_reset_reads_zero() {
        let mut rate = computation(10);
        rate.tick(snap(5000, 5000, 0));
        let sample = rate.tick(snap(10, 6000, 1000)).expect("rate sample");
        assert_eq!(sample.upload_bps, 0.0);
        assert!((sample.download_bps - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_points_only_after_traffic() {
        let mut rate = computation(10);
        rate.tick(snap(0, 0, 0));
        let idle = rate.tick(snap(0, 0, 100)).expect("rate sample");
        assert!(idle
            .batch
            .updates
            .iter()
            .all(|u| matches!(u, Update::Readout(_))));
        assert_eq!(idle.batch.updates.len(), 4);

        let busy = rate.tick(snap(0, 10, 200)).expect("rate sample");
        let points = busy
            .batch
            .updates
            .iter()
            .filter(|u| matches!(u, Update::Point { .. }))
            .count();
        assert_eq!(points, 4);
    }

    #[test]
    fn test_speed_is_windowed_average() {
        let mut rate = computation(2);
        rate.tick(snap(0, 0, 0));
        rate.tick(snap(100, 0, 1000));
        rate.tick(snap(400, 0, 2000));
        let sample = rate.tick(snap(1000, 0, 3000)).expect("rate sample");

        // Window holds 300 and 600 bytes/s.
        assert_eq!(
            readout(&sample.batch, UPLOAD_SPEED).map(|r| r.value),
            Some(450.0)
        );
        assert_eq!(
            readout(&sample.batch, UPLOAD_SPEED).map(|r| r.max),
            Some(450.0)
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_rate_loop_stops_on_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let gauge = Arc::new(VolumeGauge::new());
        let health = Arc::new(HealthMetrics::new().expect("metrics"));

        gauge.set(10, 10);
        let handle = tokio::spawn(run_rate_loop(
            computation(10),
            Arc::clone(&gauge),
            Duration::from_millis(5),
            tx,
            cancel.clone(),
            Arc::clone(&health),
        ));

        // First tick is only a baseline; the next ones produce batches.
        let job = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("tick within timeout");
        assert!(matches!(job, Some(CommitJob::Apply(_))));

        cancel.cancel();
        handle.await.expect("loop exits");
        assert!(health.rate_ticks.get() >= 1.0);
    }
}
