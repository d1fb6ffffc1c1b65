use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "chainmeter";

/// Prometheus metrics describing the engine itself.
///
/// All metrics use the "chainmeter" namespace and live in a private
/// registry, so several engines (as in tests) never collide.
pub struct HealthMetrics {
    registry: Registry,

    /// Performance samples accepted for processing.
    pub samples_received: Counter,
    /// Cycles that produced no sample.
    pub samples_missing: Counter,
    /// Commit batches applied by the consumer.
    pub commits_applied: Counter,
    /// Failed group computations by group.
    pub computation_errors: CounterVec,
    /// Rollback events handled.
    pub rollbacks: Counter,
    /// Series points removed by rollbacks.
    pub points_truncated: Counter,
    /// Rate ticks that produced a rate sample.
    pub rate_ticks: Counter,
    /// Queue status updates handled.
    pub queue_updates: Counter,
    /// Time to apply one commit batch under the write lock.
    pub commit_duration: Histogram,
    /// Time spent in one group's computation.
    pub group_compute_duration: HistogramVec,
    /// Height of the latest committed sample.
    pub current_height: Gauge,
    /// Current moving average window.
    pub window_size: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let samples_received = Counter::with_opts(
            Opts::new(
                "samples_received_total",
                "Total performance samples accepted for processing.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_missing = Counter::with_opts(
            Opts::new(
                "samples_missing_total",
                "Total cycles that delivered no performance sample.",
            )
            .namespace(NAMESPACE),
        )?;
        let commits_applied = Counter::with_opts(
            Opts::new("commits_applied_total", "Total commit batches applied.")
                .namespace(NAMESPACE),
        )?;
        let computation_errors = CounterVec::new(
            Opts::new(
                "computation_errors_total",
                "Total failed metric group computations by group.",
            )
            .namespace(NAMESPACE),
            &["group"],
        )?;
        let rollbacks = Counter::with_opts(
            Opts::new("rollbacks_total", "Total block rollback events handled.")
                .namespace(NAMESPACE),
        )?;
        let points_truncated = Counter::with_opts(
            Opts::new(
                "points_truncated_total",
                "Total series points removed by rollbacks.",
            )
            .namespace(NAMESPACE),
        )?;
        let rate_ticks = Counter::with_opts(
            Opts::new(
                "rate_ticks_total",
                "Total network rate ticks that produced a rate sample.",
            )
            .namespace(NAMESPACE),
        )?;
        let queue_updates = Counter::with_opts(
            Opts::new(
                "queue_updates_total",
                "Total download queue status updates handled.",
            )
            .namespace(NAMESPACE),
        )?;
        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "commit_duration_seconds",
                "Time to apply one commit batch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01]),
        )?;
        let group_compute_duration = HistogramVec::new(
            HistogramOpts::new(
                "group_compute_duration_seconds",
                "Time to compute one metric group for a sample.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005]),
            &["group"],
        )?;
        let current_height = Gauge::with_opts(
            Opts::new("current_height", "Height of the latest committed sample.")
                .namespace(NAMESPACE),
        )?;
        let window_size = Gauge::with_opts(
            Opts::new("window_size", "Current moving average window.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(samples_received.clone()))?;
        registry.register(Box::new(samples_missing.clone()))?;
        registry.register(Box::new(commits_applied.clone()))?;
        registry.register(Box::new(computation_errors.clone()))?;
        registry.register(Box::new(rollbacks.clone()))?;
        registry.register(Box::new(points_truncated.clone()))?;
        registry.register(Box::new(rate_ticks.clone()))?;
        registry.register(Box::new(queue_updates.clone()))?;
        registry.register(Box::new(commit_duration.clone()))?;
        registry.register(Box::new(group_compute_duration.clone()))?;
        registry.register(Box::new(current_height.clone()))?;
        registry.register(Box::new(window_size.clone()))?;

        Ok(Self {
            registry,
            samples_received,
            samples_missing,
            commits_applied,
            computation_errors,
            rollbacks,
            points_truncated,
            rate_ticks,
            queue_updates,
            commit_duration,
            group_compute_duration,
            current_height,
            window_size,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registers_all() {
        let health = HealthMetrics::new().expect("metrics register");
        health.samples_received.inc();
        health
            .computation_errors
            .with_label_values(&["timing"])
            .inc();

        let text = health.encode().expect("encode");
        assert!(text.contains("chainmeter_samples_received_total 1"));
        assert!(text.contains("chainmeter_computation_errors_total{group=\"timing\"} 1"));
        assert!(text.contains("chainmeter_commit_duration_seconds"));
    }

    #[test]
    fn test_instances_do_not_share_registry() {
        let a = HealthMetrics::new().expect("first");
        let b = HealthMetrics::new().expect("second");
        a.rollbacks.inc();
        assert_eq!(a.rollbacks.get(), 1.0);
        assert_eq!(b.rollbacks.get(), 0.0);
    }
}
