use std::sync::Arc;

use crate::error::EngineError;
use crate::metrics::descriptor::{
    self, ALL_TRANSACTIONS_PER_SECOND, AT_COUNT_PER_BLOCK, AT_TIME, BLOCKS_PER_SECOND,
    BLOCK_APPLY_TIME, BLOCK_ARRIVAL, COMMIT_TIME, HOUSEKEEPING_TIME, MISC_TIME,
    PAYLOAD_FULLNESS, PAYLOAD_SIZE, PUSH_TIME, SUBSCRIPTION_TIME,
    SYSTEM_TRANSACTIONS_PER_SECOND, TX_APPLY_TIME, TX_LOOP_TIME, VALIDATION_TIME,
    WINDOW_SYSTEM_TRANSACTIONS, WINDOW_TRANSACTIONS,
};
use crate::metrics::format;
use crate::metrics::{
    AccumulatorSet, GroupAccumulators, GroupKind, LabelArgs, MetricDescriptor, Update,
    WindowedAccumulator,
};

use super::sample::{PerformanceSample, SampleContext};

/// One independent slice of the per-sample computation.
///
/// A group owns a disjoint set of accumulators. `compute` feeds the sample
/// into them and returns the series points and readouts to commit; it must
/// not touch any shared display state.
pub trait MetricGroup: Send + Sync {
    fn kind(&self) -> GroupKind;

    fn compute(
        &self,
        sample: &PerformanceSample,
        ctx: &SampleContext,
    ) -> Result<Vec<Update>, EngineError>;
}

/// Builds the three block groups over `accumulators`.
pub fn block_groups(accumulators: &AccumulatorSet) -> Vec<Arc<dyn MetricGroup>> {
    vec![
        Arc::new(TimingGroup::new(accumulators.for_group(GroupKind::Timing))),
        Arc::new(ThroughputGroup::new(
            accumulators.for_group(GroupKind::Throughput),
        )),
        Arc::new(TransactionGroup::new(
            accumulators.for_group(GroupKind::Transactions),
        )),
    ]
}

fn lookup(group: GroupKind, name: &'static str) -> Result<&'static MetricDescriptor, EngineError> {
    descriptor::find(name).ok_or_else(|| EngineError::Computation {
        group: group.as_str(),
        reason: format!("unknown metric {name}"),
    })
}

/// Pushes the averaged point and the ratio readout of one accumulator.
fn push_averaged(
    out: &mut Vec<Update>,
    desc: &MetricDescriptor,
    acc: &WindowedAccumulator,
    height: f64,
) {
    let average = acc.average();
    if desc.charted {
        out.push(Update::point(desc.name, height, average));
    }
    out.push(Update::readout(desc, LabelArgs::new(average, acc.max())));
}

// --- Timing ---

/// Push time components, in display order. Push time comes first and is
/// the denominator of every other component's share.
fn timing_components(s: &PerformanceSample) -> [(&'static str, u64); 10] {
    [
        (PUSH_TIME, s.total_time_ms),
        (VALIDATION_TIME, s.validation_time_ms),
        (TX_LOOP_TIME, s.tx_loop_time_ms),
        (HOUSEKEEPING_TIME, s.housekeeping_time_ms),
        (TX_APPLY_TIME, s.tx_apply_time_ms),
        (AT_TIME, s.at_time_ms),
        (SUBSCRIPTION_TIME, s.subscription_time_ms),
        (BLOCK_APPLY_TIME, s.block_apply_time_ms),
        (COMMIT_TIME, s.commit_time_ms),
        (MISC_TIME, s.misc_time_ms),
    ]
}

/// Block push timings and payload fullness.
pub struct TimingGroup {
    accumulators: GroupAccumulators,
}

impl TimingGroup {
    pub fn new(accumulators: GroupAccumulators) -> Self {
        Self { accumulators }
    }

    fn payload_fullness(&self, s: &PerformanceSample, height: f64) -> Result<Vec<Update>, EngineError> {
        let payload = self.accumulators.get(PAYLOAD_SIZE)?;
        payload.insert(s.payload_size as f64);

        let max_size = s.max_payload_size as f64;
        let pct = |bytes: f64| {
            if max_size > 0.0 {
                100.0 * bytes / max_size
            } else {
                0.0
            }
        };
        let average_pct = pct(payload.average());

        let desc = lookup(self.kind(), PAYLOAD_FULLNESS)?;
        let args = LabelArgs {
            value: average_pct,
            max: pct(payload.max()),
            min: pct(payload.min()),
            total: max_size,
            current: Some(s.payload_size as f64),
        };

        Ok(vec![
            Update::point(PAYLOAD_FULLNESS, height, average_pct),
            Update::readout(desc, args),
        ])
    }
}

impl MetricGroup for TimingGroup {
    fn kind(&self) -> GroupKind {
        GroupKind::Timing
    }

    fn compute(
        &self,
        sample: &PerformanceSample,
        _ctx: &SampleContext,
    ) -> Result<Vec<Update>, EngineError> {
        let height = sample.height as f64;
        let components = timing_components(sample);

        // Feed every accumulator before reading, so shares use this sample.
        let mut accs = Vec::with_capacity(components.len());
        for (name, value) in components {
            let acc = self.accumulators.get(name)?;
            acc.insert(value as f64);
            accs.push((name, acc));
        }

        let push_average = self.accumulators.get(PUSH_TIME)?.average();
        let push_average = format::whole(push_average) as f64;

        let mut out = Vec::with_capacity(accs.len() * 2 + 2);
        for (name, acc) in accs {
            let average = format::whole(acc.average()) as f64;
            let max = format::whole(acc.max()) as f64;
            out.push(Update::point(name, height, average));

            let args = LabelArgs {
                total: push_average,
                ..LabelArgs::new(average, max)
            };
            out.push(Update::readout(lookup(self.kind(), name)?, args));
        }

        out.extend(self.payload_fullness(sample, height)?);
        Ok(out)
    }
}

// --- Throughput ---

/// Block and transaction rates measured over block arrival times, plus ATs
/// per block.
pub struct ThroughputGroup {
    accumulators: GroupAccumulators,
}

impl ThroughputGroup {
    pub fn new(accumulators: GroupAccumulators) -> Self {
        Self { accumulators }
    }
}

impl MetricGroup for ThroughputGroup {
    fn kind(&self) -> GroupKind {
        GroupKind::Throughput
    }

    fn compute(
        &self,
        sample: &PerformanceSample,
        ctx: &SampleContext,
    ) -> Result<Vec<Update>, EngineError> {
        let kind = self.kind();
        let height = sample.height as f64;

        let arrival = self.accumulators.get(BLOCK_ARRIVAL)?;
        let window_tx = self.accumulators.get(WINDOW_TRANSACTIONS)?;
        let window_system_tx = self.accumulators.get(WINDOW_SYSTEM_TRANSACTIONS)?;

        arrival.insert(ctx.received_at_ms as f64);
        window_tx.insert(sample.all_transaction_count as f64);
        window_system_tx.insert(sample.system_transaction_count as f64);

        let size = arrival.size();
        let in_window = size.min(arrival.window_size());
        let span_ms = arrival.last() - arrival.get(size - in_window);

        let per_second = |count: f64| {
            if span_ms > 0.0 {
                count * 1000.0 / span_ms
            } else {
                0.0
            }
        };

        let rates = [
            (BLOCKS_PER_SECOND, per_second(in_window as f64)),
            (ALL_TRANSACTIONS_PER_SECOND, per_second(window_tx.sum())),
            (
                SYSTEM_TRANSACTIONS_PER_SECOND,
                per_second(window_system_tx.sum()),
            ),
            (AT_COUNT_PER_BLOCK, sample.at_count as f64),
        ];

        let mut out = Vec::with_capacity(rates.len() * 2);
        for (name, value) in rates {
            let acc = self.accumulators.get(name)?;
            acc.insert(value);
            push_averaged(&mut out, lookup(kind, name)?, acc, height);
        }

        Ok(out)
    }
}

// --- Transactions ---

/// All and system transactions per block.
pub struct TransactionGroup {
    accumulators: GroupAccumulators,
}

impl TransactionGroup {
    pub fn new(accumulators: GroupAccumulators) -> Self {
        Self { accumulators }
    }
}

impl MetricGroup for TransactionGroup {
    fn kind(&self) -> GroupKind {
        GroupKind::Transactions
    }

    fn compute(
        &self,
        sample: &PerformanceSample,
        _ctx: &SampleContext,
    ) -> Result<Vec<Update>, EngineError> {
        let height = sample.height as f64;
        let mut out = Vec::new();

        for desc in descriptor::for_group(GroupKind::Transactions) {
            let value = match desc.name {
                descriptor::ALL_TRANSACTIONS_PER_BLOCK => sample.all_transaction_count,
                descriptor::SYSTEM_TRANSACTIONS_PER_BLOCK => sample.system_transaction_count,
                other => {
                    return Err(EngineError::Computation {
                        group: self.kind().as_str(),
                        reason: format!("no sample field for {other}"),
                    })
                }
            };
            let acc = self.accumulators.get(desc.name)?;
            acc.insert(value as f64);
            push_averaged(&mut out, desc, acc, height);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Readout, METRICS};

    fn accumulators(window: usize) -> AccumulatorSet {
        AccumulatorSet::from_descriptors(METRICS, 100, 100, window).expect("valid set")
    }

    fn ctx(ms: i64) -> SampleContext {
        SampleContext { received_at_ms: ms }
    }

    fn readout<'a>(updates: &'a [Update], name: &str) -> &'a Readout {
        updates
            .iter()
            .find_map(|u| match u {
                Update::Readout(r) if r.name == name => Some(r),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no readout for {name}"))
    }

    fn point(updates: &[Update], name: &str) -> (f64, f64) {
        updates
            .iter()
            .find_map(|u| match u {
                Update::Point { series, x, y } if *series == name => Some((*x, *y)),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no point for {name}"))
    }

    #[test]
    fn test_timing_shares_of_push_time() {
        let set = accumulators(10);
        let group = TimingGroup::new(set.for_group(GroupKind::Timing));

        let sample = PerformanceSample {
            height: 100,
            total_time_ms: 200,
            validation_time_ms: 50,
            commit_time_ms: 20,
            payload_size: 1000,
            max_payload_size: 4000,
            ..Default::default()
        };
        let updates = group.compute(&sample, &ctx(0)).expect("timing computes");

        assert_eq!(point(&updates, PUSH_TIME), (100.0, 200.0));
        assert_eq!(readout(&updates, PUSH_TIME).label, "200 ms - max: 200 ms");

        let validation = readout(&updates, VALIDATION_TIME);
        assert_eq!(validation.value, 25.0);
        assert_eq!(validation.max, 100.0);
        assert_eq!(validation.label, "50 ms - max: 50 ms | 25%");
        assert_eq!(readout(&updates, COMMIT_TIME).value, 10.0);
        assert_eq!(readout(&updates, MISC_TIME).value, 0.0);

        assert_eq!(point(&updates, PAYLOAD_FULLNESS), (100.0, 25.0));
        assert_eq!(
            readout(&updates, PAYLOAD_FULLNESS).label,
            "025.00% - C: 025% (001000 / 4000 bytes) - min: 025% - max: 025%"
        );
    }

    #[test]
    fn test_timing_zero_push_and_payload_yield_zero() {
        let set = accumulators(10);
        let group = TimingGroup::new(set.for_group(GroupKind::Timing));

        let sample = PerformanceSample {
            height: 1,
            validation_time_ms: 5,
            payload_size: 10,
            ..Default::default()
        };
        let updates = group.compute(&sample, &ctx(0)).expect("timing computes");

        assert_eq!(readout(&updates, VALIDATION_TIME).value, 0.0);
        assert_eq!(readout(&updates, PAYLOAD_FULLNESS).value, 0.0);
    }

    #[test]
    fn test_throughput_rates_over_arrival_span() {
        let set = accumulators(100);
        let group = ThroughputGroup::new(set.for_group(GroupKind::Throughput));

        let mut last = Vec::new();
        for (i, at) in [0i64, 1000, 2000].into_iter().enumerate() {
            let sample = PerformanceSample {
                height: 10 + i as u64,
                all_transaction_count: 6,
                system_transaction_count: 2,
                at_count: 1,
                ..Default::default()
            };
            last = group.compute(&sample, &ctx(at)).expect("throughput computes");
        }

        // Third sample: 3 arrivals over 2000 ms, 18 transactions.
        let blocks = set.get(BLOCKS_PER_SECOND).expect("blocks acc");
        assert!((blocks.last() - 1.5).abs() < 1e-9);
        let tx = set.get(ALL_TRANSACTIONS_PER_SECOND).expect("tx acc");
        assert!((tx.last() - 9.0).abs() < 1e-9);
        let sys = set.get(SYSTEM_TRANSACTIONS_PER_SECOND).expect("sys acc");
        assert!((sys.last() - 3.0).abs() < 1e-9);

        assert_eq!(point(&last, AT_COUNT_PER_BLOCK), (12.0, 1.0));
        // First sample had a zero span.
        assert_eq!(blocks.get(0), 0.0);
    }

    #[test]
    fn test_throughput_span_limited_to_window() {
        let set = accumulators(2);
        let group = ThroughputGroup::new(set.for_group(GroupKind::Throughput));

        for (i, at) in [0i64, 10_000, 10_500].into_iter().enumerate() {
            let sample = PerformanceSample {
                height: i as u64,
                ..Default::default()
            };
            group.compute(&sample, &ctx(at)).expect("throughput computes");
        }

        let blocks = set.get(BLOCKS_PER_SECOND).expect("blocks acc");
        assert!((blocks.last() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_transactions_per_block() {
        let set = accumulators(2);
        let group = TransactionGroup::new(set.for_group(GroupKind::Transactions));

        for (h, n) in [(1u64, 4u64), (2, 8), (3, 2)] {
            let sample = PerformanceSample {
                height: h,
                all_transaction_count: n,
                system_transaction_count: 1,
                ..Default::default()
            };
            group.compute(&sample, &ctx(0)).expect("transactions compute");
        }

        let all = set
            .get(descriptor::ALL_TRANSACTIONS_PER_BLOCK)
            .expect("all tx acc");
        assert_eq!(all.average(), 5.0);
        assert_eq!(all.max(), 6.0);
    }

    #[test]
    fn test_block_groups_cover_three_kinds() {
        let set = accumulators(10);
        let kinds: Vec<_> = block_groups(&set).iter().map(|g| g.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                GroupKind::Timing,
                GroupKind::Throughput,
                GroupKind::Transactions
            ]
        );
    }
}
