//! Bounded, numerically stable metric state: accumulators, chart series and
//! the catalogue describing every tracked metric.

pub mod accumulator;
pub mod descriptor;
pub mod format;
pub mod series;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::EngineError;

pub use accumulator::{AccumulatorSnapshot, WindowedAccumulator};
pub use descriptor::{Formatter, GroupKind, LabelArgs, MetricDescriptor, XKey, METRICS};
pub use series::{Point, Series, SeriesStore};

/// Display-sink view of one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readout {
    pub name: &'static str,
    pub value: f64,
    /// Upper bound of the display scale.
    pub max: f64,
    pub label: String,
}

/// One pending change produced by a computation.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Point { series: &'static str, x: f64, y: f64 },
    Readout(Readout),
}

impl Update {
    pub fn point(series: &'static str, x: f64, y: f64) -> Self {
        Self::Point { series, x, y }
    }

    /// Builds a readout scaled and labelled by the metric's formatter.
    pub fn readout(descriptor: &MetricDescriptor, args: LabelArgs) -> Self {
        Self::Readout(Readout::render(descriptor, &args))
    }
}

impl Readout {
    pub fn render(descriptor: &MetricDescriptor, args: &LabelArgs) -> Self {
        let ((value, max), label) = match descriptor.formatter {
            Some(f) => (f.gauge(args), f.render(args)),
            None => ((args.value, args.max), String::new()),
        };
        Self {
            name: descriptor.name,
            value,
            max,
            label,
        }
    }
}

/// Rebuilds the readout of every height-keyed chart from its series alone:
/// the latest point, with the series' min and max as bounds. Empty series
/// read as 0.
///
/// Timing shares are taken of the latest push time point.
pub fn readouts_from_series(store: &SeriesStore) -> Vec<Readout> {
    let latest = |name: &str| {
        store
            .series(name)
            .and_then(Series::last)
            .map_or(0.0, |p| p.y)
    };
    let push_time = latest(descriptor::PUSH_TIME);

    METRICS
        .iter()
        .filter(|d| d.charted && d.x_key == XKey::Height && d.formatter.is_some())
        .filter_map(|d| {
            let series = store.series(d.name)?;
            let (min, max) = series
                .points()
                .map(|p| p.y)
                .fold(None, |acc: Option<(f64, f64)>, y| match acc {
                    Some((lo, hi)) => Some((lo.min(y), hi.max(y))),
                    None => Some((y, y)),
                })
                .unwrap_or((0.0, 0.0));

            let args = LabelArgs {
                value: latest(d.name),
                max,
                min,
                total: push_time,
                current: None,
            };
            Some(Readout::render(d, &args))
        })
        .collect()
}

/// All accumulators, one per accumulated descriptor.
///
/// Every accumulator is owned by exactly one [`GroupKind`]; groups receive a
/// [`GroupAccumulators`] view holding only their own.
#[derive(Debug, Clone)]
pub struct AccumulatorSet {
    accumulators: BTreeMap<&'static str, (GroupKind, Arc<WindowedAccumulator>)>,
}

impl AccumulatorSet {
    /// Builds accumulators for every accumulated descriptor. Height-keyed
    /// metrics retain `chart_capacity` points, timestamp-keyed ones
    /// `speed_capacity`.
    pub fn from_descriptors(
        descriptors: &[MetricDescriptor],
        chart_capacity: usize,
        speed_capacity: usize,
        window_size: usize,
    ) -> Result<Self, EngineError> {
        let mut accumulators = BTreeMap::new();

        for d in descriptors.iter().filter(|d| d.accumulated) {
            let capacity = match d.x_key {
                XKey::Height => chart_capacity,
                XKey::Timestamp => speed_capacity,
            };
            let acc = WindowedAccumulator::new(capacity, window_size)?;
            accumulators.insert(d.name, (d.group, Arc::new(acc)));
        }

        Ok(Self { accumulators })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<WindowedAccumulator>> {
        self.accumulators.get(name).map(|(_, acc)| acc)
    }

    /// Returns the accumulators owned by `group`.
    pub fn for_group(&self, group: GroupKind) -> GroupAccumulators {
        let accumulators = self
            .accumulators
            .iter()
            .filter(|(_, (g, _))| *g == group)
            .map(|(name, (_, acc))| (*name, Arc::clone(acc)))
            .collect();

        GroupAccumulators {
            group,
            accumulators,
        }
    }

    /// Applies `window_size` to every accumulator.
    ///
    /// The request is validated against every capacity before any
    /// accumulator changes, so a failure leaves all of them untouched.
    pub fn set_window_size(&self, window_size: usize) -> Result<(), EngineError> {
        let min_capacity = self
            .accumulators
            .values()
            .map(|(_, acc)| acc.capacity())
            .min()
            .unwrap_or(usize::MAX);

        if window_size == 0 || window_size > min_capacity {
            return Err(EngineError::WindowSize {
                requested: window_size,
                capacity: min_capacity,
            });
        }

        for (_, acc) in self.accumulators.values() {
            acc.set_window_size(window_size)?;
        }

        Ok(())
    }

    /// Returns the current window size, shared by all accumulators.
    pub fn window_size(&self) -> usize {
        self.accumulators
            .values()
            .next()
            .map(|(_, acc)| acc.window_size())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, AccumulatorSnapshot> {
        self.accumulators
            .iter()
            .map(|(name, (_, acc))| ((*name).to_string(), acc.snapshot()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }
}

/// The accumulators owned by one group.
#[derive(Debug, Clone)]
pub struct GroupAccumulators {
    group: GroupKind,
    accumulators: BTreeMap<&'static str, Arc<WindowedAccumulator>>,
}

impl GroupAccumulators {
    /// Looks up one of the group's accumulators. A missing name is a
    /// computation error for this group.
    pub fn get(&self, name: &'static str) -> Result<&WindowedAccumulator, EngineError> {
        self.accumulators
            .get(name)
            .map(Arc::as_ref)
            .ok_or_else(|| self.missing(name))
    }

    /// Like [`get`](Self::get), for callers that hold the accumulator
    /// beyond the group's lifetime.
    pub fn get_shared(&self, name: &'static str) -> Result<Arc<WindowedAccumulator>, EngineError> {
        self.accumulators
            .get(name)
            .cloned()
            .ok_or_else(|| self.missing(name))
    }

    fn missing(&self, name: &str) -> EngineError {
        EngineError::Computation {
            group: self.group.as_str(),
            reason: format!("no accumulator named {name}"),
        }
    }

    pub fn group(&self) -> GroupKind {
        self.group
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.accumulators.keys().copied()
    }
}
