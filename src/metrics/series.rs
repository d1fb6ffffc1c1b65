use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use super::descriptor::{MetricDescriptor, XKey};

/// A single chart point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Bounded sequence of points in non-decreasing `x` order.
#[derive(Debug, Clone)]
pub struct Series {
    capacity: usize,
    points: VecDeque<Point>,
}

impl Series {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            points: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a point, or replaces the tail `y` when `x` equals the last `x`.
    ///
    /// Returns false when `x` is below the last stored `x`; such a point is
    /// dropped.
    pub fn insert(&mut self, x: f64, y: f64) -> bool {
        if let Some(last) = self.points.back_mut() {
            if x < last.x {
                return false;
            }
            if x == last.x {
                last.y = y;
                return true;
            }
        }

        self.points.push_back(Point { x, y });
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
        true
    }

    /// Removes trailing points with `x > max_x` and returns how many went.
    pub fn truncate(&mut self, max_x: f64) -> usize {
        let mut removed = 0;
        while let Some(last) = self.points.back() {
            if last.x <= max_x {
                break;
            }
            self.points.pop_back();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<Point> {
        self.points.back().copied()
    }

    pub fn points(&self) -> impl Iterator<Item = &Point> {
        self.points.iter()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    key: XKey,
    series: Series,
}

/// Named series, one per charted metric.
///
/// Owned by the commit consumer; every mutation happens under the
/// dashboard state's write lock.
#[derive(Debug, Clone, Default)]
pub struct SeriesStore {
    entries: BTreeMap<&'static str, Entry>,
}

impl SeriesStore {
    /// Builds one series per charted descriptor. Height-keyed metrics use
    /// `chart_capacity`; timestamp-keyed metrics use `speed_capacity`.
    pub fn from_descriptors(
        descriptors: &[MetricDescriptor],
        chart_capacity: usize,
        speed_capacity: usize,
    ) -> Self {
        let entries = descriptors
            .iter()
            .filter(|d| d.charted)
            .map(|d| {
                let capacity = match d.x_key {
                    XKey::Height => chart_capacity,
                    XKey::Timestamp => speed_capacity,
                };
                (
                    d.name,
                    Entry {
                        key: d.x_key,
                        series: Series::new(capacity),
                    },
                )
            })
            .collect();

        Self { entries }
    }

    /// Inserts into the named series. Unknown names are ignored and
    /// reported as false.
    pub fn insert(&mut self, name: &str, x: f64, y: f64) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) => entry.series.insert(x, y),
            None => false,
        }
    }

    /// Truncates every series keyed by `key` to `max_x`. Returns the total
    /// number of removed points.
    pub fn truncate_keyed(&mut self, key: XKey, max_x: f64) -> usize {
        self.entries
            .values_mut()
            .filter(|e| e.key == key)
            .map(|e| e.series.truncate(max_x))
            .sum()
    }

    pub fn series(&self, name: &str) -> Option<&Series> {
        self.entries.get(name).map(|e| &e.series)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies every series out as a name to points map.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<Point>> {
        self.entries
            .iter()
            .map(|(name, e)| ((*name).to_string(), e.series.points().copied().collect()))
            .collect()
    }
}
