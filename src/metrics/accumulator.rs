use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::EngineError;

/// Number of insertions after which the running sum is rebuilt from the
/// raw history to bound floating-point drift.
const DRIFT_CORRECTION_PERIOD: u32 = 10_000;

/// Rolling average, sum, max and min over the last `window_size` values.
///
/// Keeps two capacity-bounded histories: the raw inserted values, and the
/// average computed after each insert (used for charting and for the
/// running max/min). The windowed sum uses Kahan summation.
///
/// All operations go through one internal lock; instances never reference
/// each other.
pub struct WindowedAccumulator {
    capacity: usize,
    state: Mutex<State>,
}

struct State {
    window_size: usize,
    raw: VecDeque<f64>,
    averages: VecDeque<f64>,
    sum: f64,
    compensation: f64,
    average: f64,
    max: f64,
    min: f64,
    inserts_since_rebuild: u32,
}

/// Point-in-time view of an accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccumulatorSnapshot {
    pub average: f64,
    pub max: f64,
    pub min: f64,
    pub sum: f64,
    pub raw_count: usize,
    pub window_size: usize,
}

impl WindowedAccumulator {
    /// Creates an accumulator retaining `capacity` points.
    pub fn new(capacity: usize, window_size: usize) -> Result<Self, EngineError> {
        if capacity == 0 {
            return Err(EngineError::Capacity);
        }
        validate_window(window_size, capacity)?;

        Ok(Self {
            capacity,
            state: Mutex::new(State::new(window_size, capacity)),
        })
    }

    /// Adds a value and updates the average and the averaged history.
    pub fn insert(&self, value: f64) {
        let mut st = self.state.lock();

        st.raw.push_back(value);
        st.kahan_add(value);
        if st.raw.len() > st.window_size {
            let leaving = st.raw[st.raw.len() - 1 - st.window_size];
            st.kahan_add(-leaving);
        }
        if st.raw.len() > self.capacity {
            st.raw.pop_front();
        }

        // Inputs are non-negative; a negative sum is float error.
        if st.sum < 0.0 {
            st.sum = 0.0;
            st.compensation = 0.0;
        }

        st.inserts_since_rebuild += 1;
        if st.inserts_since_rebuild >= DRIFT_CORRECTION_PERIOD {
            st.rebuild_sum();
            st.inserts_since_rebuild = 0;
        }

        st.average = st.sum / st.raw.len().min(st.window_size) as f64;
        let average = st.average;
        st.push_average(average, self.capacity);
    }

    /// Changes the window and recomputes the sum from retained raw values.
    ///
    /// The new average is visible immediately. An out-of-range request
    /// leaves the accumulator untouched.
    pub fn set_window_size(&self, window_size: usize) -> Result<(), EngineError> {
        validate_window(window_size, self.capacity)?;

        let mut st = self.state.lock();
        st.window_size = window_size;
        st.rebuild_sum();
        st.average = if st.raw.is_empty() {
            0.0
        } else {
            st.sum / st.raw.len().min(window_size) as f64
        };

        Ok(())
    }

    /// Returns the current moving average, floored at zero.
    pub fn average(&self) -> f64 {
        let st = self.state.lock();
        if st.averages.is_empty() {
            return 0.0;
        }
        st.average.max(0.0)
    }

    /// Returns the maximum of the retained averaged history.
    pub fn max(&self) -> f64 {
        self.state.lock().max.max(0.0)
    }

    /// Returns the minimum of the retained averaged history.
    pub fn min(&self) -> f64 {
        let st = self.state.lock();
        if st.averages.is_empty() {
            return 0.0;
        }
        st.min.max(0.0)
    }

    /// Returns the windowed sum.
    pub fn sum(&self) -> f64 {
        self.state.lock().sum.max(0.0)
    }

    /// Returns the raw value at `index`, where 0 is the oldest retained value.
    /// Out-of-range reads return 0.
    pub fn get(&self, index: usize) -> f64 {
        self.state.lock().raw.get(index).copied().unwrap_or(0.0)
    }

    /// Returns the most recently inserted raw value, or 0 when empty.
    pub fn last(&self) -> f64 {
        self.state.lock().raw.back().copied().unwrap_or(0.0)
    }

    /// Returns the number of retained raw values.
    pub fn size(&self) -> usize {
        self.state.lock().raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().raw.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window_size(&self) -> usize {
        self.state.lock().window_size
    }

    /// Returns a copy of the averaged history, oldest first.
    pub fn averages(&self) -> Vec<f64> {
        self.state.lock().averages.iter().copied().collect()
    }

    /// Drops all history, keeping capacity and window size.
    pub fn clear(&self) {
        let mut st = self.state.lock();
        let window_size = st.window_size;
        *st = State::new(window_size, self.capacity);
    }

    /// Returns all cached statistics read under a single lock.
    pub fn snapshot(&self) -> AccumulatorSnapshot {
        let st = self.state.lock();
        let empty = st.averages.is_empty();
        AccumulatorSnapshot {
            average: if empty { 0.0 } else { st.average.max(0.0) },
            max: st.max.max(0.0),
            min: if empty { 0.0 } else { st.min.max(0.0) },
            sum: st.sum.max(0.0),
            raw_count: st.raw.len(),
            window_size: st.window_size,
        }
    }
}

impl std::fmt::Debug for WindowedAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("WindowedAccumulator")
            .field("capacity", &self.capacity)
            .field("window_size", &st.window_size)
            .field("raw_count", &st.raw.len())
            .field("average", &st.average)
            .finish()
    }
}

impl State {
    fn new(window_size: usize, capacity: usize) -> Self {
        Self {
            window_size,
            raw: VecDeque::with_capacity(capacity),
            averages: VecDeque::with_capacity(capacity),
            sum: 0.0,
            compensation: 0.0,
            average: 0.0,
            max: 0.0,
            min: f64::MAX,
            inserts_since_rebuild: 0,
        }
    }

    fn kahan_add(&mut self, input: f64) {
        let y = input - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    /// Recomputes the sum over the newest `window_size` raw values.
    fn rebuild_sum(&mut self) {
        self.sum = 0.0;
        self.compensation = 0.0;
        let window_size = self.window_size;
        for i in 0..self.raw.len().min(window_size) {
            let value = self.raw[self.raw.len() - 1 - i];
            self.kahan_add(value);
        }
        if self.sum < 0.0 {
            self.sum = 0.0;
            self.compensation = 0.0;
        }
    }

    fn push_average(&mut self, value: f64, capacity: usize) {
        let removed = if self.averages.len() == capacity {
            self.averages.pop_front()
        } else {
            None
        };
        self.averages.push_back(value);

        self.max = self.max.max(value);
        self.min = self.min.min(value);

        // O(capacity) rescan, only when the evicted entry held an extreme.
        if let Some(removed) = removed {
            if removed >= self.max {
                self.max = self.averages.iter().copied().fold(0.0, f64::max);
            }
            if removed <= self.min {
                self.min = self.averages.iter().copied().fold(f64::MAX, f64::min);
            }
        }
    }
}

fn validate_window(window_size: usize, capacity: usize) -> Result<(), EngineError> {
    if window_size == 0 || window_size > capacity {
        return Err(EngineError::WindowSize {
            requested: window_size,
            capacity,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn naive_mean(values: &[f64], window: usize) -> f64 {
        let n = values.len().min(window);
        if n == 0 {
            return 0.0;
        }
        values[values.len() - n..].iter().sum::<f64>() / n as f64
    }

    #[test]
    fn test_new_rejects_zero_capacity() {
        let err = WindowedAccumulator::new(0, 1).expect_err("zero capacity");
        assert_eq!(err, EngineError::Capacity);
    }

    #[test]
    fn test_new_rejects_window_larger_than_capacity() {
        let err = WindowedAccumulator::new(10, 11).expect_err("window too large");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_window_three_scenario() {
        let acc = WindowedAccumulator::new(1000, 3).expect("valid");
        let mut seen = Vec::new();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            acc.insert(v);
            seen.push(acc.average());
        }
        assert_eq!(seen, vec![1.0, 1.5, 2.0, 3.0, 4.0]);
        assert_eq!(acc.max(), 4.0);
        assert_eq!(acc.min(), 1.0);
        assert_eq!(acc.sum(), 12.0);
        assert_eq!(acc.size(), 5);
    }

    #[test]
    fn test_average_matches_naive_recomputation() {
        let acc = WindowedAccumulator::new(64, 7).expect("valid");
        let mut values = Vec::new();
        for i in 0..500u32 {
            // Deterministic mix of magnitudes.
            let v = f64::from((i * 7919) % 1013) * 0.37 + f64::from(i % 3) * 1e6;
            values.push(v);
            acc.insert(v);
            let expected = naive_mean(&values, 7);
            let got = acc.average();
            assert!(
                (got - expected).abs() <= EPS * expected.max(1.0),
                "i={i} got={got} expected={expected}"
            );
        }
    }

    #[test]
    fn test_window_equal_to_capacity_keeps_sliding() {
        let acc = WindowedAccumulator::new(4, 4).expect("valid");
        for v in [10.0, 10.0, 10.0, 10.0, 2.0, 2.0, 2.0, 2.0] {
            acc.insert(v);
        }
        assert!((acc.average() - 2.0).abs() < EPS);
        assert!((acc.sum() - 8.0).abs() < EPS);
    }

    #[test]
    fn test_max_recomputed_after_eviction() {
        let acc = WindowedAccumulator::new(3, 1).expect("valid");
        acc.insert(9.0);
        acc.insert(1.0);
        acc.insert(2.0);
        assert_eq!(acc.max(), 9.0);

        // Evicts the 9.0 average.
        acc.insert(3.0);
        assert_eq!(acc.averages(), vec![1.0, 2.0, 3.0]);
        assert_eq!(acc.max(), 3.0);

        // Evicts 1.0, the min holder.
        acc.insert(5.0);
        assert_eq!(acc.min(), 2.0);
    }

    #[test]
    fn test_max_tracks_averaged_buffer() {
        let acc = WindowedAccumulator::new(16, 4).expect("valid");
        for i in 0..200u32 {
            acc.insert(f64::from((i * 37) % 101));
            let expected = acc.averages().into_iter().fold(0.0, f64::max);
            assert_eq!(acc.max(), expected, "i={i}");
        }
    }

    #[test]
    fn test_set_window_size_rejects_out_of_range() {
        let acc = WindowedAccumulator::new(10, 5).expect("valid");
        acc.insert(4.0);

        assert!(acc.set_window_size(0).is_err());
        assert!(acc.set_window_size(11).is_err());
        assert_eq!(acc.window_size(), 5);
        assert_eq!(acc.average(), 4.0);
    }

    #[test]
    fn test_set_window_size_applies_immediately() {
        let acc = WindowedAccumulator::new(10, 5).expect("valid");
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            acc.insert(v);
        }
        assert_eq!(acc.average(), 3.0);

        acc.set_window_size(2).expect("valid window");
        assert_eq!(acc.average(), 4.5);
        assert_eq!(acc.sum(), 9.0);

        acc.set_window_size(10).expect("valid window");
        assert_eq!(acc.average(), 3.0);
    }

    #[test]
    fn test_raw_accessors() {
        let acc = WindowedAccumulator::new(3, 2).expect("valid");
        assert!(acc.is_empty());
        assert_eq!(acc.last(), 0.0);
        assert_eq!(acc.get(0), 0.0);

        for v in [1.0, 2.0, 3.0, 4.0] {
            acc.insert(v);
        }
        assert_eq!(acc.size(), 3);
        assert_eq!(acc.get(0), 2.0);
        assert_eq!(acc.get(2), 4.0);
        assert_eq!(acc.get(3), 0.0);
        assert_eq!(acc.last(), 4.0);
    }

    #[test]
    fn test_values_floored_at_zero() {
        let acc = WindowedAccumulator::new(4, 2).expect("valid");
        acc.insert(-5.0);
        assert_eq!(acc.sum(), 0.0);
        assert_eq!(acc.average(), 0.0);
        assert_eq!(acc.max(), 0.0);
        assert_eq!(acc.min(), 0.0);
    }

    #[test]
    fn test_drift_correction_period_keeps_sum_exact() {
        let acc = WindowedAccumulator::new(100, 10).expect("valid");
        for i in 0..(DRIFT_CORRECTION_PERIOD * 2 + 5) {
            acc.insert(0.1 + f64::from(i % 10) * 1e-3);
        }
        let expected: f64 = (0..10)
            .map(|i| {
                let idx = DRIFT_CORRECTION_PERIOD * 2 + 5 - 10 + i;
                0.1 + f64::from(idx % 10) * 1e-3
            })
            .sum();
        assert!((acc.sum() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_clear_resets_state() {
        let acc = WindowedAccumulator::new(8, 3).expect("valid");
        acc.insert(7.0);
        acc.clear();

        let snap = acc.snapshot();
        assert_eq!(snap.raw_count, 0);
        assert_eq!(snap.average, 0.0);
        assert_eq!(snap.max, 0.0);
        assert_eq!(snap.min, 0.0);
        assert_eq!(snap.window_size, 3);
    }

    #[test]
    fn test_concurrent_inserts() {
        use std::sync::Arc;
        use std::thread;

        let acc = Arc::new(WindowedAccumulator::new(1000, 100).expect("valid"));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let acc = Arc::clone(&acc);
            handles.push(thread::spawn(move || {
                for _ in 0..250 {
                    acc.insert(2.0);
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }

        assert_eq!(acc.size(), 1000);
        assert!((acc.average() - 2.0).abs() < EPS);
    }
}
