use serde::{Deserialize, Serialize};

/// Per-block performance statistics reported by the node after it pushes a
/// block. All durations are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSample {
    pub height: u64,
    pub total_time_ms: u64,
    pub validation_time_ms: u64,
    pub tx_loop_time_ms: u64,
    pub housekeeping_time_ms: u64,
    pub tx_apply_time_ms: u64,
    pub at_time_ms: u64,
    pub subscription_time_ms: u64,
    pub block_apply_time_ms: u64,
    pub commit_time_ms: u64,
    pub misc_time_ms: u64,
    pub payload_size: u64,
    pub max_payload_size: u64,
    pub at_count: u64,
    pub all_transaction_count: u64,
    pub system_transaction_count: u64,
}

/// Download queue state, emitted when the queue changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStatus {
    pub unverified_size: u64,
    pub verified_size: u64,
    pub total_size: u64,
    pub cache_fullness_bytes: u64,
    pub cache_capacity_bytes: u64,
}

/// Cumulative network byte counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    /// Epoch milliseconds.
    pub observed_at_ms: i64,
}

/// Data attached to a sample by the engine when it is received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleContext {
    /// Wall-clock arrival time, epoch milliseconds. Block rate spans are
    /// measured between arrivals.
    pub received_at_ms: i64,
}
