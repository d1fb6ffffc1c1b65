//! chainmeter aggregates per-block performance samples and network counters
//! from a blockchain node into bounded, smoothed chart series.

pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod metrics;
pub mod replay;
