use serde::Serialize;

use super::format;

/// The computation group that owns a metric's accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Timing,
    Throughput,
    Transactions,
    Network,
    Queue,
}

impl GroupKind {
    /// Returns the label used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timing => "timing",
            Self::Throughput => "throughput",
            Self::Transactions => "transactions",
            Self::Network => "network",
            Self::Queue => "queue",
        }
    }
}

/// What a series' `x` coordinate measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum XKey {
    /// Block height. Truncated on rollback.
    Height,
    /// Epoch milliseconds. Unaffected by rollback.
    Timestamp,
}

/// How a metric's readout is scaled and labelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formatter {
    /// `"{value} ms - max: {max} ms"`
    Millis,
    /// `"{value} ms - max: {max} ms | {share}%"`, `share` of `total` (the
    /// push time). The gauge shows the share out of 100.
    MillisShare,
    /// `"{value:.2} - max: {max:.2}"`
    Ratio,
    ByteRate,
    Bytes,
    /// Average payload fullness in percent; `min` and `max` are percentages,
    /// `current` is the latest payload size in bytes out of `total`.
    Fullness,
    /// `current` used bytes out of `total` capacity, in megabytes.
    CacheFullness,
    /// `"{current} / {total} | {pct}%"`
    Fraction,
    Count,
}

/// Values a readout is rendered from. Which fields matter depends on the
/// [`Formatter`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LabelArgs {
    pub value: f64,
    pub max: f64,
    pub min: f64,
    /// Denominator for percentages.
    pub total: f64,
    /// Latest raw amount, when the readout shows one.
    pub current: Option<f64>,
}

impl LabelArgs {
    pub fn new(value: f64, max: f64) -> Self {
        Self {
            value,
            max,
            ..Default::default()
        }
    }

    pub fn part_of(current: f64, total: f64) -> Self {
        Self {
            total,
            current: Some(current),
            ..Default::default()
        }
    }
}

impl Formatter {
    /// Returns the gauge `(value, max)` shown for `args`.
    pub fn gauge(self, args: &LabelArgs) -> (f64, f64) {
        match self {
            Self::Millis => (format::whole(args.value) as f64, format::whole(args.max) as f64),
            Self::MillisShare => (format::share(args.value, args.total) as f64, 100.0),
            Self::Fullness => (args.value, 100.0),
            Self::CacheFullness | Self::Fraction => {
                let current = args.current.unwrap_or(0.0);
                (format::percent_floor(current, args.total) as f64, 100.0)
            }
            Self::Ratio | Self::ByteRate | Self::Bytes | Self::Count => (args.value, args.max),
        }
    }

    /// Renders the label for `args`.
    pub fn render(self, args: &LabelArgs) -> String {
        match self {
            Self::Millis => format::millis(args.value, args.max),
            Self::MillisShare => format::millis_share(
                args.value,
                args.max,
                format::share(args.value, args.total),
            ),
            Self::Ratio => format::ratio(args.value, args.max),
            Self::ByteRate => format::data_rate(args.value),
            Self::Bytes => format::data_size(args.value),
            Self::Fullness => match args.current {
                Some(current) => format::fullness(&format::Fullness {
                    average_pct: args.value,
                    current_pct: format::share(current, args.total),
                    payload_size: current as u64,
                    max_payload_size: args.total as u64,
                    min_pct: format::whole(args.min),
                    max_pct: format::whole(args.max),
                }),
                None => format::fullness_summary(args.value, args.min, args.max),
            },
            Self::CacheFullness => {
                let current = args.current.unwrap_or(0.0);
                format::cache_fullness(
                    current as u64,
                    args.total as u64,
                    format::percent_floor(current, args.total),
                )
            }
            Self::Fraction => {
                let current = args.current.unwrap_or(0.0);
                format::fraction(
                    current as u64,
                    args.total as u64,
                    format::percent_floor(current, args.total),
                )
            }
            Self::Count => format!("{}", format::whole(args.value)),
        }
    }
}

/// Static description of one tracked metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricDescriptor {
    pub name: &'static str,
    pub group: GroupKind,
    pub x_key: XKey,
    /// `None` for metrics that never produce a readout.
    pub formatter: Option<Formatter>,
    /// Owns a windowed accumulator.
    pub accumulated: bool,
    /// Owns a chart series.
    pub charted: bool,
}

const fn timing(name: &'static str, formatter: Formatter) -> MetricDescriptor {
    MetricDescriptor {
        name,
        group: GroupKind::Timing,
        x_key: XKey::Height,
        formatter: Some(formatter),
        accumulated: true,
        charted: true,
    }
}

const fn per_block(name: &'static str, group: GroupKind) -> MetricDescriptor {
    MetricDescriptor {
        name,
        group,
        x_key: XKey::Height,
        formatter: Some(Formatter::Ratio),
        accumulated: true,
        charted: true,
    }
}

const fn hidden(name: &'static str, group: GroupKind) -> MetricDescriptor {
    MetricDescriptor {
        name,
        group,
        x_key: XKey::Height,
        formatter: None,
        accumulated: true,
        charted: false,
    }
}

const fn network(
    name: &'static str,
    formatter: Formatter,
    accumulated: bool,
) -> MetricDescriptor {
    MetricDescriptor {
        name,
        group: GroupKind::Network,
        x_key: XKey::Timestamp,
        formatter: Some(formatter),
        accumulated,
        charted: true,
    }
}

const fn queue(name: &'static str, formatter: Formatter) -> MetricDescriptor {
    MetricDescriptor {
        name,
        group: GroupKind::Queue,
        x_key: XKey::Timestamp,
        formatter: Some(formatter),
        accumulated: false,
        charted: false,
    }
}

pub const PUSH_TIME: &str = "push_time";
pub const VALIDATION_TIME: &str = "validation_time";
pub const TX_LOOP_TIME: &str = "tx_loop_time";
pub const HOUSEKEEPING_TIME: &str = "housekeeping_time";
pub const TX_APPLY_TIME: &str = "tx_apply_time";
pub const AT_TIME: &str = "at_time";
pub const SUBSCRIPTION_TIME: &str = "subscription_time";
pub const BLOCK_APPLY_TIME: &str = "block_apply_time";
pub const COMMIT_TIME: &str = "commit_time";
pub const MISC_TIME: &str = "misc_time";
pub const PAYLOAD_SIZE: &str = "payload_size";
pub const PAYLOAD_FULLNESS: &str = "payload_fullness";

pub const BLOCKS_PER_SECOND: &str = "blocks_per_second";
pub const ALL_TRANSACTIONS_PER_SECOND: &str = "all_transactions_per_second";
pub const SYSTEM_TRANSACTIONS_PER_SECOND: &str = "system_transactions_per_second";
pub const AT_COUNT_PER_BLOCK: &str = "at_count_per_block";
pub const BLOCK_ARRIVAL: &str = "block_arrival";
pub const WINDOW_TRANSACTIONS: &str = "window_transactions";
pub const WINDOW_SYSTEM_TRANSACTIONS: &str = "window_system_transactions";

pub const ALL_TRANSACTIONS_PER_BLOCK: &str = "all_transactions_per_block";
pub const SYSTEM_TRANSACTIONS_PER_BLOCK: &str = "system_transactions_per_block";

pub const UPLOAD_SPEED: &str = "upload_speed";
pub const DOWNLOAD_SPEED: &str = "download_speed";
pub const UPLOAD_VOLUME: &str = "upload_volume";
pub const DOWNLOAD_VOLUME: &str = "download_volume";

pub const QUEUE_VERIFIED: &str = "queue_verified";
pub const QUEUE_UNVERIFIED: &str = "queue_unverified";
pub const CACHE_FULLNESS: &str = "cache_fullness";

/// Every metric the dashboard tracks.
pub const METRICS: &[MetricDescriptor] = &[
    timing(PUSH_TIME, Formatter::Millis),
    timing(VALIDATION_TIME, Formatter::MillisShare),
    timing(TX_LOOP_TIME, Formatter::MillisShare),
    timing(HOUSEKEEPING_TIME, Formatter::MillisShare),
    timing(TX_APPLY_TIME, Formatter::MillisShare),
    timing(AT_TIME, Formatter::MillisShare),
    timing(SUBSCRIPTION_TIME, Formatter::MillisShare),
    timing(BLOCK_APPLY_TIME, Formatter::MillisShare),
    timing(COMMIT_TIME, Formatter::MillisShare),
    timing(MISC_TIME, Formatter::MillisShare),
    hidden(PAYLOAD_SIZE, GroupKind::Timing),
    MetricDescriptor {
        name: PAYLOAD_FULLNESS,
        group: GroupKind::Timing,
        x_key: XKey::Height,
        formatter: Some(Formatter::Fullness),
        accumulated: false,
        charted: true,
    },
    per_block(BLOCKS_PER_SECOND, GroupKind::Throughput),
    per_block(ALL_TRANSACTIONS_PER_SECOND, GroupKind::Throughput),
    per_block(SYSTEM_TRANSACTIONS_PER_SECOND, GroupKind::Throughput),
    per_block(AT_COUNT_PER_BLOCK, GroupKind::Throughput),
    hidden(BLOCK_ARRIVAL, GroupKind::Throughput),
    hidden(WINDOW_TRANSACTIONS, GroupKind::Throughput),
    hidden(WINDOW_SYSTEM_TRANSACTIONS, GroupKind::Throughput),
    per_block(ALL_TRANSACTIONS_PER_BLOCK, GroupKind::Transactions),
    per_block(SYSTEM_TRANSACTIONS_PER_BLOCK, GroupKind::Transactions),
    network(UPLOAD_SPEED, Formatter::ByteRate, true),
    network(DOWNLOAD_SPEED, Formatter::ByteRate, true),
    network(UPLOAD_VOLUME, Formatter::Bytes, false),
    network(DOWNLOAD_VOLUME, Formatter::Bytes, false),
    queue(QUEUE_VERIFIED, Formatter::Fraction),
    queue(QUEUE_UNVERIFIED, Formatter::Count),
    queue(CACHE_FULLNESS, Formatter::CacheFullness),
];

/// Looks up a descriptor by metric name.
pub fn find(name: &str) -> Option<&'static MetricDescriptor> {
    METRICS.iter().find(|d| d.name == name)
}

/// Returns the descriptors owned by `group`.
pub fn for_group(group: GroupKind) -> impl Iterator<Item = &'static MetricDescriptor> {
    METRICS.iter().filter(move |d| d.group == group)
}
