use crate::metrics::descriptor::{self, CACHE_FULLNESS, QUEUE_UNVERIFIED, QUEUE_VERIFIED};
use crate::metrics::{GroupKind, LabelArgs, Update};

use super::commit::{CommitBatch, CommitKind};
use super::sample::QueueStatus;

/// Builds the download queue readouts for one status update.
pub fn queue_status_batch(status: &QueueStatus) -> CommitBatch {
    let updates = descriptor::for_group(GroupKind::Queue)
        .filter_map(|desc| {
            let args = match desc.name {
                QUEUE_VERIFIED => {
                    LabelArgs::part_of(status.verified_size as f64, status.total_size as f64)
                }
                QUEUE_UNVERIFIED => LabelArgs::new(
                    status.unverified_size as f64,
                    status.total_size as f64,
                ),
                CACHE_FULLNESS => LabelArgs::part_of(
                    status.cache_fullness_bytes as f64,
                    status.cache_capacity_bytes as f64,
                ),
                _ => return None,
            };
            Some(Update::readout(desc, args))
        })
        .collect();

    CommitBatch {
        kind: CommitKind::QueueStatus,
        updates,
    }
}
