use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::export::health::HealthMetrics;

use super::commit::CommitJob;

/// Turns rollback events into truncate jobs on the commit queue.
///
/// Only height-keyed series are truncated. Accumulators keep their
/// forward-only history, so moving averages can reflect orphaned blocks
/// until the window refills.
#[derive(Clone)]
pub struct RollbackCoordinator {
    commits: mpsc::UnboundedSender<CommitJob>,
    health: Arc<HealthMetrics>,
}

impl RollbackCoordinator {
    pub fn new(commits: mpsc::UnboundedSender<CommitJob>, health: Arc<HealthMetrics>) -> Self {
        Self { commits, health }
    }

    /// Queues truncation of every height-keyed series to `height`.
    ///
    /// Returns false when the commit queue has already shut down.
    pub fn on_block_popped(&self, height: u64) -> bool {
        info!(height, "block popped, truncating series");
        self.health.rollbacks.inc();

        if self.commits.send(CommitJob::Truncate { height }).is_err() {
            warn!(height, "commit queue closed, rollback not applied");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posts_truncate_job() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let health = Arc::new(HealthMetrics::new().expect("metrics"));
        let rollback = RollbackCoordinator::new(tx, Arc::clone(&health));

        assert!(rollback.on_block_popped(42));
        assert!(matches!(
            rx.try_recv(),
            Ok(CommitJob::Truncate { height: 42 })
        ));
        assert_eq!(health.rollbacks.get(), 1.0);
    }

    #[test]
    fn test_closed_queue_reports_false() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let health = Arc::new(HealthMetrics::new().expect("metrics"));
        let rollback = RollbackCoordinator::new(tx, health);

        assert!(!rollback.on_block_popped(1));
    }
}
