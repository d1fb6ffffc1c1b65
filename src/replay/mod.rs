//! Feeds recorded node events from an NDJSON file into an engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::sample::{PerformanceSample, QueueStatus};
use crate::engine::Engine;

/// One recorded node event, tagged by `"event"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    Performance {
        #[serde(flatten)]
        sample: PerformanceSample,
        /// Recorded arrival time; replay time is used when absent.
        #[serde(default)]
        received_at_ms: Option<i64>,
    },
    MissingSample,
    QueueStatus(QueueStatus),
    Volume {
        uploaded_bytes: u64,
        downloaded_bytes: u64,
    },
    BlockPopped {
        height: u64,
    },
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("engine stopped after {applied} events")]
    EngineStopped { applied: u64 },
}

/// Counts of a finished replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: u64,
    pub skipped: u64,
}

/// Parses one line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line_no: usize, line: &str) -> Result<Option<NodeEvent>, ReplayError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|source| ReplayError::Parse {
            line: line_no,
            source,
        })
}

/// Hands one event to the engine. Returns false once the engine stopped
/// accepting events.
pub fn apply(engine: &Engine, event: NodeEvent) -> bool {
    match event {
        NodeEvent::Performance {
            sample,
            received_at_ms: Some(at),
        } => engine.submit_sample_at(Some(sample), at),
        NodeEvent::Performance {
            sample,
            received_at_ms: None,
        } => engine.submit_sample(Some(sample)),
        NodeEvent::MissingSample => engine.submit_sample(None),
        NodeEvent::QueueStatus(status) => engine.on_queue_status(status),
        NodeEvent::Volume {
            uploaded_bytes,
            downloaded_bytes,
        } => {
            engine.on_volume_changed(uploaded_bytes, downloaded_bytes);
            true
        }
        NodeEvent::BlockPopped { height } => engine.on_block_popped(height),
    }
}

/// Replays `path` into `engine`, waiting `pace` between events, then waits
/// for everything replayed to be committed.
///
/// Malformed lines are logged and skipped. Cancelling stops the replay
/// early with the counts so far.
pub async fn replay(
    engine: &Engine,
    path: &Path,
    pace: Duration,
    cancel: &CancellationToken,
) -> Result<ReplayStats, ReplayError> {
    let file = File::open(path).await.map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut lines = BufReader::new(file).lines();
    let mut stats = ReplayStats::default();
    let mut line_no = 0;

    info!(path = %path.display(), "replaying node events");

    loop {
        let line = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(applied = stats.applied, "replay cancelled");
                return Ok(stats);
            }

            line = lines.next_line() => line.map_err(|source| ReplayError::Io {
                path: path.to_path_buf(),
                source,
            })?,
        };

        let Some(line) = line else {
            break;
        };
        line_no += 1;

        let event = match parse_line(line_no, &line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "skipping malformed event");
                stats.skipped += 1;
                continue;
            }
        };

        if !apply(engine, event) {
            return Err(ReplayError::EngineStopped {
                applied: stats.applied,
            });
        }
        stats.applied += 1;

        if !pace.is_zero() {
            tokio::time::sleep(pace).await;
        }
    }

    if !engine.flush().await {
        return Err(ReplayError::EngineStopped {
            applied: stats.applied,
        });
    }

    debug!(lines = line_no, "replay file exhausted");
    info!(
        applied = stats.applied,
        skipped = stats.skipped,
        "replay finished",
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_performance_event() {
        let line = r#"{"event":"performance","height":7,"total_time_ms":120,"received_at_ms":1500}"#;
        let event = parse_line(1, line).expect("valid").expect("event");

        let NodeEvent::Performance {
            sample,
            received_at_ms,
        } = event
        else {
            panic!("expected performance event");
        };
        assert_eq!(sample.height, 7);
        assert_eq!(sample.total_time_ms, 120);
        assert_eq!(sample.commit_time_ms, 0);
        assert_eq!(received_at_ms, Some(1500));
    }

    #[test]
    fn test_parse_other_events() {
        assert_eq!(
            parse_line(1, r#"{"event":"block_popped","height":11}"#).expect("valid"),
            Some(NodeEvent::BlockPopped { height: 11 })
        );
        assert_eq!(
            parse_line(1, r#"{"event":"missing_sample"}"#).expect("valid"),
            Some(NodeEvent::MissingSample)
        );
        assert_eq!(
            parse_line(
                1,
                r#"{"event":"volume","uploaded_bytes":10,"downloaded_bytes":20}"#
            )
            .expect("valid"),
            Some(NodeEvent::Volume {
                uploaded_bytes: 10,
                downloaded_bytes: 20
            })
        );

        let status = parse_line(
            1,
            r#"{"event":"queue_status","verified_size":3,"total_size":4}"#,
        )
        .expect("valid");
        assert_eq!(
            status,
            Some(NodeEvent::QueueStatus(QueueStatus {
                verified_size: 3,
                total_size: 4,
                ..Default::default()
            }))
        );
    }

    #[test]
    fn test_blank_and_comment_lines_skipped() {
        assert_eq!(parse_line(1, "").expect("blank"), None);
        assert_eq!(parse_line(2, "   ").expect("blank"), None);
        assert_eq!(parse_line(3, "# recorded 2024-05-01").expect("comment"), None);
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let err = parse_line(42, r#"{"event":"teleport"}"#).expect_err("unknown event");
        assert!(matches!(err, ReplayError::Parse { line: 42, .. }));
        assert!(err.to_string().starts_with("line 42:"));

        assert!(parse_line(1, "not json").is_err());
    }
}
