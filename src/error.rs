use thiserror::Error;

/// Errors raised by the aggregation engine.
///
/// Only `WindowSize` and `Capacity` ever reach a caller. `Computation`
/// is reported to an [`ErrorSink`] by the pipeline and never propagated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid window size {requested}: must be between 1 and {capacity}")]
    WindowSize { requested: usize, capacity: usize },

    #[error("invalid accumulator capacity: must be positive")]
    Capacity,

    #[error("{group} computation failed: {reason}")]
    Computation { group: &'static str, reason: String },
}

impl EngineError {
    /// Returns true for errors caused by an invalid operator request.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::WindowSize { .. } | Self::Capacity)
    }
}

/// Receives errors that are caught inside the engine instead of propagated.
pub trait ErrorSink: Send + Sync {
    fn report(&self, err: &EngineError);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_message() {
        let err = EngineError::WindowSize {
            requested: 0,
            capacity: 1000,
        };
        assert_eq!(
            err.to_string(),
            "invalid window size 0: must be between 1 and 1000"
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn test_computation_is_not_configuration() {
        let err = EngineError::Computation {
            group: "timing",
            reason: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "timing computation failed: boom");
        assert!(!err.is_configuration());
    }
}
