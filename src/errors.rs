use chrono::NaiveDate;
use thiserror::Error;

/// Errors raised by the regime pipeline.
///
/// Structural problems (configuration, input shape, not enough history) abort
/// before any output is produced. `ModelFitDegenerate` is only ever produced by
/// a single refit and is absorbed by the walk-forward engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    #[error("Insufficient history: need more than {required} periods before the first prediction, got {actual}")]
    InsufficientHistory { required: usize, actual: usize },

    #[error("Degenerate model fit at cutoff {cutoff}: {reason}")]
    ModelFitDegenerate { cutoff: usize, reason: String },

    #[error("Invalid configuration: {}", .0.join(", "))]
    FilterConfiguration(Vec<String>),

    #[error("Ambiguous state alignment at cutoff {cutoff}: best cost {best:.6}, runner-up {runner_up:.6}")]
    LabelAlignmentAmbiguity {
        cutoff: usize,
        best: f64,
        runner_up: f64,
    },

    #[error("Invalid feature frame: {0}")]
    Data(String),
}

impl StrategyError {
    pub fn data(msg: impl Into<String>) -> Self {
        StrategyError::Data(msg.into())
    }

    pub fn unordered(prev: NaiveDate, next: NaiveDate) -> Self {
        StrategyError::Data(format!(
            "dates must be strictly increasing ({} followed by {})",
            prev, next
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_lists_every_problem() {
        let err = StrategyError::FilterConfiguration(vec![
            "hysteresis_k must be >= 1".to_string(),
            "asset universe is empty".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("hysteresis_k"));
        assert!(msg.contains("universe"));
    }

    #[test]
    fn test_insufficient_history_message() {
        let err = StrategyError::InsufficientHistory { required: 1260, actual: 300 };
        assert!(err.to_string().contains("1260"));
        assert!(err.to_string().contains("300"));
    }
}
