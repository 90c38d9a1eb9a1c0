use thiserror::Error;

use crate::suggestion::{Eid, Tid};

/// Main error type for the GlowTune system
#[derive(Error, Debug)]
pub enum GtError {
    #[error("Tape error: {0}")]
    Tape(#[from] TapeError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors reading or writing the trial tape
#[derive(Error, Debug)]
pub enum TapeError {
    #[error("Tape {path} is empty, expected a metadata record")]
    MissingMetadata { path: String },

    #[error("Tape {path} line {line} is corrupted: {message}")]
    Corrupted {
        path: String,
        line: usize,
        message: String,
    },

    #[error("Tape {path} line {line}: expected a trial entry, found metadata")]
    UnexpectedMetadata { path: String, line: usize },

    #[error("Tape not found: {path}")]
    NotFound { path: String },
}

/// Errors raised by `State` bookkeeping
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Trial {tid} is not live (never suggested or already submitted)")]
    NotLive { tid: Tid },

    #[error("Trial {tid} returned an ok result without a numeric loss")]
    MissingLoss { tid: Tid },

    #[error("Search returned tid {tid} which is already live")]
    DuplicateTid { tid: Tid },
}

/// Fatal disagreement between a recorded tape and a fresh search
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error(
        "Replay mismatch at tape entry {position}: recorded tid {expected_tid} with {expected}, \
         search produced tid {actual_tid} with {actual}"
    )]
    Mismatch {
        position: usize,
        expected_tid: Tid,
        expected: String,
        actual_tid: Tid,
        actual: String,
    },

    #[error("Replay mismatch at tape entry {position}: recorded tid {expected_tid} but search returned nothing")]
    SearchStopped { position: usize, expected_tid: Tid },

    #[error("Replay failed at tape entry {position}: {source}")]
    Submit {
        position: usize,
        #[source]
        source: TrialError,
    },
}

/// Evaluation failures that must not be absorbed as trial results
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("Uncaught evaluation error {kind} for {suggestion}: {message}")]
    Uncaught {
        kind: String,
        message: String,
        trace: String,
        suggestion: String,
    },

    #[error("Evaluation {eid} was abandoned before completing")]
    Abandoned { eid: Eid },

    #[error("Worker failed to start: {message}")]
    WorkerStartup { message: String },

    #[error("Evaluation pool is shut down")]
    PoolClosed,
}

/// Run-level failures
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Run directory {path} already holds a run")]
    AlreadyPrepared { path: String },

    #[error("Search is idle but not done: {message}")]
    Stalled { message: String },
}

/// Result type alias for GlowTune operations
pub type GtResult<T> = Result<T, GtError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::GtError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::GtError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::GtError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ReplayError::Mismatch {
            position: 7,
            expected_tid: 3,
            expected: "{\"x\":1}".to_string(),
            actual_tid: 3,
            actual: "{\"x\":2}".to_string(),
        };

        let text = error.to_string();
        assert!(text.contains("entry 7"));
        assert!(text.contains("{\"x\":1}"));
        assert!(text.contains("{\"x\":2}"));
    }

    #[test]
    fn test_error_conversion() {
        let trial_error = TrialError::NotLive { tid: 4 };
        let gt_error: GtError = trial_error.into();

        match gt_error {
            GtError::Trial(TrialError::NotLive { tid }) => assert_eq!(tid, 4),
            _ => panic!("Expected Trial error"),
        }
    }

    #[test]
    fn test_macros() {
        let validation_err = validation_error!("Invalid value: {}", 42);
        assert!(matches!(validation_err, GtError::Validation(ref m) if m == "Invalid value: 42"));
        let _internal_err = internal_error!("Something went wrong");
        let _config_err = config_error!("Missing required field: {}", "space");
    }
}
