//! Evaluation outcomes and the reduced feedback handed to searches.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Error kind the evaluation pool reports when a trial exceeds its timeout.
pub const TIMEOUT_KIND: &str = "Timeout";
/// Error kind reported when a worker process dies mid-evaluation.
pub const WORKER_CRASHED_KIND: &str = "WorkerCrashed";
/// Error kind reported when an evaluator panics inside a worker.
pub const PANIC_KIND: &str = "Panic";

/// Successful evaluation payload: a JSON object with at least a numeric `loss`.
///
/// Every other field (duration, auxiliary metrics, `variance`) is carried
/// untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Outcome(Map<String, Value>);

impl Outcome {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with_loss(loss: f64) -> Self {
        Self::new().with("loss", loss)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn loss(&self) -> Option<f64> {
        self.0.get("loss").and_then(Value::as_f64)
    }

    pub fn variance(&self) -> Option<f64> {
        self.0.get("variance").and_then(Value::as_f64)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl TryFrom<Value> for Outcome {
    type Error = Value;

    /// Accepts only JSON objects; hands the value back otherwise.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}

/// A failed evaluation as reported by an evaluator or by the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalFailure {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub trace: String,
}

impl EvalFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }
}

impl fmt::Display for EvalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Which half of [`EvalResult`] an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    Ok,
    Error,
}

/// Tagged result of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EvalResult {
    Ok {
        outcome: Outcome,
    },
    Error {
        kind: String,
        message: String,
        #[serde(default)]
        trace: String,
    },
}

impl EvalResult {
    pub fn ok(outcome: Outcome) -> Self {
        Self::Ok { outcome }
    }

    pub fn state(&self) -> ResultState {
        match self {
            Self::Ok { .. } => ResultState::Ok,
            Self::Error { .. } => ResultState::Error,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn loss(&self) -> Option<f64> {
        match self {
            Self::Ok { outcome } => outcome.loss(),
            Self::Error { .. } => None,
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            Self::Ok { outcome } => Some(outcome),
            Self::Error { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<&str> {
        match self {
            Self::Ok { .. } => None,
            Self::Error { kind, .. } => Some(kind),
        }
    }

    /// Reduce to what a search needs to know.
    ///
    /// Returns `None` for an ok result without a numeric loss.
    pub fn feedback(&self) -> Option<Feedback> {
        match self {
            Self::Ok { outcome } => outcome.loss().map(|loss| Feedback::Ok {
                loss,
                variance: outcome.variance(),
            }),
            Self::Error { .. } => Some(Feedback::Failed),
        }
    }
}

impl From<EvalFailure> for EvalResult {
    fn from(failure: EvalFailure) -> Self {
        Self::Error {
            kind: failure.kind,
            message: failure.message,
            trace: failure.trace,
        }
    }
}

/// The reduced result a search is informed of.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Feedback {
    Ok { loss: f64, variance: Option<f64> },
    Failed,
}
