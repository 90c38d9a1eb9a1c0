//! Serializable configuration for searches, evaluators and whole runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::GtResult;
use crate::result::{TIMEOUT_KIND, WORKER_CRASHED_KIND};
use crate::{config_error, validation_error};

/// Unique run identifier.
pub type RunId = Uuid;

/// Version of the tape / metadata layout written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// How a search is reconstructed. Must carry every input that influences its
/// suggestions, seeds included, so that a restart rebuilds it identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchConfig {
    /// Exhaustive sweep over the space's grid.
    Grid {
        space: serde_json::Value,
        /// Number of points for each continuous dimension.
        #[serde(default = "default_grid_steps")]
        grid_steps: usize,
    },
    /// Seeded independent sampling.
    Random {
        space: serde_json::Value,
        #[serde(default)]
        seed: u64,
        #[serde(default)]
        max_trials: Option<usize>,
    },
    /// Random exploration mixed with perturbation of the best point so far.
    Adaptive {
        space: serde_json::Value,
        #[serde(default)]
        seed: u64,
        #[serde(default = "default_exploration_weight")]
        exploration_weight: f64,
        #[serde(default = "default_n_startup")]
        n_startup: usize,
        #[serde(default)]
        max_trials: Option<usize>,
    },
}

fn default_grid_steps() -> usize {
    5
}

fn default_exploration_weight() -> f64 {
    0.3
}

fn default_n_startup() -> usize {
    10
}

impl SearchConfig {
    pub fn grid(space: serde_json::Value) -> Self {
        Self::Grid {
            space,
            grid_steps: default_grid_steps(),
        }
    }

    pub fn random(space: serde_json::Value, seed: u64) -> Self {
        Self::Random {
            space,
            seed,
            max_trials: None,
        }
    }

    pub fn adaptive(space: serde_json::Value, seed: u64) -> Self {
        Self::Adaptive {
            space,
            seed,
            exploration_weight: default_exploration_weight(),
            n_startup: default_n_startup(),
            max_trials: None,
        }
    }

    pub fn space(&self) -> &serde_json::Value {
        match self {
            Self::Grid { space, .. } | Self::Random { space, .. } | Self::Adaptive { space, .. } => {
                space
            }
        }
    }

    /// Short kind tag, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Grid { .. } => "grid",
            Self::Random { .. } => "random",
            Self::Adaptive { .. } => "adaptive",
        }
    }
}

/// How each worker process builds its evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl EvaluatorConfig {
    pub fn new(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

/// Which counter a [`StopConfig::Max`] policy watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCounter {
    /// Every submitted trial, including repeats of identical suggestions.
    Trials,
    /// Distinct evaluation ids that have a result.
    Evals,
}

/// Stopping policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopConfig {
    Max {
        count: usize,
        #[serde(default = "default_count_errors")]
        count_errors: bool,
        #[serde(default = "default_stop_counter", rename = "use")]
        counter: StopCounter,
    },
}

fn default_count_errors() -> bool {
    true
}

fn default_stop_counter() -> StopCounter {
    StopCounter::Trials
}

impl StopConfig {
    pub fn max(count: usize) -> Self {
        Self::Max {
            count,
            count_errors: default_count_errors(),
            counter: default_stop_counter(),
        }
    }

    pub fn max_with(count: usize, count_errors: bool, counter: StopCounter) -> Self {
        Self::Max {
            count,
            count_errors,
            counter,
        }
    }
}

/// Everything needed to reconstruct a run; persisted as tape metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    pub search: SearchConfig,
    pub evaluator: EvaluatorConfig,
    pub stop: StopConfig,

    /// Per-trial wall clock limit. `None` disables the timeout.
    #[serde(default)]
    pub trial_timeout_secs: Option<f64>,

    /// Evaluation error kinds recorded as trial failures. Any other kind
    /// aborts the run. The pool's own timeout kind is always caught.
    #[serde(default = "default_caught_kinds")]
    pub caught_error_kinds: Vec<String>,
}

fn default_caught_kinds() -> Vec<String> {
    vec![TIMEOUT_KIND.to_string(), WORKER_CRASHED_KIND.to_string()]
}

impl RunConfig {
    pub fn new(
        name: impl Into<String>,
        search: SearchConfig,
        evaluator: EvaluatorConfig,
        stop: StopConfig,
    ) -> Self {
        Self {
            name: name.into(),
            search,
            evaluator,
            stop,
            trial_timeout_secs: None,
            caught_error_kinds: default_caught_kinds(),
        }
    }

    pub fn with_trial_timeout(mut self, secs: f64) -> Self {
        self.trial_timeout_secs = Some(secs);
        self
    }

    pub fn with_caught_error_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.caught_error_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// `None` when unset or not representable; `validate` rejects the latter.
    pub fn trial_timeout(&self) -> Option<Duration> {
        self.trial_timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn validate(&self) -> GtResult<()> {
        if self.name.trim().is_empty() {
            return Err(validation_error!("run name must not be empty"));
        }
        if let Some(secs) = self.trial_timeout_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(validation_error!(
                    "trial_timeout_secs must be positive, got {secs}"
                ));
            }
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(validation_error!(
                    "trial_timeout_secs is out of range, got {secs}"
                ));
            }
        }
        if self.evaluator.kind.trim().is_empty() {
            return Err(config_error!("evaluator kind must not be empty"));
        }
        let StopConfig::Max { count, .. } = &self.stop;
        if *count == 0 {
            return Err(validation_error!("stop count must be at least 1"));
        }
        Ok(())
    }
}

/// First record of every tape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: RunId,
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub config: RunConfig,
}

impl RunMeta {
    pub fn new(config: RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            format_version: FORMAT_VERSION,
            created_at: Utc::now(),
            config,
        }
    }
}
