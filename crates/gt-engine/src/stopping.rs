use gt_types::{StopConfig, StopCounter};

use crate::state::State;

/// Decides when a run has done enough work.
pub trait StoppingPolicy: Send + Sync {
    fn done(&self, state: &State) -> bool;

    /// Progress towards the goal, for status output.
    fn describe(&self, state: &State) -> String;
}

/// Stop once a counter reaches `count`.
#[derive(Debug, Clone, PartialEq)]
pub struct StopMax {
    count: usize,
    count_errors: bool,
    counter: StopCounter,
}

impl StopMax {
    pub fn new(count: usize, count_errors: bool, counter: StopCounter) -> Self {
        Self {
            count,
            count_errors,
            counter,
        }
    }

    fn progress(&self, state: &State) -> usize {
        match (self.counter, self.count_errors) {
            (StopCounter::Trials, true) => state.n_submitted(),
            (StopCounter::Trials, false) => state.n_ok(),
            (StopCounter::Evals, true) => state.db().len(),
            (StopCounter::Evals, false) => state.n_evals_ok(),
        }
    }
}

impl StoppingPolicy for StopMax {
    fn done(&self, state: &State) -> bool {
        self.progress(state) >= self.count
    }

    fn describe(&self, state: &State) -> String {
        let unit = match self.counter {
            StopCounter::Trials => "trials",
            StopCounter::Evals => "evals",
        };
        let scope = if self.count_errors { "" } else { " ok" };
        format!(
            "max: {}/{}{} {}",
            self.progress(state),
            self.count,
            scope,
            unit
        )
    }
}

pub fn build_stopping(config: &StopConfig) -> Box<dyn StoppingPolicy> {
    match config {
        StopConfig::Max {
            count,
            count_errors,
            counter,
        } => Box::new(StopMax::new(*count, *count_errors, *counter)),
    }
}
