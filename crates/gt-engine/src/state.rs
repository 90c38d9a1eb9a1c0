//! Trial bookkeeping for one run.
//!
//! `State` is the only place that talks to the search. Every `suggest` and
//! `submit` goes through here, is applied to the search, written to the tape,
//! and (for submits) mirrored into the result database. Because the search is
//! deterministic in its input sequence, re-applying a tape's entries to a
//! fresh search reproduces the exact same state.

use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use gt_search::Search;
use gt_types::{
    Eid, EvalResult, GtError, GtResult, ReplayError, ResultState, Suggestion, Tid, TrialError,
};

use crate::resultdb::ResultDb;
use crate::tape::{Tape, TapeEntry};

/// A trial that has been submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTrial {
    pub tid: Tid,
    pub eid: Eid,
    pub suggestion: Suggestion,
    pub result: EvalResult,
}

pub struct State {
    search: Box<dyn Search>,
    db: ResultDb,
    tape: Tape,
    live: BTreeMap<Tid, Suggestion>,
    resolved: Vec<ResolvedTrial>,
    n_suggested: usize,
    n_ok: usize,
    n_errors: usize,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("search", &self.search.name())
            .field("live", &self.live.len())
            .field("resolved", &self.resolved.len())
            .finish()
    }
}

impl State {
    pub fn new(search: Box<dyn Search>, db: ResultDb, tape: Tape) -> Self {
        Self {
            search,
            db,
            tape,
            live: BTreeMap::new(),
            resolved: Vec::new(),
            n_suggested: 0,
            n_ok: 0,
            n_errors: 0,
        }
    }

    /// Rebuild a state by re-applying recorded entries to a fresh search.
    ///
    /// Each recorded suggest is checked against what the search proposes now;
    /// any disagreement is fatal. The entries are re-recorded on `tape`.
    pub fn replay<I>(entries: I, search: Box<dyn Search>, db: ResultDb, tape: Tape) -> GtResult<Self>
    where
        I: IntoIterator<Item = TapeEntry>,
    {
        let mut state = Self::new(search, db, tape);
        let mut position = 0usize;

        for entry in entries {
            match entry {
                TapeEntry::Suggest {
                    tid: expected_tid,
                    suggestion: expected,
                } => match state.suggest()? {
                    Some((tid, suggestion)) if tid == expected_tid && suggestion == expected => {}
                    Some((actual_tid, actual)) => {
                        return Err(ReplayError::Mismatch {
                            position,
                            expected_tid,
                            expected: expected.to_string(),
                            actual_tid,
                            actual: actual.to_string(),
                        }
                        .into())
                    }
                    None => {
                        return Err(ReplayError::SearchStopped {
                            position,
                            expected_tid,
                        }
                        .into())
                    }
                },
                TapeEntry::Submit { tid, result } => {
                    state.submit(tid, result).map_err(|e| match e {
                        GtError::Trial(source) => ReplayError::Submit { position, source }.into(),
                        other => other,
                    })?;
                }
            }
            position += 1;
        }

        info!(
            entries = position,
            submitted = state.n_submitted(),
            live = state.live.len(),
            "state replayed"
        );
        Ok(state)
    }

    /// Ask the search for the next trial and record it as live.
    pub fn suggest(&mut self) -> GtResult<Option<(Tid, Suggestion)>> {
        let Some((tid, suggestion)) = self.search.suggest() else {
            return Ok(None);
        };
        if self.live.contains_key(&tid) {
            return Err(TrialError::DuplicateTid { tid }.into());
        }

        self.tape.append(TapeEntry::Suggest {
            tid,
            suggestion: suggestion.clone(),
        })?;
        self.live.insert(tid, suggestion.clone());
        self.n_suggested += 1;
        debug!(tid, "trial suggested");
        Ok(Some((tid, suggestion)))
    }

    /// Resolve a live trial.
    pub fn submit(&mut self, tid: Tid, result: EvalResult) -> GtResult<()> {
        if !self.live.contains_key(&tid) {
            return Err(TrialError::NotLive { tid }.into());
        }
        let feedback = result
            .feedback()
            .ok_or(TrialError::MissingLoss { tid })?;

        self.search.submit(tid, feedback);
        self.tape.append(TapeEntry::Submit {
            tid,
            result: result.clone(),
        })?;

        let Some(suggestion) = self.live.remove(&tid) else {
            return Err(TrialError::NotLive { tid }.into());
        };
        let eid = suggestion.eid();
        self.db.submit(eid.clone(), result.clone());

        match result.state() {
            ResultState::Ok => self.n_ok += 1,
            ResultState::Error => self.n_errors += 1,
        }
        debug!(tid, eid = eid.short(), state = ?result.state(), "trial submitted");
        self.resolved.push(ResolvedTrial {
            tid,
            eid,
            suggestion,
            result,
        });
        Ok(())
    }

    pub fn live(&self) -> &BTreeMap<Tid, Suggestion> {
        &self.live
    }

    pub fn trials(&self) -> &[ResolvedTrial] {
        &self.resolved
    }

    pub fn db(&self) -> &ResultDb {
        &self.db
    }

    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    pub(crate) fn tape_mut(&mut self) -> &mut Tape {
        &mut self.tape
    }

    pub fn search_done(&self) -> bool {
        self.search.done()
    }

    pub fn search_name(&self) -> &str {
        self.search.name()
    }

    pub fn n_suggested(&self) -> usize {
        self.n_suggested
    }

    pub fn n_submitted(&self) -> usize {
        self.resolved.len()
    }

    pub fn n_ok(&self) -> usize {
        self.n_ok
    }

    pub fn n_errors(&self) -> usize {
        self.n_errors
    }

    /// Number of distinct evaluations with an ok result.
    pub fn n_evals_ok(&self) -> usize {
        self.db.count_state(ResultState::Ok)
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.db.sorted_losses().first().map(|(_, loss)| *loss)
    }

    /// The `n` best ok trials, one per eid.
    pub fn top_trials(&self, n: usize) -> Vec<&ResolvedTrial> {
        let mut ranked: Vec<(&ResolvedTrial, f64)> = self
            .resolved
            .iter()
            .filter_map(|trial| trial.result.loss().map(|loss| (trial, loss)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut seen = HashSet::new();
        ranked
            .into_iter()
            .filter(|(trial, _)| seen.insert(trial.eid.clone()))
            .map(|(trial, _)| trial)
            .take(n)
            .collect()
    }

    pub fn error_histogram(&self) -> BTreeMap<String, usize> {
        self.db.count_by_error_kind()
    }

    /// One-line progress summary.
    pub fn short_report(&self) -> String {
        let best: Vec<String> = self
            .db
            .sorted_losses()
            .into_iter()
            .take(3)
            .map(|(_, loss)| format!("{loss:.6}"))
            .collect();
        format!(
            "{} submitted ({} ok, {} errors), {} live, {} distinct evals; best: [{}]",
            self.n_submitted(),
            self.n_ok,
            self.n_errors,
            self.live.len(),
            self.db.len(),
            best.join(", ")
        )
    }
}
