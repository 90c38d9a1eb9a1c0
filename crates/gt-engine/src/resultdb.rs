use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use gt_types::{Eid, EvalResult, ResultState};

/// Evaluation results keyed by eid.
///
/// Cheap to clone; clones share the same table. The run loop owns the only
/// writer, the evaluation pool reads it to short-circuit repeated work.
#[derive(Debug, Clone, Default)]
pub struct ResultDb {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Eid, EvalResult>,
    /// First-insertion order, for stable listings.
    order: Vec<Eid>,
}

impl ResultDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the result for `eid`.
    pub fn submit(&self, eid: Eid, result: EvalResult) {
        let mut inner = self.inner.write();
        if !inner.entries.contains_key(&eid) {
            inner.order.push(eid.clone());
        }
        inner.entries.insert(eid, result);
    }

    pub fn get(&self, eid: &Eid) -> Option<EvalResult> {
        self.inner.read().entries.get(eid).cloned()
    }

    pub fn contains(&self, eid: &Eid) -> bool {
        self.inner.read().entries.contains_key(eid)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Eids whose result is in `state`, in insertion order.
    pub fn where_state(&self, state: ResultState) -> Vec<Eid> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter(|eid| {
                inner
                    .entries
                    .get(*eid)
                    .is_some_and(|result| result.state() == state)
            })
            .cloned()
            .collect()
    }

    pub fn count_state(&self, state: ResultState) -> usize {
        self.inner
            .read()
            .entries
            .values()
            .filter(|result| result.state() == state)
            .count()
    }

    /// Losses of every ok result, in insertion order.
    pub fn losses(&self) -> Vec<(Eid, f64)> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|eid| {
                let loss = inner.entries.get(eid)?.loss()?;
                Some((eid.clone(), loss))
            })
            .collect()
    }

    /// Losses ascending; NaN sorts last.
    pub fn sorted_losses(&self) -> Vec<(Eid, f64)> {
        let mut losses = self.losses();
        losses.sort_by(|a, b| a.1.total_cmp(&b.1));
        losses
    }

    /// The `n` best ok results.
    pub fn top_n(&self, n: usize) -> Vec<(Eid, EvalResult)> {
        let ranked = self.sorted_losses();
        let inner = self.inner.read();
        ranked
            .into_iter()
            .take(n)
            .filter_map(|(eid, _)| {
                let result = inner.entries.get(&eid)?.clone();
                Some((eid, result))
            })
            .collect()
    }

    /// Number of error results per kind.
    pub fn count_by_error_kind(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for result in self.inner.read().entries.values() {
            if let Some(kind) = result.error_kind() {
                *counts.entry(kind.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gt_types::{EvalFailure, Outcome, Suggestion};
    use serde_json::json;

    fn eid(x: i64) -> Eid {
        Suggestion::new(json!({ "x": x })).eid()
    }

    #[test]
    fn submit_upserts() {
        let db = ResultDb::new();
        db.submit(eid(1), EvalResult::ok(Outcome::with_loss(3.0)));
        db.submit(eid(1), EvalResult::ok(Outcome::with_loss(1.0)));

        assert_eq!(db.len(), 1);
        assert_eq!(db.get(&eid(1)).and_then(|r| r.loss()), Some(1.0));
        assert!(db.contains(&eid(1)));
        assert!(!db.contains(&eid(2)));
    }

    #[test]
    fn clones_share_storage() {
        let db = ResultDb::new();
        let view = db.clone();
        db.submit(eid(1), EvalResult::ok(Outcome::with_loss(0.5)));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn queries_by_state_and_loss() {
        let db = ResultDb::new();
        db.submit(eid(1), EvalResult::ok(Outcome::with_loss(0.9)));
        db.submit(eid(2), EvalFailure::new("Timeout", "slow").into());
        db.submit(eid(3), EvalResult::ok(Outcome::with_loss(0.1)));
        db.submit(eid(4), EvalFailure::new("Timeout", "slow").into());
        db.submit(eid(5), EvalFailure::new("WorkerCrashed", "gone").into());

        assert_eq!(db.where_state(ResultState::Ok), vec![eid(1), eid(3)]);
        assert_eq!(db.count_state(ResultState::Error), 3);
        assert_eq!(db.losses(), vec![(eid(1), 0.9), (eid(3), 0.1)]);
        assert_eq!(db.sorted_losses()[0], (eid(3), 0.1));

        let top = db.top_n(1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, eid(3));

        let histogram = db.count_by_error_kind();
        assert_eq!(histogram.get("Timeout"), Some(&2));
        assert_eq!(histogram.get("WorkerCrashed"), Some(&1));
    }
}
