//! Search strategies.
//!
//! Every strategy here honours the determinism contract the engine's replay
//! relies on: for a fixed construction, the sequence of `suggest` outputs is a
//! pure function of the sequence of `submit` calls made before them. Hence the
//! seeded ChaCha RNG and ordered containers throughout.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use gt_types::{validation_error, Feedback, GtResult, SearchConfig, Suggestion, Tid};

use crate::space::{Point, SearchSpace};

/// Common trait for all search strategies.
pub trait Search: Send {
    /// Propose the next trial, or `None` if nothing should be dispatched now.
    fn suggest(&mut self) -> Option<(Tid, Suggestion)>;

    /// Report a resolved trial. Unknown tids are ignored.
    fn submit(&mut self, tid: Tid, feedback: Feedback);

    /// True once the strategy will never propose anything again.
    fn done(&self) -> bool;

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

/// Construct the strategy described by `config`.
pub fn build_search(config: &SearchConfig) -> GtResult<Box<dyn Search>> {
    let space = SearchSpace::parse(config.space())?;
    let search: Box<dyn Search> = match config {
        SearchConfig::Grid { grid_steps, .. } => Box::new(GridSearch::new(space, *grid_steps)?),
        SearchConfig::Random {
            seed, max_trials, ..
        } => Box::new(RandomSearch::new(space, *seed).with_max_trials(*max_trials)),
        SearchConfig::Adaptive {
            seed,
            exploration_weight,
            n_startup,
            max_trials,
            ..
        } => Box::new(
            AdaptiveSearch::new(space, *seed, *exploration_weight)
                .with_startup(*n_startup)
                .with_max_trials(*max_trials),
        ),
    };
    debug!(strategy = search.name(), "search constructed");
    Ok(search)
}

// ---- Grid search ----

/// Grids above this size are allowed but logged.
const LARGE_GRID: usize = 1_000_000;

/// Exhaustive grid search over the space. Points are decoded from the cursor
/// on demand, so the grid is never held in memory.
#[derive(Debug, Clone)]
pub struct GridSearch {
    space: SearchSpace,
    steps: usize,
    size: usize,
    cursor: usize,
}

impl GridSearch {
    pub fn new(space: SearchSpace, grid_steps: usize) -> GtResult<Self> {
        let size = space.grid_size(grid_steps).ok_or_else(|| {
            validation_error!(
                "grid over {:?} has too many points to enumerate",
                space.variables()
            )
        })?;
        if size > LARGE_GRID {
            warn!(points = size, "grid search is very large");
        }
        Ok(Self {
            space,
            steps: grid_steps,
            size,
            cursor: 0,
        })
    }

    /// Total number of grid points.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Search for GridSearch {
    fn suggest(&mut self) -> Option<(Tid, Suggestion)> {
        if self.done() {
            return None;
        }
        let suggestion = self.space.grid_point(self.steps, self.cursor)?;
        let tid = self.cursor as Tid;
        self.cursor += 1;
        Some((tid, suggestion))
    }

    fn submit(&mut self, _tid: Tid, _feedback: Feedback) {}

    fn done(&self) -> bool {
        self.cursor >= self.size
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent seeded sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: ChaCha8Rng,
    issued: usize,
    max_trials: Option<usize>,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            rng: ChaCha8Rng::seed_from_u64(seed),
            issued: 0,
            max_trials: None,
        }
    }

    pub fn with_max_trials(mut self, max_trials: Option<usize>) -> Self {
        self.max_trials = max_trials;
        self
    }
}

impl Search for RandomSearch {
    fn suggest(&mut self) -> Option<(Tid, Suggestion)> {
        if self.done() {
            return None;
        }
        let (suggestion, _) = self.space.sample(&mut self.rng);
        let tid = self.issued as Tid;
        self.issued += 1;
        Some((tid, suggestion))
    }

    fn submit(&mut self, _tid: Tid, _feedback: Feedback) {}

    fn done(&self) -> bool {
        self.max_trials.is_some_and(|max| self.issued >= max)
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Adaptive search ----

/// Random exploration mixed with exploitation around the best observed point.
///
/// The first `n_startup` suggestions are pure exploration. After that each
/// suggestion explores with probability `exploration_weight` and otherwise
/// perturbs the lowest-loss point reported so far. Failed trials are kept as
/// observations but never exploited.
#[derive(Debug, Clone)]
pub struct AdaptiveSearch {
    space: SearchSpace,
    rng: ChaCha8Rng,
    exploration_weight: f64,
    n_startup: usize,
    max_trials: Option<usize>,
    issued: usize,
    pending: BTreeMap<Tid, Point>,
    observations: Vec<(Point, Feedback)>,
}

impl AdaptiveSearch {
    pub fn new(space: SearchSpace, seed: u64, exploration_weight: f64) -> Self {
        Self {
            space,
            rng: ChaCha8Rng::seed_from_u64(seed),
            exploration_weight,
            n_startup: 0,
            max_trials: None,
            issued: 0,
            pending: BTreeMap::new(),
            observations: Vec::new(),
        }
    }

    pub fn with_startup(mut self, n_startup: usize) -> Self {
        self.n_startup = n_startup;
        self
    }

    pub fn with_max_trials(mut self, max_trials: Option<usize>) -> Self {
        self.max_trials = max_trials;
        self
    }

    pub fn observations(&self) -> usize {
        self.observations.len()
    }

    /// Lowest-loss successful observation; earliest wins ties.
    fn best(&self) -> Option<&Point> {
        self.observations
            .iter()
            .filter_map(|(point, feedback)| match feedback {
                Feedback::Ok { loss, .. } if loss.is_finite() => Some((point, *loss)),
                _ => None,
            })
            .fold(None, |best: Option<(&Point, f64)>, (point, loss)| match best {
                Some((_, best_loss)) if best_loss <= loss => best,
                _ => Some((point, loss)),
            })
            .map(|(point, _)| point)
    }
}

impl Search for AdaptiveSearch {
    fn suggest(&mut self) -> Option<(Tid, Suggestion)> {
        if self.done() {
            return None;
        }

        let explore = self.issued < self.n_startup
            || self.best().is_none()
            || self.rng.gen::<f64>() < self.exploration_weight;

        let base = if explore { None } else { self.best().cloned() };
        let (suggestion, point) = match base {
            Some(best) => self.space.perturb(&best, &mut self.rng),
            None => self.space.sample(&mut self.rng),
        };

        let tid = self.issued as Tid;
        self.issued += 1;
        self.pending.insert(tid, point);
        Some((tid, suggestion))
    }

    fn submit(&mut self, tid: Tid, feedback: Feedback) {
        if let Some(point) = self.pending.remove(&tid) {
            self.observations.push((point, feedback));
        }
    }

    fn done(&self) -> bool {
        self.max_trials.is_some_and(|max| self.issued >= max)
    }

    fn name(&self) -> &str {
        "adaptive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn sample_space() -> SearchSpace {
        SearchSpace::parse(&json!({
            "batch_size": ["hp_randint", "batch_size", 5, 15],
            "epochs": ["hp_randint", "epochs", 20, 50],
            "dropout": ["hp_uniform", "dropout", 0.5, 1.0]
        }))
        .unwrap()
    }

    fn drain(search: &mut dyn Search, n: usize) -> Vec<(Tid, Suggestion)> {
        (0..n).map_while(|_| search.suggest()).collect()
    }

    #[test]
    fn grid_search_enumerates_then_stops() {
        let space = SearchSpace::parse(&json!({"x": ["hp_choice", "x", [1, 2, 3]]})).unwrap();
        let mut gs = GridSearch::new(space, 5).unwrap();
        assert_eq!(gs.len(), 3);
        assert!(!gs.done());

        let batch = drain(&mut gs, 10);
        let xs: Vec<Value> = batch.iter().map(|(_, s)| s.as_value()["x"].clone()).collect();
        assert_eq!(xs, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(batch.iter().map(|(t, _)| *t).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(gs.done());
        assert!(gs.suggest().is_none());
    }

    #[test]
    fn random_search_respects_bounds() {
        let mut rs = RandomSearch::new(sample_space(), 3);
        let suggestions = drain(&mut rs, 50);
        assert_eq!(suggestions.len(), 50);
        assert!(!rs.done());

        for (_, params) in &suggestions {
            let batch = params.pointer("/batch_size").and_then(Value::as_i64).unwrap();
            assert!((5..=15).contains(&batch));
            let dropout = params.pointer("/dropout").and_then(Value::as_f64).unwrap();
            assert!((0.5..=1.0).contains(&dropout));
        }
    }

    #[test]
    fn grid_search_walks_a_large_grid_lazily() {
        let space = SearchSpace::parse(&json!({
            "a": ["hp_uniform", "a", 0.0, 1.0],
            "b": ["hp_uniform", "b", 0.0, 1.0],
            "c": ["hp_uniform", "c", 0.0, 1.0],
            "d": ["hp_uniform", "d", 0.0, 1.0],
            "e": ["hp_uniform", "e", 0.0, 1.0],
            "f": ["hp_uniform", "f", 0.0, 1.0],
            "g": ["hp_uniform", "g", 0.0, 1.0],
            "h": ["hp_uniform", "h", 0.0, 1.0],
            "i": ["hp_uniform", "i", 0.0, 1.0],
            "j": ["hp_uniform", "j", 0.0, 1.0]
        }))
        .unwrap();
        let mut gs = GridSearch::new(space, 5).unwrap();
        assert_eq!(gs.len(), 9_765_625);
        let first = drain(&mut gs, 3);
        let js: Vec<f64> = first
            .iter()
            .map(|(_, s)| s.pointer("/j").and_then(Value::as_f64).unwrap())
            .collect();
        assert_eq!(js, vec![0.0, 0.25, 0.5]);
        assert!(!gs.done());
    }

    #[test]
    fn grid_search_rejects_uncountable_grids() {
        let space =
            SearchSpace::parse(&json!({"n": ["hp_randint", "n", i64::MIN, i64::MAX]})).unwrap();
        assert!(GridSearch::new(space, 5).is_err());
    }

    #[test]
    fn random_search_max_trials() {
        let mut rs = RandomSearch::new(sample_space(), 3).with_max_trials(Some(4));
        assert_eq!(drain(&mut rs, 10).len(), 4);
        assert!(rs.done());
    }

    #[test]
    fn identical_construction_gives_identical_suggestions() {
        let mut a = AdaptiveSearch::new(sample_space(), 11, 0.3).with_startup(2);
        let mut b = AdaptiveSearch::new(sample_space(), 11, 0.3).with_startup(2);
        for i in 0..25u64 {
            let (ta, sa) = a.suggest().unwrap();
            let (tb, sb) = b.suggest().unwrap();
            assert_eq!((ta, &sa), (tb, &sb));
            let feedback = if i % 5 == 4 {
                Feedback::Failed
            } else {
                Feedback::Ok {
                    loss: (i as f64 * 0.37).sin(),
                    variance: None,
                }
            };
            a.submit(ta, feedback);
            b.submit(tb, feedback);
        }
    }

    #[test]
    fn same_history_gives_same_next_suggestion() {
        let run = |order: [usize; 2]| {
            let mut search = AdaptiveSearch::new(sample_space(), 5, 0.0).with_startup(2);
            let first = [search.suggest().unwrap(), search.suggest().unwrap()];
            for i in order {
                let loss = if i == 0 { 1.0 } else { 2.0 };
                search.submit(first[i].0, Feedback::Ok { loss, variance: None });
            }
            search.suggest().unwrap()
        };
        assert_eq!(run([0, 1]), run([0, 1]));
    }

    #[test]
    fn adaptive_exploits_best_point() {
        let space = SearchSpace::parse(&json!({"lr": ["hp_uniform", "lr", 0.0, 1.0]})).unwrap();
        let mut search = AdaptiveSearch::new(space, 1, 0.0).with_startup(1);

        let (tid, first) = search.suggest().unwrap();
        search.submit(tid, Feedback::Ok { loss: 0.1, variance: None });
        let best = first.pointer("/lr").and_then(Value::as_f64).unwrap();

        for (_, params) in drain(&mut search, 20) {
            let lr = params.pointer("/lr").and_then(Value::as_f64).unwrap();
            assert!((lr - best).abs() <= 0.1 + 1e-12, "lr {lr} not near {best}");
        }
    }

    #[test]
    fn adaptive_ignores_unknown_tids() {
        let mut search = AdaptiveSearch::new(sample_space(), 2, 0.5);
        search.submit(999, Feedback::Failed);
        assert_eq!(search.observations(), 0);
        let (tid, _) = search.suggest().unwrap();
        search.submit(tid, Feedback::Failed);
        search.submit(tid, Feedback::Failed);
        assert_eq!(search.observations(), 1);
    }

    #[test]
    fn build_search_from_config() {
        let space = json!({"x": ["hp_choice", "x", [1, 2, 3]]});
        let mut grid = build_search(&SearchConfig::grid(space.clone())).unwrap();
        assert_eq!(grid.name(), "grid");
        assert_eq!(drain(grid.as_mut(), 10).len(), 3);
        assert!(grid.done());

        let adaptive = build_search(&SearchConfig::adaptive(space, 0)).unwrap();
        assert_eq!(adaptive.name(), "adaptive");

        let bad = SearchConfig::random(json!({"x": ["hp_uniform", "x"]}), 0);
        assert!(build_search(&bad).is_err());
    }
}
