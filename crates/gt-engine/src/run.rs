//! Run directories and the main run loop.
//!
//! A run directory holds the live tape (`tape.jsonl`), timestamped backups of
//! earlier tapes, and the status files. Starting a run is always a restore:
//! the recorded tape is replayed into a fresh tape, the old file is kept as a
//! backup, and trials left live by a previous process are dispatched again.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use gt_search::build_search;
use gt_types::{internal_error, GtResult, RunConfig, RunError, RunMeta, Suggestion, Tid};

use crate::pool::{Completion, EvaluationPool, PoolConfig, WorkerCommand};
use crate::resultdb::ResultDb;
use crate::state::State;
use crate::status::StatusSnapshot;
use crate::stopping::{build_stopping, StoppingPolicy};
use crate::tape::Tape;

pub const TAPE_FILE: &str = "tape.jsonl";
const REPLAY_FILE: &str = "tape.replay.jsonl";
/// Lower bound on the status interval, which is also the longest wait for a completion.
pub const MIN_STATUS_INTERVAL: Duration = Duration::from_millis(50);

/// File layout of a run directory.
#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tape(&self) -> PathBuf {
        self.root.join(TAPE_FILE)
    }

    fn replay_tape(&self) -> PathBuf {
        self.root.join(REPLAY_FILE)
    }

    /// A backup name that does not exist yet.
    fn backup(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
        let mut candidate = self.root.join(format!("tape.{stamp}.bak.jsonl"));
        let mut n = 1;
        while candidate.exists() {
            candidate = self.root.join(format!("tape.{stamp}-{n}.bak.jsonl"));
            n += 1;
        }
        candidate
    }

    /// Put a complete replay tape back in place when a previous restore
    /// died after moving `tape.jsonl` away.
    fn recover_interrupted_swap(&self) -> GtResult<()> {
        let tape = self.tape();
        let replay = self.replay_tape();
        if tape.exists() || !replay.exists() {
            return Ok(());
        }
        Tape::restore(&replay)?;
        warn!(
            replay = %replay.display(),
            "tape missing after an interrupted restore, recovering from the replay tape"
        );
        fs::rename(&replay, &tape)?;
        Ok(())
    }

    /// Existing backups, oldest first.
    pub fn backups(&self) -> GtResult<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_backup = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("tape.") && n.ends_with(".bak.jsonl"));
            if is_backup {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }
}

fn link_or_copy(from: &Path, to: &Path) -> GtResult<()> {
    if let Err(e) = fs::hard_link(from, to) {
        debug!(error = %e, "hard link failed, copying the tape instead");
        fs::copy(from, to)?;
    }
    Ok(())
}

/// Process-level knobs for driving a run. Nothing here affects the search.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_workers: usize,
    pub time_budget: Option<Duration>,
    pub status_interval: Duration,
    /// How long in-flight trials may finish after the time budget runs out.
    pub drain_grace: Duration,
    pub kill_grace: Duration,
    pub shutdown_grace: Duration,
    pub top_n: usize,
    pub worker: WorkerCommand,
}

impl RunOptions {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            max_workers: 1,
            time_budget: None,
            status_interval: Duration::from_secs(10),
            drain_grace: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            top_n: 10,
            worker,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget;
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval.max(MIN_STATUS_INTERVAL);
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    StoppingPolicy,
    TimeBudget,
    SearchExhausted,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub reason: StopReason,
    pub submitted: usize,
    pub ok: usize,
    pub errors: usize,
    /// Trials still live on the tape; they are dispatched again on restore.
    pub live: usize,
    pub best_loss: Option<f64>,
    pub elapsed: Duration,
}

/// Create a run directory holding a tape with only metadata.
pub fn prepare(dir: impl AsRef<Path>, config: RunConfig, overwrite: bool) -> GtResult<RunMeta> {
    let dir = RunDir::new(dir.as_ref());
    config.validate()?;
    // Fail on a bad space now rather than on first start.
    build_search(&config.search)?;

    fs::create_dir_all(dir.root())?;
    let tape_path = dir.tape();
    if tape_path.exists() && !overwrite {
        return Err(RunError::AlreadyPrepared {
            path: dir.root().display().to_string(),
        }
        .into());
    }

    let meta = RunMeta::new(config);
    Tape::create(&tape_path, &meta)?;
    info!(dir = %dir.root().display(), run_id = %meta.run_id, name = %meta.config.name, "run prepared");
    Ok(meta)
}

/// Read-only view of a run directory.
pub struct Checkout {
    meta: RunMeta,
    state: State,
}

impl Checkout {
    pub fn meta(&self) -> &RunMeta {
        &self.meta
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn snapshot(&self, top_n: usize) -> StatusSnapshot {
        let stopping = build_stopping(&self.meta.config.stop);
        StatusSnapshot::capture(
            &self.state,
            &self.meta.config.name,
            self.meta.run_id,
            stopping.describe(&self.state),
            Duration::ZERO,
            top_n,
        )
    }
}

/// Replay a run directory's tape without touching it.
pub fn checkout(dir: impl AsRef<Path>) -> GtResult<Checkout> {
    let dir = RunDir::new(dir.as_ref());
    let recorded = Tape::restore(dir.tape())?;
    let search = build_search(&recorded.meta.config.search)?;
    let state = State::replay(recorded.entries, search, ResultDb::new(), Tape::in_memory())?;
    Ok(Checkout {
        meta: recorded.meta,
        state,
    })
}

pub struct Run {
    dir: RunDir,
    meta: RunMeta,
    state: State,
    stopping: Box<dyn StoppingPolicy>,
    pool: EvaluationPool,
    options: RunOptions,
    status_task: Option<JoinHandle<()>>,
}

impl Run {
    /// Rebuild a run from its directory, ready to drive.
    ///
    /// The recorded tape is replayed into a new file first; only once the
    /// replay has succeeded is the old tape moved to a backup and the new one
    /// put in its place.
    pub async fn restore(dir: impl AsRef<Path>, options: RunOptions) -> GtResult<Self> {
        let dir = RunDir::new(dir.as_ref());
        let tape_path = dir.tape();
        dir.recover_interrupted_swap()?;
        let recorded = Tape::restore(&tape_path)?;
        let meta = recorded.meta;
        meta.config.validate()?;

        let search = build_search(&meta.config.search)?;
        let db = ResultDb::new();
        let tape = Tape::create(dir.replay_tape(), &meta)?;
        let mut state = State::replay(recorded.entries, search, db.clone(), tape)?;

        // `tape.jsonl` exists at every point of the swap: the backup is a
        // second link to the old file and the rename replaces it atomically.
        let backup = dir.backup();
        link_or_copy(&tape_path, &backup)?;
        state.tape_mut().rename_to(&tape_path)?;
        info!(
            run = %meta.config.name,
            backup = %backup.display(),
            submitted = state.n_submitted(),
            live = state.live().len(),
            dropped_tail = recorded.dropped_tail,
            "run restored"
        );

        let pool_config = PoolConfig::new(meta.config.evaluator.clone(), options.worker.clone())
            .with_max_workers(options.max_workers)
            .with_trial_timeout(meta.config.trial_timeout())
            .with_kill_grace(options.kill_grace)
            .with_caught_error_kinds(meta.config.caught_error_kinds.clone());
        let pool = EvaluationPool::new(pool_config, db);
        let stopping = build_stopping(&meta.config.stop);

        Ok(Self {
            dir,
            meta,
            state,
            stopping,
            pool,
            options,
            status_task: None,
        })
    }

    pub fn meta(&self) -> &RunMeta {
        &self.meta
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Drive the run until a stop condition, then shut the pool down.
    pub async fn drive(mut self) -> GtResult<RunSummary> {
        let started = Instant::now();
        let mut inflight: JoinSet<(Tid, Completion)> = JoinSet::new();

        let outcome = self.run_loop(&mut inflight, started).await;
        let outcome = match outcome {
            Ok(StopReason::TimeBudget) => self
                .drain(&mut inflight)
                .await
                .map(|()| StopReason::TimeBudget),
            other => other,
        };
        if !inflight.is_empty() {
            debug!(abandoned = inflight.len(), "leaving in-flight trials live");
            inflight.abort_all();
        }

        let saved = self.save_status(started).await;
        self.pool.shutdown(self.options.shutdown_grace).await;

        let reason = outcome.inspect_err(|e| error!(error = %e, "run failed"))?;
        saved?;

        let summary = RunSummary {
            reason,
            submitted: self.state.n_submitted(),
            ok: self.state.n_ok(),
            errors: self.state.n_errors(),
            live: self.state.live().len(),
            best_loss: self.state.best_loss(),
            elapsed: started.elapsed(),
        };
        info!(
            reason = ?summary.reason,
            submitted = summary.submitted,
            ok = summary.ok,
            errors = summary.errors,
            best_loss = ?summary.best_loss,
            "run finished"
        );
        Ok(summary)
    }

    async fn run_loop(
        &mut self,
        inflight: &mut JoinSet<(Tid, Completion)>,
        started: Instant,
    ) -> GtResult<StopReason> {
        let redispatch: Vec<(Tid, Suggestion)> = self
            .state
            .live()
            .iter()
            .map(|(tid, suggestion)| (*tid, suggestion.clone()))
            .collect();
        for (tid, suggestion) in redispatch {
            info!(tid, "re-dispatching trial left live by an earlier run");
            self.dispatch(inflight, tid, suggestion)?;
        }

        let mut last_status = Instant::now();
        loop {
            if self.stopping.done(&self.state) {
                info!(progress = %self.stopping.describe(&self.state), "stopping policy satisfied");
                return Ok(StopReason::StoppingPolicy);
            }
            let remaining = match self.options.time_budget {
                Some(budget) => {
                    let left = budget.saturating_sub(started.elapsed());
                    if left.is_zero() {
                        info!(?budget, "time budget exhausted");
                        return Ok(StopReason::TimeBudget);
                    }
                    Some(left)
                }
                None => None,
            };

            self.refill(inflight)?;
            if inflight.is_empty() {
                if self.state.search_done() {
                    warn!(
                        progress = %self.stopping.describe(&self.state),
                        "search exhausted before the stopping policy was met"
                    );
                    return Ok(StopReason::SearchExhausted);
                }
                return Err(RunError::Stalled {
                    message: format!(
                        "{} suggested nothing with no trials in flight",
                        self.state.search_name()
                    ),
                }
                .into());
            }

            let wait = remaining.map_or(self.options.status_interval, |left| {
                left.min(self.options.status_interval)
            });
            if let Ok(Some(joined)) = timeout(wait, inflight.join_next()).await {
                self.complete(joined)?;
                while !self.stopping.done(&self.state) {
                    match inflight.try_join_next() {
                        Some(joined) => self.complete(joined)?,
                        None => break,
                    }
                }
            }

            if last_status.elapsed() >= self.options.status_interval {
                self.spawn_status_save(started);
                last_status = Instant::now();
            }
        }
    }

    /// Keep one more trial queued than there are workers.
    fn refill(&mut self, inflight: &mut JoinSet<(Tid, Completion)>) -> GtResult<()> {
        let target = self.options.max_workers.max(1) + 1;
        while inflight.len() < target {
            match self.state.suggest()? {
                Some((tid, suggestion)) => self.dispatch(inflight, tid, suggestion)?,
                None => break,
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        inflight: &mut JoinSet<(Tid, Completion)>,
        tid: Tid,
        suggestion: Suggestion,
    ) -> GtResult<()> {
        let pending = self.pool.schedule(suggestion)?;
        debug!(tid, eid = pending.eid().short(), "trial dispatched");
        inflight.spawn(async move { (tid, pending.await) });
        Ok(())
    }

    fn complete(&mut self, joined: Result<(Tid, Completion), JoinError>) -> GtResult<()> {
        let (tid, completion) =
            joined.map_err(|e| internal_error!("evaluation task failed: {e}"))?;
        let cached = completion.is_cached();
        let result = self.pool.finish(completion)?;
        info!(
            tid,
            state = ?result.state(),
            loss = ?result.loss(),
            cached,
            "trial finished"
        );
        self.state.submit(tid, result)
    }

    async fn drain(&mut self, inflight: &mut JoinSet<(Tid, Completion)>) -> GtResult<()> {
        if inflight.is_empty() {
            return Ok(());
        }
        info!(inflight = inflight.len(), grace = ?self.options.drain_grace, "draining in-flight trials");
        let deadline = Instant::now() + self.options.drain_grace;
        while !inflight.is_empty() {
            let left = deadline.saturating_duration_since(Instant::now());
            match timeout(left, inflight.join_next()).await {
                Ok(Some(joined)) => self.complete(joined)?,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        abandoned = inflight.len(),
                        "drain grace expired; unfinished trials stay live"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self, started: Instant) -> StatusSnapshot {
        StatusSnapshot::capture(
            &self.state,
            &self.meta.config.name,
            self.meta.run_id,
            self.stopping.describe(&self.state),
            started.elapsed(),
            self.options.top_n,
        )
    }

    /// Periodic status writes happen off the run loop; a write still in
    /// progress makes this a no-op.
    fn spawn_status_save(&mut self, started: Instant) {
        if self
            .status_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        info!(progress = %self.state.short_report(), "status");
        let snapshot = self.snapshot(started);
        let root = self.dir.root().to_path_buf();
        self.status_task = Some(tokio::task::spawn_blocking(move || {
            if let Err(e) = snapshot.write(&root) {
                warn!(error = %e, "failed to write status files");
            }
        }));
    }

    async fn save_status(&mut self, started: Instant) -> GtResult<()> {
        if let Some(task) = self.status_task.take() {
            let _ = task.await;
        }
        let snapshot = self.snapshot(started);
        let root = self.dir.root().to_path_buf();
        tokio::task::spawn_blocking(move || snapshot.write(&root))
            .await
            .map_err(|e| internal_error!("status writer failed: {e}"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gt_types::{EvaluatorConfig, GtError, SearchConfig, StopConfig, TapeError};
    use serde_json::json;
    use tempfile::tempdir;

    fn config() -> RunConfig {
        RunConfig::new(
            "unit",
            SearchConfig::grid(json!({ "x": ["hp_choice", "x", [1, 2, 3]] })),
            EvaluatorConfig::new("probe", json!({"pointer": "/x"})),
            StopConfig::max(3),
        )
    }

    #[test]
    fn prepare_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let meta = prepare(dir.path(), config(), false).unwrap();
        assert_eq!(meta.config.name, "unit");

        assert!(matches!(
            prepare(dir.path(), config(), false),
            Err(GtError::Run(RunError::AlreadyPrepared { .. }))
        ));
        let again = prepare(dir.path(), config(), true).unwrap();
        assert_ne!(again.run_id, meta.run_id);
    }

    #[test]
    fn prepare_validates_the_space() {
        let dir = tempdir().unwrap();
        let mut bad = config();
        bad.search = SearchConfig::grid(json!({ "x": ["hp_uniform", "x", 2.0, 1.0] }));
        assert!(prepare(dir.path(), bad, false).is_err());
        assert!(!dir.path().join(TAPE_FILE).exists());
    }

    #[test]
    fn checkout_is_read_only_replay() {
        let dir = tempdir().unwrap();
        let meta = prepare(dir.path(), config(), false).unwrap();
        let before = fs::read(dir.path().join(TAPE_FILE)).unwrap();

        let checkout = checkout(dir.path()).unwrap();
        assert_eq!(checkout.meta().run_id, meta.run_id);
        assert_eq!(checkout.state().n_submitted(), 0);
        assert!(checkout.state().tape().path().is_none());
        assert!(checkout.snapshot(5).render().contains("max: 0/3 trials"));

        assert_eq!(fs::read(dir.path().join(TAPE_FILE)).unwrap(), before);
        assert!(RunDir::new(dir.path()).backups().unwrap().is_empty());
    }

    #[test]
    fn status_interval_has_a_floor() {
        let options = RunOptions::new(WorkerCommand::new("/bin/true"))
            .with_status_interval(Duration::ZERO);
        assert_eq!(options.status_interval, MIN_STATUS_INTERVAL);
    }

    #[test]
    fn checkout_of_missing_run_fails() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            checkout(dir.path()),
            Err(GtError::Tape(TapeError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn restore_backs_up_and_rewrites_the_tape() {
        let dir = tempdir().unwrap();
        prepare(dir.path(), config(), false).unwrap();

        let options = RunOptions::new(WorkerCommand::new("/nonexistent/glowtune-worker"));
        let run = Run::restore(dir.path(), options).await.unwrap();
        assert_eq!(run.state().n_submitted(), 0);

        let run_dir = RunDir::new(dir.path());
        assert_eq!(run_dir.backups().unwrap().len(), 1);
        assert!(dir.path().join(TAPE_FILE).exists());
        assert!(!dir.path().join(REPLAY_FILE).exists());
        assert_eq!(
            Tape::restore(dir.path().join(TAPE_FILE)).unwrap().meta.run_id,
            run.meta().run_id
        );
    }

    #[tokio::test]
    async fn restore_recovers_from_an_interrupted_swap() {
        let dir = tempdir().unwrap();
        let meta = prepare(dir.path(), config(), false).unwrap();
        let tape = dir.path().join(TAPE_FILE);
        fs::copy(&tape, dir.path().join(REPLAY_FILE)).unwrap();
        fs::rename(&tape, dir.path().join("tape.20240101T000000.000000.bak.jsonl")).unwrap();

        let options = RunOptions::new(WorkerCommand::new("/nonexistent/glowtune-worker"));
        let run = Run::restore(dir.path(), options).await.unwrap();
        assert_eq!(run.meta().run_id, meta.run_id);
        assert!(tape.exists());
        assert!(!dir.path().join(REPLAY_FILE).exists());
        assert_eq!(RunDir::new(dir.path()).backups().unwrap().len(), 2);
        drop(run);

        assert_eq!(checkout(dir.path()).unwrap().meta().run_id, meta.run_id);
    }

    #[tokio::test]
    async fn backup_keeps_the_old_tape_contents() {
        let dir = tempdir().unwrap();
        prepare(dir.path(), config(), false).unwrap();
        let before = fs::read(dir.path().join(TAPE_FILE)).unwrap();

        let options = RunOptions::new(WorkerCommand::new("/nonexistent/glowtune-worker"));
        let run = Run::restore(dir.path(), options).await.unwrap();
        let backups = RunDir::new(dir.path()).backups().unwrap();
        assert_eq!(fs::read(&backups[0]).unwrap(), before);
        drop(run);
    }
}
