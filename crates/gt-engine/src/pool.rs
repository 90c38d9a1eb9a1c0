//! Process-isolated evaluation pool.
//!
//! Each of `max_workers` slots is a tokio task owning at most one worker
//! child process, started lazily and restarted after a timeout or crash.
//! Jobs are deduplicated by eid twice over: results already in the
//! [`ResultDb`] short-circuit to a cached completion, and a second request
//! for an eid that is still being evaluated waits on the first one.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use gt_types::{
    internal_error, Eid, EvalFailure, EvalResult, EvaluationError, EvaluatorConfig, GtResult,
    Outcome, Suggestion, TIMEOUT_KIND, WORKER_CRASHED_KIND,
};

use crate::resultdb::ResultDb;
use crate::worker::{Reply, Request};

/// Reported when a worker cannot be started or rejects the evaluator.
pub const WORKER_STARTUP_KIND: &str = "WorkerStartup";
/// Reported when an evaluator returns an outcome without a numeric loss.
pub const INVALID_OUTCOME_KIND: &str = "InvalidOutcome";

/// Environment variable naming an alternative worker executable.
pub const WORKER_ENV: &str = "GLOWTUNE_WORKER";

/// How worker processes are launched.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `<current executable> worker`, unless `GLOWTUNE_WORKER` names another
    /// program (which is then run with the same `worker` argument).
    pub fn current_exe() -> GtResult<Self> {
        let program = match std::env::var_os(WORKER_ENV) {
            Some(program) => PathBuf::from(program),
            None => std::env::current_exe()?,
        };
        Ok(Self::new(program).arg("worker"))
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub trial_timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL for a stuck worker's process group.
    pub kill_grace: Duration,
    pub startup_timeout: Duration,
    pub caught_error_kinds: Vec<String>,
    pub evaluator: EvaluatorConfig,
    pub worker: WorkerCommand,
}

impl PoolConfig {
    pub fn new(evaluator: EvaluatorConfig, worker: WorkerCommand) -> Self {
        Self {
            max_workers: 1,
            trial_timeout: None,
            kill_grace: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(60),
            caught_error_kinds: vec![TIMEOUT_KIND.to_string(), WORKER_CRASHED_KIND.to_string()],
            evaluator,
            worker,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_trial_timeout(mut self, trial_timeout: Option<Duration>) -> Self {
        self.trial_timeout = trial_timeout;
        self
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn with_caught_error_kinds(mut self, kinds: Vec<String>) -> Self {
        self.caught_error_kinds = kinds;
        self
    }
}

type Evaluation = Result<Outcome, EvalFailure>;
type Waiters = Arc<parking_lot::Mutex<HashMap<Eid, Vec<oneshot::Sender<Evaluation>>>>>;

#[derive(Debug)]
struct Job {
    eid: Eid,
    suggestion: Suggestion,
}

#[derive(Debug)]
enum Delivery {
    Cached(EvalResult),
    Evaluated(Evaluation),
    Abandoned,
}

/// A finished job, to be classified by [`EvaluationPool::finish`].
#[derive(Debug)]
pub struct Completion {
    eid: Eid,
    suggestion: Suggestion,
    delivery: Delivery,
}

impl Completion {
    pub fn eid(&self) -> &Eid {
        &self.eid
    }

    pub fn suggestion(&self) -> &Suggestion {
        &self.suggestion
    }

    /// True when the result came from the result database.
    pub fn is_cached(&self) -> bool {
        matches!(self.delivery, Delivery::Cached(_))
    }
}

#[derive(Debug)]
enum PendingState {
    Ready(Option<EvalResult>),
    Waiting(oneshot::Receiver<Evaluation>),
}

/// Future returned by [`EvaluationPool::schedule`].
#[derive(Debug)]
pub struct Pending {
    eid: Eid,
    suggestion: Suggestion,
    state: PendingState,
}

impl Pending {
    pub fn eid(&self) -> &Eid {
        &self.eid
    }
}

impl Future for Pending {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let delivery = match &mut this.state {
            PendingState::Ready(result) => match result.take() {
                Some(result) => Delivery::Cached(result),
                None => Delivery::Abandoned,
            },
            PendingState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(evaluation)) => Delivery::Evaluated(evaluation),
                Poll::Ready(Err(_)) => Delivery::Abandoned,
                Poll::Pending => return Poll::Pending,
            },
        };
        Poll::Ready(Completion {
            eid: this.eid.clone(),
            suggestion: this.suggestion.clone(),
            delivery,
        })
    }
}

struct Shared {
    config: PoolConfig,
    waiters: Waiters,
    closing: AtomicBool,
}

pub struct EvaluationPool {
    shared: Arc<Shared>,
    db: ResultDb,
    jobs: Option<mpsc::UnboundedSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl EvaluationPool {
    /// Start the worker slots. Must be called inside a tokio runtime; child
    /// processes are only spawned once work arrives.
    pub fn new(config: PoolConfig, db: ResultDb) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let max_workers = config.max_workers.max(1);
        let shared = Arc::new(Shared {
            config,
            waiters: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            closing: AtomicBool::new(false),
        });

        let workers = (0..max_workers)
            .map(|slot| tokio::spawn(worker_slot(slot, shared.clone(), rx.clone())))
            .collect();
        info!(max_workers, program = %shared.config.worker.program.display(), "evaluation pool started");

        Self {
            shared,
            db,
            jobs: Some(tx),
            workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn db(&self) -> &ResultDb {
        &self.db
    }

    pub fn is_caught(&self, kind: &str) -> bool {
        kind == TIMEOUT_KIND || self.shared.config.caught_error_kinds.iter().any(|k| k == kind)
    }

    /// Queue a suggestion for evaluation.
    pub fn schedule(&self, suggestion: Suggestion) -> GtResult<Pending> {
        let eid = suggestion.eid();
        if let Some(result) = self.db.get(&eid) {
            debug!(eid = eid.short(), "result cached");
            return Ok(Pending {
                eid,
                suggestion,
                state: PendingState::Ready(Some(result)),
            });
        }

        let jobs = self.jobs.as_ref().ok_or(EvaluationError::PoolClosed)?;
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut waiters = self.shared.waiters.lock();
            let queue = waiters.entry(eid.clone()).or_default();
            queue.push(tx);
            queue.len() == 1
        };

        if first {
            jobs.send(Job {
                eid: eid.clone(),
                suggestion: suggestion.clone(),
            })
            .map_err(|_| EvaluationError::PoolClosed)?;
        } else {
            debug!(eid = eid.short(), "joined in-flight evaluation");
        }

        Ok(Pending {
            eid,
            suggestion,
            state: PendingState::Waiting(rx),
        })
    }

    /// Classify a completion and record it.
    ///
    /// Caught failures become error results; anything else is returned as
    /// [`EvaluationError::Uncaught`] and must end the run.
    pub fn finish(&self, completion: Completion) -> GtResult<EvalResult> {
        let Completion {
            eid,
            suggestion,
            delivery,
        } = completion;

        let result = match delivery {
            Delivery::Cached(result) => return Ok(result),
            Delivery::Abandoned => return Err(EvaluationError::Abandoned { eid }.into()),
            Delivery::Evaluated(Ok(outcome)) if outcome.loss().is_some() => EvalResult::ok(outcome),
            Delivery::Evaluated(Ok(outcome)) => self.classify(
                &suggestion,
                EvalFailure::new(
                    INVALID_OUTCOME_KIND,
                    format!(
                        "outcome has no numeric loss: {}",
                        serde_json::Value::Object(outcome.as_map().clone())
                    ),
                ),
            )?,
            Delivery::Evaluated(Err(failure)) => self.classify(&suggestion, failure)?,
        };

        self.db.submit(eid, result.clone());
        Ok(result)
    }

    fn classify(&self, suggestion: &Suggestion, failure: EvalFailure) -> GtResult<EvalResult> {
        if self.is_caught(&failure.kind) {
            warn!(
                eid = suggestion.eid().short(),
                kind = %failure.kind,
                message = %failure.message,
                "evaluation failed"
            );
            return Ok(failure.into());
        }
        error!(
            kind = %failure.kind,
            message = %failure.message,
            trace = %failure.trace,
            suggestion = %suggestion,
            "uncaught evaluation error"
        );
        Err(EvaluationError::Uncaught {
            kind: failure.kind,
            message: failure.message,
            trace: failure.trace,
            suggestion: suggestion.to_string(),
        }
        .into())
    }

    /// Schedule, wait and finish in one call.
    pub async fn evaluate(&self, suggestion: Suggestion) -> GtResult<EvalResult> {
        let pending = self.schedule(suggestion)?;
        self.finish(pending.await)
    }

    /// Stop accepting work, abandon queued jobs and stop every worker.
    ///
    /// Slots get `grace` to finish what they are doing before being aborted;
    /// aborting a slot kills its child process.
    pub async fn shutdown(&mut self, grace: Duration) {
        if self.jobs.take().is_none() && self.workers.is_empty() {
            return;
        }
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.waiters.lock().clear();

        let deadline = Instant::now() + grace;
        for mut handle in self.workers.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut handle).await.is_err() {
                warn!("worker slot did not stop in time, aborting");
                handle.abort();
            }
        }
        info!("evaluation pool stopped");
    }
}

impl Drop for EvaluationPool {
    fn drop(&mut self) {
        for handle in &self.workers {
            handle.abort();
        }
    }
}

async fn worker_slot(
    slot: usize,
    shared: Arc<Shared>,
    jobs: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
) {
    let mut process: Option<WorkerProcess> = None;

    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else { break };

        if shared.closing.load(Ordering::SeqCst) {
            shared.waiters.lock().remove(&job.eid);
            continue;
        }

        let evaluation = run_job(slot, &shared.config, &mut process, &job).await;
        let waiters = shared.waiters.lock().remove(&job.eid).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(evaluation.clone());
        }
    }

    if let Some(process) = process.take() {
        process.close(shared.config.kill_grace).await;
    }
    debug!(slot, "worker slot finished");
}

async fn run_job(
    slot: usize,
    config: &PoolConfig,
    process: &mut Option<WorkerProcess>,
    job: &Job,
) -> Evaluation {
    let mut worker = match process.take() {
        Some(worker) => worker,
        None => match WorkerProcess::spawn(slot, config).await {
            Ok(worker) => worker,
            Err(e) => {
                error!(slot, error = %e, "worker failed to start");
                return Err(EvalFailure::new(WORKER_STARTUP_KIND, e.to_string()));
            }
        },
    };

    let started = Instant::now();
    match worker.evaluate(&job.suggestion, config.trial_timeout).await {
        Ok(evaluation) => {
            debug!(slot, eid = job.eid.short(), elapsed = ?started.elapsed(), "evaluation returned");
            *process = Some(worker);
            evaluation
        }
        Err(WorkerFault::Timeout(limit)) => {
            warn!(slot, eid = job.eid.short(), ?limit, "evaluation timed out, restarting worker");
            worker.terminate(config.kill_grace).await;
            Err(EvalFailure::new(
                TIMEOUT_KIND,
                format!("evaluation exceeded {:.3}s", limit.as_secs_f64()),
            ))
        }
        Err(WorkerFault::Crashed(message)) => {
            warn!(slot, eid = job.eid.short(), %message, "worker crashed, restarting");
            worker.terminate(config.kill_grace).await;
            Err(EvalFailure::new(WORKER_CRASHED_KIND, message))
        }
    }
}

#[derive(Debug)]
enum WorkerFault {
    Timeout(Duration),
    Crashed(String),
}

struct WorkerProcess {
    slot: usize,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerProcess {
    async fn spawn(slot: usize, config: &PoolConfig) -> GtResult<Self> {
        let mut command = Command::new(&config.worker.program);
        command
            .args(&config.worker.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Own process group, so programs the evaluator starts are signalled too.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|e| EvaluationError::WorkerStartup {
                message: format!("{}: {e}", config.worker.program.display()),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| internal_error!("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| internal_error!("worker stdout not captured"))?;

        let mut worker = Self {
            slot,
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };
        worker
            .send(&Request::Init {
                evaluator: config.evaluator.clone(),
            })
            .await?;

        let reply = timeout(config.startup_timeout, worker.recv())
            .await
            .map_err(|_| EvaluationError::WorkerStartup {
                message: format!("no ready reply within {:?}", config.startup_timeout),
            })??;

        match reply {
            Some(Reply::Ready) => {
                info!(slot, pid = ?worker.child.id(), "worker ready");
                Ok(worker)
            }
            Some(Reply::InitFailed { message }) => {
                Err(EvaluationError::WorkerStartup { message }.into())
            }
            Some(other) => Err(EvaluationError::WorkerStartup {
                message: format!("unexpected reply to init: {other:?}"),
            }
            .into()),
            None => Err(EvaluationError::WorkerStartup {
                message: "worker exited during init".to_string(),
            }
            .into()),
        }
    }

    async fn send(&mut self, request: &Request) -> GtResult<()> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> GtResult<Option<Reply>> {
        match self.stdout.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }

    async fn evaluate(
        &mut self,
        suggestion: &Suggestion,
        limit: Option<Duration>,
    ) -> Result<Evaluation, WorkerFault> {
        let request = Request::Evaluate {
            suggestion: suggestion.clone(),
        };
        if let Err(e) = self.send(&request).await {
            return Err(WorkerFault::Crashed(format!("could not reach worker: {e}")));
        }

        let reply = match limit {
            Some(limit) => timeout(limit, self.recv())
                .await
                .map_err(|_| WorkerFault::Timeout(limit))?,
            None => self.recv().await,
        };

        match reply {
            Ok(Some(Reply::Ok { outcome })) => Ok(Ok(outcome)),
            Ok(Some(Reply::Error {
                kind,
                message,
                trace,
            })) => Ok(Err(EvalFailure::new(kind, message).with_trace(trace))),
            Ok(Some(other)) => Err(WorkerFault::Crashed(format!("unexpected reply: {other:?}"))),
            Ok(None) => {
                let status = self.child.try_wait().ok().flatten();
                Err(WorkerFault::Crashed(match status {
                    Some(status) => format!("worker exited mid-evaluation ({status})"),
                    None => "worker closed its output mid-evaluation".to_string(),
                }))
            }
            Err(e) => Err(WorkerFault::Crashed(format!("bad reply from worker: {e}"))),
        }
    }

    /// SIGTERM to the worker's process group, then SIGKILL once `grace` is
    /// up. Descendants that outlive the worker are killed either way.
    async fn terminate(mut self, grace: Duration) {
        let group = self.child.id();
        signal_group(group, GroupSignal::Terminate);
        if timeout(grace, self.child.wait()).await.is_err() {
            warn!(slot = self.slot, "worker ignored SIGTERM, killing");
        }
        signal_group(group, GroupSignal::Kill);
        if self.child.id().is_some() {
            if let Err(e) = self.child.kill().await {
                warn!(slot = self.slot, error = %e, "failed to kill worker");
            }
        }
    }

    /// Ask the worker to exit, escalating if it does not.
    async fn close(mut self, grace: Duration) {
        if self.send(&Request::Shutdown).await.is_ok()
            && timeout(grace, self.child.wait()).await.is_ok()
        {
            return;
        }
        self.terminate(grace).await;
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // An aborted slot leaves no part of the group behind.
        signal_group(self.child.id(), GroupSignal::Kill);
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal every process in the group led by a worker. Groups that are
/// already gone are ignored.
#[cfg(unix)]
fn signal_group(leader: Option<u32>, signal: GroupSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = leader.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pid, ?signal, error = %e, "failed to signal worker group"),
    }
}

#[cfg(not(unix))]
fn signal_group(_leader: Option<u32>, _signal: GroupSignal) {}

#[cfg(test)]
mod tests {
    use super::*;
    use gt_types::{GtError, Outcome};
    use serde_json::json;

    fn config(program: &str) -> PoolConfig {
        PoolConfig::new(
            EvaluatorConfig::new("probe", json!({})),
            WorkerCommand::new(program),
        )
        .with_max_workers(2)
    }

    #[tokio::test]
    async fn cached_results_skip_the_workers() {
        let db = ResultDb::new();
        let suggestion = Suggestion::new(json!({"x": 1}));
        db.submit(suggestion.eid(), EvalResult::ok(Outcome::with_loss(0.25)));

        let mut pool = EvaluationPool::new(config("/nonexistent/glowtune-worker"), db);
        let completion = pool.schedule(suggestion).unwrap().await;
        assert!(completion.is_cached());
        assert_eq!(pool.finish(completion).unwrap().loss(), Some(0.25));
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unstartable_worker_is_uncaught() {
        let mut pool = EvaluationPool::new(config("/nonexistent/glowtune-worker"), ResultDb::new());
        let result = pool.evaluate(Suggestion::new(json!({"x": 2}))).await;

        match result {
            Err(GtError::Evaluation(EvaluationError::Uncaught { kind, .. })) => {
                assert_eq!(kind, WORKER_STARTUP_KIND)
            }
            other => panic!("expected uncaught startup failure, got {other:?}"),
        }
        assert!(pool.db().is_empty());
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn duplicate_requests_share_one_job() {
        let mut pool = EvaluationPool::new(config("/nonexistent/glowtune-worker"), ResultDb::new());
        let suggestion = Suggestion::new(json!({"x": 3}));
        let first = pool.schedule(suggestion.clone()).unwrap();
        let second = pool.schedule(suggestion).unwrap();

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.eid(), b.eid());
        assert!(!a.is_cached() && !b.is_cached());
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn timeout_is_always_caught() {
        let pool = EvaluationPool::new(
            config("/nonexistent/glowtune-worker").with_caught_error_kinds(Vec::new()),
            ResultDb::new(),
        );
        assert!(pool.is_caught(TIMEOUT_KIND));
        assert!(!pool.is_caught(WORKER_CRASHED_KIND));
    }

    #[tokio::test]
    async fn schedule_after_shutdown_fails() {
        let mut pool = EvaluationPool::new(config("/nonexistent/glowtune-worker"), ResultDb::new());
        pool.shutdown(Duration::from_millis(100)).await;
        assert!(matches!(
            pool.schedule(Suggestion::new(json!({}))),
            Err(GtError::Evaluation(EvaluationError::PoolClosed))
        ));
    }

    #[test]
    fn worker_command_builder() {
        let command = WorkerCommand::new("/bin/worker").arg("worker").arg("--quiet");
        assert_eq!(command.args, vec!["worker", "--quiet"]);
    }
}
