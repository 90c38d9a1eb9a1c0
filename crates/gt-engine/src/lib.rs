//! # gt-engine
//!
//! Drives a hyperparameter search: records every trial on an append-only
//! tape, evaluates suggestions in isolated worker processes, and restores a
//! run bit-for-bit from its tape after a crash or a deliberate stop.

pub mod pool;
pub mod resultdb;
pub mod run;
pub mod state;
pub mod status;
pub mod stopping;
pub mod tape;
pub mod worker;

pub use pool::{Completion, EvaluationPool, Pending, PoolConfig, WorkerCommand};
pub use resultdb::ResultDb;
pub use run::{checkout, prepare, Checkout, Run, RunDir, RunOptions, RunSummary, StopReason};
pub use state::{ResolvedTrial, State};
pub use status::{StatusSnapshot, TopEntry};
pub use stopping::{build_stopping, StopMax, StoppingPolicy};
pub use tape::{RecordedTape, Tape, TapeEntry};
pub use worker::{serve, Evaluator, EvaluatorRegistry, Reply, Request};
