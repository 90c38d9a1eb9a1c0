//! Worker-side half of the evaluation protocol.
//!
//! A worker is a separate process speaking JSON lines over stdin/stdout. The
//! parent sends `init` once, then any number of `evaluate` requests, then
//! `shutdown` (or simply closes stdin). Evaluators run on the worker's main
//! thread; a panic is reported as an error reply and the worker keeps going.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, info, warn};

use gt_types::{
    internal_error, EvalFailure, EvaluatorConfig, GtResult, Outcome, Suggestion, PANIC_KIND,
};

/// Parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Init { evaluator: EvaluatorConfig },
    Evaluate { suggestion: Suggestion },
    Shutdown,
}

/// Worker to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ready,
    InitFailed {
        message: String,
    },
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

impl From<Result<Outcome, EvalFailure>> for Reply {
    fn from(result: Result<Outcome, EvalFailure>) -> Self {
        match result {
            Ok(outcome) => Self::Ok { outcome },
            Err(failure) => Self::Error {
                kind: failure.kind,
                message: failure.message,
                trace: failure.trace,
            },
        }
    }
}

/// Maps a suggestion to an outcome. Built once per worker process.
pub trait Evaluator {
    fn evaluate(&mut self, suggestion: &Suggestion) -> Result<Outcome, EvalFailure>;
}

/// Builds evaluators from their configuration.
pub trait EvaluatorRegistry {
    fn build(&self, config: &EvaluatorConfig) -> Result<Box<dyn Evaluator>, String>;
}

impl<F> EvaluatorRegistry for F
where
    F: Fn(&EvaluatorConfig) -> Result<Box<dyn Evaluator>, String>,
{
    fn build(&self, config: &EvaluatorConfig) -> Result<Box<dyn Evaluator>, String> {
        self(config)
    }
}

/// Serve the protocol until shutdown or end of input.
pub fn serve<R, W>(registry: &dyn EvaluatorRegistry, input: R, mut output: W) -> GtResult<()>
where
    R: BufRead,
    W: Write,
{
    let mut evaluator: Option<Box<dyn Evaluator>> = None;

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = serde_json::from_str(&line)?;

        match request {
            Request::Init { evaluator: config } => match registry.build(&config) {
                Ok(built) => {
                    info!(kind = %config.kind, "evaluator ready");
                    evaluator = Some(built);
                    send(&mut output, &Reply::Ready)?;
                }
                Err(message) => {
                    warn!(kind = %config.kind, %message, "evaluator failed to initialise");
                    send(&mut output, &Reply::InitFailed { message })?;
                    return Ok(());
                }
            },
            Request::Evaluate { suggestion } => {
                let Some(evaluator) = evaluator.as_mut() else {
                    return Err(internal_error!("evaluate request before init"));
                };
                debug!(eid = suggestion.eid().short(), "evaluating");
                let reply = run_guarded(evaluator.as_mut(), &suggestion);
                send(&mut output, &reply)?;
            }
            Request::Shutdown => break,
        }
    }
    debug!("worker exiting");
    Ok(())
}

fn run_guarded(evaluator: &mut dyn Evaluator, suggestion: &Suggestion) -> Reply {
    match panic::catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(suggestion))) {
        Ok(result) => result.into(),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "evaluator panicked".to_string());
            Reply::Error {
                kind: PANIC_KIND.to_string(),
                message,
                trace: String::new(),
            }
        }
    }
}

fn send<W: Write>(output: &mut W, reply: &Reply) -> GtResult<()> {
    let mut line = serde_json::to_vec(reply)?;
    line.push(b'\n');
    output.write_all(&line)?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Square;

    impl Evaluator for Square {
        fn evaluate(&mut self, suggestion: &Suggestion) -> Result<Outcome, EvalFailure> {
            let x = suggestion
                .pointer("/x")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| EvalFailure::new("KeyError", "x missing"))?;
            if x < 0.0 {
                panic!("negative input");
            }
            Ok(Outcome::with_loss(x * x))
        }
    }

    fn registry(config: &EvaluatorConfig) -> Result<Box<dyn Evaluator>, String> {
        match config.kind.as_str() {
            "square" => Ok(Box::new(Square)),
            other => Err(format!("unknown evaluator {other}")),
        }
    }

    fn script(requests: &[Request]) -> String {
        requests
            .iter()
            .map(|r| serde_json::to_string(r).unwrap() + "\n")
            .collect()
    }

    fn replies(output: &[u8]) -> Vec<Reply> {
        String::from_utf8_lossy(output)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn serves_evaluations_and_errors() {
        let input = script(&[
            Request::Init {
                evaluator: EvaluatorConfig::new("square", json!({})),
            },
            Request::Evaluate {
                suggestion: Suggestion::new(json!({"x": 3.0})),
            },
            Request::Evaluate {
                suggestion: Suggestion::new(json!({"y": 1})),
            },
            Request::Evaluate {
                suggestion: Suggestion::new(json!({"x": -1.0})),
            },
            Request::Shutdown,
        ]);
        let mut output = Vec::new();
        serve(&registry, input.as_bytes(), &mut output).unwrap();

        let replies = replies(&output);
        assert_eq!(replies.len(), 4);
        assert_eq!(replies[0], Reply::Ready);
        assert_eq!(
            replies[1],
            Reply::Ok {
                outcome: Outcome::with_loss(9.0)
            }
        );
        assert!(matches!(&replies[2], Reply::Error { kind, .. } if kind == "KeyError"));
        assert!(
            matches!(&replies[3], Reply::Error { kind, message, .. } if kind == PANIC_KIND && message == "negative input")
        );
    }

    #[test]
    fn unknown_evaluator_reports_init_failure() {
        let input = script(&[Request::Init {
            evaluator: EvaluatorConfig::new("nope", json!({})),
        }]);
        let mut output = Vec::new();
        serve(&registry, input.as_bytes(), &mut output).unwrap();
        assert!(matches!(&replies(&output)[0], Reply::InitFailed { .. }));
    }

    #[test]
    fn evaluate_before_init_is_rejected() {
        let input = script(&[Request::Evaluate {
            suggestion: Suggestion::new(json!({"x": 1})),
        }]);
        assert!(serve(&registry, input.as_bytes(), Vec::new()).is_err());
    }

    #[test]
    fn wire_format_is_type_tagged() {
        let text = serde_json::to_string(&Request::Shutdown).unwrap();
        assert_eq!(text, r#"{"type":"shutdown"}"#);
        let reply: Reply =
            serde_json::from_str(r#"{"type":"error","kind":"Timeout","message":"m"}"#).unwrap();
        assert!(matches!(reply, Reply::Error { trace, .. } if trace.is_empty()));
    }
}
