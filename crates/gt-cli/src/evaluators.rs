//! Evaluators shipped with the `glowtune` binary.
//!
//! * `probe` reads its loss straight out of the suggestion and obeys a few
//!   control fields (`sleep_secs`, `fail_kind`, `panic`, `hang`, `exit`,
//!   `ignore_term`). It exists to exercise the engine end to end.
//! * `command` runs an external program per evaluation: the suggestion is
//!   written to its stdin as JSON, and the last non-empty stdout line is read
//!   back as the outcome (an object with `loss`, or a bare number).

use serde::Deserialize;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use gt_engine::Evaluator;
use gt_types::{EvalFailure, EvaluatorConfig, Outcome, Suggestion};

pub const COMMAND_FAILED_KIND: &str = "CommandFailed";

pub fn build_evaluator(config: &EvaluatorConfig) -> Result<Box<dyn Evaluator>, String> {
    match config.kind.as_str() {
        "probe" => Ok(Box::new(Probe::from_params(&config.params)?)),
        "command" => Ok(Box::new(CommandEvaluator::from_params(&config.params)?)),
        other => Err(format!("unknown evaluator kind '{other}'")),
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: &Value) -> Result<T, String> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| format!("invalid evaluator params: {e}"))
}

#[derive(Debug, Clone, Deserialize)]
struct ProbeParams {
    #[serde(default = "default_pointer")]
    pointer: String,
    /// Every evaluation appends one line here before running.
    #[serde(default)]
    journal: Option<PathBuf>,
}

fn default_pointer() -> String {
    "/x".to_string()
}

#[derive(Debug)]
pub struct Probe {
    params: ProbeParams,
}

impl Probe {
    fn from_params(params: &Value) -> Result<Self, String> {
        let params: ProbeParams = parse_params(params)?;
        if !params.pointer.is_empty() && !params.pointer.starts_with('/') {
            return Err(format!("pointer '{}' must start with '/'", params.pointer));
        }
        Ok(Self { params })
    }

    fn record(&self, suggestion: &Suggestion) -> Result<(), EvalFailure> {
        let Some(path) = &self.params.journal else {
            return Ok(());
        };
        let line = serde_json::json!({
            "eid": suggestion.eid(),
            "pid": std::process::id(),
        });
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{line}"))
            .map_err(|e| EvalFailure::new("JournalError", e.to_string()))
    }
}

impl Evaluator for Probe {
    fn evaluate(&mut self, suggestion: &Suggestion) -> Result<Outcome, EvalFailure> {
        self.record(suggestion)?;
        let started = Instant::now();

        if suggestion.pointer("/ignore_term") == Some(&Value::Bool(true)) {
            ignore_sigterm();
        }
        if let Some(secs) = suggestion.pointer("/sleep_secs").and_then(Value::as_f64) {
            thread::sleep(Duration::from_secs_f64(secs.max(0.0)));
        }
        if suggestion.pointer("/hang") == Some(&Value::Bool(true)) {
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }
        if let Some(code) = suggestion.pointer("/exit").and_then(Value::as_i64) {
            std::process::exit(code as i32);
        }
        if suggestion.pointer("/panic") == Some(&Value::Bool(true)) {
            panic!("probe asked to panic");
        }
        if let Some(kind) = suggestion.pointer("/fail_kind").and_then(Value::as_str) {
            return Err(EvalFailure::new(kind, "probe asked to fail"));
        }

        let loss = suggestion
            .pointer(&self.params.pointer)
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                EvalFailure::new(
                    "KeyError",
                    format!("no numeric value at {}", self.params.pointer),
                )
            })?;
        Ok(Outcome::with_loss(loss).with("duration", started.elapsed().as_secs_f64()))
    }
}

#[cfg(unix)]
fn ignore_sigterm() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // SAFETY: installs the ignore disposition; no handler code runs.
    let _ = unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) };
}

#[cfg(not(unix))]
fn ignore_sigterm() {}

#[derive(Debug, Clone, Deserialize)]
struct CommandParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug)]
pub struct CommandEvaluator {
    params: CommandParams,
}

impl CommandEvaluator {
    fn from_params(params: &Value) -> Result<Self, String> {
        let params: CommandParams = parse_params(params)?;
        if params.program.trim().is_empty() {
            return Err("command evaluator needs a program".to_string());
        }
        Ok(Self { params })
    }
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&mut self, suggestion: &Suggestion) -> Result<Outcome, EvalFailure> {
        let started = Instant::now();
        let fail = |message: String| EvalFailure::new(COMMAND_FAILED_KIND, message);

        let mut child = Command::new(&self.params.program)
            .args(&self.params.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| fail(format!("failed to start {}: {e}", self.params.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = serde_json::to_vec(suggestion)
                .map_err(|e| fail(format!("failed to encode suggestion: {e}")))?;
            // A program may exit without reading its input.
            if let Err(e) = stdin.write_all(&input) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(fail(format!("failed to write suggestion: {e}")));
                }
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| fail(format!("failed to wait for command: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!("command exited with {}", output.status))
                .with_trace(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| fail("command produced no output".to_string()))?;
        let mut outcome = parse_outcome(last).map_err(fail)?;
        if outcome.get("duration").is_none() {
            outcome.insert("duration", started.elapsed().as_secs_f64());
        }
        Ok(outcome)
    }
}

fn parse_outcome(line: &str) -> Result<Outcome, String> {
    let value: Value =
        serde_json::from_str(line.trim()).map_err(|e| format!("unparseable output '{line}': {e}"))?;
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(Outcome::with_loss)
            .ok_or_else(|| format!("loss {n} is not representable")),
        other => Outcome::try_from(other).map_err(|v| format!("expected an object, got {v}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn probe(params: Value) -> Box<dyn Evaluator> {
        build_evaluator(&EvaluatorConfig::new("probe", params)).unwrap()
    }

    #[test]
    fn probe_reads_loss_at_pointer() {
        let mut evaluator = probe(json!({"pointer": "/model/alpha"}));
        let outcome = evaluator
            .evaluate(&Suggestion::new(json!({"model": {"alpha": 0.25}})))
            .unwrap();
        assert_eq!(outcome.loss(), Some(0.25));
        assert!(outcome.get("duration").is_some());

        let failure = evaluator
            .evaluate(&Suggestion::new(json!({"model": {}})))
            .unwrap_err();
        assert_eq!(failure.kind, "KeyError");
    }

    #[test]
    fn probe_fails_on_request() {
        let mut evaluator = probe(Value::Null);
        let failure = evaluator
            .evaluate(&Suggestion::new(json!({"x": 1, "fail_kind": "ValueError"})))
            .unwrap_err();
        assert_eq!(failure.kind, "ValueError");
    }

    #[test]
    fn probe_journals_each_call() {
        let dir = tempdir().unwrap();
        let journal = dir.path().join("journal.jsonl");
        let mut evaluator = probe(json!({"journal": journal}));
        evaluator.evaluate(&Suggestion::new(json!({"x": 1}))).unwrap();
        evaluator.evaluate(&Suggestion::new(json!({"x": 1}))).unwrap();

        let lines = std::fs::read_to_string(&journal).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[test]
    fn registry_rejects_bad_configs() {
        assert!(build_evaluator(&EvaluatorConfig::new("nope", json!({}))).is_err());
        assert!(build_evaluator(&EvaluatorConfig::new("probe", json!({"pointer": "x"}))).is_err());
        assert!(build_evaluator(&EvaluatorConfig::new("command", json!({}))).is_err());
    }

    #[test]
    fn outcome_parsing() {
        assert_eq!(parse_outcome("1.5").unwrap().loss(), Some(1.5));
        let outcome = parse_outcome(r#"{"loss": 2, "acc": 0.9}"#).unwrap();
        assert_eq!(outcome.loss(), Some(2.0));
        assert!(parse_outcome("[1]").is_err());
        assert!(parse_outcome("loss=1").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_evaluator_uses_last_line() {
        let mut evaluator = build_evaluator(&EvaluatorConfig::new(
            "command",
            json!({"program": "sh", "args": ["-c", "cat > /dev/null; echo warming up; echo '{\"loss\": 0.5}'"]}),
        ))
        .unwrap();
        let outcome = evaluator.evaluate(&Suggestion::new(json!({"x": 1}))).unwrap();
        assert_eq!(outcome.loss(), Some(0.5));

        let mut failing = build_evaluator(&EvaluatorConfig::new(
            "command",
            json!({"program": "sh", "args": ["-c", "echo broken >&2; exit 3"]}),
        ))
        .unwrap();
        let failure = failing.evaluate(&Suggestion::new(json!({"x": 1}))).unwrap_err();
        assert_eq!(failure.kind, COMMAND_FAILED_KIND);
        assert_eq!(failure.trace, "broken");
    }
}
