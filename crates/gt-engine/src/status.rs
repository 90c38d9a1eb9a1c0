use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use gt_types::{Eid, GtResult, Outcome, RunId, Suggestion, Tid};

use crate::state::State;

pub const STATUS_FILE: &str = "status.txt";
pub const TOP_FILE: &str = "top.json";

#[derive(Debug, Clone, Serialize)]
pub struct TopEntry {
    pub rank: usize,
    pub tid: Tid,
    pub eid: Eid,
    pub loss: f64,
    pub suggestion: Suggestion,
    pub outcome: Outcome,
}

/// Everything written to the status files, captured on the run loop so the
/// write itself can happen elsewhere.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub run_name: String,
    pub run_id: RunId,
    pub updated_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub search: String,
    pub search_done: bool,
    pub stopping: String,
    pub report: String,
    pub errors: Vec<(String, usize)>,
    pub top: Vec<TopEntry>,
}

impl StatusSnapshot {
    pub fn capture(
        state: &State,
        run_name: &str,
        run_id: RunId,
        stopping: String,
        elapsed: Duration,
        top_n: usize,
    ) -> Self {
        let top = state
            .top_trials(top_n)
            .into_iter()
            .enumerate()
            .filter_map(|(index, trial)| {
                let outcome = trial.result.outcome()?.clone();
                Some(TopEntry {
                    rank: index + 1,
                    tid: trial.tid,
                    eid: trial.eid.clone(),
                    loss: outcome.loss()?,
                    suggestion: trial.suggestion.clone(),
                    outcome,
                })
            })
            .collect();

        Self {
            run_name: run_name.to_string(),
            run_id,
            updated_at: Utc::now(),
            elapsed_secs: elapsed.as_secs_f64(),
            search: state.search_name().to_string(),
            search_done: state.search_done(),
            stopping,
            report: state.short_report(),
            errors: state.error_histogram().into_iter().collect(),
            top,
        }
    }

    pub fn render(&self) -> String {
        let mut text = String::new();
        text.push_str(&format!("run:      {} ({})\n", self.run_name, self.run_id));
        text.push_str(&format!(
            "updated:  {} (elapsed {:.1}s)\n",
            self.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.elapsed_secs
        ));
        text.push_str(&format!(
            "search:   {}{}\n",
            self.search,
            if self.search_done { " (done)" } else { "" }
        ));
        text.push_str(&format!("stopping: {}\n", self.stopping));
        text.push_str(&format!("trials:   {}\n", self.report));

        if !self.errors.is_empty() {
            text.push_str("errors:\n");
            for (kind, count) in &self.errors {
                text.push_str(&format!("  {kind}: {count}\n"));
            }
        }
        if !self.top.is_empty() {
            text.push_str("top:\n");
            for entry in &self.top {
                text.push_str(&format!(
                    "  #{:<3} loss={:.6} tid={} eid={} {}\n",
                    entry.rank,
                    entry.loss,
                    entry.tid,
                    entry.eid.short(),
                    entry.suggestion
                ));
            }
        }
        text
    }

    /// Replace the status files in `dir`.
    pub fn write(&self, dir: &Path) -> GtResult<()> {
        write_atomic(&dir.join(STATUS_FILE), self.render().as_bytes())?;
        write_atomic(&dir.join(TOP_FILE), &serde_json::to_vec_pretty(&self.top)?)?;
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> GtResult<()> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
