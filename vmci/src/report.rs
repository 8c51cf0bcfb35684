//! Structured run report.

use crate::artifacts::Verdict;
use crate::orchestrator::{RunContext, RunState, StateTransition};
use crate::pipeline::{StageOutcome, StageRecord};
use crate::util::fs::atomic_write_json;
use crate::workflow::{OperationCounts, OperationStatus, ScenarioResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use vmci_shared::VmciResult;

/// Everything a run did, in the order it happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline_id: String,
    pub commit: String,
    /// Baseline as requested (`latest` or a tag).
    pub baseline: String,
    /// Baseline tag actually fetched.
    pub baseline_tag: Option<String>,
    pub state: RunState,
    pub verdict: Verdict,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub transitions: Vec<StateTransition>,
    pub stages: Vec<StageRecord>,
    pub scenarios: Vec<ScenarioResult>,
    pub counts: OperationCounts,
    pub published_tag: Option<String>,
    pub warnings: Vec<String>,
    pub run_dir: PathBuf,
}

impl RunReport {
    /// Snapshot the run as it stands.
    pub fn from_context(ctx: &RunContext, verdict: Verdict) -> Self {
        let finished_at = Utc::now();
        let (scenarios, counts) = match &ctx.workflow {
            Some(outcome) => (outcome.scenarios.clone(), outcome.counts()),
            None => (Vec::new(), OperationCounts::default()),
        };

        Self {
            run_id: ctx.run_id.clone(),
            pipeline_id: ctx.request.pipeline_id.clone(),
            commit: ctx.request.commit.clone(),
            baseline: ctx.request.baseline.clone(),
            baseline_tag: ctx.baseline.as_ref().map(|b| b.tag.clone()),
            state: ctx.journal.state(),
            verdict,
            started_at: ctx.started_at,
            finished_at,
            duration_ms: (finished_at - ctx.started_at).num_milliseconds(),
            transitions: ctx.journal.history(),
            stages: ctx.journal.stages(),
            scenarios,
            counts,
            published_tag: ctx.published.as_ref().map(|p| p.tag.clone()),
            warnings: ctx.warnings.clone(),
            run_dir: ctx.layout.root().to_path_buf(),
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict.is_passed()
    }

    /// Process exit code for the CI runner.
    pub fn exit_code(&self) -> i32 {
        if self.passed() { 0 } else { 1 }
    }

    pub fn to_json(&self) -> VmciResult<Vec<u8>> {
        let mut data = serde_json::to_vec_pretty(self)?;
        data.push(b'\n');
        Ok(data)
    }

    pub fn write(&self, path: &Path) -> VmciResult<()> {
        atomic_write_json(path, self)
    }

    /// Human-readable summary for the CI log.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "run {} ({} @ {}): {}",
            self.run_id, self.pipeline_id, self.commit, self.verdict
        );
        let _ = writeln!(
            out,
            "  baseline: {}",
            self.baseline_tag.as_deref().unwrap_or(&self.baseline)
        );
        for stage in &self.stages {
            let status = match &stage.outcome {
                StageOutcome::Success => "ok".to_string(),
                StageOutcome::Failure { reason, .. } => format!("FAILED: {}", reason),
                StageOutcome::Skipped { reason } => format!("skipped ({})", reason),
            };
            let _ = writeln!(out, "  {:<10} {:>7}ms  {}", stage.name, stage.duration_ms, status);
        }
        let c = &self.counts;
        let _ = writeln!(
            out,
            "  operations: {} total, {} passed, {} failed, {} errored, {} skipped",
            c.total, c.passed, c.failed, c.errored, c.skipped
        );
        for scenario in &self.scenarios {
            for op in &scenario.operations {
                if matches!(op.status, OperationStatus::Pass | OperationStatus::Skipped) {
                    continue;
                }
                let _ = writeln!(
                    out,
                    "    {}/{}: {} {}",
                    scenario.name,
                    op.id,
                    op.status.as_str(),
                    op.error.as_deref().unwrap_or("")
                );
                for diff in &op.diffs {
                    let _ = writeln!(
                        out,
                        "      {}: expected {} got {}",
                        diff.field, diff.expected, diff.actual
                    );
                }
            }
        }
        match &self.published_tag {
            Some(tag) => {
                let _ = writeln!(out, "  published: {}", tag);
            }
            None => {
                let _ = writeln!(out, "  published: none");
            }
        }
        for warning in &self.warnings {
            let _ = writeln!(out, "  warning: {}", warning);
        }
        out
    }
}
