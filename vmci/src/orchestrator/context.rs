//! Shared state of one pipeline run.

use super::layout::RunLayout;
use super::state::{RunEvent, RunState, RunStateMachine, StateTransition};
use crate::artifacts::{ArtifactStore, BaselineBundle, PublishedBundle};
use crate::config::PipelineConfig;
use crate::pipeline::{StageObserver, StageOutcome, StageRecord};
use crate::provision::ProvisionSummary;
use crate::vmm::VmSession;
use crate::workflow::{Scenario, WorkflowOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

/// What the CI runner asked for.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Baseline version tag, or `latest`.
    pub baseline: String,
    pub scenarios: Vec<PathBuf>,
    pub commit: String,
    pub pipeline_id: String,
    /// Where to write the final report, in addition to the run directory.
    pub report_path: Option<PathBuf>,
    pub work_dir: PathBuf,
}

/// Context threaded through every stage task.
///
/// Tasks hold the lock while they use the session, so a cancelled task
/// leaves the session in place for the publish stage to tear down.
pub struct RunContext {
    pub config: PipelineConfig,
    pub request: RunRequest,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub layout: RunLayout,
    pub store: Arc<dyn ArtifactStore>,
    pub scenarios: Vec<Scenario>,
    pub journal: Arc<RunJournal>,

    // Stage outputs
    pub baseline: Option<BaselineBundle>,
    pub session: Option<VmSession>,
    pub provision: Option<ProvisionSummary>,
    pub workflow: Option<WorkflowOutcome>,
    pub published: Option<PublishedBundle>,
    pub warnings: Vec<String>,
}

pub type RunCtx = Arc<tokio::sync::Mutex<RunContext>>;

impl RunContext {
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(run_id = %self.run_id, "{}", message);
        self.warnings.push(message);
    }
}

#[derive(Default)]
struct JournalInner {
    machine: RunStateMachine,
    stages: Vec<StageRecord>,
}

/// Run state and stage history, updated as stages finish.
///
/// Lives outside the context lock so it stays readable while a task runs.
#[derive(Default)]
pub struct RunJournal {
    inner: Mutex<JournalInner>,
}

impl RunJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RunState {
        self.inner.lock().machine.state()
    }

    pub fn history(&self) -> Vec<StateTransition> {
        self.inner.lock().machine.history().to_vec()
    }

    /// Stage records so far, in execution order.
    pub fn stages(&self) -> Vec<StageRecord> {
        self.inner.lock().stages.clone()
    }

    pub fn any_failed(&self) -> bool {
        self.inner
            .lock()
            .stages
            .iter()
            .any(|stage| stage.outcome.is_failure())
    }

    pub fn apply(&self, event: RunEvent) -> RunState {
        let mut inner = self.inner.lock();
        match inner.machine.apply(event) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "Rejected run state event");
                inner.machine.state()
            }
        }
    }
}

impl StageObserver for RunJournal {
    fn stage_started(&self, index: usize, name: &str) {
        tracing::debug!(index, stage = name, state = %self.state(), "Entering stage");
    }

    fn stage_finished(&self, record: &StageRecord) {
        let mut inner = self.inner.lock();
        inner.stages.push(record.clone());

        if inner.machine.state().is_terminal() {
            return;
        }
        let event = match &record.outcome {
            StageOutcome::Success => RunEvent::StageSucceeded,
            StageOutcome::Failure { .. } => RunEvent::StageFailed,
            StageOutcome::Skipped { .. } => return,
        };
        if let Err(e) = inner.machine.apply(event) {
            tracing::error!(stage = %record.name, error = %e, "Rejected run state event");
        }
    }
}
