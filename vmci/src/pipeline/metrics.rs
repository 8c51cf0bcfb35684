use crate::pipeline::StagePolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal result of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Failure {
        reason: String,
        /// Diagnostic output attached to the failure (console log, command output).
        #[serde(skip_serializing_if = "Option::is_none")]
        log: Option<String>,
    },
    /// Never ran because a predecessor failed or the run was cancelled.
    Skipped { reason: String },
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StageOutcome::Failure { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StageOutcome::Skipped { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub index: usize,
    pub name: String,
    pub policy: StagePolicy,
    pub outcome: StageOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub stages: Vec<StageRecord>,
}

impl PipelineMetrics {
    pub fn outcome(&self, name: &str) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .map(|stage| &stage.outcome)
    }

    /// True when every stage succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.stages.iter().all(|stage| stage.outcome.is_success())
    }

    /// First failing stage, if any.
    pub fn first_failure(&self) -> Option<&StageRecord> {
        self.stages.iter().find(|stage| stage.outcome.is_failure())
    }
}
