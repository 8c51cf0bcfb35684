//! Runs scenarios against the live VM, one operation at a time.

use super::scenario::{Operation, Scenario};
use crate::config::AssertionPolicy;
use crate::harness_client::HarnessClient;
use crate::logs::StageLog;
use crate::vmm::VmSession;
use serde::{Deserialize, Serialize};
use vmci_shared::{
    ExecutionRecord, FieldDiff, HarnessVerdict, Identity, OperationKind, ResultRecord, VmciError,
    VmciResult, evaluate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pass,
    /// Ran, but the result did not match the expectation.
    Fail,
    /// Could not be executed (timeout, launch failure, setup failure).
    Error,
    Skipped,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pass => "pass",
            OperationStatus::Fail => "fail",
            OperationStatus::Error => "error",
            OperationStatus::Skipped => "skipped",
        }
    }
}

impl From<HarnessVerdict> for OperationStatus {
    fn from(verdict: HarnessVerdict) -> Self {
        match verdict {
            HarnessVerdict::Pass => OperationStatus::Pass,
            HarnessVerdict::Fail => OperationStatus::Fail,
            HarnessVerdict::Error => OperationStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub id: String,
    pub kind: OperationKind,
    pub identity: Identity,
    pub status: OperationStatus,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diffs: Vec<FieldDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl OperationResult {
    fn from_record(operation: &Operation, record: ResultRecord) -> Self {
        Self {
            id: operation.id.clone(),
            kind: operation.kind,
            identity: operation.identity,
            status: record.verdict.into(),
            exit_code: record.exit_code,
            diffs: record.diffs,
            error: record.error,
            duration_ms: record.duration_ms,
        }
    }

    fn failed(operation: &Operation, error: impl Into<String>) -> Self {
        Self {
            id: operation.id.clone(),
            kind: operation.kind,
            identity: operation.identity,
            status: OperationStatus::Error,
            exit_code: None,
            diffs: Vec::new(),
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    fn skipped(operation: &Operation, reason: impl Into<String>) -> Self {
        Self {
            id: operation.id.clone(),
            kind: operation.kind,
            identity: operation.identity,
            status: OperationStatus::Skipped,
            exit_code: None,
            diffs: Vec::new(),
            error: Some(reason.into()),
            duration_ms: 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == OperationStatus::Pass
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub operations: Vec<OperationResult>,
}

impl ScenarioResult {
    pub fn passed(&self) -> bool {
        self.operations.iter().all(OperationResult::passed)
    }
}

/// Operation counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub scenarios: Vec<ScenarioResult>,
}

impl WorkflowOutcome {
    pub fn operations(&self) -> impl Iterator<Item = (&ScenarioResult, &OperationResult)> {
        self.scenarios
            .iter()
            .flat_map(|s| s.operations.iter().map(move |op| (s, op)))
    }

    pub fn counts(&self) -> OperationCounts {
        let mut counts = OperationCounts::default();
        for (_, op) in self.operations() {
            counts.total += 1;
            match op.status {
                OperationStatus::Pass => counts.passed += 1,
                OperationStatus::Fail => counts.failed += 1,
                OperationStatus::Error => counts.errored += 1,
                OperationStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// True iff every operation of every scenario passed.
    pub fn all_passed(&self) -> bool {
        self.scenarios.iter().all(ScenarioResult::passed)
    }
}

/// Everything a workflow run produced.
///
/// `fatal` is set when the session broke mid-run; `outcome` still holds
/// every result recorded up to that point.
#[derive(Debug)]
pub struct WorkflowRun {
    pub outcome: WorkflowOutcome,
    pub fatal: Option<VmciError>,
}

pub struct WorkflowExecutor {
    harness: HarnessClient,
    policy: AssertionPolicy,
}

impl WorkflowExecutor {
    pub fn new(harness: HarnessClient, policy: AssertionPolicy) -> Self {
        Self { harness, policy }
    }

    /// Run every scenario in order.
    ///
    /// Operation failures are recorded in the outcome. When the session
    /// itself breaks, the operation that hit it is recorded as an error,
    /// everything after it is skipped and the error is returned in `fatal`.
    pub async fn run(
        &self,
        session: &VmSession,
        scenarios: &[Scenario],
        log: &StageLog,
    ) -> WorkflowRun {
        let mut outcome = WorkflowOutcome::default();
        let mut halted: Option<String> = None;
        let mut fatal: Option<VmciError> = None;

        for scenario in scenarios {
            tracing::info!(scenario = %scenario.name, operations = scenario.operations.len(), "Running scenario");
            log.line(format!("== scenario {} ({})", scenario.name, scenario.source.display()));

            let mut results = Vec::with_capacity(scenario.operations.len());
            let mut aborted: Option<String> = None;

            for operation in &scenario.operations {
                if let Some(reason) = halted.as_ref().or(aborted.as_ref()) {
                    log.line(format!("-- {} skipped: {}", operation.id, reason));
                    results.push(OperationResult::skipped(operation, reason.clone()));
                    continue;
                }

                let result = match self.run_operation(session, operation, log).await {
                    Ok(result) => result,
                    Err(e) => {
                        log.line(format!("-- {} error: {}", operation.id, e));
                        tracing::error!(
                            scenario = %scenario.name,
                            operation = %operation.id,
                            error = %e,
                            "Session failed during operation"
                        );
                        halted = Some(format!(
                            "session failed during operation '{}' in scenario '{}'",
                            operation.id, scenario.name
                        ));
                        results.push(OperationResult::failed(operation, e.to_string()));
                        fatal = Some(e);
                        continue;
                    }
                };
                log.line(format!("-- {} {}", operation.id, result.status.as_str()));
                tracing::info!(
                    scenario = %scenario.name,
                    operation = %operation.id,
                    status = result.status.as_str(),
                    "Operation finished"
                );

                if result.status == OperationStatus::Error {
                    aborted = Some(format!("earlier operation '{}' failed to execute", operation.id));
                }
                if !result.passed() && self.policy == AssertionPolicy::FailFast {
                    halted = Some(format!(
                        "fail-fast: operation '{}' in scenario '{}' did not pass",
                        operation.id, scenario.name
                    ));
                }
                results.push(result);
            }

            outcome.scenarios.push(ScenarioResult {
                name: scenario.name.clone(),
                operations: results,
            });
        }

        WorkflowRun { outcome, fatal }
    }

    async fn run_operation(
        &self,
        session: &VmSession,
        operation: &Operation,
        log: &StageLog,
    ) -> VmciResult<OperationResult> {
        match operation.identity {
            Identity::Operator => {
                let record = session
                    .exec(Identity::Operator, &operation.command, operation.timeout)
                    .await?;
                log.record(&record);
                Ok(OperationResult::from_record(operation, operator_result(operation, &record)))
            }
            Identity::Validator => {
                let run = self.harness.run(session, operation).await?;
                log.record(&run.execution);
                Ok(OperationResult::from_record(operation, run.result))
            }
        }
    }
}

/// Operator operations are setup steps: an unexpected exit code is an
/// execution error rather than an assertion mismatch.
fn operator_result(operation: &Operation, record: &ExecutionRecord) -> ResultRecord {
    let outcome = evaluate(record, &operation.expected);
    let unexpected_exit = record.error().is_none()
        && record.exit_code() != Some(operation.expected.exit_code);

    if unexpected_exit {
        let mut result = ResultRecord::from_evaluation(
            &operation.id,
            operation.kind,
            Identity::Operator,
            record,
            &outcome,
        );
        result.verdict = HarnessVerdict::Error;
        result.diffs.clear();
        result.error = Some(format!(
            "operator command exited with {} (expected {})",
            record
                .exit_code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "no status".to_string()),
            operation.expected.exit_code
        ));
        return result;
    }

    ResultRecord::from_evaluation(&operation.id, operation.kind, Identity::Operator, record, &outcome)
}
