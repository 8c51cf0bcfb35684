//! Task: Validate - succeed iff every operation passed.
//!
//! Writes one diff file per non-passing operation so the published bundle
//! shows exactly what differed.

use super::{log_task_error, stage_log, task_start};
use crate::orchestrator::context::RunCtx;
use crate::pipeline::PipelineTask;
use crate::util::fs::atomic_write_json;
use crate::workflow::{OperationResult, OperationStatus, WorkflowOutcome};
use async_trait::async_trait;
use std::path::Path;
use vmci_shared::{VmciError, VmciResult};

pub struct ValidateTask;

#[async_trait]
impl PipelineTask<RunCtx> for ValidateTask {
    async fn run(self: Box<Self>, ctx: RunCtx) -> VmciResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let ctx = ctx.lock().await;
        let log = stage_log(&ctx, task_name)?;
        let outcome = ctx
            .workflow
            .as_ref()
            .ok_or_else(|| VmciError::Internal("execute task must run first".into()))?;

        let written = write_diffs(outcome, &ctx.layout.diffs_dir())?;
        let counts = outcome.counts();
        log.line(format!(
            "{} operation(s): {} passed, {} failed, {} errored, {} skipped; {} diff file(s)",
            counts.total, counts.passed, counts.failed, counts.errored, counts.skipped, written
        ));

        if outcome.all_passed() {
            return Ok(());
        }

        let err = VmciError::Assertion(format!(
            "{} of {} operation(s) did not pass",
            counts.total - counts.passed,
            counts.total
        ));
        log_task_error(&run_id, task_name, &err);
        Err(err)
    }

    fn name(&self) -> &str {
        "validate"
    }
}

/// `<NN>-<scenario>__<NN>-<operation>.json`; the positions keep names
/// unique when ids only differ in characters that get replaced.
fn diff_file_name(
    scenario_index: usize,
    scenario: &str,
    operation_index: usize,
    operation: &OperationResult,
) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    };
    format!(
        "{:02}-{}__{:02}-{}.json",
        scenario_index + 1,
        clean(scenario),
        operation_index + 1,
        clean(&operation.id)
    )
}

/// Write a diff file for every failed or errored operation.
pub(super) fn write_diffs(outcome: &WorkflowOutcome, dir: &Path) -> VmciResult<usize> {
    let mut written = 0;
    for (si, scenario) in outcome.scenarios.iter().enumerate() {
        for (oi, operation) in scenario.operations.iter().enumerate() {
            if !matches!(operation.status, OperationStatus::Fail | OperationStatus::Error) {
                continue;
            }
            let body = serde_json::json!({
                "scenario": scenario.name,
                "operation": operation,
            });
            let name = diff_file_name(si, &scenario.name, oi, operation);
            atomic_write_json(&dir.join(name), &body)?;
            written += 1;
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ScenarioResult;
    use serde_json::json;
    use vmci_shared::{FieldDiff, Identity, OperationKind};

    fn result(id: &str, status: OperationStatus) -> OperationResult {
        OperationResult {
            id: id.into(),
            kind: OperationKind::CheckOut,
            identity: Identity::Validator,
            status,
            exit_code: Some(0),
            diffs: if status == OperationStatus::Fail {
                vec![FieldDiff::new("status", json!("checked_out"), json!("error"))]
            } else {
                Vec::new()
            },
            error: None,
            duration_ms: 3,
        }
    }

    #[test]
    fn test_diff_files_only_for_non_passing() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = WorkflowOutcome {
            scenarios: vec![ScenarioResult {
                name: "inventory/basic".into(),
                operations: vec![
                    result("checkout", OperationStatus::Fail),
                    result("status", OperationStatus::Pass),
                    result("checkin", OperationStatus::Skipped),
                ],
            }],
        };

        assert_eq!(write_diffs(&outcome, dir.path()).unwrap(), 1);
        let text = std::fs::read_to_string(dir.path().join("01-inventory_basic__01-checkout.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["operation"]["diffs"][0]["field"], "status");
        assert_eq!(value["operation"]["diffs"][0]["actual"], "error");
    }

    #[test]
    fn test_similar_ids_get_distinct_diff_files() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = WorkflowOutcome {
            scenarios: vec![ScenarioResult {
                name: "inventory".into(),
                operations: vec![
                    result("check.out", OperationStatus::Fail),
                    result("check_out", OperationStatus::Fail),
                ],
            }],
        };

        assert_eq!(write_diffs(&outcome, dir.path()).unwrap(), 2);
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(dir.path().join("01-inventory__01-check_out.json").is_file());
        assert!(dir.path().join("01-inventory__02-check_out.json").is_file());
    }
}
