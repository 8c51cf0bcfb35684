//! Task: Execute - run every scenario through the workflow executor.
//!
//! Operation failures are recorded for the validate stage; only a broken
//! session fails this stage. Results gathered before the break are kept
//! and their diff files written, since validate will not run.

use super::validate::write_diffs;
use super::{log_task_error, session_required, stage_log, task_start};
use crate::harness_client::HarnessClient;
use crate::orchestrator::context::RunCtx;
use crate::pipeline::PipelineTask;
use crate::workflow::WorkflowExecutor;
use async_trait::async_trait;
use vmci_shared::VmciResult;

pub struct ExecuteTask;

#[async_trait]
impl PipelineTask<RunCtx> for ExecuteTask {
    async fn run(self: Box<Self>, ctx: RunCtx) -> VmciResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let log = stage_log(&ctx, task_name)?;
        let session = session_required(&ctx)?;

        let executor = WorkflowExecutor::new(
            HarnessClient::new(&ctx.config.harness),
            ctx.config.workflow.policy,
        );
        let run = executor.run(session, &ctx.scenarios, &log).await;
        let outcome = run.outcome;

        let counts = outcome.counts();
        tracing::info!(
            run_id = %run_id,
            total = counts.total,
            passed = counts.passed,
            failed = counts.failed,
            errored = counts.errored,
            skipped = counts.skipped,
            "Workflows executed"
        );

        if let Some(err) = run.fatal {
            log_task_error(&run_id, task_name, &err);
            match write_diffs(&outcome, &ctx.layout.diffs_dir()) {
                Ok(written) => log.line(format!("{} diff file(s) written before abort", written)),
                Err(e) => ctx.warn(format!("writing diffs failed: {}", e)),
            }
            ctx.workflow = Some(outcome);
            return Err(err);
        }

        ctx.workflow = Some(outcome);
        Ok(())
    }

    fn name(&self) -> &str {
        "execute"
    }
}
