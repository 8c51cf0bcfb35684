//! Task: Provision - run setup commands and smoke checks as the operator.

use super::{log_task_error, session_required, stage_log, task_start};
use crate::orchestrator::context::RunCtx;
use crate::pipeline::PipelineTask;
use crate::provision::provision;
use async_trait::async_trait;
use vmci_shared::VmciResult;

pub struct ProvisionTask;

#[async_trait]
impl PipelineTask<RunCtx> for ProvisionTask {
    async fn run(self: Box<Self>, ctx: RunCtx) -> VmciResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let log = stage_log(&ctx, task_name)?;
        let session = session_required(&ctx)?;

        let summary = provision(session, &ctx.config.provision, &log)
            .await
            .inspect_err(|e| log_task_error(&run_id, task_name, e))?;

        tracing::info!(
            run_id = %run_id,
            commands = summary.commands_run,
            smoke_checks = summary.smoke_checks_passed,
            "Guest provisioned"
        );
        ctx.provision = Some(summary);
        Ok(())
    }

    fn name(&self) -> &str {
        "provision"
    }
}
