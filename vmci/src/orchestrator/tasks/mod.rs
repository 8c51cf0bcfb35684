//! Stage tasks of the run pipeline.

mod boot;
mod execute;
mod fetch;
mod provision;
mod publish;
mod validate;

pub use boot::BootTask;
pub use execute::ExecuteTask;
pub use fetch::FetchTask;
pub use provision::ProvisionTask;
pub use publish::PublishTask;
pub use validate::ValidateTask;

use super::context::{RunContext, RunCtx};
use crate::logs::StageLog;
use vmci_shared::{VmciError, VmciResult};

/// Log task start and return the run id for later log lines.
pub(crate) async fn task_start(ctx: &RunCtx, task_name: &str) -> String {
    let ctx = ctx.lock().await;
    tracing::debug!(run_id = %ctx.run_id, task = task_name, "Task started");
    ctx.run_id.clone()
}

pub(crate) fn log_task_error(run_id: &str, task_name: &str, error: &VmciError) {
    tracing::error!(run_id = %run_id, task = task_name, error = %error, "Task failed");
}

pub(crate) fn stage_log(ctx: &RunContext, task_name: &str) -> VmciResult<StageLog> {
    StageLog::open(&ctx.layout.stages_dir(), task_name)
}

pub(crate) fn session_required(ctx: &RunContext) -> VmciResult<&crate::vmm::VmSession> {
    ctx.session
        .as_ref()
        .ok_or_else(|| VmciError::Internal("boot task must run first".into()))
}
