//! Task: Fetch - resolve and verify the baseline bundle, then make the
//! writable working copy of its image.

use super::{log_task_error, stage_log, task_start};
use crate::orchestrator::context::RunCtx;
use crate::pipeline::PipelineTask;
use async_trait::async_trait;
use vmci_shared::{VmciError, VmciResult};

pub struct FetchTask;

#[async_trait]
impl PipelineTask<RunCtx> for FetchTask {
    async fn run(self: Box<Self>, ctx: RunCtx) -> VmciResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let log = stage_log(&ctx, task_name)?;
        log.line(format!("fetching baseline '{}'", ctx.request.baseline));

        let store = ctx.store.clone();
        let requested = ctx.request.baseline.clone();
        let bundle = tokio::task::spawn_blocking(move || store.fetch(&requested))
            .await
            .map_err(|e| VmciError::Internal(format!("fetch task panicked: {}", e)))?
            .inspect_err(|e| {
                log.line(format!("fetch failed: {}", e));
                log_task_error(&run_id, task_name, e);
            })?;

        log.line(format!(
            "baseline {} (commit {}, digest {})",
            bundle.tag,
            bundle.metadata.commit,
            bundle.metadata.image_digest.as_deref().unwrap_or("-")
        ));

        let disk = ctx.layout.disk();
        let image = bundle.image();
        tokio::fs::copy(&image, &disk).await.map_err(|e| {
            let err = VmciError::Fetch(format!(
                "copying {} to working disk {}: {}",
                image.display(),
                disk.display(),
                e
            ));
            log_task_error(&run_id, task_name, &err);
            err
        })?;
        log.line(format!("working disk {}", disk.display()));

        tracing::info!(run_id = %run_id, baseline = %bundle.tag, "Baseline fetched");
        ctx.baseline = Some(bundle);
        Ok(())
    }

    fn name(&self) -> &str {
        "fetch"
    }
}
