//! Task: Publish - tear down the VM and publish a new bundle version.
//!
//! Runs after failures and cancellation too. Whatever the run produced
//! (console log, stage logs, diffs, report) is published; a publish failure
//! becomes a report warning and never changes the verdict.

use super::{stage_log, task_start};
use crate::artifacts::{PublishRequest, Verdict, new_version_tag};
use crate::config::{HarnessMode, PublishPolicy};
use crate::orchestrator::context::{RunContext, RunCtx};
use crate::orchestrator::state::RunState;
use crate::pipeline::PipelineTask;
use crate::report::RunReport;
use async_trait::async_trait;
use vmci_shared::{VmciError, VmciResult};

pub struct PublishTask;

#[async_trait]
impl PipelineTask<RunCtx> for PublishTask {
    async fn run(self: Box<Self>, ctx: RunCtx) -> VmciResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        // Nothing in this stage may fail the run: problems become warnings.
        let log = match stage_log(&ctx, task_name) {
            Ok(log) => Some(log),
            Err(e) => {
                ctx.warn(format!("publish stage log unavailable: {}", e));
                None
            }
        };
        let note = |text: String| {
            if let Some(log) = &log {
                log.line(text);
            }
        };

        if let Some(mut session) = ctx.session.take() {
            let grace = ctx.config.vm.shutdown_grace();
            match session.teardown(grace).await {
                Ok(()) => note("vm stopped".to_string()),
                Err(e) => ctx.warn(format!("vm teardown failed: {}", e)),
            }
        }

        let verdict = if ctx.journal.state() == RunState::Publishing && !ctx.journal.any_failed() {
            Verdict::Passed
        } else {
            Verdict::Failed
        };

        if !verdict.is_passed() && ctx.config.publish.policy == PublishPolicy::OnSuccess {
            note("run failed and publish policy is on-success; nothing published".to_string());
            ctx.warn("publish skipped: run failed and publish policy is on-success");
            return Ok(());
        }

        let tag = new_version_tag(&ctx.request.pipeline_id, &ctx.request.commit);
        let request = match publish_request(&ctx, &tag, verdict) {
            Ok(request) => request,
            Err(e) => {
                note(format!("preparing publish failed: {}", e));
                ctx.warn(format!("publish failed: {}", e));
                return Ok(());
            }
        };
        note(format!("publishing {} as {}", verdict, tag));

        let store = ctx.store.clone();
        let result = tokio::task::spawn_blocking(move || store.publish(&request))
            .await
            .map_err(|e| VmciError::Internal(format!("publish task panicked: {}", e)))
            .and_then(|r| r);

        match result {
            Ok(published) => {
                note(format!(
                    "published {} at {}{}",
                    published.tag,
                    published.dir.display(),
                    if published.promoted { " (latest known-good)" } else { "" }
                ));
                tracing::info!(
                    run_id = %run_id,
                    tag = %published.tag,
                    promoted = published.promoted,
                    "Bundle published"
                );
                ctx.published = Some(published);
            }
            Err(e) => {
                note(format!("publish failed: {}", e));
                ctx.warn(format!("publish failed: {}", e));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "publish"
    }
}

fn publish_request(ctx: &RunContext, tag: &str, verdict: Verdict) -> VmciResult<PublishRequest> {
    let mut request = PublishRequest::new(
        tag,
        &ctx.request.commit,
        &ctx.request.pipeline_id,
        &ctx.run_id,
        verdict,
    );

    if let Some(baseline) = &ctx.baseline {
        request.parent_tag = Some(baseline.tag.clone());
        request.kernel = baseline.kernel();
        request.initrd = baseline.initrd();
    }

    let disk = ctx.layout.disk();
    if disk.is_file() && (verdict.is_passed() || ctx.config.publish.include_image_on_failure) {
        request.image = Some(disk);
    }
    let console = ctx.layout.console_log();
    if console.is_file() {
        request.console_log = Some(console);
    }
    request.stage_logs = Some(ctx.layout.stages_dir());
    request.diffs = Some(ctx.layout.diffs_dir());

    let mut report = RunReport::from_context(ctx, verdict);
    report.published_tag = Some(tag.to_string());
    request.report = Some(report.to_json()?);

    let info = &mut request.build_info;
    info.insert("source".into(), "pipeline".into());
    info.insert("vmci_version".into(), env!("CARGO_PKG_VERSION").into());
    info.insert("requested_baseline".into(), ctx.request.baseline.clone());
    info.insert("scenarios".into(), ctx.scenarios.len().to_string());
    info.insert(
        "harness_mode".into(),
        match ctx.config.harness.mode {
            HarnessMode::Host => "host".into(),
            HarnessMode::Guest => "guest".into(),
        },
    );
    Ok(request)
}
