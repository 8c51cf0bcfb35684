//! Task: Boot - start the VM from the working disk with the baseline kernel,
//! wait for the readiness marker, then for the guest command channel.

use super::{log_task_error, stage_log, task_start};
use crate::guest::channel_from_config;
use crate::orchestrator::context::{RunContext, RunCtx};
use crate::pipeline::PipelineTask;
use crate::vmm::{ConsoleLog, InstanceSpec, ProcessController, VmSession, boot};
use async_trait::async_trait;
use regex::Regex;
use vmci_shared::{VmciError, VmciResult};

pub struct BootTask;

#[async_trait]
impl PipelineTask<RunCtx> for BootTask {
    async fn run(self: Box<Self>, ctx: RunCtx) -> VmciResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let log = stage_log(&ctx, task_name)?;

        let spec = instance_spec(&ctx).inspect_err(|e| log_task_error(&run_id, task_name, e))?;
        log.line(format!(
            "kernel {} initrd {} disk {}",
            spec.kernel.display(),
            spec.initrd
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            spec.disk.display()
        ));

        let vm = &ctx.config.vm;
        let marker = Regex::new(&vm.readiness_marker)
            .map_err(|e| VmciError::Config(format!("readiness marker: {}", e)))?;
        let console = ConsoleLog::create(&ctx.layout.console_log(), marker)?;
        let controller = ProcessController::new(&vm.program, vm.args.clone());

        let handler = boot(
            &controller,
            &spec,
            &console,
            vm.boot_timeout(),
            vm.shutdown_grace(),
        )
        .await
        .inspect_err(|e| {
            log.line(format!("boot failed: {}", e));
            log_task_error(&run_id, task_name, e);
        })?;
        log.line(format!("readiness marker seen, pid {}", handler.pid()));

        let channel = channel_from_config(&ctx.config.guest);
        let mut session = VmSession::new(
            handler,
            console,
            channel,
            ctx.config.identities.clone(),
            spec.disk.clone(),
        );

        if let Err(e) = session.wait_channel().await {
            log.line(format!("guest channel unavailable: {}", e));
            log_task_error(&run_id, task_name, &e);
            if let Err(stop_err) = session.teardown(vm.shutdown_grace()).await {
                tracing::warn!(run_id = %run_id, error = %stop_err, "Teardown after channel failure failed");
            }
            return Err(VmciError::Boot {
                reason: format!("guest channel unavailable: {}", e),
                console_log: session.console().snapshot(),
            });
        }

        tracing::info!(run_id = %run_id, pid = session.pid(), "VM booted");
        ctx.session = Some(session);
        Ok(())
    }

    fn name(&self) -> &str {
        "boot"
    }
}

fn instance_spec(ctx: &RunContext) -> VmciResult<InstanceSpec> {
    let baseline = ctx
        .baseline
        .as_ref()
        .ok_or_else(|| VmciError::Internal("fetch task must run first".into()))?;
    let vm = &ctx.config.vm;

    let kernel = baseline
        .kernel()
        .or_else(|| vm.kernel.clone())
        .ok_or_else(|| {
            VmciError::Config(format!(
                "baseline '{}' carries no kernel and vm.kernel is not set",
                baseline.tag
            ))
        })?;
    let initrd = baseline.initrd().or_else(|| vm.initrd.clone());

    Ok(InstanceSpec {
        kernel,
        initrd,
        disk: ctx.layout.disk(),
        cmdline: vm.cmdline.clone(),
        memory_mib: vm.memory_mib,
        cpus: vm.cpus,
        ssh_port: ctx.config.guest.ssh.port,
    })
}
