//! Process-based VM controller.
//!
//! ## Architecture
//!
//! - **VmmController**: spawning operations (creates VmmHandler)
//! - **VmmHandler**: runtime operations on the running VM (stop, liveness)
//!
//! The controller wires the VM's stdout and stderr into the session's
//! [`ConsoleLog`]; the caller decides when the VM counts as booted.

mod handler;
mod spawn;

use crate::vmm::InstanceSpec;
use crate::vmm::console::ConsoleLog;
pub use handler::{ProcessHandler, VmmHandler};
use vmci_shared::{VmciError, VmciResult};

/// Trait for spawning VMs.
#[async_trait::async_trait]
pub trait VmmController: Send + Sync {
    /// Launch the VM described by `spec`, streaming its console into `console`.
    async fn start(
        &self,
        spec: &InstanceSpec,
        console: &ConsoleLog,
    ) -> VmciResult<Box<dyn VmmHandler>>;
}

/// Launches the configured VM program (qemu by default) as a child process.
pub struct ProcessController {
    program: String,
    args_template: Vec<String>,
}

impl ProcessController {
    pub fn new(program: impl Into<String>, args_template: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args_template,
        }
    }
}

#[async_trait::async_trait]
impl VmmController for ProcessController {
    async fn start(
        &self,
        spec: &InstanceSpec,
        console: &ConsoleLog,
    ) -> VmciResult<Box<dyn VmmHandler>> {
        let args = spec.render_args(&self.args_template);
        tracing::info!(program = %self.program, args = ?args, "Launching VM");

        let mut child = spawn::spawn_vm_process(&self.program, &args)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            let _ = child.start_kill();
            return Err(VmciError::Console(
                "VM process started without console pipes".to_string(),
            ));
        };
        let drains = vec![
            console.attach(stdout, "stdout"),
            console.attach(stderr, "stderr"),
        ];

        let handler = ProcessHandler::monitor(child, &self.program, console.clone(), drains)?;
        tracing::info!(pid = handler.pid(), "VM process started");
        Ok(Box::new(handler))
    }
}
