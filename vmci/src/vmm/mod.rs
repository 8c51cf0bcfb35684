//! VM boot controller.
//!
//! Boots the baseline image with an explicitly supplied kernel and initrd,
//! captures the serial console, and declares the VM booted only once the
//! readiness marker appears on the console.

pub mod console;
pub mod controller;
pub mod session;

pub use console::{ConsoleLog, ConsoleState, ReadyError};
pub use controller::{ProcessController, VmmController, VmmHandler};
pub use session::VmSession;

use std::path::PathBuf;
use std::time::Duration;
use vmci_shared::{VmciError, VmciResult};

/// Everything needed to launch one VM instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    /// Writable working copy of the baseline image.
    pub disk: PathBuf,
    pub cmdline: String,
    pub memory_mib: u32,
    pub cpus: u32,
    pub ssh_port: u16,
}

impl InstanceSpec {
    /// Substitute placeholders in the configured argument template.
    ///
    /// Arguments are passed to the VM program directly (no shell), so values
    /// are not quoted. Without an initrd, a `{initrd}` argument and the flag
    /// before it are dropped.
    pub fn render_args(&self, template: &[String]) -> Vec<String> {
        let mut args: Vec<String> = Vec::with_capacity(template.len());
        for arg in template {
            if arg == "{initrd}" && self.initrd.is_none() {
                if args.last().is_some_and(|prev| prev.starts_with('-')) {
                    args.pop();
                }
                continue;
            }
            args.push(self.substitute(arg));
        }
        args
    }

    fn substitute(&self, arg: &str) -> String {
        let initrd = self
            .initrd
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        arg.replace("{kernel}", &self.kernel.display().to_string())
            .replace("{initrd}", &initrd)
            .replace("{disk}", &self.disk.display().to_string())
            .replace("{cmdline}", &self.cmdline)
            .replace("{memory}", &self.memory_mib.to_string())
            .replace("{cpus}", &self.cpus.to_string())
            .replace("{ssh_port}", &self.ssh_port.to_string())
    }
}

/// Boot a VM and wait for its readiness marker.
///
/// On any failure the VM process is stopped before returning, so no process
/// outlives a failed boot.
pub async fn boot(
    controller: &dyn VmmController,
    spec: &InstanceSpec,
    console: &ConsoleLog,
    boot_timeout: Duration,
    shutdown_grace: Duration,
) -> VmciResult<Box<dyn VmmHandler>> {
    let mut handler = controller.start(spec, console).await?;

    let reason = match console.wait_ready(boot_timeout).await {
        Ok(()) => {
            tracing::info!(pid = handler.pid(), "Readiness marker observed");
            return Ok(handler);
        }
        Err(ReadyError::Timeout) => format!(
            "readiness timeout: marker not seen within {}s",
            boot_timeout.as_secs()
        ),
        Err(ReadyError::Exited(code)) => match code {
            Some(code) => format!("vm exited before readiness (exit code {})", code),
            None => "vm exited before readiness (killed by signal)".to_string(),
        },
        Err(ReadyError::CaptureFailed(reason)) => {
            if let Err(e) = handler.stop(shutdown_grace).await {
                tracing::warn!(error = %e, "Failed to stop VM after console capture failure");
            }
            return Err(VmciError::Console(reason));
        }
    };

    if let Err(e) = handler.stop(shutdown_grace).await {
        tracing::warn!(error = %e, "Failed to stop VM after boot failure");
    }
    tracing::error!(reason = %reason, console_tail = %console.tail(20), "VM boot failed");

    Err(VmciError::Boot {
        reason,
        console_log: console.snapshot(),
    })
}
