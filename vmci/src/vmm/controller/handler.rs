//! VmmHandler - Runtime operations on a running VM.

use crate::util::process::{is_process_alive, kill_process, terminate_process};
use crate::vmm::console::ConsoleLog;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vmci_shared::{VmciError, VmciResult};

/// Trait for runtime operations on a running VM.
///
/// Separates runtime operations from spawning (VmmController).
#[async_trait]
pub trait VmmHandler: Send + Sync {
    /// Stop the VM: SIGTERM, wait up to `grace`, then SIGKILL.
    async fn stop(&mut self, grace: Duration) -> VmciResult<()>;

    /// Check if the VM is still running.
    fn is_running(&self) -> bool;

    /// Get the process ID of the running VM.
    fn pid(&self) -> u32;

    /// Exit code once the process has exited (`None` while running or when killed by a signal).
    fn exit_code(&self) -> Option<i32>;
}

/// Exit observed by the monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    Running,
    Exited(Option<i32>),
}

/// Handler backed by a child process.
///
/// A monitor task owns the child and waits on it, reporting the exit to the
/// console so a VM that dies before readiness is noticed immediately.
pub struct ProcessHandler {
    pid: u32,
    program: String,
    exit: watch::Receiver<ProcessExit>,
    monitor: JoinHandle<()>,
    drains: Vec<JoinHandle<()>>,
}

impl ProcessHandler {
    pub(crate) fn monitor(
        mut child: Child,
        program: &str,
        console: ConsoleLog,
        drains: Vec<JoinHandle<()>>,
    ) -> VmciResult<Self> {
        let pid = child
            .id()
            .ok_or_else(|| VmciError::Engine("VM process exited during launch".to_string()))?;
        let (tx, rx) = watch::channel(ProcessExit::Running);

        let monitor = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Failed to wait on VM process");
                    None
                }
            };
            tracing::info!(pid, exit_code = ?code, "VM process exited");
            console.mark_exited(code);
            let _ = tx.send(ProcessExit::Exited(code));
        });

        Ok(Self {
            pid,
            program: program.to_string(),
            exit: rx,
            monitor,
            drains,
        })
    }

    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        let waited = tokio::time::timeout(
            timeout,
            self.exit.wait_for(|exit| *exit != ProcessExit::Running),
        )
        .await;
        matches!(waited, Ok(Ok(_)))
    }

    /// Let the console drains reach EOF so the last lines land in the log.
    async fn flush_console(&mut self) {
        for drain in self.drains.drain(..) {
            let abort = drain.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), drain).await.is_err() {
                abort.abort();
            }
        }
    }
}

#[async_trait]
impl VmmHandler for ProcessHandler {
    async fn stop(&mut self, grace: Duration) -> VmciResult<()> {
        if !self.is_running() {
            return Ok(());
        }

        // The monitor has not reaped the child yet, so the PID cannot have been reused.
        tracing::info!(pid = self.pid, program = %self.program, grace_secs = grace.as_secs(), "Stopping VM");
        terminate_process(self.pid);
        if self.wait_exit(grace).await {
            self.flush_console().await;
            return Ok(());
        }

        tracing::warn!(pid = self.pid, "VM ignored SIGTERM, killing");
        if !kill_process(self.pid) {
            return Err(VmciError::Engine(format!(
                "failed to kill VM process {}",
                self.pid
            )));
        }
        if self.wait_exit(Duration::from_secs(5)).await {
            self.flush_console().await;
            Ok(())
        } else {
            Err(VmciError::Engine(format!(
                "VM process {} did not exit after SIGKILL",
                self.pid
            )))
        }
    }

    fn is_running(&self) -> bool {
        *self.exit.borrow() == ProcessExit::Running && is_process_alive(self.pid)
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn exit_code(&self) -> Option<i32> {
        match *self.exit.borrow() {
            ProcessExit::Running => None,
            ProcessExit::Exited(code) => code,
        }
    }
}

impl Drop for ProcessHandler {
    fn drop(&mut self) {
        if *self.exit.borrow() == ProcessExit::Running {
            tracing::warn!(pid = self.pid, "VM handler dropped while running, killing");
            // Aborting the monitor drops the child, which is kill_on_drop.
            self.monitor.abort();
            for drain in &self.drains {
                drain.abort();
            }
        }
    }
}
