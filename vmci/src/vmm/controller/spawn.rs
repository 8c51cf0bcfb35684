//! Subprocess spawning for the VM program.

use std::process::Stdio;
use tokio::process::{Child, Command};
use vmci_shared::{VmciError, VmciResult};

/// Spawns the VM program with piped stdout and stderr for console capture.
///
/// stdin is null so the VM never reads the orchestrator's terminal. The
/// child is killed if its handle is dropped.
pub(crate) fn spawn_vm_process(program: &str, args: &[String]) -> VmciResult<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd.spawn().map_err(|e| {
        let err_msg = format!("Failed to spawn VM process {}: {}", program, e);
        tracing::error!("{}", err_msg);
        VmciError::Engine(err_msg)
    })
}
