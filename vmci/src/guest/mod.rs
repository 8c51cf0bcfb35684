//! Command channel into the guest.
//!
//! Every guest-side action (provisioning, workflow operations, harness
//! invocations) goes through a [`GuestChannel`]. A channel runs one command
//! as a named guest account and captures it into an [`ExecutionRecord`].
//!
//! Two implementations:
//! - [`SshChannel`]: system `ssh` to the port forwarded by the VM
//! - [`LocalChannel`]: `sh -c` on the current machine, used by the
//!   guest-side harness and by tests

mod local;
mod ssh;

pub use local::LocalChannel;
pub use ssh::SshChannel;

use crate::config::{ChannelKind, GuestConfig};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use vmci_shared::{ExecutionRecord, VmciError, VmciResult};

/// Time allowed for output pipes to drain after a command is killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[async_trait]
pub trait GuestChannel: Send + Sync {
    /// Run `command` as `account`, bounded by `timeout`.
    ///
    /// Command failures (non-zero exit, timeout) are captured in the record.
    /// `Err` means the channel itself is unusable.
    async fn exec(
        &self,
        account: &str,
        command: &str,
        timeout: Duration,
    ) -> VmciResult<ExecutionRecord>;

    /// Block until the channel accepts commands for `account`.
    async fn wait_ready(&self, account: &str) -> VmciResult<()>;

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

/// Build the channel selected by configuration.
pub fn channel_from_config(config: &GuestConfig) -> Arc<dyn GuestChannel> {
    match config.channel {
        ChannelKind::Ssh => Arc::new(SshChannel::new(config.ssh.clone())),
        ChannelKind::Local => Arc::new(LocalChannel::new(config.local_sudo)),
    }
}

/// Spawn `cmd`, capture its output and enforce `timeout`.
///
/// The command runs in its own process group so a timeout kills every
/// process it started, not just the shell.
pub(crate) async fn run_captured(
    mut cmd: Command,
    display_command: &str,
    account: &str,
    timeout: Duration,
) -> VmciResult<ExecutionRecord> {
    let started_at = Utc::now();
    let start = Instant::now();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let mut child = cmd.spawn().map_err(|e| {
        VmciError::Channel(format!("failed to spawn command for '{}': {}", account, e))
    })?;
    let pid = child.id();

    let stdout = Arc::new(Mutex::new(Vec::new()));
    let stderr = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, stdout.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, stderr.clone())));

    let waited = tokio::time::timeout(timeout, child.wait()).await;

    let status = match waited {
        Ok(status) => Some(status?),
        Err(_) => {
            if let Some(pid) = pid {
                crate::util::process::kill_process_group(pid);
            }
            let _ = child.kill().await;
            None
        }
    };

    for task in [stdout_task, stderr_task].into_iter().flatten() {
        let abort = task.abort_handle();
        if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
            abort.abort();
        }
    }

    let duration_ms = start.elapsed().as_millis() as u64;
    let out = String::from_utf8_lossy(&stdout.lock()).into_owned();
    let err = String::from_utf8_lossy(&stderr.lock()).into_owned();

    let record = match status {
        None => ExecutionRecord::failed(
            display_command,
            account,
            out,
            err,
            started_at,
            duration_ms,
            format!("timed out after {}s", timeout.as_secs()),
        ),
        Some(status) => match (status.code(), status.signal()) {
            (Some(code), _) => ExecutionRecord::captured(
                display_command,
                account,
                out,
                err,
                Some(code),
                started_at,
                duration_ms,
            ),
            (None, signal) => ExecutionRecord::failed(
                display_command,
                account,
                out,
                err,
                started_at,
                duration_ms,
                format!("terminated by signal {}", signal.unwrap_or_default()),
            ),
        },
    };

    tracing::debug!(
        account,
        command = display_command,
        exit_code = ?record.exit_code(),
        duration_ms,
        "Command finished"
    );

    Ok(record)
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
        }
    }
}
