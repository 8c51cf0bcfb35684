//! Local command execution with a hard timeout.

use chrono::Utc;
use parking_lot::Mutex;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use vmci_shared::ExecutionRecord;

/// How long output may keep draining after the shell has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

async fn drain<R: AsyncRead + Unpin>(mut pipe: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
        }
    }
}

fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: signalling the process group of our own child.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

/// Run `command` with `sh -c` and capture it.
///
/// Never fails: launch failures and timeouts are execution errors inside
/// the record. Only the shell is timed; background processes it leaves
/// holding the pipes get a short drain window, then the whole process
/// group is killed.
pub async fn run_local(command: &str, identity: &str, timeout: Duration) -> ExecutionRecord {
    let started_at = Utc::now();
    let start = Instant::now();

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return ExecutionRecord::failed(
                command,
                identity,
                "",
                "",
                started_at,
                start.elapsed().as_millis() as u64,
                format!("failed to launch: {}", e),
            );
        }
    };
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

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Some(status),
        Err(_) => {
            kill_group(pid);
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
    kill_group(pid);

    let duration_ms = start.elapsed().as_millis() as u64;
    let out = String::from_utf8_lossy(&stdout.lock()).into_owned();
    let err = String::from_utf8_lossy(&stderr.lock()).into_owned();

    match status {
        None => ExecutionRecord::failed(
            command,
            identity,
            out,
            err,
            started_at,
            duration_ms,
            format!("timed out after {}s", timeout.as_secs()),
        ),
        Some(Ok(status)) => match (status.code(), status.signal()) {
            (Some(code), _) => ExecutionRecord::captured(
                command,
                identity,
                out,
                err,
                Some(code),
                started_at,
                duration_ms,
            ),
            (None, signal) => ExecutionRecord::failed(
                command,
                identity,
                out,
                err,
                started_at,
                duration_ms,
                format!("terminated by signal {}", signal.unwrap_or_default()),
            ),
        },
        Some(Err(e)) => ExecutionRecord::failed(
            command,
            identity,
            out,
            err,
            started_at,
            duration_ms,
            format!("wait failed: {}", e),
        ),
    }
}
