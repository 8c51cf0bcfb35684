//! Console capture for the VM process.
//!
//! Background drain tasks read the VM's stdout and stderr line by line,
//! append every line to memory and to `console.log`, and flip the console
//! state to `Ready` the first time a line matches the readiness marker.

use parking_lot::Mutex;
use regex::Regex;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vmci_shared::{VmciError, VmciResult};

/// Boot progress as observed on the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleState {
    Booting,
    /// Readiness marker seen.
    Ready,
    /// VM process exited; exit code if it had one.
    Exited(Option<i32>),
    /// Console output can no longer be recorded.
    CaptureFailed(String),
}

/// Why waiting for readiness ended without the marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyError {
    Timeout,
    Exited(Option<i32>),
    CaptureFailed(String),
}

struct Inner {
    lines: Mutex<Vec<String>>,
    file: Mutex<File>,
    path: PathBuf,
    marker: Regex,
    state: watch::Sender<ConsoleState>,
}

/// Shared handle to the console log of one VM session.
#[derive(Clone)]
pub struct ConsoleLog {
    inner: Arc<Inner>,
}

impl ConsoleLog {
    /// Create the console log file at `path`.
    pub fn create(path: &Path, marker: Regex) -> VmciResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VmciError::Console(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let file = File::create(path).map_err(|e| {
            VmciError::Console(format!("cannot open console log {}: {}", path.display(), e))
        })?;
        let (state, _) = watch::channel(ConsoleState::Booting);

        Ok(Self {
            inner: Arc::new(Inner {
                lines: Mutex::new(Vec::new()),
                file: Mutex::new(file),
                path: path.to_path_buf(),
                marker,
                state,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn state(&self) -> ConsoleState {
        self.inner.state.borrow().clone()
    }

    /// Start a background task draining `reader` into the log.
    pub fn attach<R>(&self, reader: R, stream: &'static str) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let console = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\n', '\r']);
                        if let Err(e) = console.append_line(line) {
                            console.mark_capture_failed(e.to_string());
                            break;
                        }
                    }
                    Err(e) => {
                        console.mark_capture_failed(format!("reading VM {}: {}", stream, e));
                        break;
                    }
                }
            }
            tracing::trace!(stream, "Console stream closed");
        })
    }

    /// Record one console line.
    pub fn append_line(&self, line: &str) -> VmciResult<()> {
        {
            let mut file = self.inner.file.lock();
            writeln!(file, "{}", line)
                .and_then(|_| file.flush())
                .map_err(|e| VmciError::Console(format!("writing console log: {}", e)))?;
        }
        self.inner.lines.lock().push(line.to_string());

        if self.inner.marker.is_match(line) {
            self.inner.state.send_if_modified(|state| {
                if *state == ConsoleState::Booting {
                    *state = ConsoleState::Ready;
                    true
                } else {
                    false
                }
            });
        }
        Ok(())
    }

    /// Record that the VM process exited. Readiness already seen is kept.
    pub fn mark_exited(&self, code: Option<i32>) {
        self.inner.state.send_if_modified(|state| {
            if *state == ConsoleState::Booting {
                *state = ConsoleState::Exited(code);
                true
            } else {
                false
            }
        });
    }

    pub(super) fn mark_capture_failed(&self, reason: String) {
        tracing::error!(reason = %reason, "Console capture failed");
        self.inner.state.send_if_modified(|state| {
            if matches!(state, ConsoleState::Booting | ConsoleState::Ready) {
                *state = ConsoleState::CaptureFailed(reason.clone());
                true
            } else {
                false
            }
        });
    }

    /// Wait until the readiness marker is seen, bounded by `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ReadyError> {
        let mut rx = self.inner.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state != ConsoleState::Booting),
        )
        .await;

        match waited {
            Err(_) => Err(ReadyError::Timeout),
            Ok(Err(_)) => Err(ReadyError::CaptureFailed("console closed".to_string())),
            Ok(Ok(state)) => match &*state {
                ConsoleState::Ready => Ok(()),
                ConsoleState::Exited(code) => Err(ReadyError::Exited(*code)),
                ConsoleState::CaptureFailed(reason) => Err(ReadyError::CaptureFailed(reason.clone())),
                ConsoleState::Booting => Err(ReadyError::Timeout),
            },
        }
    }

    /// Everything captured so far.
    pub fn snapshot(&self) -> String {
        let lines = self.inner.lines.lock();
        let mut out = lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Last `n` lines, for error summaries.
    pub fn tail(&self, n: usize) -> String {
        let lines = self.inner.lines.lock();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}
