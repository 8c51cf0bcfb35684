//! Helpers shared by unit tests.

use crate::config::IdentitiesConfig;
use crate::guest::{GuestChannel, LocalChannel};
use crate::vmm::{ConsoleLog, InstanceSpec, ProcessController, VmSession, boot};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use vmci_shared::{ExecutionRecord, VmciResult};

/// Stand-in VM program: prints the readiness marker and idles.
pub const FAKE_VM_SCRIPT: &str = "echo 'Booting fake guest'; echo vmci-ready; exec sleep 60";

pub fn fake_vm_args() -> Vec<String> {
    vec!["-c".to_string(), FAKE_VM_SCRIPT.to_string()]
}

/// Local channel that remembers every command it ran, in order.
pub struct RecordingChannel {
    inner: LocalChannel,
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self {
            inner: LocalChannel::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(account, command)` pairs in execution order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl GuestChannel for RecordingChannel {
    async fn exec(
        &self,
        account: &str,
        command: &str,
        timeout: Duration,
    ) -> VmciResult<ExecutionRecord> {
        self.calls
            .lock()
            .push((account.to_string(), command.to_string()));
        self.inner.exec(account, command, timeout).await
    }

    async fn wait_ready(&self, account: &str) -> VmciResult<()> {
        self.inner.wait_ready(account).await
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

/// Boot a fake VM whose commands run locally through `sh -c`.
pub async fn local_session(dir: &Path) -> VmSession {
    local_session_with_channel(dir, Arc::new(LocalChannel::new(false))).await
}

/// Boot a fake VM whose commands go through `channel`.
pub async fn local_session_with_channel(
    dir: &Path,
    channel: Arc<dyn GuestChannel>,
) -> VmSession {
    let console =
        ConsoleLog::create(&dir.join("console.log"), Regex::new("vmci-ready").unwrap()).unwrap();
    let controller = ProcessController::new("sh", fake_vm_args());
    let spec = InstanceSpec {
        kernel: dir.join("vmlinuz"),
        initrd: None,
        disk: dir.join("disk.img"),
        cmdline: String::new(),
        memory_mib: 512,
        cpus: 1,
        ssh_port: 2222,
    };
    let handler = boot(
        &controller,
        &spec,
        &console,
        Duration::from_secs(10),
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    VmSession::new(
        handler,
        console,
        channel,
        IdentitiesConfig::default(),
        spec.disk,
    )
}
