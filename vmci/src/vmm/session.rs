//! A booted VM plus the command channel into it.

use crate::config::IdentitiesConfig;
use crate::guest::GuestChannel;
use crate::vmm::console::ConsoleLog;
use crate::vmm::controller::VmmHandler;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use vmci_shared::{ExecutionRecord, Identity, VmciError, VmciResult};

/// The single running VM of a pipeline run.
///
/// Only exists after the readiness marker was observed. Components run
/// commands through it one at a time; it is torn down exactly once.
pub struct VmSession {
    handler: Box<dyn VmmHandler>,
    console: ConsoleLog,
    channel: Arc<dyn GuestChannel>,
    identities: IdentitiesConfig,
    disk: PathBuf,
    torn_down: bool,
}

impl VmSession {
    pub fn new(
        handler: Box<dyn VmmHandler>,
        console: ConsoleLog,
        channel: Arc<dyn GuestChannel>,
        identities: IdentitiesConfig,
        disk: PathBuf,
    ) -> Self {
        Self {
            handler,
            console,
            channel,
            identities,
            disk,
            torn_down: false,
        }
    }

    pub fn console(&self) -> &ConsoleLog {
        &self.console
    }

    /// Working copy of the image the VM booted from.
    pub fn disk(&self) -> &Path {
        &self.disk
    }

    pub fn pid(&self) -> u32 {
        self.handler.pid()
    }

    pub fn is_running(&self) -> bool {
        !self.torn_down && self.handler.is_running()
    }

    /// Guest account name for an identity.
    pub fn account(&self, identity: Identity) -> &str {
        self.identities.account(identity)
    }

    /// Wait until the guest accepts commands for the validator account.
    pub async fn wait_channel(&self) -> VmciResult<()> {
        tracing::info!(channel = %self.channel.describe(), "Waiting for guest channel");
        self.channel.wait_ready(self.account(Identity::Validator)).await
    }

    /// Run a command in the guest as `identity`.
    ///
    /// A dead VM is fatal; failures of the command itself are in the record.
    pub async fn exec(
        &self,
        identity: Identity,
        command: &str,
        timeout: Duration,
    ) -> VmciResult<ExecutionRecord> {
        if !self.is_running() {
            return Err(VmciError::Engine(format!(
                "VM process {} is no longer running (exit code {:?})",
                self.handler.pid(),
                self.handler.exit_code()
            )));
        }
        let account = self.account(identity).to_string();
        tracing::debug!(identity = %identity, account = %account, command, "Guest exec");
        self.channel.exec(&account, command, timeout).await
    }

    /// Stop the VM. Later calls are no-ops.
    pub async fn teardown(&mut self, grace: Duration) -> VmciResult<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        tracing::info!(pid = self.handler.pid(), "Tearing down VM session");
        self.handler.stop(grace).await
    }
}

impl Drop for VmSession {
    fn drop(&mut self) {
        if !self.torn_down {
            // The handler kills the process on drop.
            tracing::warn!(pid = self.handler.pid(), "VM session dropped without teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::local_session;

    #[tokio::test]
    async fn test_exec_runs_as_identity_account() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = local_session(dir.path()).await;

        let record = session
            .exec(Identity::Operator, "echo provisioned", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(record.identity(), "operator");
        assert_eq!(record.stdout(), "provisioned\n");
        assert_eq!(session.account(Identity::Validator), "validator");

        session.teardown(Duration::from_secs(2)).await.unwrap();
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_exec_after_teardown_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = local_session(dir.path()).await;
        session.teardown(Duration::from_secs(2)).await.unwrap();
        session.teardown(Duration::from_secs(2)).await.unwrap();

        let err = session
            .exec(Identity::Validator, "true", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_console_kept_after_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = local_session(dir.path()).await;
        session.teardown(Duration::from_secs(2)).await.unwrap();
        let text = std::fs::read_to_string(session.console().path()).unwrap();
        assert!(text.contains("Booting fake guest"));
        assert!(text.contains("vmci-ready"));
    }
}
