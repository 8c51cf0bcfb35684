//! Channel that runs commands on the current machine.

use super::{GuestChannel, run_captured};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use vmci_shared::{ExecutionRecord, VmciResult};

/// Runs commands with `sh -c`.
///
/// With `sudo` enabled, commands for an account other than the current user
/// run through `sudo -n -u <account>`; otherwise the account is only recorded.
pub struct LocalChannel {
    sudo: bool,
    current_user: Option<String>,
}

impl LocalChannel {
    pub fn new(sudo: bool) -> Self {
        Self {
            sudo,
            current_user: std::env::var("USER").ok(),
        }
    }

    fn command_for(&self, account: &str, command: &str) -> Command {
        let switch_user = self.sudo && self.current_user.as_deref() != Some(account);
        if switch_user {
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", "-u", account, "--", "sh", "-c", command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
    }
}

#[async_trait]
impl GuestChannel for LocalChannel {
    async fn exec(
        &self,
        account: &str,
        command: &str,
        timeout: Duration,
    ) -> VmciResult<ExecutionRecord> {
        run_captured(self.command_for(account, command), command, account, timeout).await
    }

    async fn wait_ready(&self, _account: &str) -> VmciResult<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        if self.sudo {
            "local (sudo)".to_string()
        } else {
            "local".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_exec_records_account() {
        let channel = LocalChannel::new(false);
        let record = channel
            .exec("validator", "printf '%s' hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(record.stdout(), "hello");
        assert_eq!(record.identity(), "validator");
        assert_eq!(record.command(), "printf '%s' hello");
        assert!(record.succeeded());
    }

    #[test]
    fn test_sudo_only_for_other_accounts() {
        let channel = LocalChannel {
            sudo: true,
            current_user: Some("ci".into()),
        };
        let cmd = channel.command_for("validator", "id");
        assert_eq!(cmd.as_std().get_program(), "sudo");

        let cmd = channel.command_for("ci", "id");
        assert_eq!(cmd.as_std().get_program(), "sh");
    }
}
