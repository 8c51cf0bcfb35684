//! Channel over the system `ssh` client.

use super::{GuestChannel, run_captured};
use crate::config::SshConfig;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use vmci_shared::{ExecutionRecord, VmciError, VmciResult};

/// Exit status `ssh` uses for its own connection failures.
const SSH_CONNECTION_ERROR: i32 = 255;

pub struct SshChannel {
    config: SshConfig,
}

impl SshChannel {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn ssh_args(&self, account: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.config.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ];
        if let Some(key) = &self.config.key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        for option in &self.config.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(format!("{}@{}", account, self.config.host));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl GuestChannel for SshChannel {
    async fn exec(
        &self,
        account: &str,
        command: &str,
        timeout: Duration,
    ) -> VmciResult<ExecutionRecord> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.ssh_args(account, command));

        let record = run_captured(cmd, command, account, timeout).await?;
        if record.exit_code() == Some(SSH_CONNECTION_ERROR) {
            return Ok(ExecutionRecord::failed(
                record.command(),
                record.identity(),
                record.stdout(),
                record.stderr(),
                record.started_at(),
                record.duration_ms(),
                format!(
                    "ssh connection to {}:{} failed",
                    self.config.host, self.config.port
                ),
            ));
        }
        Ok(record)
    }

    async fn wait_ready(&self, account: &str) -> VmciResult<()> {
        let timeout = Duration::from_secs(self.config.connect_timeout_secs.max(1) + 5);
        let interval = Duration::from_millis(self.config.retry_interval_ms);
        let attempts = self.config.connect_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let record = self.exec(account, "true", timeout).await?;
            if record.succeeded() {
                tracing::info!(endpoint = %self.describe(), attempt, "Guest channel ready");
                return Ok(());
            }
            last_error = record
                .error()
                .map(str::to_string)
                .unwrap_or_else(|| record.combined_output());
            tracing::debug!(attempt, error = %last_error, "Guest channel not ready yet");
            tokio::time::sleep(interval).await;
        }

        Err(VmciError::Channel(format!(
            "{} not reachable after {} attempts: {}",
            self.describe(),
            attempts,
            last_error.trim()
        )))
    }

    fn describe(&self) -> String {
        format!("ssh://{}:{}", self.config.host, self.config.port)
    }
}
