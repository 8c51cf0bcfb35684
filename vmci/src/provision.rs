//! Provisioning executor.
//!
//! Runs the configured setup commands in the guest as the operator, in order,
//! then the smoke checks. The first failure stops provisioning and fails the
//! stage with the command and its captured output.

use crate::config::{ProvisionConfig, SmokeCheck};
use crate::logs::StageLog;
use crate::vmm::VmSession;
use vmci_shared::{ExecutionRecord, Identity, VmciError, VmciResult, shell_quote};

/// What provisioning did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub commands_run: usize,
    pub smoke_checks_passed: usize,
}

impl SmokeCheck {
    /// Guest command that succeeds iff the check holds.
    pub fn command(&self) -> String {
        match self {
            SmokeCheck::Binary { name } => format!("command -v {}", shell_quote(name)),
            SmokeCheck::File { path } => format!("test -e {}", shell_quote(path)),
            SmokeCheck::Command { command } => command.clone(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SmokeCheck::Binary { name } => format!("binary '{}' on PATH", name),
            SmokeCheck::File { path } => format!("file '{}' exists", path),
            SmokeCheck::Command { command } => format!("command '{}' succeeds", command),
        }
    }
}

fn failure_output(record: &ExecutionRecord) -> String {
    let mut output = record.combined_output();
    match (record.error(), record.exit_code()) {
        (Some(err), _) => output.push_str(&format!("error: {}\n", err)),
        (None, Some(code)) => output.push_str(&format!("exit code: {}\n", code)),
        (None, None) => {}
    }
    output
}

/// Provision the guest.
pub async fn provision(
    session: &VmSession,
    config: &ProvisionConfig,
    log: &StageLog,
) -> VmciResult<ProvisionSummary> {
    let timeout = config.command_timeout();
    let mut summary = ProvisionSummary::default();

    for (index, command) in config.commands.iter().enumerate() {
        tracing::info!(step = index + 1, total = config.commands.len(), command = %command, "Provisioning");
        let record = session.exec(Identity::Operator, command, timeout).await?;
        log.record(&record);
        summary.commands_run += 1;

        if !record.succeeded() {
            tracing::error!(command = %command, exit_code = ?record.exit_code(), "Provisioning command failed");
            return Err(VmciError::Provision {
                command: command.clone(),
                output: failure_output(&record),
            });
        }
    }

    for check in &config.smoke {
        let record = session
            .exec(Identity::Operator, &check.command(), timeout)
            .await?;
        log.record(&record);

        if !record.succeeded() {
            tracing::error!(check = %check.describe(), "Smoke check failed");
            return Err(VmciError::Provision {
                command: format!("smoke check: {}", check.describe()),
                output: failure_output(&record),
            });
        }
        summary.smoke_checks_passed += 1;
    }

    log.line(format!(
        "provisioning complete: {} command(s), {} smoke check(s)",
        summary.commands_run, summary.smoke_checks_passed
    ));
    Ok(summary)
}
