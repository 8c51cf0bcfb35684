//! Host side of the validation harness.
//!
//! Runs one validator operation and turns it into a [`ResultRecord`]. In
//! host mode the operation command runs in the guest and is evaluated here;
//! in guest mode `vmci-harness` runs inside the guest and its result record
//! is parsed from stdout. Both modes use the same evaluation code.

use crate::config::{HarnessConfig, HarnessMode};
use crate::vmm::VmSession;
use crate::workflow::Operation;
use std::time::Duration;
use vmci_shared::{
    AssertionOutcome, ExecutionRecord, Identity, ResultRecord, VmciResult, evaluate, shell_quote,
};

/// Extra time the channel allows the guest-side harness beyond the operation timeout.
const GUEST_HARNESS_MARGIN: Duration = Duration::from_secs(10);

/// Output of one harness invocation.
#[derive(Debug, Clone)]
pub struct HarnessRun {
    pub result: ResultRecord,
    pub execution: ExecutionRecord,
}

pub struct HarnessClient {
    mode: HarnessMode,
    guest_binary: String,
}

impl HarnessClient {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            mode: config.mode,
            guest_binary: config.guest_binary.clone(),
        }
    }

    pub fn mode(&self) -> HarnessMode {
        self.mode
    }

    /// Execute, normalize and compare one operation as the validator.
    ///
    /// `Err` only when the session itself failed.
    pub async fn run(&self, session: &VmSession, operation: &Operation) -> VmciResult<HarnessRun> {
        match self.mode {
            HarnessMode::Host => self.run_on_host(session, operation).await,
            HarnessMode::Guest => self.run_in_guest(session, operation).await,
        }
    }

    async fn run_on_host(&self, session: &VmSession, operation: &Operation) -> VmciResult<HarnessRun> {
        let execution = session
            .exec(Identity::Validator, &operation.command, operation.timeout)
            .await?;
        let outcome = if execution.error().is_some() {
            AssertionOutcome::Pass
        } else {
            evaluate(&execution, &operation.expected)
        };
        let result = ResultRecord::from_evaluation(
            &operation.id,
            operation.kind,
            Identity::Validator,
            &execution,
            &outcome,
        );
        Ok(HarnessRun { result, execution })
    }

    async fn run_in_guest(&self, session: &VmSession, operation: &Operation) -> VmciResult<HarnessRun> {
        let command = self.guest_command(operation)?;
        let execution = session
            .exec(
                Identity::Validator,
                &command,
                operation.timeout + GUEST_HARNESS_MARGIN,
            )
            .await?;

        let result = match ResultRecord::parse_stdout(execution.stdout()) {
            Some(record) => record,
            None => {
                let detail = execution
                    .error()
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        format!(
                            "exit code {:?}: {}",
                            execution.exit_code(),
                            execution.stderr().trim()
                        )
                    });
                ResultRecord::execution_error(
                    &operation.id,
                    operation.kind,
                    Identity::Validator,
                    format!("harness produced no result record ({})", detail),
                )
            }
        };
        Ok(HarnessRun { result, execution })
    }

    /// Command line invoking `vmci-harness` in the guest.
    pub fn guest_command(&self, operation: &Operation) -> VmciResult<String> {
        let mut parts = vec![
            shell_quote(&self.guest_binary),
            operation.kind.as_str().to_string(),
            "--operation".to_string(),
            shell_quote(&operation.id),
            "--command".to_string(),
            shell_quote(&operation.template),
        ];
        for (key, value) in &operation.params {
            parts.push("--param".to_string());
            parts.push(shell_quote(&format!("{}={}", key, value)));
        }
        parts.push("--expected-b64".to_string());
        parts.push(operation.expected.to_b64()?);
        parts.push("--timeout".to_string());
        parts.push(operation.timeout.as_secs().max(1).to_string());
        Ok(parts.join(" "))
    }
}
