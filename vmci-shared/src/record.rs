//! Execution records, assertion outcomes and the harness result record.

use crate::operation::{Identity, OperationKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Process exit code: operation ran and matched expectations.
pub const EXIT_PASS: i32 = 0;
/// Process exit code: operation ran but its output did not match.
pub const EXIT_MISMATCH: i32 = 1;
/// Process exit code: operation could not be executed (launch failure, timeout).
///
/// `2` is left to the CLI parser for usage errors.
pub const EXIT_EXECUTION_ERROR: i32 = 3;

/// Everything captured from running one command.
///
/// Fields are private and there are no setters: a record cannot change after
/// capture. Normalized output is always derived on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    command: String,
    identity: String,
    stdout: String,
    stderr: String,
    /// `None` when the process never produced an exit status (timeout, launch failure, signal).
    exit_code: Option<i32>,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    /// Set when the command could not be run to completion.
    error: Option<String>,
}

impl ExecutionRecord {
    /// Record for a command that ran to completion.
    pub fn captured(
        command: impl Into<String>,
        identity: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: Option<i32>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            command: command.into(),
            identity: identity.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            started_at,
            duration_ms,
            error: None,
        }
    }

    /// Record for a command that failed to run (timeout, spawn failure, lost channel).
    ///
    /// Partial output captured before the failure is kept.
    pub fn failed(
        command: impl Into<String>,
        identity: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            identity: identity.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: None,
            started_at,
            duration_ms,
            error: Some(error.into()),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// True if the command ran and exited 0.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }

    /// Combined stdout/stderr for diagnostics.
    pub fn combined_output(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                out.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            out.push_str(&self.stderr);
            if !self.stderr.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// One mismatching field between expected and actual output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    /// `null` when the field was absent on the expected side.
    pub expected: Value,
    /// `null` when the field was absent on the actual side.
    pub actual: Value,
}

impl FieldDiff {
    pub fn new(field: impl Into<String>, expected: Value, actual: Value) -> Self {
        Self {
            field: field.into(),
            expected,
            actual,
        }
    }
}

/// Verdict for one operation's output against its expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssertionOutcome {
    Pass,
    Fail { diffs: Vec<FieldDiff> },
}

impl AssertionOutcome {
    pub fn from_diffs(diffs: Vec<FieldDiff>) -> Self {
        if diffs.is_empty() {
            AssertionOutcome::Pass
        } else {
            AssertionOutcome::Fail { diffs }
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, AssertionOutcome::Pass)
    }

    pub fn diffs(&self) -> &[FieldDiff] {
        match self {
            AssertionOutcome::Pass => &[],
            AssertionOutcome::Fail { diffs } => diffs,
        }
    }
}

/// Harness-level verdict, distinguishing wrong results from failed executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessVerdict {
    Pass,
    Fail,
    Error,
}

/// The single machine-parseable line a harness invocation writes to stdout.
///
/// Field declaration order is the serialization order and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub operation: String,
    pub kind: OperationKind,
    pub identity: Identity,
    pub verdict: HarnessVerdict,
    pub exit_code: Option<i32>,
    pub diffs: Vec<FieldDiff>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ResultRecord {
    /// Build the result record for an evaluated execution.
    ///
    /// An execution error takes precedence over any assertion outcome.
    pub fn from_evaluation(
        operation: impl Into<String>,
        kind: OperationKind,
        identity: Identity,
        record: &ExecutionRecord,
        outcome: &AssertionOutcome,
    ) -> Self {
        let (verdict, error) = match (record.error(), outcome) {
            (Some(err), _) => (HarnessVerdict::Error, Some(err.to_string())),
            (None, AssertionOutcome::Pass) => (HarnessVerdict::Pass, None),
            (None, AssertionOutcome::Fail { diffs }) => (
                HarnessVerdict::Fail,
                Some(format!("{} field(s) differ from expectation", diffs.len())),
            ),
        };

        Self {
            operation: operation.into(),
            kind,
            identity,
            verdict,
            exit_code: record.exit_code(),
            diffs: outcome.diffs().to_vec(),
            error,
            duration_ms: record.duration_ms(),
            timestamp: record.started_at(),
        }
    }

    /// Result record for an operation that could not be attempted at all.
    pub fn execution_error(
        operation: impl Into<String>,
        kind: OperationKind,
        identity: Identity,
        error: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            kind,
            identity,
            verdict: HarnessVerdict::Error,
            exit_code: None,
            diffs: Vec::new(),
            error: Some(error.into()),
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    /// Exit code the harness process terminates with.
    pub fn process_exit_code(&self) -> i32 {
        match self.verdict {
            HarnessVerdict::Pass => EXIT_PASS,
            HarnessVerdict::Fail => EXIT_MISMATCH,
            HarnessVerdict::Error => EXIT_EXECUTION_ERROR,
        }
    }

    /// Serialize to the single-line stdout form.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse the last JSON object line of harness stdout.
    ///
    /// Anything the operation itself printed is ignored; the harness always
    /// writes its record last.
    pub fn parse_stdout(stdout: &str) -> Option<Self> {
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .find_map(|line| serde_json::from_str(line).ok())
    }
}
