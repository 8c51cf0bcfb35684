//! `vmci-harness` - run one workflow operation and classify it.
//!
//! One subcommand per operation kind. The harness renders the command,
//! runs it locally with a timeout, normalizes and compares the output, then
//! prints exactly one JSON result record on stdout. Diagnostics go to stderr.
//!
//! Exit codes: 0 pass, 1 mismatch, 3 execution error, 2 usage error.
//!
//! `evaluate` re-runs normalization and comparison on a captured execution
//! record without executing anything.

mod exec;
mod templates;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use templates::{Templates, parse_param};
use tracing_subscriber::EnvFilter;
use vmci_shared::{
    ExecutionRecord, ExpectedResult, Identity, OperationKind, ResultRecord, evaluate,
    render_template,
};

const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(name = "vmci-harness")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run one workflow operation and classify it as pass, fail or error", long_about = None)]
struct Cli {
    /// Command template file (TOML with a [commands] table)
    #[arg(long, global = true, alias = "template-file", env = "VMCI_HARNESS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check an item out
    CheckOut(OperationArgs),
    /// Check an item back in
    CheckIn(OperationArgs),
    /// Query item status
    Status(OperationArgs),
    /// Move an item to another state
    Transition(OperationArgs),
    /// Run an arbitrary command (requires --command)
    Exec(OperationArgs),
    /// Re-evaluate a captured execution record
    Evaluate(EvaluateArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct OperationArgs {
    /// Operation id reported in the result record (default: the kind)
    #[arg(long)]
    operation: Option<String>,

    /// Shorthand for --param item=<ITEM>
    #[arg(long)]
    item: Option<String>,

    /// Shorthand for --param state=<STATE>
    #[arg(long)]
    state: Option<String>,

    /// Template parameter, repeatable
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Command template overriding the configured one
    #[arg(long)]
    command: Option<String>,

    /// Expected result file (JSON)
    #[arg(long, conflicts_with = "expected_b64")]
    expected: Option<PathBuf>,

    /// Expected result as base64-encoded JSON
    #[arg(long)]
    expected_b64: Option<String>,

    /// Seconds before the operation is killed
    #[arg(long, default_value = "60")]
    timeout: u64,

    /// Identity recorded for the run
    #[arg(long, default_value = "validator", value_parser = parse_identity)]
    identity: Identity,
}

#[derive(Args, Debug, Clone)]
struct EvaluateArgs {
    /// Captured execution record (JSON)
    #[arg(long)]
    record: PathBuf,

    /// Expected result file (JSON)
    #[arg(long)]
    expected: PathBuf,

    #[arg(long, default_value = "evaluate")]
    operation: String,

    #[arg(long, default_value = "exec", value_parser = parse_kind)]
    kind: OperationKind,
}

fn parse_identity(s: &str) -> Result<Identity, String> {
    match s {
        "operator" => Ok(Identity::Operator),
        "validator" => Ok(Identity::Validator),
        other => Err(format!("unknown identity '{}'", other)),
    }
}

fn parse_kind(s: &str) -> Result<OperationKind, String> {
    OperationKind::parse(s).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("vmci-harness: failed to start runtime: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let target = cli.command.target();
    let result = runtime.block_on(dispatch(cli));
    match result.and_then(|record| Ok((record.to_line()?, record.process_exit_code()))) {
        Ok((line, code)) => {
            println!("{}", line);
            ExitCode::from(code as u8)
        }
        Err(e) => {
            if let Some(line) = error_line(target, &e) {
                println!("{}", line);
            }
            eprintln!("vmci-harness: {:#}", e);
            ExitCode::from(EXIT_USAGE)
        }
    }
}

/// Operation id, kind and identity a record for this command reports.
struct Target {
    operation: String,
    kind: OperationKind,
    identity: Identity,
}

impl Command {
    fn target(&self) -> Target {
        let (kind, args) = match self {
            Command::CheckOut(args) => (OperationKind::CheckOut, args),
            Command::CheckIn(args) => (OperationKind::CheckIn, args),
            Command::Status(args) => (OperationKind::Status, args),
            Command::Transition(args) => (OperationKind::Transition, args),
            Command::Exec(args) => (OperationKind::Exec, args),
            Command::Evaluate(args) => {
                return Target {
                    operation: args.operation.clone(),
                    kind: args.kind,
                    identity: Identity::default(),
                };
            }
        };
        Target {
            operation: args
                .operation
                .clone()
                .unwrap_or_else(|| kind.as_str().to_string()),
            kind,
            identity: args.identity,
        }
    }
}

/// Error record printed when the operation could not be set up.
///
/// Stdout still carries one record, so callers parsing it see the cause.
fn error_line(target: Target, error: &anyhow::Error) -> Option<String> {
    ResultRecord::execution_error(
        target.operation,
        target.kind,
        target.identity,
        format!("{:#}", error),
    )
    .to_line()
    .ok()
}

async fn dispatch(cli: Cli) -> Result<ResultRecord> {
    let templates = match &cli.config {
        Some(path) => Templates::load(path)?,
        None => Templates::default(),
    };

    let (kind, args) = match cli.command {
        Command::CheckOut(args) => (OperationKind::CheckOut, args),
        Command::CheckIn(args) => (OperationKind::CheckIn, args),
        Command::Status(args) => (OperationKind::Status, args),
        Command::Transition(args) => (OperationKind::Transition, args),
        Command::Exec(args) => (OperationKind::Exec, args),
        Command::Evaluate(args) => return evaluate_record(&args),
    };
    run_operation(kind, &args, &templates).await
}

fn load_expected(args: &OperationArgs) -> Result<ExpectedResult> {
    let expected = match (&args.expected, &args.expected_b64) {
        (Some(path), _) => ExpectedResult::load(path)?,
        (None, Some(encoded)) => ExpectedResult::from_b64(encoded)?,
        (None, None) => ExpectedResult::exit_only(0),
    };
    expected.validate()?;
    Ok(expected)
}

async fn run_operation(
    kind: OperationKind,
    args: &OperationArgs,
    templates: &Templates,
) -> Result<ResultRecord> {
    if args.timeout == 0 {
        bail!("--timeout must be > 0");
    }

    let mut params: BTreeMap<String, String> = args.params.iter().cloned().collect();
    if let Some(item) = &args.item {
        params.insert("item".to_string(), item.clone());
    }
    if let Some(state) = &args.state {
        params.insert("state".to_string(), state.clone());
    }

    let template = templates.resolve(kind, args.command.as_deref())?;
    let command = render_template(&template, &params)?;
    let expected = load_expected(args)?;
    let operation = args
        .operation
        .clone()
        .unwrap_or_else(|| kind.as_str().to_string());

    tracing::info!(operation = %operation, command = %command, "Running operation");
    let record = exec::run_local(
        &command,
        &args.identity.to_string(),
        Duration::from_secs(args.timeout),
    )
    .await;
    if !record.stderr().is_empty() {
        tracing::debug!(stderr = %record.stderr(), "Operation stderr");
    }

    let outcome = evaluate(&record, &expected);
    let result = ResultRecord::from_evaluation(operation, kind, args.identity, &record, &outcome);
    for diff in &result.diffs {
        tracing::warn!(field = %diff.field, expected = %diff.expected, actual = %diff.actual, "Mismatch");
    }
    Ok(result)
}

fn read_record(path: &Path) -> Result<ExecutionRecord> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading execution record {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing execution record {}", path.display()))
}

fn evaluate_record(args: &EvaluateArgs) -> Result<ResultRecord> {
    let record = read_record(&args.record)?;
    let expected = ExpectedResult::load(&args.expected)?;
    expected.validate()?;

    let identity = parse_identity(record.identity()).unwrap_or_default();
    let outcome = evaluate(&record, &expected);
    Ok(ResultRecord::from_evaluation(
        args.operation.clone(),
        args.kind,
        identity,
        &record,
        &outcome,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vmci_shared::{HarnessVerdict, NormalizationRule, RuleKind};

    fn checkout_expected() -> ExpectedResult {
        ExpectedResult::structured(
            json!({"status": "checked_out", "item": 42})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .with_rule(NormalizationRule::new("ts", RuleKind::Ignore))
    }

    fn args(command: &str) -> OperationArgs {
        OperationArgs {
            item: Some("42".into()),
            command: Some(command.into()),
            expected_b64: Some(checkout_expected().to_b64().unwrap()),
            timeout: 5,
            ..OperationArgs::default()
        }
    }

    #[tokio::test]
    async fn test_check_out_pass() {
        let result = run_operation(
            OperationKind::CheckOut,
            &args(r#"echo "{{\"status\":\"checked_out\",\"item\":{item},\"ts\":\"$(date)\"}}""#),
            &Templates::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.verdict, HarnessVerdict::Pass);
        assert_eq!(result.operation, "check-out");
        assert_eq!(result.process_exit_code(), 0);
    }

    #[tokio::test]
    async fn test_check_out_fail_names_field() {
        let result = run_operation(
            OperationKind::CheckOut,
            &args(r#"echo '{{"status":"error","item":42}}'"#),
            &Templates::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.verdict, HarnessVerdict::Fail);
        assert_eq!(result.process_exit_code(), 1);
        assert_eq!(result.diffs.len(), 1);
        assert_eq!(result.diffs[0].field, "status");
        assert_eq!(result.diffs[0].expected, json!("checked_out"));
        assert_eq!(result.diffs[0].actual, json!("error"));
    }

    #[tokio::test]
    async fn test_timeout_is_execution_error() {
        let mut a = args("sleep 30");
        a.timeout = 1;
        let result = run_operation(OperationKind::Exec, &a, &Templates::default())
            .await
            .unwrap();
        assert_eq!(result.verdict, HarnessVerdict::Error);
        assert_eq!(result.process_exit_code(), 3);
    }

    #[tokio::test]
    async fn test_without_expectation_exit_zero_passes() {
        let a = OperationArgs {
            command: Some("true".into()),
            timeout: 5,
            ..OperationArgs::default()
        };
        let result = run_operation(OperationKind::Exec, &a, &Templates::default())
            .await
            .unwrap();
        assert_eq!(result.verdict, HarnessVerdict::Pass);
    }

    #[tokio::test]
    async fn test_exec_requires_command() {
        let a = OperationArgs {
            timeout: 5,
            ..OperationArgs::default()
        };
        assert!(
            run_operation(OperationKind::Exec, &a, &Templates::default())
                .await
                .is_err()
        );
    }

    #[test]
    fn test_evaluate_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let record = ExecutionRecord::captured(
            "inventory checkout --item 42 --json",
            "validator",
            r#"{"status":"checked_out","item":42,"ts":"2024-05-01T10:00:00Z"}"#,
            "",
            Some(0),
            chrono::Utc::now(),
            12,
        );
        let record_path = dir.path().join("record.json");
        let expected_path = dir.path().join("expected.json");
        std::fs::write(&record_path, serde_json::to_string(&record).unwrap()).unwrap();
        std::fs::write(
            &expected_path,
            serde_json::to_string(&checkout_expected()).unwrap(),
        )
        .unwrap();

        let eval = EvaluateArgs {
            record: record_path,
            expected: expected_path,
            operation: "checkout".into(),
            kind: OperationKind::CheckOut,
        };
        let first = evaluate_record(&eval).unwrap();
        let second = evaluate_record(&eval).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.verdict, HarnessVerdict::Pass);
        assert_eq!(first.identity, Identity::Validator);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "vmci-harness",
            "transition",
            "--item",
            "7",
            "--state",
            "archived",
            "--param",
            "note=x",
            "--timeout",
            "9",
        ])
        .unwrap();
        match cli.command {
            Command::Transition(args) => {
                assert_eq!(args.item.as_deref(), Some("7"));
                assert_eq!(args.state.as_deref(), Some("archived"));
                assert_eq!(args.params, vec![("note".to_string(), "x".to_string())]);
                assert_eq!(args.timeout, 9);
                assert_eq!(args.identity, Identity::Validator);
            }
            _ => panic!("expected transition"),
        }
    }

    #[tokio::test]
    async fn test_setup_error_still_prints_record() {
        let cli = Cli::try_parse_from([
            "vmci-harness",
            "check-in",
            "--operation",
            "return-42",
            "--identity",
            "operator",
            "--command",
            "echo {missing}",
        ])
        .unwrap();
        let target = cli.command.target();
        let err = dispatch(cli).await.unwrap_err();

        let line = error_line(target, &err).unwrap();
        let record = ResultRecord::parse_stdout(&line).unwrap();
        assert_eq!(record.verdict, HarnessVerdict::Error);
        assert_eq!(record.operation, "return-42");
        assert_eq!(record.kind, OperationKind::CheckIn);
        assert_eq!(record.identity, Identity::Operator);
        assert!(record.error.unwrap().contains("missing"));
    }
}
