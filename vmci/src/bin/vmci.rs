//! `vmci` - CI entry point.
//!
//! ## Commands
//!
//! - `run`: execute the pipeline once; exit 0 PASSED, 1 FAILED, 2 usage/config error
//! - `import`: seed the artifact store with a baseline built elsewhere
//! - `latest`: print the latest known-good version tag
//! - `versions`: list recent versions

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use vmci::artifacts::{ArtifactStore, FsArtifactStore, ImportRequest, import};
use vmci::logging::{self, RunLogHandle};
use vmci::{Orchestrator, PipelineConfig, RunRequest, VmciError};

const EXIT_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(name = "vmci")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Boot, provision, validate and publish a CI VM image", long_about = None)]
struct Cli {
    /// Pipeline configuration (TOML)
    #[arg(short, long, global = true, env = "VMCI_CONFIG")]
    config: Option<PathBuf>,

    /// Artifact store root (overrides artifacts.root)
    #[arg(long, global = true, env = "VMCI_STORE")]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline against a baseline
    Run {
        /// Baseline version tag, or `latest`
        #[arg(long, default_value = "latest")]
        baseline: String,

        /// Scenario files or directories (default: workflow.scenarios)
        #[arg(long = "scenarios", num_args = 1..)]
        scenarios: Vec<PathBuf>,

        /// Commit hash under test
        #[arg(long, env = "VMCI_COMMIT")]
        commit: String,

        /// CI pipeline identifier
        #[arg(long, env = "VMCI_PIPELINE_ID")]
        pipeline_id: String,

        /// Also write the run report here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Directory for run working files and logs
        #[arg(long, default_value = ".vmci")]
        work_dir: PathBuf,

        /// Cancel the run after this many seconds
        #[arg(long)]
        run_timeout: Option<u64>,
    },

    /// Seed the store with a known-good baseline
    Import {
        #[arg(long)]
        tag: String,

        #[arg(long)]
        image: PathBuf,

        #[arg(long)]
        kernel: Option<PathBuf>,

        #[arg(long)]
        initrd: Option<PathBuf>,

        #[arg(long, default_value = "unknown")]
        commit: String,

        #[arg(long, default_value = "import")]
        pipeline_id: String,
    },

    /// Print the latest known-good version tag
    Latest,

    /// List recent versions, newest first
    Versions {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };

    let run_log = logging::init(level);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match runtime.block_on(dispatch(cli, run_log)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            let config_error = e
                .downcast_ref::<VmciError>()
                .is_some_and(|err| matches!(err, VmciError::Config(_)));
            ExitCode::from(if config_error { EXIT_USAGE } else { EXIT_FAILED })
        }
    }
}

async fn dispatch(cli: Cli, run_log: RunLogHandle) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;
    let store_root = cli.store.clone().unwrap_or_else(|| config.artifacts.root.clone());
    let store = Arc::new(
        FsArtifactStore::open(&store_root)
            .with_context(|| format!("opening artifact store {}", store_root.display()))?,
    );

    match cli.command {
        Commands::Run {
            baseline,
            scenarios,
            commit,
            pipeline_id,
            report,
            work_dir,
            run_timeout,
        } => {
            let request = RunRequest {
                baseline,
                scenarios,
                commit,
                pipeline_id,
                report_path: report,
                work_dir,
            };
            run(config, store, request, run_timeout, run_log).await
        }
        Commands::Import {
            tag,
            image,
            kernel,
            initrd,
            commit,
            pipeline_id,
        } => {
            let published = import(
                store.as_ref(),
                &ImportRequest {
                    tag,
                    image,
                    kernel,
                    initrd,
                    commit,
                    pipeline_id,
                },
            )?;
            println!("{}", published.tag);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Latest => match store.latest()? {
            Some(tag) => {
                println!("{}", tag);
                Ok(ExitCode::SUCCESS)
            }
            None => {
                eprintln!("no known-good version has been published");
                Ok(ExitCode::from(EXIT_FAILED))
            }
        },
        Commands::Versions { limit } => {
            for row in store.versions(limit)? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    row.tag,
                    row.verdict,
                    row.commit,
                    row.parent_tag.as_deref().unwrap_or("-"),
                    row.created_at
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    config.sanitize()?;
    Ok(config)
}

async fn run(
    config: PipelineConfig,
    store: Arc<FsArtifactStore>,
    request: RunRequest,
    run_timeout: Option<u64>,
    run_log: RunLogHandle,
) -> Result<ExitCode> {
    let orchestrator = Orchestrator::new(config, store)?.with_run_log(run_log);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(watch_for_cancellation(cancel_tx, run_timeout));

    let report = orchestrator.run(request, cancel_rx).await?;
    println!("{}", report.summary());
    Ok(ExitCode::from(report.exit_code() as u8))
}

/// Flip the cancel flag on SIGINT, SIGTERM or when the run timeout expires.
async fn watch_for_cancellation(cancel: watch::Sender<bool>, run_timeout: Option<u64>) {
    let timeout = async {
        match run_timeout {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => "interrupted",
        _ = sigterm() => "terminated",
        _ = timeout => "run timeout expired",
    };
    tracing::warn!(reason, "Cancelling run");
    let _ = cancel.send(true);
    // Keep the sender alive so the cancellation stays visible.
    std::future::pending::<()>().await;
}

async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}
