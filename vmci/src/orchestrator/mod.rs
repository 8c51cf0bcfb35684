//! Pipeline orchestrator.
//!
//! ## Architecture
//!
//! A run is a fixed, table-driven plan over one shared [`RunContext`]:
//!
//! ```text
//!   1. Fetch       (resolve + verify baseline, working copy of the image)
//!   2. Boot        (start VM, wait for readiness marker and guest channel)
//!   3. Provision   (setup commands + smoke checks as operator)
//!   4. Execute     (scenarios, strictly sequential)
//!   5. Validate    (succeeds iff every operation passed)
//!   6. Publish     (always: teardown, then publish whatever exists)
//! ```
//!
//! Stage outcomes drive the [`RunState`] machine through [`RunJournal`].
//! Nothing is retried.

mod context;
mod layout;
mod state;
mod tasks;

pub use context::{RunContext, RunCtx, RunJournal, RunRequest};
pub use layout::RunLayout;
pub use state::{RunEvent, RunState, RunStateMachine, StateTransition};

use crate::artifacts::{ArtifactStore, Verdict};
use crate::config::PipelineConfig;
use crate::logging::RunLogHandle;
use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineExecutor, Stage};
use crate::report::RunReport;
use crate::workflow::load_scenarios;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use vmci_shared::{VmciError, VmciResult};

use tasks::{BootTask, ExecuteTask, FetchTask, ProvisionTask, PublishTask, ValidateTask};

// ============================================================================
// EXECUTION PLAN
// ============================================================================

fn execution_plan() -> ExecutionPlan<RunCtx> {
    let stages: Vec<Stage<BoxedTask<RunCtx>>> = vec![
        Stage::required(Box::new(FetchTask)),
        Stage::required(Box::new(BootTask)),
        Stage::required(Box::new(ProvisionTask)),
        Stage::required(Box::new(ExecuteTask)),
        Stage::required(Box::new(ValidateTask)),
        // Runs after failures and cancellation: teardown + partial publish
        Stage::always(Box::new(PublishTask)),
    ];
    ExecutionPlan::new(stages)
}

pub struct Orchestrator {
    config: PipelineConfig,
    store: Arc<dyn ArtifactStore>,
    run_log: Option<RunLogHandle>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, store: Arc<dyn ArtifactStore>) -> VmciResult<Self> {
        config.sanitize()?;
        Ok(Self {
            config,
            store,
            run_log: None,
        })
    }

    /// Mirror log events into `run.log` in each run directory.
    pub fn with_run_log(mut self, run_log: RunLogHandle) -> Self {
        self.run_log = Some(run_log);
        self
    }

    /// Run the pipeline once.
    ///
    /// `Err` only for problems found before anything runs (bad scenarios,
    /// unusable work directory). Every other failure is in the report.
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: watch::Receiver<bool>,
    ) -> VmciResult<RunReport> {
        let scenario_paths = if request.scenarios.is_empty() {
            self.config.workflow.scenarios.clone()
        } else {
            request.scenarios.clone()
        };
        if scenario_paths.is_empty() {
            return Err(VmciError::Config("no scenarios given".to_string()));
        }
        let scenarios = load_scenarios(
            &scenario_paths,
            &self.config.harness,
            self.config.workflow.operation_timeout(),
        )?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let layout = RunLayout::new(&request.work_dir, &run_id);
        layout.prepare()?;
        if let Some(run_log) = &self.run_log {
            run_log.attach(layout.root());
        }

        tracing::info!(
            run_id = %run_id,
            pipeline_id = %request.pipeline_id,
            commit = %request.commit,
            baseline = %request.baseline,
            scenarios = scenarios.len(),
            run_dir = %layout.root().display(),
            "Starting pipeline run"
        );

        let journal = Arc::new(RunJournal::new());
        journal.apply(RunEvent::Begin);

        let ctx: RunCtx = Arc::new(Mutex::new(RunContext {
            config: self.config.clone(),
            request: request.clone(),
            run_id: run_id.clone(),
            started_at: Utc::now(),
            layout: layout.clone(),
            store: self.store.clone(),
            scenarios,
            journal: journal.clone(),
            baseline: None,
            session: None,
            provision: None,
            workflow: None,
            published: None,
            warnings: Vec::new(),
        }));

        let metrics =
            PipelineExecutor::execute(execution_plan(), ctx.clone(), cancel, journal.as_ref())
                .await;

        let passed = journal.state() == RunState::Publishing && !journal.any_failed();
        let state = journal.apply(RunEvent::Finish { passed });
        let verdict = if state == RunState::Passed {
            Verdict::Passed
        } else {
            Verdict::Failed
        };

        let mut ctx = ctx.lock().await;
        if let Some(mut session) = ctx.session.take() {
            let grace = ctx.config.vm.shutdown_grace();
            if let Err(e) = session.teardown(grace).await {
                ctx.warn(format!("vm teardown failed: {}", e));
            }
        }

        let report = RunReport::from_context(&ctx, verdict);
        if let Err(e) = report.write(&layout.report()) {
            tracing::error!(run_id = %run_id, error = %e, "Failed to write run report");
        }
        if let Some(path) = &request.report_path
            && let Err(e) = report.write(path)
        {
            tracing::error!(run_id = %run_id, path = %path.display(), error = %e, "Failed to write run report");
        }

        tracing::info!(
            run_id = %run_id,
            verdict = %verdict,
            total_ms = metrics.total_duration_ms as u64,
            "Pipeline run finished\n{}",
            report.summary()
        );
        if let Some(run_log) = &self.run_log {
            run_log.detach();
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{FsArtifactStore, ImportRequest, LATEST, import};
    use crate::config::ChannelKind;
    use crate::pipeline::StageOutcome;
    use crate::test_support::fake_vm_args;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        store: Arc<FsArtifactStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().to_path_buf();
            let store = Arc::new(FsArtifactStore::open(root.join("store")).unwrap());

            let inputs = root.join("inputs");
            std::fs::create_dir_all(&inputs).unwrap();
            std::fs::write(inputs.join("base.img"), b"baseline image").unwrap();
            std::fs::write(inputs.join("vmlinuz"), b"kernel").unwrap();
            import(
                store.as_ref(),
                &ImportRequest {
                    tag: "seed".into(),
                    image: inputs.join("base.img"),
                    kernel: Some(inputs.join("vmlinuz")),
                    initrd: None,
                    commit: "0000000".into(),
                    pipeline_id: "ci".into(),
                },
            )
            .unwrap();

            Self {
                _dir: dir,
                root,
                store,
            }
        }

        fn scenario(&self, body: &str, expected: &str) -> PathBuf {
            let dir = self.root.join("scenarios");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("inventory.expected.json"), expected).unwrap();
            std::fs::write(dir.join("inventory.toml"), body).unwrap();
            dir
        }

        fn request(&self, scenarios: &Path) -> RunRequest {
            RunRequest {
                baseline: LATEST.into(),
                scenarios: vec![scenarios.to_path_buf()],
                commit: "abcdef0123".into(),
                pipeline_id: "ci".into(),
                report_path: Some(self.root.join("report.json")),
                work_dir: self.root.join("work"),
            }
        }

        fn orchestrator(&self, config: PipelineConfig) -> Orchestrator {
            Orchestrator::new(config, self.store.clone()).unwrap()
        }
    }

    fn config(vm_args: Vec<String>) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.vm.program = "sh".into();
        config.vm.args = vm_args;
        config.vm.boot_timeout_secs = 5;
        config.vm.shutdown_grace_secs = 1;
        config.guest.channel = ChannelKind::Local;
        config.provision.commands = vec!["true".into()];
        config.workflow.operation_timeout_secs = 5;
        config
    }

    const SCENARIO: &str = r#"
name = "inventory"
expected = "inventory.expected.json"

[[operations]]
id = "checkout"
kind = "exec"
command = "echo '{{\"status\":\"checked_out\",\"item\":42}}'"
"#;

    const EXPECTED_PASS: &str =
        r#"{"checkout": {"structured": {"fields": {"status": "checked_out", "item": 42}}}}"#;
    const EXPECTED_FAIL: &str =
        r#"{"checkout": {"structured": {"fields": {"status": "available", "item": 42}}}}"#;

    fn outcome<'a>(report: &'a RunReport, stage: &str) -> &'a StageOutcome {
        &report
            .stages
            .iter()
            .find(|s| s.name == stage)
            .unwrap()
            .outcome
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_passing_run_publishes_and_promotes() {
        let fx = Fixture::new();
        let scenarios = fx.scenario(SCENARIO, EXPECTED_PASS);

        let report = fx
            .orchestrator(config(fake_vm_args()))
            .run(fx.request(&scenarios), no_cancel())
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Passed);
        assert_eq!(report.state, RunState::Passed);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.baseline_tag.as_deref(), Some("seed"));
        assert_eq!(report.counts.passed, 1);
        assert!(report.stages.iter().all(|s| s.outcome.is_success()));

        let tag = report.published_tag.clone().unwrap();
        assert_eq!(fx.store.latest().unwrap(), Some(tag.clone()));
        let bundle = fx.store.fetch(&tag).unwrap();
        assert_eq!(bundle.metadata.parent_tag.as_deref(), Some("seed"));
        assert!(bundle.kernel().is_some());
        assert!(bundle.dir.join("console.log").is_file());
        assert!(bundle.dir.join("stages/provision.log").is_file());
        assert!(bundle.dir.join("report.json").is_file());

        let written: RunReport =
            serde_json::from_slice(&std::fs::read(fx.root.join("report.json")).unwrap()).unwrap();
        assert_eq!(written.run_id, report.run_id);
    }

    #[tokio::test]
    async fn test_boot_timeout_fails_run_but_publishes_logs() {
        let fx = Fixture::new();
        let scenarios = fx.scenario(SCENARIO, EXPECTED_PASS);
        let mut cfg = config(vec![
            "-c".into(),
            "echo 'Kernel panic - not syncing'; exec sleep 60".into(),
        ]);
        cfg.vm.boot_timeout_secs = 1;

        let report = fx
            .orchestrator(cfg)
            .run(fx.request(&scenarios), no_cancel())
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Failed);
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.exit_code(), 1);
        assert!(outcome(&report, "fetch").is_success());
        match outcome(&report, "boot") {
            StageOutcome::Failure { reason, log } => {
                assert!(reason.contains("readiness timeout"));
                assert!(log.as_deref().unwrap_or("").contains("Kernel panic"));
            }
            other => panic!("expected boot failure, got {other:?}"),
        }
        for stage in ["provision", "execute", "validate"] {
            assert!(outcome(&report, stage).is_skipped(), "{stage} should be skipped");
        }
        assert!(outcome(&report, "publish").is_success());

        let tag = report.published_tag.clone().unwrap();
        let dir = fx.store.root().join("bundles").join(&tag);
        let console = std::fs::read_to_string(dir.join("console.log")).unwrap();
        assert!(console.contains("Kernel panic"));
        assert!(dir.join("stages/boot.log").is_file());
        assert_eq!(fx.store.latest().unwrap().as_deref(), Some("seed"));
    }

    #[tokio::test]
    async fn test_assertion_mismatch_fails_validate() {
        let fx = Fixture::new();
        let scenarios = fx.scenario(SCENARIO, EXPECTED_FAIL);

        let report = fx
            .orchestrator(config(fake_vm_args()))
            .run(fx.request(&scenarios), no_cancel())
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Failed);
        assert!(outcome(&report, "execute").is_success());
        assert!(outcome(&report, "validate").is_failure());
        assert_eq!(report.counts.failed, 1);
        let diffs = &report.scenarios[0].operations[0].diffs;
        assert_eq!(diffs[0].field, "status");

        let tag = report.published_tag.clone().unwrap();
        let dir = fx.store.root().join("bundles").join(&tag);
        assert!(dir.join("diffs/01-inventory__01-checkout.json").is_file());
        assert_eq!(fx.store.latest().unwrap().as_deref(), Some("seed"));
    }

    #[tokio::test]
    async fn test_vm_death_during_execute_keeps_results() {
        let fx = Fixture::new();
        let pid_file = fx.root.join("vm.pid");
        let mut body = SCENARIO.to_string();
        body.push_str(&format!(
            r#"
[[operations]]
id = "kill-vm"
kind = "exec"
identity = "operator"
command = "kill -9 $(cat {}); sleep 1"

[[operations]]
id = "status"
kind = "exec"
command = "echo '{{{{}}}}'"
"#,
            pid_file.display()
        ));
        let expected = r#"{
            "checkout": {"structured": {"fields": {"status": "available", "item": 42}}},
            "status": {"structured": {"fields": {}}}
        }"#;
        let scenarios = fx.scenario(&body, expected);
        let cfg = config(vec![
            "-c".into(),
            format!(
                "echo $$ > {}; echo vmci-ready; exec sleep 60",
                pid_file.display()
            ),
        ]);

        let report = fx
            .orchestrator(cfg)
            .run(fx.request(&scenarios), no_cancel())
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Failed);
        match outcome(&report, "execute") {
            StageOutcome::Failure { reason, .. } => assert!(reason.contains("no longer running")),
            other => panic!("expected execute failure, got {other:?}"),
        }
        assert!(outcome(&report, "validate").is_skipped());
        assert!(outcome(&report, "publish").is_success());

        assert_eq!(report.counts.total, 3);
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.counts.errored, 1);
        let checkout = &report.scenarios[0].operations[0];
        assert_eq!(checkout.diffs[0].field, "status");

        let tag = report.published_tag.clone().unwrap();
        let dir = fx.store.root().join("bundles").join(&tag);
        assert!(dir.join("diffs/01-inventory__01-checkout.json").is_file());
        assert!(dir.join("diffs/01-inventory__03-status.json").is_file());
    }

    #[tokio::test]
    async fn test_publish_log_failure_keeps_passing_verdict() {
        let fx = Fixture::new();
        let mut body = SCENARIO.to_string();
        // Occupy the publish log path with a directory so it cannot be opened.
        body.push_str(&format!(
            r#"
[[operations]]
id = "block-publish-log"
kind = "exec"
identity = "operator"
command = 'for d in {}/runs/*/stages; do mkdir "$d/publish.log"; done'
"#,
            fx.root.join("work").display()
        ));
        let scenarios = fx.scenario(&body, EXPECTED_PASS);

        let report = fx
            .orchestrator(config(fake_vm_args()))
            .run(fx.request(&scenarios), no_cancel())
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Passed);
        assert_eq!(report.state, RunState::Passed);
        assert!(outcome(&report, "publish").is_success());
        assert!(
            report
                .warnings
                .iter()
                .any(|w| w.contains("publish stage log unavailable"))
        );
        let tag = report.published_tag.clone().unwrap();
        assert_eq!(fx.store.latest().unwrap(), Some(tag));
    }

    #[tokio::test]
    async fn test_cancel_during_provision_tears_down_and_publishes() {
        let fx = Fixture::new();
        let scenarios = fx.scenario(SCENARIO, EXPECTED_PASS);
        let mut cfg = config(fake_vm_args());
        cfg.provision.commands = vec!["sleep 30".into()];
        cfg.provision.command_timeout_secs = 60;

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = tx.send(true);
            // Keep the sender alive until the run is over.
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let started = std::time::Instant::now();
        let report = fx
            .orchestrator(cfg)
            .run(fx.request(&scenarios), rx)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(report.verdict, Verdict::Failed);
        match outcome(&report, "provision") {
            StageOutcome::Failure { reason, .. } => assert_eq!(reason, "run cancelled"),
            other => panic!("expected cancelled provision, got {other:?}"),
        }
        assert!(outcome(&report, "execute").is_skipped());
        assert!(outcome(&report, "publish").is_success());
        assert!(report.published_tag.is_some());
    }

    #[tokio::test]
    async fn test_bad_scenario_rejected_before_boot() {
        let fx = Fixture::new();
        let scenarios = fx.scenario(SCENARIO, "{}");

        let err = fx
            .orchestrator(config(fake_vm_args()))
            .run(fx.request(&scenarios), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, VmciError::Config(_)));
        assert!(!fx.root.join("work").exists());
    }

    #[tokio::test]
    async fn test_on_success_policy_skips_failed_publish() {
        let fx = Fixture::new();
        let scenarios = fx.scenario(SCENARIO, EXPECTED_FAIL);
        let mut cfg = config(fake_vm_args());
        cfg.publish.policy = crate::config::PublishPolicy::OnSuccess;

        let report = fx
            .orchestrator(cfg)
            .run(fx.request(&scenarios), no_cancel())
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Failed);
        assert!(report.published_tag.is_none());
        assert!(report.warnings.iter().any(|w| w.contains("publish skipped")));
        assert_eq!(fx.store.versions(10).unwrap().len(), 1);
    }
}
