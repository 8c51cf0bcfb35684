//! Generic pipeline execution framework.
//!
//! Runs stages sequentially over a shared context, turning every task result
//! into a terminal [`StageOutcome`].

use super::metrics::{PipelineMetrics, StageOutcome, StageRecord};
use super::stage::{Stage, StagePolicy};
use super::task::BoxedTask;
use chrono::Utc;
use std::time::Instant;
use tokio::sync::watch;
use vmci_shared::VmciError;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    pub fn stages(self) -> Vec<Stage<BoxedTask<Ctx>>> {
        self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Receives stage lifecycle notifications as they happen.
///
/// `stage_finished` is called before the next stage starts, so an observer
/// can make the outcome visible to later tasks.
pub trait StageObserver: Send + Sync {
    fn stage_started(&self, _index: usize, _name: &str) {}
    fn stage_finished(&self, _record: &StageRecord) {}
}

impl StageObserver for () {}

/// Pipeline executor framework.
///
/// This provides the generic infrastructure for executing a table-driven pipeline.
/// The actual task execution logic is provided by task implementations.
pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Execute a pipeline.
    ///
    /// Never fails itself: every stage ends up in the returned metrics as a
    /// success, failure or skip. Setting `cancel` to `true` interrupts the
    /// running stage (recorded as a `cancelled` failure) and skips every
    /// remaining `RequiresSuccess` stage; `Always` stages still run to completion.
    pub async fn execute<Ctx>(
        plan: ExecutionPlan<Ctx>,
        ctx: Ctx,
        mut cancel: watch::Receiver<bool>,
        observer: &dyn StageObserver,
    ) -> PipelineMetrics
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut records = Vec::new();
        let mut failed = false;

        for (index, stage) in plan.stages().into_iter().enumerate() {
            let name = stage.task.name().to_string();
            let started_at = Utc::now();
            let stage_start = Instant::now();
            let cancelled = *cancel.borrow();

            let outcome = if stage.policy == StagePolicy::RequiresSuccess && cancelled {
                StageOutcome::Skipped {
                    reason: "run cancelled".to_string(),
                }
            } else if stage.policy == StagePolicy::RequiresSuccess && failed {
                StageOutcome::Skipped {
                    reason: "previous stage failed".to_string(),
                }
            } else {
                observer.stage_started(index, &name);
                tracing::info!(stage = %name, index, "Stage started");

                let result = if stage.policy == StagePolicy::Always {
                    stage.task.run(ctx.clone()).await
                } else {
                    tokio::select! {
                        result = stage.task.run(ctx.clone()) => result,
                        _ = wait_cancelled(&mut cancel) => Err(VmciError::Cancelled),
                    }
                };

                match result {
                    Ok(()) => StageOutcome::Success,
                    Err(err) => StageOutcome::Failure {
                        reason: err.to_string(),
                        log: err.diagnostic_log().map(str::to_string),
                    },
                }
            };

            if outcome.is_failure() {
                failed = true;
            }

            let record = StageRecord {
                index,
                name,
                policy: stage.policy,
                outcome,
                started_at,
                duration_ms: stage_start.elapsed().as_millis(),
            };

            match &record.outcome {
                StageOutcome::Success => tracing::info!(
                    stage = %record.name,
                    duration_ms = record.duration_ms as u64,
                    "Stage succeeded"
                ),
                StageOutcome::Failure { reason, .. } => tracing::error!(
                    stage = %record.name,
                    duration_ms = record.duration_ms as u64,
                    reason = %reason,
                    "Stage failed"
                ),
                StageOutcome::Skipped { reason } => {
                    tracing::info!(stage = %record.name, reason = %reason, "Stage skipped")
                }
            }

            observer.stage_finished(&record);
            records.push(record);
        }

        PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: records,
        }
    }
}

/// Resolves once cancellation is requested; never resolves if the sender is gone.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTask;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use vmci_shared::VmciResult;

    type Trace = Arc<Mutex<Vec<String>>>;

    enum Behavior {
        Succeed,
        Fail,
        Hang,
    }

    struct Step {
        name: &'static str,
        behavior: Behavior,
    }

    #[async_trait]
    impl PipelineTask<Trace> for Step {
        async fn run(self: Box<Self>, ctx: Trace) -> VmciResult<()> {
            ctx.lock().push(self.name.to_string());
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err(VmciError::Boot {
                    reason: "readiness timeout".into(),
                    console_log: "kernel panic".into(),
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    fn step(name: &'static str, behavior: Behavior) -> BoxedTask<Trace> {
        Box::new(Step { name, behavior })
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl StageObserver for Recorder {
        fn stage_started(&self, _index: usize, name: &str) {
            self.0.lock().push(format!("start:{}", name));
        }
        fn stage_finished(&self, record: &StageRecord) {
            self.0.lock().push(format!("end:{}", record.name));
        }
    }

    #[tokio::test]
    async fn test_all_stages_run_in_order() {
        let (_tx, rx) = watch::channel(false);
        let trace = Trace::default();
        let plan = ExecutionPlan::new(vec![
            Stage::required(step("fetch", Behavior::Succeed)),
            Stage::required(step("boot", Behavior::Succeed)),
            Stage::always(step("publish", Behavior::Succeed)),
        ]);
        let recorder = Recorder::default();

        let metrics = PipelineExecutor::execute(plan, trace.clone(), rx, &recorder).await;

        assert!(metrics.all_succeeded());
        assert_eq!(*trace.lock(), vec!["fetch", "boot", "publish"]);
        assert_eq!(
            *recorder.0.lock(),
            vec![
                "start:fetch",
                "end:fetch",
                "start:boot",
                "end:boot",
                "start:publish",
                "end:publish"
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_skips_required_but_runs_always() {
        let (_tx, rx) = watch::channel(false);
        let trace = Trace::default();
        let plan = ExecutionPlan::new(vec![
            Stage::required(step("fetch", Behavior::Succeed)),
            Stage::required(step("boot", Behavior::Fail)),
            Stage::required(step("provision", Behavior::Succeed)),
            Stage::required(step("execute", Behavior::Succeed)),
            Stage::always(step("publish", Behavior::Succeed)),
        ]);

        let metrics = PipelineExecutor::execute(plan, trace.clone(), rx, &()).await;

        assert_eq!(*trace.lock(), vec!["fetch", "boot", "publish"]);
        assert_eq!(
            metrics.outcome("boot"),
            Some(&StageOutcome::Failure {
                reason: "boot error: readiness timeout".into(),
                log: Some("kernel panic".into()),
            })
        );
        assert!(metrics.outcome("provision").unwrap().is_skipped());
        assert!(metrics.outcome("execute").unwrap().is_skipped());
        assert!(metrics.outcome("publish").unwrap().is_success());
        assert_eq!(metrics.first_failure().unwrap().name, "boot");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_stage() {
        let (tx, rx) = watch::channel(false);
        let trace = Trace::default();
        let plan = ExecutionPlan::new(vec![
            Stage::required(step("boot", Behavior::Hang)),
            Stage::required(step("provision", Behavior::Succeed)),
            Stage::always(step("publish", Behavior::Succeed)),
        ]);

        let handle = tokio::spawn({
            let trace = trace.clone();
            async move { PipelineExecutor::execute(plan, trace, rx, &()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let metrics = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            metrics.outcome("boot"),
            Some(&StageOutcome::Failure {
                reason: "run cancelled".into(),
                log: None,
            })
        );
        assert_eq!(
            metrics.outcome("provision"),
            Some(&StageOutcome::Skipped {
                reason: "run cancelled".into()
            })
        );
        assert!(metrics.outcome("publish").unwrap().is_success());
        assert_eq!(*trace.lock(), vec!["boot", "publish"]);
    }

    #[tokio::test]
    async fn test_dropped_cancel_sender_never_cancels() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let plan = ExecutionPlan::new(vec![Stage::required(step("fetch", Behavior::Succeed))]);
        let metrics = PipelineExecutor::execute(plan, Trace::default(), rx, &()).await;
        assert!(metrics.all_succeeded());
    }
}
