//! Generic table-driven stage execution framework.
//!
//! ## Architecture
//!
//! ```text
//! ExecutionPlan → Stages → Task
//!
//! - ExecutionPlan: ordered list of stages
//! - Stage: one task plus the policy deciding whether it runs after a failure
//! - Task: atomic unit of work over a shared context
//! ```
//!
//! Stages run strictly in order; no stage starts before its predecessor has a
//! terminal outcome. After the first failure, `RequiresSuccess` stages are
//! recorded as skipped while `Always` stages still run.
//!
//! ## Example
//!
//! ```ignore
//! use pipeline::{ExecutionPlan, PipelineExecutor, Stage};
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! let plan = ExecutionPlan::new(vec![
//!     Stage::required(Box::new(FetchTask)),
//!     Stage::always(Box::new(PublishTask)),
//! ]);
//!
//! let ctx = Arc::new(Mutex::new(Context::default()));
//! let metrics = PipelineExecutor::execute(plan, ctx, cancel_rx, &()).await;
//! println!("pipeline took {}ms", metrics.total_duration_ms);
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageOutcome, StageRecord};
pub use pipeline::{ExecutionPlan, PipelineExecutor, StageObserver};
pub use stage::{Stage, StagePolicy};
pub use task::{BoxedTask, PipelineTask};
