//! Workflow executor.
//!
//! Scenarios run in declaration order and operations in declared order,
//! strictly one at a time against the single VM session.

mod executor;
mod scenario;

pub use executor::{
    OperationCounts, OperationResult, OperationStatus, ScenarioResult, WorkflowExecutor,
    WorkflowOutcome, WorkflowRun,
};
pub use scenario::{Operation, ParamValue, Scenario, discover, load_scenarios};
