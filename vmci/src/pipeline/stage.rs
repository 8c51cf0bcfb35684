//! Stage definition for table-driven pipeline execution.

use serde::{Deserialize, Serialize};

/// Whether a stage runs once an earlier stage has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePolicy {
    /// Runs only if every earlier stage succeeded; otherwise recorded as skipped.
    RequiresSuccess,
    /// Runs regardless of earlier failures or cancellation (log collection, cleanup).
    Always,
}

/// A stage wraps one task and its policy.
///
/// Generic over task type T to allow different pipeline implementations.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub task: T,
    pub policy: StagePolicy,
}

impl<T> Stage<T> {
    /// Create a stage that is skipped after any earlier failure.
    pub fn required(task: T) -> Self {
        Self {
            task,
            policy: StagePolicy::RequiresSuccess,
        }
    }

    /// Create a stage that always runs.
    pub fn always(task: T) -> Self {
        Self {
            task,
            policy: StagePolicy::Always,
        }
    }
}
