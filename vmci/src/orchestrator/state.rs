//! Run state machine.
//!
//! ```text
//! Pending → Fetching → Booting → Provisioning → Executing → Validating → Publishing → Passed
//!              │          │           │              │            │            │
//!              └──────────┴───────────┴──────────────┴────────────┴────────────┴──→ Failed
//! ```
//!
//! A failed run still publishes what it collected, but its state stays
//! `Failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use vmci_shared::{VmciError, VmciResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Fetching,
    Booting,
    Provisioning,
    Executing,
    Validating,
    Publishing,
    Passed,
    Failed,
}

/// What happened to the run, as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Begin,
    StageSucceeded,
    StageFailed,
    /// Publishing finished. `passed` is the verdict of everything before it.
    Finish { passed: bool },
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Fetching => "fetching",
            RunState::Booting => "booting",
            RunState::Provisioning => "provisioning",
            RunState::Executing => "executing",
            RunState::Validating => "validating",
            RunState::Publishing => "publishing",
            RunState::Passed => "passed",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Passed | RunState::Failed)
    }

    /// Transition table.
    pub fn next(self, event: RunEvent) -> VmciResult<RunState> {
        use RunEvent::*;
        use RunState::*;

        let next = match (self, event) {
            (Pending, Begin) => Fetching,
            (Fetching, StageSucceeded) => Booting,
            (Booting, StageSucceeded) => Provisioning,
            (Provisioning, StageSucceeded) => Executing,
            (Executing, StageSucceeded) => Validating,
            (Validating, StageSucceeded) => Publishing,
            (Publishing, StageSucceeded) => Publishing,
            (Publishing, Finish { passed: true }) => Passed,
            (Publishing, Finish { passed: false }) => Failed,
            (Failed, Finish { .. }) => Failed,
            (state, StageFailed) if !state.is_terminal() && state != Pending => Failed,
            (state, event) => {
                return Err(VmciError::InvalidState(format!(
                    "no transition from {} on {:?}",
                    state, event
                )));
            }
        };
        Ok(next)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
}

/// Current state plus the append-only transition history.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    state: RunState,
    history: Vec<StateTransition>,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self {
            state: RunState::Pending,
            history: Vec::new(),
        }
    }
}

impl RunStateMachine {
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Apply an event. Self-transitions are not recorded.
    pub fn apply(&mut self, event: RunEvent) -> VmciResult<RunState> {
        let next = self.state.next(event)?;
        if next != self.state {
            tracing::info!(from = %self.state, to = %next, "Run state transition");
            self.history.push(StateTransition {
                from: self.state,
                to: next,
                at: Utc::now(),
            });
            self.state = next;
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut machine = RunStateMachine::default();
        machine.apply(RunEvent::Begin).unwrap();
        for _ in 0..5 {
            machine.apply(RunEvent::StageSucceeded).unwrap();
        }
        assert_eq!(machine.state(), RunState::Publishing);
        machine.apply(RunEvent::Finish { passed: true }).unwrap();
        assert_eq!(machine.state(), RunState::Passed);

        let visited: Vec<RunState> = machine.history().iter().map(|t| t.to).collect();
        assert_eq!(
            visited,
            vec![
                RunState::Fetching,
                RunState::Booting,
                RunState::Provisioning,
                RunState::Executing,
                RunState::Validating,
                RunState::Publishing,
                RunState::Passed,
            ]
        );
    }

    #[test]
    fn test_any_stage_can_fail() {
        for successes in 0..5 {
            let mut machine = RunStateMachine::default();
            machine.apply(RunEvent::Begin).unwrap();
            for _ in 0..successes {
                machine.apply(RunEvent::StageSucceeded).unwrap();
            }
            assert_eq!(machine.apply(RunEvent::StageFailed).unwrap(), RunState::Failed);
            assert_eq!(
                machine.apply(RunEvent::Finish { passed: true }).unwrap(),
                RunState::Failed
            );
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(RunState::Pending.next(RunEvent::StageSucceeded).is_err());
        assert!(RunState::Pending.next(RunEvent::StageFailed).is_err());
        assert!(RunState::Passed.next(RunEvent::StageFailed).is_err());
        assert!(RunState::Failed.next(RunEvent::StageSucceeded).is_err());
        assert!(RunState::Booting.next(RunEvent::Finish { passed: true }).is_err());
    }
}
