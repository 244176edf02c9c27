//! Execution state machine with an explicit transition table.
//!
//! Every state change during a run goes through `ExecutionStateMachine`,
//! which rejects transitions the table does not allow. Terminal states
//! (`Completed`, `Failed`, `Cancelled`) accept no further transitions.

use thiserror::Error;
use weft_types::execution::ExecutionState;

/// Rejected state transition.
#[derive(Debug, Error, PartialEq)]
#[error("invalid state transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ExecutionState,
    pub to: ExecutionState,
}

/// Tracks the current state of a run and enforces legal transitions.
#[derive(Debug, Clone)]
pub struct ExecutionStateMachine {
    current: ExecutionState,
}

impl ExecutionStateMachine {
    pub fn new() -> Self {
        Self {
            current: ExecutionState::Idle,
        }
    }

    /// Resume a machine from a persisted state (checkpoint restore).
    pub fn from_state(state: ExecutionState) -> Self {
        Self { current: state }
    }

    pub fn current(&self) -> ExecutionState {
        self.current
    }

    /// Whether `to` is reachable from the current state.
    pub fn can_transition(&self, to: ExecutionState) -> bool {
        Self::allowed(self.current, to)
    }

    /// Attempt a transition, updating the current state on success.
    pub fn transition(&mut self, to: ExecutionState) -> Result<(), InvalidTransition> {
        if !Self::allowed(self.current, to) {
            return Err(InvalidTransition {
                from: self.current,
                to,
            });
        }
        tracing::debug!(from = ?self.current, to = ?to, "execution state transition");
        self.current = to;
        Ok(())
    }

    /// The transition table. Anything not listed is illegal.
    fn allowed(from: ExecutionState, to: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (from, to),
            (Idle, Parsing)
                | (Parsing, Validating)
                | (Parsing, Failed)
                | (Validating, BuildingGraph)
                | (Validating, Failed)
                | (BuildingGraph, Scheduling)
                | (BuildingGraph, Failed)
                | (Scheduling, Executing)
                | (Scheduling, Failed)
                | (Executing, AwaitingCompletion)
                | (Executing, CreatingCheckpoint)
                | (Executing, Paused)
                | (Executing, Cancelled)
                | (Executing, Failed)
                | (AwaitingCompletion, Executing)
                | (AwaitingCompletion, AggregatingResults)
                | (AwaitingCompletion, CreatingCheckpoint)
                | (AwaitingCompletion, Paused)
                | (AwaitingCompletion, Cancelled)
                | (AwaitingCompletion, Failed)
                | (CreatingCheckpoint, Executing)
                | (CreatingCheckpoint, AwaitingCompletion)
                | (CreatingCheckpoint, Paused)
                | (CreatingCheckpoint, Failed)
                | (Paused, RestoringCheckpoint)
                | (Paused, Cancelled)
                | (RestoringCheckpoint, Executing)
                | (RestoringCheckpoint, Failed)
                | (AggregatingResults, Completed)
                | (AggregatingResults, Failed)
        )
    }
}

impl Default for ExecutionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn test_happy_path_to_completed() {
        let mut sm = ExecutionStateMachine::new();
        for state in [
            Parsing,
            Validating,
            BuildingGraph,
            Scheduling,
            Executing,
            AwaitingCompletion,
            AggregatingResults,
            Completed,
        ] {
            sm.transition(state).unwrap();
        }
        assert_eq!(sm.current(), Completed);
        assert!(sm.current().is_terminal());
    }

    #[test]
    fn test_level_loop_cycles_between_executing_and_awaiting() {
        let mut sm = ExecutionStateMachine::from_state(Executing);
        sm.transition(AwaitingCompletion).unwrap();
        sm.transition(Executing).unwrap();
        sm.transition(AwaitingCompletion).unwrap();
        assert_eq!(sm.current(), AwaitingCompletion);
    }

    #[test]
    fn test_checkpoint_detour_returns_to_executing() {
        let mut sm = ExecutionStateMachine::from_state(Executing);
        sm.transition(CreatingCheckpoint).unwrap();
        sm.transition(Executing).unwrap();
        assert_eq!(sm.current(), Executing);
    }

    #[test]
    fn test_pause_and_resume_via_checkpoint_restore() {
        let mut sm = ExecutionStateMachine::from_state(Executing);
        sm.transition(Paused).unwrap();
        sm.transition(RestoringCheckpoint).unwrap();
        sm.transition(Executing).unwrap();
        assert_eq!(sm.current(), Executing);
    }

    #[test]
    fn test_cancel_from_paused() {
        let mut sm = ExecutionStateMachine::from_state(Paused);
        sm.transition(Cancelled).unwrap();
        assert!(sm.current().is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [Completed, Failed, Cancelled] {
            let mut sm = ExecutionStateMachine::from_state(terminal);
            for target in [Idle, Parsing, Executing, Paused, Completed, Failed] {
                let err = sm.transition(target).unwrap_err();
                assert_eq!(err.from, terminal);
            }
        }
    }

    #[test]
    fn test_skipping_phases_rejected() {
        let mut sm = ExecutionStateMachine::new();
        let err = sm.transition(Executing).unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                from: Idle,
                to: Executing
            }
        );
        // State is unchanged after a rejected transition.
        assert_eq!(sm.current(), Idle);
    }

    #[test]
    fn test_failure_reachable_from_every_active_phase() {
        for from in [
            Parsing,
            Validating,
            BuildingGraph,
            Scheduling,
            Executing,
            AwaitingCompletion,
            CreatingCheckpoint,
            RestoringCheckpoint,
            AggregatingResults,
        ] {
            let mut sm = ExecutionStateMachine::from_state(from);
            assert!(
                sm.transition(ExecutionState::Failed).is_ok(),
                "Failed unreachable from {from:?}"
            );
        }
    }

    #[test]
    fn test_idle_cannot_fail_directly() {
        let sm = ExecutionStateMachine::new();
        assert!(!sm.can_transition(Failed));
    }
}
