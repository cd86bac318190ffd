//! # Migration Task State Machine
//!
//! Per-task transitions with guards and an in-memory transition log.
//!
//! ```text
//! Pending --Start--> Running --Succeed--> Succeeded
//!                            --Fail-----> Failed --Retry--> Pending
//! Pending|Failed --Skip--> Skipped
//! ```
//!
//! `Start` is guarded: every prerequisite must be `Succeeded` or `Skipped`.

use super::events::MigrationEvent;
use super::states::MigrationTaskState;
use crate::dag::TaskId;
use crate::error::{Result, SchemaflowError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Facts a guard may inspect
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub task_id: TaskId,
    /// Current state of every direct prerequisite
    pub prerequisites: &'a [(TaskId, MigrationTaskState)],
}

/// A precondition on a transition
pub trait StateGuard {
    fn check(&self, context: &GuardContext<'_>) -> Result<()>;

    fn description(&self) -> &'static str;
}

/// Every prerequisite finished successfully or was skipped
pub struct PrerequisitesSatisfiedGuard;

impl StateGuard for PrerequisitesSatisfiedGuard {
    fn check(&self, context: &GuardContext<'_>) -> Result<()> {
        let unmet: Vec<String> = context
            .prerequisites
            .iter()
            .filter(|(_, state)| !state.satisfies_dependencies())
            .map(|(id, state)| format!("{id} ({state})"))
            .collect();
        if unmet.is_empty() {
            return Ok(());
        }
        Err(SchemaflowError::Validation(format!(
            "Task {} has unmet prerequisites: {}",
            context.task_id,
            unmet.join(", ")
        )))
    }

    fn description(&self) -> &'static str {
        "All prerequisites must be succeeded or skipped"
    }
}

/// One applied transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: MigrationTaskState,
    pub to: MigrationTaskState,
    pub event: String,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MigrationStateMachine {
    task_id: TaskId,
    state: MigrationTaskState,
    transitions: Vec<StateTransition>,
    sequence: Option<i64>,
    last_error: Option<String>,
}

impl MigrationStateMachine {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: MigrationTaskState::Pending,
            transitions: Vec::new(),
            sequence: None,
            last_error: None,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn current_state(&self) -> MigrationTaskState {
        self.state
    }

    /// History sequence recorded by the successful run
    pub fn sequence(&self) -> Option<i64> {
        self.sequence
    }

    /// Error message of the most recent failure
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Target state for `event`, without guards
    pub fn determine_target_state(
        current: MigrationTaskState,
        event: &MigrationEvent,
    ) -> Result<MigrationTaskState> {
        use MigrationTaskState::*;
        let target = match (current, event) {
            (Pending, MigrationEvent::Start) => Running,
            (Running, MigrationEvent::Succeed(_)) => Succeeded,
            (Running, MigrationEvent::Fail(_)) => Failed,
            (Failed, MigrationEvent::Retry) => Pending,
            (Pending | Failed, MigrationEvent::Skip) => Skipped,
            (from, _) => {
                return Err(SchemaflowError::Validation(format!(
                    "Invalid transition: event '{}' from state {from}",
                    event.event_type()
                )))
            }
        };
        Ok(target)
    }

    /// Apply `event` after checking the guards for the transition
    pub fn transition(
        &mut self,
        event: MigrationEvent,
        prerequisites: &[(TaskId, MigrationTaskState)],
    ) -> Result<MigrationTaskState> {
        let from = self.state;
        let to = Self::determine_target_state(from, &event)?;

        if (from, to) == (MigrationTaskState::Pending, MigrationTaskState::Running) {
            PrerequisitesSatisfiedGuard.check(&GuardContext {
                task_id: self.task_id,
                prerequisites,
            })?;
        }

        match &event {
            MigrationEvent::Succeed(sequence) => self.sequence = Some(*sequence),
            MigrationEvent::Fail(message) => self.last_error = Some(message.clone()),
            _ => {}
        }
        self.transitions.push(StateTransition {
            from,
            to,
            event: event.event_type().to_string(),
            error: event.error_message().map(str::to_string),
            at: Utc::now(),
        });
        self.state = to;
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_happy_path() {
        let mut machine = MigrationStateMachine::new(TaskId(1));
        machine.transition(MigrationEvent::Start, &[]).unwrap();
        let state = machine.transition(MigrationEvent::Succeed(4), &[]).unwrap();
        assert_eq!(state, MigrationTaskState::Succeeded);
        assert_eq!(machine.sequence(), Some(4));
        assert_eq!(machine.transitions().len(), 2);
    }

    #[test]
    fn test_start_requires_satisfied_prerequisites() {
        let mut machine = MigrationStateMachine::new(TaskId(2));
        let prerequisites = [
            (TaskId(1), MigrationTaskState::Succeeded),
            (TaskId(3), MigrationTaskState::Failed),
        ];
        let err = machine
            .transition(MigrationEvent::Start, &prerequisites)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("3 (failed)"));
        assert_eq!(machine.current_state(), MigrationTaskState::Pending);
        assert!(machine.transitions().is_empty());

        let skipped = [(TaskId(1), MigrationTaskState::Skipped)];
        machine.transition(MigrationEvent::Start, &skipped).unwrap();
    }

    #[test]
    fn test_failed_is_terminal_until_operator_acts() {
        let mut machine = MigrationStateMachine::new(TaskId(1));
        machine.transition(MigrationEvent::Start, &[]).unwrap();
        machine
            .transition(MigrationEvent::fail_with_error("boom"), &[])
            .unwrap();
        assert_eq!(machine.last_error(), Some("boom"));
        assert!(machine.transition(MigrationEvent::Start, &[]).is_err());

        machine.transition(MigrationEvent::Retry, &[]).unwrap();
        assert_eq!(machine.current_state(), MigrationTaskState::Pending);
    }

    #[test]
    fn test_skip_rules() {
        use MigrationTaskState::*;
        assert_eq!(
            MigrationStateMachine::determine_target_state(Failed, &MigrationEvent::Skip).unwrap(),
            Skipped
        );
        assert!(MigrationStateMachine::determine_target_state(Running, &MigrationEvent::Skip).is_err());
        assert!(MigrationStateMachine::determine_target_state(Succeeded, &MigrationEvent::Skip).is_err());
        assert!(MigrationStateMachine::determine_target_state(Succeeded, &MigrationEvent::Retry).is_err());
    }

    #[test]
    fn test_guard_description() {
        assert_eq!(
            PrerequisitesSatisfiedGuard.description(),
            "All prerequisites must be succeeded or skipped"
        );
    }
}
