use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one migration task inside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationTaskState {
    /// Waiting for prerequisites or a free slot
    #[default]
    Pending,
    /// Driver call in flight
    Running,
    /// Migration applied and recorded
    Succeeded,
    /// Migration failed; stays here until an operator retries or skips it
    Failed,
    /// Operator decided not to run it
    Skipped,
}

impl MigrationTaskState {
    /// No further transition without operator action
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Dependents may start once every prerequisite is in one of these
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl fmt::Display for MigrationTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for MigrationTaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid migration task state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_display() {
        for state in [
            MigrationTaskState::Pending,
            MigrationTaskState::Running,
            MigrationTaskState::Succeeded,
            MigrationTaskState::Failed,
            MigrationTaskState::Skipped,
        ] {
            assert_eq!(state.to_string().parse::<MigrationTaskState>(), Ok(state));
        }
        assert!("complete".parse::<MigrationTaskState>().is_err());
    }

    #[test]
    fn test_only_success_and_skip_satisfy_dependents() {
        assert!(MigrationTaskState::Succeeded.satisfies_dependencies());
        assert!(MigrationTaskState::Skipped.satisfies_dependencies());
        assert!(!MigrationTaskState::Failed.satisfies_dependencies());
        assert!(!MigrationTaskState::Running.satisfies_dependencies());
        assert!(MigrationTaskState::Failed.is_terminal());
    }
}
