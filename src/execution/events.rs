use serde::{Deserialize, Serialize};

/// Events that move a migration task between states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MigrationEvent {
    /// Launch the driver call
    Start,
    /// Driver recorded the migration under this history sequence
    Succeed(i64),
    /// Driver call failed with this message
    Fail(String),
    /// Operator: run a failed task again
    Retry,
    /// Operator: mark a pending or failed task as not needed
    Skip,
}

impl MigrationEvent {
    /// Event name for logs
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Succeed(_) => "succeed",
            Self::Fail(_) => "fail",
            Self::Retry => "retry",
            Self::Skip => "skip",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Raised by an operator rather than by the engine
    pub fn is_operator_decision(&self) -> bool {
        matches!(self, Self::Retry | Self::Skip)
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
