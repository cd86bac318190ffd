//! Error types for the schemaflow core.
//!
//! Every driver, graph and engine operation returns [`SchemaflowError`]. The
//! variants follow the failure taxonomy callers branch on:
//!
//! - **Connection**: unreachable host, rejected credentials, bad TLS setup,
//!   or use of a driver that is not open
//! - **Query**: a statement failed; the offending statement is kept for diagnostics
//! - **Validation**: cycle detected, duplicate edge, unregistered engine type
//! - **Consistency**: an expected-unique lookup returned zero or several rows
//! - **Cancelled**: the caller's cancellation token or deadline fired mid-operation

use crate::dag::TaskId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest statement excerpt carried in an error message
const STATEMENT_EXCERPT_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaflowError {
    #[error("Connection error ({engine} {target}): {reason}")]
    Connection {
        engine: String,
        target: String,
        reason: String,
    },

    #[error("Query error: {reason} [statement: {}]", excerpt(.statement))]
    Query { statement: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected among tasks {}", format_task_ids(.tasks))]
    Cycle { tasks: Vec<TaskId> },

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Operation '{operation}' cancelled: {reason}")]
    Cancelled { operation: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classification used in reports and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Query,
    Validation,
    Consistency,
    Cancellation,
    Configuration,
    Io,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Validation => "validation",
            Self::Consistency => "consistency",
            Self::Cancellation => "cancellation",
            Self::Configuration => "configuration",
            Self::Io => "io",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl SchemaflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Query { .. } => ErrorKind::Query,
            Self::Validation(_) | Self::Cycle { .. } => ErrorKind::Validation,
            Self::Consistency(_) => ErrorKind::Consistency,
            Self::Cancelled { .. } => ErrorKind::Cancellation,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Io(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Connection-level failures that a pipeline may choose to retry.
    ///
    /// The engine itself never retries; this only informs the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn connection(
        engine: impl fmt::Display,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Connection {
            engine: engine.to_string(),
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn query(statement: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Query {
            statement: statement.into(),
            reason: reason.to_string(),
        }
    }

    pub fn cancelled(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Driver method called before `open` or after `close`
    pub fn not_open(engine: impl fmt::Display) -> Self {
        Self::connection(engine, "-", "driver is not open")
    }

    /// Classify a sqlx failure raised while running `statement`
    pub fn from_sqlx(statement: &str, error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::connection("postgres", "-", error.to_string()),
            sqlx::Error::RowNotFound => Self::Consistency(format!(
                "Expected a row but none was returned [statement: {}]",
                excerpt(statement)
            )),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Validation(db.message().to_string())
            }
            _ => Self::query(statement, error),
        }
    }
}

fn excerpt(statement: &str) -> String {
    let trimmed = statement.trim();
    if trimmed.chars().count() <= STATEMENT_EXCERPT_LIMIT {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(STATEMENT_EXCERPT_LIMIT).collect();
    format!("{head}...")
}

fn format_task_ids(tasks: &[TaskId]) -> String {
    let ids: Vec<String> = tasks.iter().map(ToString::to_string).collect();
    format!("[{}]", ids.join(", "))
}

impl From<std::io::Error> for SchemaflowError {
    fn from(error: std::io::Error) -> Self {
        SchemaflowError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for SchemaflowError {
    fn from(error: serde_json::Error) -> Self {
        SchemaflowError::Internal(format!("JSON serialization error: {error}"))
    }
}

impl From<crate::config::ConfigurationError> for SchemaflowError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        SchemaflowError::Configuration(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchemaflowError>;
