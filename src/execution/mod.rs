//! # Migration Execution
//!
//! Plans, per-task state machines and the engine that runs them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use schemaflow_core::context::OperationContext;
//! use schemaflow_core::dag::{Task, TaskGraph};
//! use schemaflow_core::db::{
//!     register_builtin_drivers, ConnectionConfig, DriverConfig, DriverRegistry, EngineType,
//!     MigrationInfo,
//! };
//! use schemaflow_core::config::ExecutionConfig;
//! use schemaflow_core::execution::{
//!     MigrationEngine, MigrationPlan, MigrationTarget, MigrationTask, MigrationUnit,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> schemaflow_core::error::Result<()> {
//! let registry = Arc::new(register_builtin_drivers(DriverRegistry::builder())?.build());
//! let mut graph = TaskGraph::new();
//! graph.add_task(Task::new(1, "create users"))?;
//!
//! let target = MigrationTarget::new(
//!     EngineType::Postgres,
//!     ConnectionConfig::new("localhost").with_credentials("postgres", "secret"),
//! );
//! let unit = MigrationUnit::new(
//!     "users-1",
//!     MigrationInfo::new("app", "20240101000000"),
//!     "CREATE TABLE users (id BIGINT PRIMARY KEY)",
//! );
//! let plan = MigrationPlan::new(graph).with_task(MigrationTask::new(1, unit, target))?;
//!
//! let engine = MigrationEngine::new(registry, DriverConfig::default(), ExecutionConfig::default());
//! let report = engine.run(&plan, &OperationContext::new()).await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod events;
pub mod plan;
pub mod state_machine;
pub mod states;

pub use engine::{MigrationEngine, PipelineReport, TaskOutcome};
pub use events::MigrationEvent;
pub use plan::{MigrationPlan, MigrationTarget, MigrationTask, MigrationUnit};
pub use state_machine::{
    GuardContext, MigrationStateMachine, PrerequisitesSatisfiedGuard, StateGuard, StateTransition,
};
pub use states::MigrationTaskState;
