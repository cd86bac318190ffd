#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, ClickHouse in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Schemaflow Core
//!
//! Core of a multi-engine database schema migration orchestrator.
//!
//! ## Overview
//!
//! Schemaflow applies versioned schema changes to heterogeneous database
//! engines through one driver contract, records what has run in a
//! per-database history table, and sequences dependent changes so that
//! connected migrations never overlap.
//!
//! ## Module Organization
//!
//! - [`db`] - Driver contract, engine registry, PostgreSQL and ClickHouse drivers
//! - [`dag`] - Task dependency graph and persisted edges
//! - [`execution`] - Migration plans, per-task state machine and the engine
//! - [`ast`] - Statement tree, generic walker and visitors
//! - [`config`] - Configuration loading and validation
//! - [`context`] - Cancellation and deadlines for driver calls
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup and helpers
//!
//! ## Quick Start
//!
//! ```rust
//! use schemaflow_core::dag::{Task, TaskGraph, TaskId};
//! use schemaflow_core::db::{register_builtin_drivers, DriverRegistry, EngineType};
//!
//! let registry = register_builtin_drivers(DriverRegistry::builder())
//!     .unwrap()
//!     .build();
//! assert!(registry.is_registered(EngineType::ClickHouse));
//!
//! let mut graph = TaskGraph::new();
//! graph.add_task(Task::new(1, "create events")).unwrap();
//! graph.add_task(Task::new(2, "backfill events")).unwrap();
//! graph.add_edge(TaskId(1), TaskId(2)).unwrap();
//! assert_eq!(graph.resolve_all().unwrap(), vec![TaskId(1), TaskId(2)]);
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib                      # Unit tests
//! DATABASE_URL=postgres://... cargo test -- --ignored   # PostgreSQL round trips
//! ```

pub mod ast;
pub mod config;
pub mod constants;
pub mod context;
pub mod dag;
pub mod db;
pub mod error;
pub mod execution;
pub mod logging;

pub use config::{ConfigManager, ExecutionConfig, SchemaflowConfig};
pub use context::OperationContext;
pub use dag::{Task, TaskGraph, TaskId};
pub use db::{Driver, DriverConfig, DriverRegistry, EngineType};
pub use error::{ErrorKind, Result, SchemaflowError};
pub use execution::{MigrationEngine, MigrationPlan, PipelineReport, TaskOutcome};
