//! # Task Dependency Graph
//!
//! Ordering constraints between migration tasks and their persistence.
//!
//! ## Overview
//!
//! - [`TaskGraph`]: in-memory arena graph with cycle rejection and
//!   deterministic topological ordering
//! - [`TaskDagStore`]: persisted `(from, to, payload)` edges, looked up by
//!   destination task
//!
//! ## Usage
//!
//! ```rust
//! use schemaflow_core::dag::{Task, TaskGraph, TaskId};
//!
//! let mut graph = TaskGraph::new();
//! for id in 1..=3 {
//!     graph.add_task(Task::new(id, format!("step {id}"))).unwrap();
//! }
//! graph.add_edge(TaskId(1), TaskId(2)).unwrap();
//! graph.add_edge(TaskId(2), TaskId(3)).unwrap();
//! assert!(graph.add_edge(TaskId(3), TaskId(1)).is_err());
//! assert_eq!(graph.resolve_all().unwrap(), vec![TaskId(1), TaskId(2), TaskId(3)]);
//! ```

pub mod graph;
pub mod store;
pub mod task;

pub use graph::TaskGraph;
pub use store::{
    InMemoryTaskDagStore, PgTaskDagStore, TaskDag, TaskDagCreate, TaskDagFind, TaskDagStore,
};
pub use task::{Task, TaskId};
