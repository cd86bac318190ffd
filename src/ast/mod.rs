//! # Statement AST
//!
//! Typed tree for the DDL statements the orchestrator inspects and rewrites.
//!
//! ## Overview
//!
//! Statements are owned trees ([`Statement`]) viewed through a borrowed,
//! copyable [`NodeRef`]. A single generic [`walk`] drives depth-first
//! traversal in a fixed order; behaviour lives in [`Visitor`] implementations.
//!
//! ## Key Features
//!
//! - **Closed node set**: thirteen node kinds, dispatched exhaustively
//! - **Pruning**: a visitor returns `None` to skip a subtree
//! - **Immutable rewrites**: [`rewrite`] functions build new trees
//! - **Rendering**: [`render`] turns trees into engine DDL
//! - **Validation**: [`SchemaValidator`] checks statements against a catalog
//!
//! ## Usage
//!
//! ```rust
//! use schemaflow_core::ast::{Statement, RenameTableStmt, TableDef, TableCollector};
//!
//! let stmt = Statement::RenameTable(RenameTableStmt {
//!     table: TableDef::new("users"),
//!     new_name: "members".into(),
//! });
//! let tables = TableCollector::new().collect(stmt.as_node());
//! assert_eq!(tables, vec![TableDef::new("users")]);
//! ```

pub mod node;
pub mod render;
pub mod rewrite;
pub mod validate;
pub mod visitors;
pub mod walk;

pub use node::{
    AddColumnListStmt, AddConstraintStmt, AlterTableStmt, ChangeColumnStmt, ColumnDef,
    ConstraintDef, ConstraintType, CreateTableStmt, DropConstraintStmt, ForeignDef, NodeRef,
    RenameColumnStmt, RenameConstraintStmt, RenameTableStmt, Statement, TableDef,
};
pub use render::{render, Dialect};
pub use validate::{SchemaValidator, ValidationIssue};
pub use visitors::{NodeCounter, TableCollector};
pub use walk::{inspect, walk, Inspector, Visitor};
