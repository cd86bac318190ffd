//! # Database Drivers
//!
//! The driver contract, the engine registry and the built-in engine backends.
//!
//! ## Module Organization
//!
//! - [`driver`]: the [`Driver`] trait and shared [`DriverConfig`]
//! - [`registry`]: engine type to constructor mapping
//! - [`types`]: connection settings, schema metadata and migration history
//! - [`tls`]: TLS material and named profiles
//! - [`statement`]: statement-stream splitting used by `execute` and `restore`
//! - [`postgres`], [`clickhouse`]: engine implementations

pub mod clickhouse;
pub mod driver;
pub mod postgres;
pub mod registry;
pub mod statement;
pub mod tls;
pub mod types;

pub use driver::{ensure_engine, Driver, DriverConfig, DriverConstructor, DEFAULT_INTERNAL_DATABASE};
pub use registry::{register_builtin_drivers, DriverRegistry, DriverRegistryBuilder};
pub use statement::{
    is_data_statement, is_transaction_control, quote_literal, split_statements, statement_kind,
    StatementSplitter,
};
pub use tls::{TlsConfig, TlsMaterial};
pub use types::{
    payload_with_error, ConnectionConfig, ConnectionContext, DbColumn, DbConstraint,
    DbConstraintKind, DbSchema, DbTable, DbUser, EngineType, ExcludedDatabases, MigrationHistory,
    MigrationHistoryFind, MigrationInfo, MigrationSource, MigrationStatus, MigrationType,
    REDACTED_PASSWORD,
};
