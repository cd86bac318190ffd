//! # Driver Contract
//!
//! The uniform contract every engine backend satisfies.
//!
//! ## Lifecycle
//!
//! A driver is constructed from a [`DriverConfig`] by the registry, becomes
//! usable after a successful [`Driver::open`], and releases its connection on
//! [`Driver::close`]. Calling any other method on a driver that is not open
//! fails with a `Connection` error. `close` is idempotent.
//!
//! A driver instance is owned by one task at a time; concurrent work uses
//! separate instances with their own connections.
//!
//! ## Cancellation
//!
//! Every method takes an [`OperationContext`]. Drivers race their network
//! round-trips against it and roll back any open transaction when it fires.

use super::tls::TlsConfig;
use super::types::{
    ConnectionConfig, ConnectionContext, DbSchema, DbUser, EngineType, MigrationHistory,
    MigrationHistoryFind, MigrationInfo,
};
use crate::context::OperationContext;
use crate::error::{Result, SchemaflowError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};

/// Name of the metadata database (ClickHouse) or schema (PostgreSQL) that
/// holds migration history
pub const DEFAULT_INTERNAL_DATABASE: &str = "bytebase";

/// Settings shared by every driver instance a registry constructs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_internal_database")]
    pub internal_database: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    #[serde(default)]
    pub tls_profiles: HashMap<String, TlsConfig>,
}

fn default_internal_database() -> String {
    DEFAULT_INTERNAL_DATABASE.to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            internal_database: default_internal_database(),
            max_connections: default_max_connections(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            tls_profiles: HashMap::new(),
        }
    }
}

impl DriverConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Constructor registered per engine type
pub type DriverConstructor = fn(DriverConfig) -> Box<dyn Driver>;

#[async_trait]
pub trait Driver: Send + Sync {
    fn engine(&self) -> EngineType;

    fn is_open(&self) -> bool;

    /// Connect. Credentials never appear in logs or errors.
    async fn open(
        &mut self,
        ctx: &OperationContext,
        engine: EngineType,
        config: &ConnectionConfig,
        connection: &ConnectionContext,
    ) -> Result<()>;

    /// Release the connection; later calls are no-ops
    async fn close(&mut self, ctx: &OperationContext) -> Result<()>;

    async fn ping(&self, ctx: &OperationContext) -> Result<()>;

    async fn get_version(&self, ctx: &OperationContext) -> Result<String>;

    /// Principals and schemas, excluding system and internal databases
    async fn sync_schema(&self, ctx: &OperationContext) -> Result<(Vec<DbUser>, Vec<DbSchema>)>;

    /// Run `statement` (one or more statements) as a unit
    async fn execute(&self, ctx: &OperationContext, statement: &str) -> Result<()>;

    async fn needs_setup_migration(&self, ctx: &OperationContext) -> Result<bool>;

    async fn setup_migration_if_needed(&self, ctx: &OperationContext) -> Result<()>;

    /// Apply `statement` and record it in history.
    ///
    /// Returns the history sequence and the schema snapshot taken after the
    /// migration. When `info.version` already has a `Done` record the
    /// statement is not re-applied and that record's values are returned.
    async fn execute_migration(
        &self,
        ctx: &OperationContext,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<(i64, String)>;

    async fn find_migration_history_list(
        &self,
        ctx: &OperationContext,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>>;

    /// Write `database` as a `;`-terminated statement stream
    async fn dump(
        &self,
        ctx: &OperationContext,
        database: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
        schema_only: bool,
    ) -> Result<()>;

    /// Replay a statement stream produced by [`Driver::dump`]
    async fn restore(
        &self,
        ctx: &OperationContext,
        input: &mut (dyn AsyncBufRead + Unpin + Send),
    ) -> Result<()>;
}

/// Reject an `open` for an engine the driver does not implement
pub fn ensure_engine(expected: EngineType, requested: EngineType) -> Result<()> {
    if expected == requested {
        Ok(())
    } else {
        Err(SchemaflowError::Configuration(format!(
            "{expected} driver cannot open a {requested} connection"
        )))
    }
}
