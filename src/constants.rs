//! # System Constants
//!
//! Names shared across drivers, configuration and logging.

/// History table created in the internal database (ClickHouse) or schema (PostgreSQL)
pub const MIGRATION_HISTORY_TABLE: &str = "migration_history";

/// Prefix of environment overrides, e.g. `SCHEMAFLOW__EXECUTION__MAX_CONCURRENT_TASKS`
pub const ENV_PREFIX: &str = "SCHEMAFLOW";

/// Environment variables consulted, in order, to name the deployment environment
pub const ENVIRONMENT_VARIABLES: [&str; 2] = ["SCHEMAFLOW_ENV", "APP_ENV"];

/// Prefix of ClickHouse session ids opened by the driver
pub const SESSION_ID_PREFIX: &str = "schemaflow";

/// Operation names recorded in structured logs
pub mod operations {
    pub const OPEN: &str = "open";
    pub const CLOSE: &str = "close";
    pub const EXECUTE_MIGRATION: &str = "execute_migration";
    pub const DUMP: &str = "dump";
    pub const RESTORE: &str = "restore";
    pub const RUN_TASK: &str = "run_task";
}
