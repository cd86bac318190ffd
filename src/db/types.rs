//! Shared driver data types: engine identity, connection parameters,
//! introspection results and migration history.

use super::tls::TlsConfig;
use crate::ast::{
    AddConstraintStmt, ColumnDef, ConstraintDef, ConstraintType, CreateTableStmt, ForeignDef,
    SchemaValidator, Statement, TableDef,
};
use crate::error::SchemaflowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Placeholder substituted for passwords in every diagnostic
pub const REDACTED_PASSWORD: &str = "<<redacted password>>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineType {
    Postgres,
    ClickHouse,
}

impl EngineType {
    pub fn default_port(&self, tls: bool) -> u16 {
        match (self, tls) {
            (EngineType::Postgres, _) => 5432,
            (EngineType::ClickHouse, false) => 8123,
            (EngineType::ClickHouse, true) => 8443,
        }
    }

    /// Databases the engine ships with, never reported by `sync_schema`
    pub fn system_databases(&self) -> &'static [&'static str] {
        match self {
            EngineType::Postgres => &["template0", "template1"],
            EngineType::ClickHouse => &["system", "INFORMATION_SCHEMA", "information_schema"],
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineType::Postgres => f.write_str("POSTGRES"),
            EngineType::ClickHouse => f.write_str("CLICKHOUSE"),
        }
    }
}

impl FromStr for EngineType {
    type Err = SchemaflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(EngineType::Postgres),
            "clickhouse" => Ok(EngineType::ClickHouse),
            other => Err(SchemaflowError::Configuration(format!(
                "Unknown engine type: {other}"
            ))),
        }
    }
}

/// Where and how to connect. The password never appears in `Debug` output.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn port_or_default(&self, engine: EngineType) -> u16 {
        self.port
            .unwrap_or_else(|| engine.default_port(self.tls.is_enabled()))
    }

    /// Host starting with `/` names a unix socket directory
    pub fn is_unix_socket(&self) -> bool {
        self.host.starts_with('/')
    }

    /// Replace every occurrence of the password in `text`
    pub fn redact(&self, text: &str) -> String {
        if self.password.is_empty() {
            return text.to_string();
        }
        text.replace(&self.password, REDACTED_PASSWORD)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &REDACTED_PASSWORD)
            .field("database", &self.database)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Diagnostic context attached to a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContext {
    pub environment_name: String,
    pub instance_name: String,
}

impl ConnectionContext {
    pub fn new(environment_name: impl Into<String>, instance_name: impl Into<String>) -> Self {
        Self {
            environment_name: environment_name.into(),
            instance_name: instance_name.into(),
        }
    }
}

/// Databases hidden from schema sync: engine system databases plus the
/// internal metadata database. Matching is exact and case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedDatabases {
    names: BTreeSet<String>,
}

impl ExcludedDatabases {
    pub fn new(engine: EngineType, internal_database: &str) -> Self {
        let mut names: BTreeSet<String> = engine
            .system_databases()
            .iter()
            .map(|s| s.to_string())
            .collect();
        names.insert(internal_database.to_string());
        Self { names }
    }

    pub fn contains(&self, database: &str) -> bool {
        self.names.contains(database)
    }

    /// Keep only the databases that are not excluded, preserving order
    pub fn filter<I, S>(&self, databases: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        databases
            .into_iter()
            .map(|name| -> String { name.into() })
            .filter(|name| !self.contains(name))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbUser {
    pub name: String,
    /// Grant statements, newline separated
    pub grant: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbSchema {
    pub name: String,
    pub character_set: String,
    pub collation: String,
    pub tables: Vec<DbTable>,
}

impl DbSchema {
    pub fn table(&self, schema: Option<&str>, name: &str) -> Option<&DbTable> {
        self.tables
            .iter()
            .find(|t| t.name == name && (schema.is_none() || t.schema.as_deref() == schema))
    }

    /// Validator seeded with this snapshot's tables, columns and constraints
    pub fn validator(&self) -> SchemaValidator {
        self.tables
            .iter()
            .fold(SchemaValidator::new(), |validator, table| {
                validator.with_table(
                    table.table_def(),
                    table.columns.iter().map(|c| c.name.clone()),
                    table.constraints.iter().map(|c| c.name.clone()),
                )
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbTable {
    pub schema: Option<String>,
    pub name: String,
    /// Storage engine, for engines that have one
    pub engine: Option<String>,
    pub columns: Vec<DbColumn>,
    pub constraints: Vec<DbConstraint>,
    pub row_count: Option<i64>,
}

impl DbTable {
    pub fn table_def(&self) -> TableDef {
        TableDef {
            schema: self.schema.clone(),
            name: self.name.clone(),
        }
    }

    /// `CREATE TABLE` for the table, without foreign keys.
    ///
    /// Foreign keys are emitted separately by [`DbTable::foreign_key_statements`]
    /// so that every referenced table exists before they are added.
    pub fn create_statement(&self) -> Statement {
        Statement::CreateTable(CreateTableStmt {
            name: self.table_def(),
            if_not_exists: false,
            columns: self.columns.iter().map(DbColumn::to_column_def).collect(),
            constraints: self
                .constraints
                .iter()
                .filter(|c| c.kind != DbConstraintKind::ForeignKey)
                .map(DbConstraint::to_constraint_def)
                .collect(),
        })
    }

    pub fn foreign_key_statements(&self) -> Vec<Statement> {
        self.constraints
            .iter()
            .filter(|c| c.kind == DbConstraintKind::ForeignKey)
            .map(|c| {
                Statement::AddConstraint(AddConstraintStmt {
                    table: self.table_def(),
                    constraint: c.to_constraint_def(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbColumn {
    pub name: String,
    pub position: i32,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub comment: Option<String>,
}

impl DbColumn {
    pub fn to_column_def(&self) -> ColumnDef {
        ColumnDef {
            name: self.name.clone(),
            data_type: self.data_type.clone(),
            nullable: self.nullable,
            default: self.default.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbConstraintKind {
    PrimaryKey,
    Unique,
    ForeignKey,
    Check,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbConstraint {
    pub name: String,
    pub kind: DbConstraintKind,
    pub columns: Vec<String>,
    pub check_expression: Option<String>,
    pub referenced_table: Option<TableDef>,
    pub referenced_columns: Vec<String>,
    pub on_delete: Option<String>,
    pub on_update: Option<String>,
}

impl DbConstraint {
    pub fn to_constraint_def(&self) -> ConstraintDef {
        let constraint_type = match self.kind {
            DbConstraintKind::PrimaryKey => ConstraintType::PrimaryKey,
            DbConstraintKind::Unique => ConstraintType::Unique,
            DbConstraintKind::ForeignKey => ConstraintType::ForeignKey,
            DbConstraintKind::Check => {
                ConstraintType::Check(self.check_expression.clone().unwrap_or_default())
            }
        };
        let foreign = self.referenced_table.as_ref().map(|table| ForeignDef {
            table: table.clone(),
            columns: self.referenced_columns.clone(),
            on_delete: self.on_delete.clone(),
            on_update: self.on_update.clone(),
        });
        ConstraintDef {
            name: Some(self.name.clone()),
            constraint_type,
            columns: self.columns.clone(),
            foreign,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MigrationStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MigrationType {
    Baseline,
    Migrate,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MigrationSource {
    Ui,
    Vcs,
    Library,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = SchemaflowError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(SchemaflowError::Consistency(format!(
                        "Unknown {} value: {}",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(MigrationStatus { Pending => "PENDING", Done => "DONE", Failed => "FAILED" });
string_enum!(MigrationType { Baseline => "BASELINE", Migrate => "MIGRATE", Data => "DATA" });
string_enum!(MigrationSource { Ui => "UI", Vcs => "VCS", Library => "LIBRARY" });

/// Describes one migration to apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationInfo {
    /// Caller-assigned version, unique per namespace
    pub version: String,
    /// History partition; defaults to the target database name
    pub namespace: String,
    /// Target database
    pub database: String,
    pub environment: String,
    pub source: MigrationSource,
    pub migration_type: MigrationType,
    pub description: String,
    pub creator: String,
    pub issue_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl MigrationInfo {
    pub fn new(database: impl Into<String>, version: impl Into<String>) -> Self {
        let database = database.into();
        Self {
            version: version.into(),
            namespace: database.clone(),
            database,
            environment: String::new(),
            source: MigrationSource::Ui,
            migration_type: MigrationType::Migrate,
            description: String::new(),
            creator: String::new(),
            issue_id: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    /// History partition, when it differs from the target database
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_type(mut self, migration_type: MigrationType) -> Self {
        self.migration_type = migration_type;
        self
    }
}

/// One row of a database's migration history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationHistory {
    pub id: i64,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub namespace: String,
    /// Per-namespace application order
    pub sequence: i64,
    pub source: MigrationSource,
    pub migration_type: MigrationType,
    pub status: MigrationStatus,
    pub version: String,
    pub description: String,
    pub statement: String,
    /// Schema snapshot after the migration
    pub schema: String,
    /// Schema snapshot before the migration
    pub schema_prev: String,
    pub execution_duration_ns: i64,
    pub issue_id: Option<String>,
    pub payload: serde_json::Value,
}

/// `payload` with an `error` note attached, for `Failed` history records
pub fn payload_with_error(payload: &serde_json::Value, note: &str) -> serde_json::Value {
    match payload {
        serde_json::Value::Object(map) => {
            let mut map = map.clone();
            map.insert("error".to_string(), serde_json::Value::from(note));
            serde_json::Value::Object(map)
        }
        serde_json::Value::Null => serde_json::json!({ "error": note }),
        other => serde_json::json!({ "payload": other, "error": note }),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationHistoryFind {
    pub id: Option<i64>,
    pub database: Option<String>,
    pub version: Option<String>,
    pub limit: Option<i64>,
}

impl MigrationHistoryFind {
    pub fn database(database: impl Into<String>) -> Self {
        Self {
            database: Some(database.into()),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        assert_eq!(EngineType::Postgres.default_port(false), 5432);
        assert_eq!(EngineType::ClickHouse.default_port(false), 8123);
        assert_eq!(EngineType::ClickHouse.default_port(true), 8443);
        assert_eq!("PostgreSQL".parse::<EngineType>().unwrap(), EngineType::Postgres);
        assert!("oracle".parse::<EngineType>().is_err());
    }

    #[test]
    fn test_debug_never_shows_password() {
        let config = ConnectionConfig::new("db.internal").with_credentials("admin", "hunter2");
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains(REDACTED_PASSWORD));
        assert_eq!(
            config.redact("login failed for admin:hunter2"),
            format!("login failed for admin:{REDACTED_PASSWORD}")
        );
    }

    #[test]
    fn test_excluded_databases_exact_match() {
        let excluded = ExcludedDatabases::new(EngineType::ClickHouse, "bytebase");
        let kept = excluded.filter(["default", "system", "bytebase", "Bytebase", "analytics"]);
        assert_eq!(kept, vec!["default", "Bytebase", "analytics"]);
    }

    #[test]
    fn test_status_round_trip_through_text() {
        assert_eq!("DONE".parse::<MigrationStatus>().unwrap(), MigrationStatus::Done);
        assert_eq!(MigrationStatus::Pending.to_string(), "PENDING");
        assert!("done".parse::<MigrationStatus>().is_err());
    }

    #[test]
    fn test_table_splits_foreign_keys_out_of_create() {
        let table = DbTable {
            schema: Some("public".into()),
            name: "orders".into(),
            columns: vec![
                DbColumn {
                    name: "id".into(),
                    position: 1,
                    data_type: "bigint".into(),
                    ..Default::default()
                },
                DbColumn {
                    name: "user_id".into(),
                    position: 2,
                    data_type: "bigint".into(),
                    nullable: true,
                    ..Default::default()
                },
            ],
            constraints: vec![
                DbConstraint {
                    name: "orders_pkey".into(),
                    kind: DbConstraintKind::PrimaryKey,
                    columns: vec!["id".into()],
                    check_expression: None,
                    referenced_table: None,
                    referenced_columns: vec![],
                    on_delete: None,
                    on_update: None,
                },
                DbConstraint {
                    name: "orders_user_fk".into(),
                    kind: DbConstraintKind::ForeignKey,
                    columns: vec!["user_id".into()],
                    check_expression: None,
                    referenced_table: Some(TableDef::qualified("public", "users")),
                    referenced_columns: vec!["id".into()],
                    on_delete: None,
                    on_update: None,
                },
            ],
            ..Default::default()
        };

        let Statement::CreateTable(create) = table.create_statement() else {
            panic!("expected create table");
        };
        assert_eq!(create.constraints.len(), 1);
        assert_eq!(table.foreign_key_statements().len(), 1);
    }

    #[test]
    fn test_error_note_keeps_payload() {
        let payload = serde_json::json!({ "ticket": "OPS-7" });
        let noted = payload_with_error(&payload, "syntax error");
        assert_eq!(noted["ticket"], "OPS-7");
        assert_eq!(noted["error"], "syntax error");
        assert_eq!(
            payload_with_error(&serde_json::Value::Null, "boom"),
            serde_json::json!({ "error": "boom" })
        );
    }

    #[test]
    fn test_snapshot_validator_knows_tables() {
        let schema = DbSchema {
            name: "app".into(),
            tables: vec![DbTable {
                schema: Some("public".into()),
                name: "users".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(schema.validator().has_table(&TableDef::new("users")));
    }
}
