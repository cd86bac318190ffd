//! # ClickHouse Driver
//!
//! [`Driver`] implementation over the ClickHouse HTTP interface.
//!
//! ## Overview
//!
//! ClickHouse has no transactional DDL. `execute` runs the split statements
//! in order inside one server session and stops at the first failure;
//! statements that already ran stay applied. Migration history compensates
//! with write-ahead markers (see [`history`]).

mod client;
mod history;
mod sync;
#[cfg(test)]
mod test_server;

use super::driver::{ensure_engine, Driver, DriverConfig};
use super::statement::{is_transaction_control, split_statements, statement_kind, StatementSplitter};
use super::types::{
    ConnectionConfig, ConnectionContext, DbSchema, DbUser, EngineType, ExcludedDatabases,
    MigrationHistory, MigrationHistoryFind, MigrationInfo, MigrationStatus, REDACTED_PASSWORD,
};
use crate::ast::Dialect;
use crate::constants::operations;
use crate::context::OperationContext;
use crate::error::{ErrorKind, Result, SchemaflowError};
use crate::logging::{log_driver_operation, log_migration_operation};
use async_trait::async_trait;
use client::{new_session_id, quote_string, ClickHouseClient, Scope};
use history::{HistoryRow, HistoryTable};
use serde::Deserialize;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

const ENGINE: EngineType = EngineType::ClickHouse;

/// Registry constructor
pub fn new_driver(config: DriverConfig) -> Box<dyn Driver> {
    Box::new(ClickHouseDriver::new(config))
}

pub struct ClickHouseDriver {
    config: DriverConfig,
    state: Option<OpenState>,
}

struct OpenState {
    client: ClickHouseClient,
    database: Option<String>,
    connection: ConnectionContext,
}

#[derive(Debug, Deserialize)]
struct DumpTableRow {
    name: String,
    engine: String,
}

impl DumpTableRow {
    fn is_view(&self) -> bool {
        self.engine.ends_with("View")
    }

    fn holds_data(&self) -> bool {
        !self.is_view() && !matches!(self.engine.as_str(), "Dictionary" | "Distributed" | "Merge")
    }
}

impl ClickHouseDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    fn state(&self) -> Result<&OpenState> {
        self.state
            .as_ref()
            .ok_or_else(|| SchemaflowError::not_open(ENGINE))
    }

    fn history(&self) -> HistoryTable<'_> {
        HistoryTable::new(&self.config.internal_database)
    }

    /// Tables of `database`, plain tables before views
    async fn dump_tables(client: &ClickHouseClient, database: &str) -> Result<Vec<DumpTableRow>> {
        let mut tables: Vec<DumpTableRow> = client
            .rows(
                &Scope::default(),
                &format!(
                    "SELECT name, engine FROM system.tables \
                     WHERE database = {} AND NOT is_temporary ORDER BY name",
                    quote_string(database)
                ),
            )
            .await?;
        tables.sort_by_key(|t| t.is_view());
        Ok(tables)
    }

    async fn show_create(client: &ClickHouseClient, database: &str, table: &str) -> Result<String> {
        let sql = format!(
            "SHOW CREATE TABLE {}.{} FORMAT TabSeparatedRaw",
            Dialect::ClickHouse.quote_ident(database),
            Dialect::ClickHouse.quote_ident(table)
        );
        Ok(client
            .text(&Scope::default(), &sql)
            .await?
            .trim_end()
            .to_string())
    }

    /// `SHOW CREATE` output for every table of `database`
    async fn schema_snapshot(client: &ClickHouseClient, database: &str) -> Result<String> {
        let mut snapshot = String::new();
        for table in Self::dump_tables(client, database).await? {
            snapshot.push_str(&Self::show_create(client, database, &table.name).await?);
            snapshot.push_str(";\n");
        }
        Ok(snapshot)
    }

    async fn run_statements(
        client: &ClickHouseClient,
        database: Option<&str>,
        statements: &[String],
    ) -> Result<()> {
        let session_id = new_session_id();
        let scope = Scope {
            database,
            session_id: None,
        }
        .in_session(&session_id);
        for statement in statements {
            client.execute(&scope, statement).await?;
        }
        Ok(())
    }

    fn reject_transaction_control(statements: &[String]) -> Result<()> {
        match statements.iter().find(|s| is_transaction_control(s)) {
            Some(control) => Err(SchemaflowError::Validation(format!(
                "ClickHouse statements run without a transaction; {} is not allowed",
                statement_kind(control)
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Driver for ClickHouseDriver {
    fn engine(&self) -> EngineType {
        ENGINE
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    #[instrument(skip_all, fields(host = %config.host, instance = %connection.instance_name))]
    async fn open(
        &mut self,
        ctx: &OperationContext,
        engine: EngineType,
        config: &ConnectionConfig,
        connection: &ConnectionContext,
    ) -> Result<()> {
        ensure_engine(ENGINE, engine)?;
        if self.state.is_some() {
            return Err(SchemaflowError::Validation(
                "ClickHouse driver is already open".to_string(),
            ));
        }

        let target = format!("{}:{}", config.host, config.port_or_default(ENGINE));
        let tls = config
            .tls
            .resolve(&self.config.tls_profiles, ENGINE, &target)?;
        let client = ClickHouseClient::new(config, tls, self.config.connect_timeout())?;

        debug!(
            dsn = %format!(
                "clickhouse://{}:{REDACTED_PASSWORD}@{target}/{}",
                config.username,
                config.database.as_deref().unwrap_or("default")
            ),
            environment = %connection.environment_name,
            "Opening ClickHouse connection"
        );

        let started = Instant::now();
        let probe = ctx
            .run(operations::OPEN, client.execute(&Scope::default(), "SELECT 1"))
            .await;
        if let Err(error) = probe {
            return Err(match error.kind() {
                ErrorKind::Connection | ErrorKind::Cancellation => error,
                _ => SchemaflowError::connection(ENGINE, &target, config.redact(&error.to_string())),
            });
        }

        log_driver_operation(
            &ENGINE.to_string(),
            operations::OPEN,
            client.target(),
            "connected",
            Some(started.elapsed().as_millis() as u64),
            Some(&connection.instance_name),
        );
        self.state = Some(OpenState {
            client,
            database: config.database.clone(),
            connection: connection.clone(),
        });
        Ok(())
    }

    async fn close(&mut self, _ctx: &OperationContext) -> Result<()> {
        if let Some(state) = self.state.take() {
            log_driver_operation(
                &ENGINE.to_string(),
                operations::CLOSE,
                state.client.target(),
                "closed",
                None,
                Some(&state.connection.instance_name),
            );
        }
        Ok(())
    }

    async fn ping(&self, ctx: &OperationContext) -> Result<()> {
        let state = self.state()?;
        ctx.run("ping", state.client.execute(&Scope::default(), "SELECT 1"))
            .await
    }

    async fn get_version(&self, ctx: &OperationContext) -> Result<String> {
        let state = self.state()?;
        let lines = ctx
            .run(
                "get_version",
                state.client.lines(&Scope::default(), "SELECT version()"),
            )
            .await?;
        lines.into_iter().next().ok_or_else(|| {
            SchemaflowError::Consistency("SELECT version() returned no rows".to_string())
        })
    }

    #[instrument(skip_all)]
    async fn sync_schema(&self, ctx: &OperationContext) -> Result<(Vec<DbUser>, Vec<DbSchema>)> {
        let state = self.state()?;
        let snapshot = ctx.run("sync_schema", sync::fetch(&state.client)).await?;
        let excluded = ExcludedDatabases::new(ENGINE, &self.config.internal_database);
        let (users, schemas) = sync::assemble(snapshot, &excluded);
        info!(
            users = users.len(),
            databases = schemas.len(),
            "Synced ClickHouse schema"
        );
        Ok((users, schemas))
    }

    #[instrument(skip_all)]
    async fn execute(&self, ctx: &OperationContext, statement: &str) -> Result<()> {
        let state = self.state()?;
        let statements = split_statements(statement, true)?;
        Self::reject_transaction_control(&statements)?;
        ctx.run(
            "execute",
            Self::run_statements(&state.client, state.database.as_deref(), &statements),
        )
        .await
    }

    async fn needs_setup_migration(&self, ctx: &OperationContext) -> Result<bool> {
        let state = self.state()?;
        let exists = ctx
            .run(
                "needs_setup_migration",
                self.history().exists(&state.client),
            )
            .await?;
        Ok(!exists)
    }

    async fn setup_migration_if_needed(&self, ctx: &OperationContext) -> Result<()> {
        let state = self.state()?;
        let history = self.history();
        if self.needs_setup_migration(ctx).await? {
            ctx.run("setup_migration", history.ensure(&state.client))
                .await?;
            info!(database = %self.config.internal_database, "Created migration history table");
            return Ok(());
        }
        let reconciled = ctx
            .run(
                "setup_migration",
                history.reconcile_pending(&state.client, None),
            )
            .await?;
        if reconciled > 0 {
            warn!(reconciled, "Reconciled interrupted migrations");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(namespace = %info.namespace, version = %info.version))]
    async fn execute_migration(
        &self,
        ctx: &OperationContext,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<(i64, String)> {
        const OPERATION: &str = operations::EXECUTE_MIGRATION;
        let state = self.state()?;
        let client = &state.client;
        let history = self.history();

        let statements = split_statements(statement, true)?;
        Self::reject_transaction_control(&statements)?;

        ctx.run(OPERATION, history.ensure(client)).await?;
        ctx.run(
            OPERATION,
            history.reconcile_pending(client, Some(&info.namespace)),
        )
        .await?;
        if let Some(done) = ctx
            .run(
                OPERATION,
                history.find_done(client, &info.namespace, &info.version),
            )
            .await?
        {
            info!(sequence = done.sequence, "Migration already applied; skipping");
            return Ok((done.sequence, done.schema));
        }

        let schema_prev = ctx
            .run(OPERATION, Self::schema_snapshot(client, &info.database))
            .await?;
        let sequence = ctx
            .run(OPERATION, history.next_sequence(client, &info.namespace))
            .await?;
        let marker = HistoryRow::pending(info, sequence, statement, &schema_prev);
        ctx.run(OPERATION, history.insert(client, &marker)).await?;

        let started = Instant::now();
        let applied = ctx
            .run(
                OPERATION,
                Self::run_statements(client, Some(&info.database), &statements),
            )
            .await;
        let duration_ns = i64::try_from(started.elapsed().as_nanos()).unwrap_or(i64::MAX);

        match applied {
            Ok(()) => {
                // the statements are applied: from here on DONE is written even if cancelled
                let schema = match ctx
                    .run(OPERATION, Self::schema_snapshot(client, &info.database))
                    .await
                {
                    Ok(schema) => schema,
                    Err(error) => {
                        warn!(error = %error, "Schema snapshot failed; recording migration without one");
                        String::new()
                    }
                };
                let done = marker.resolve(MigrationStatus::Done, &schema, duration_ns);
                history.insert(client, &done).await?;
                log_migration_operation(
                    OPERATION,
                    None,
                    Some(&info.database),
                    Some(&info.version),
                    "done",
                    Some(&format!("sequence {sequence}")),
                );
                Ok((sequence, schema))
            }
            Err(error) => {
                // recorded even when cancelled: statements may already have run
                let failed = marker
                    .resolve(MigrationStatus::Failed, &schema_prev, duration_ns)
                    .with_error(&error.to_string());
                if let Err(record_error) = history.insert(client, &failed).await {
                    warn!(
                        error = %record_error,
                        "Failed to record failed migration; it stays PENDING until reconciled"
                    );
                }
                log_migration_operation(
                    OPERATION,
                    None,
                    Some(&info.database),
                    Some(&info.version),
                    "failed",
                    Some(&error.to_string()),
                );
                Err(error)
            }
        }
    }

    async fn find_migration_history_list(
        &self,
        ctx: &OperationContext,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>> {
        let state = self.state()?;
        ctx.run(
            "find_migration_history_list",
            self.history().list(&state.client, find),
        )
        .await
    }

    #[instrument(skip_all, fields(database = %database, schema_only = schema_only))]
    async fn dump(
        &self,
        ctx: &OperationContext,
        database: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
        schema_only: bool,
    ) -> Result<()> {
        const OPERATION: &str = operations::DUMP;
        let state = self.state()?;
        let client = &state.client;
        let started = Instant::now();

        let tables = ctx
            .run(OPERATION, Self::dump_tables(client, database))
            .await?;
        for table in &tables {
            let create = ctx
                .run(OPERATION, Self::show_create(client, database, &table.name))
                .await?;
            out.write_all(create.as_bytes()).await?;
            out.write_all(b";\n").await?;
        }

        if !schema_only {
            for table in tables.iter().filter(|t| t.holds_data()) {
                let qualified = format!(
                    "{}.{}",
                    Dialect::ClickHouse.quote_ident(database),
                    Dialect::ClickHouse.quote_ident(&table.name)
                );
                let select = format!("SELECT * FROM {qualified} FORMAT Values");
                let prefix = format!("INSERT INTO {qualified} VALUES ");
                let wrote = ctx
                    .run(
                        OPERATION,
                        client.copy_to(&Scope::default(), &select, &prefix, &mut *out),
                    )
                    .await?;
                if wrote {
                    out.write_all(b";\n").await?;
                }
            }
        }
        out.flush().await?;

        log_driver_operation(
            &ENGINE.to_string(),
            operations::DUMP,
            client.target(),
            "completed",
            Some(started.elapsed().as_millis() as u64),
            Some(database),
        );
        Ok(())
    }

    #[instrument(skip_all)]
    async fn restore(
        &self,
        ctx: &OperationContext,
        input: &mut (dyn AsyncBufRead + Unpin + Send),
    ) -> Result<()> {
        let state = self.state()?;
        let session_id = new_session_id();
        let scope = Scope {
            database: state.database.as_deref(),
            session_id: None,
        }
        .in_session(&session_id);

        let replayed = ctx
            .run(operations::RESTORE, async {
                let mut splitter = StatementSplitter::new(true);
                let mut line = String::new();
                let mut count = 0usize;
                loop {
                    line.clear();
                    if input.read_line(&mut line).await? == 0 {
                        break;
                    }
                    for statement in splitter.push(&line) {
                        state.client.execute(&scope, &statement).await?;
                        count += 1;
                    }
                }
                if let Some(statement) = splitter.finish()? {
                    state.client.execute(&scope, &statement).await?;
                    count += 1;
                }
                Ok::<usize, SchemaflowError>(count)
            })
            .await?;

        log_driver_operation(
            &ENGINE.to_string(),
            operations::RESTORE,
            state.client.target(),
            "completed",
            None,
            Some(&format!("{replayed} statements")),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::sync::{assemble, ColumnRow, DatabaseRow, SyncSnapshot, TableRow, UserRow};
    use super::*;

    fn table(database: &str, name: &str) -> TableRow {
        TableRow {
            database: database.into(),
            name: name.into(),
            engine: "MergeTree".into(),
            total_rows: Some(0),
        }
    }

    fn column(database: &str, table: &str) -> ColumnRow {
        ColumnRow {
            database: database.into(),
            table: table.into(),
            name: "id".into(),
            position: 1,
            data_type: "UInt64".into(),
            default_expression: String::new(),
            comment: String::new(),
            is_in_primary_key: 1,
        }
    }

    #[test]
    fn test_sync_schema_scenario() {
        let snapshot = SyncSnapshot {
            users: vec![(
                UserRow {
                    name: "default".into(),
                },
                vec![
                    "GRANT SHOW, SELECT ON *.* TO default".into(),
                    "GRANT INSERT ON analytics.* TO default".into(),
                ],
            )],
            databases: ["INFORMATION_SCHEMA", "analytics", "bytebase", "default", "system"]
                .iter()
                .map(|name| DatabaseRow {
                    name: name.to_string(),
                })
                .collect(),
            tables: vec![
                table("analytics", "events"),
                table("bytebase", "migration_history"),
                table("system", "users"),
            ],
            columns: vec![
                column("analytics", "events"),
                column("bytebase", "migration_history"),
            ],
        };

        let excluded = ExcludedDatabases::new(EngineType::ClickHouse, "bytebase");
        let (users, schemas) = assemble(snapshot, &excluded);

        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "default");
        assert_eq!(
            users[0].grant,
            "GRANT SHOW, SELECT ON *.* TO default\nGRANT INSERT ON analytics.* TO default"
        );

        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["analytics", "default"]);
        assert_eq!(schemas[0].tables.len(), 1);
        assert_eq!(schemas[0].tables[0].name, "events");
        assert!(schemas[1].tables.is_empty());
    }

    #[test]
    fn test_internal_database_name_is_configurable() {
        let snapshot = SyncSnapshot {
            databases: vec![
                DatabaseRow {
                    name: "bytebase".into(),
                },
                DatabaseRow {
                    name: "schemaflow_meta".into(),
                },
            ],
            ..Default::default()
        };
        let excluded = ExcludedDatabases::new(EngineType::ClickHouse, "schemaflow_meta");
        let (_, schemas) = assemble(snapshot, &excluded);
        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["bytebase"]);
    }

    #[test]
    fn test_transaction_control_rejected() {
        let statements = split_statements("BEGIN TRANSACTION; CREATE TABLE t (x UInt8) ENGINE = Log", true)
            .unwrap();
        let err = ClickHouseDriver::reject_transaction_control(&statements).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_dump_ordering_helpers() {
        let view = DumpTableRow {
            name: "daily".into(),
            engine: "MaterializedView".into(),
        };
        let log = DumpTableRow {
            name: "events".into(),
            engine: "MergeTree".into(),
        };
        assert!(view.is_view() && !view.holds_data());
        assert!(!log.is_view() && log.holds_data());
    }

    mod write_ahead {
        use super::super::history::INTERRUPTED_NOTE;
        use super::super::test_server::FakeClickHouse;
        use super::*;

        const CREATE_EVENTS: &str = "CREATE TABLE events (id UInt64) ENGINE = MergeTree ORDER BY id";

        fn info(version: &str) -> MigrationInfo {
            MigrationInfo::new("analytics", version).with_creator("ci")
        }

        async fn open(server: &FakeClickHouse) -> ClickHouseDriver {
            let mut driver = ClickHouseDriver::new(DriverConfig::default());
            driver
                .open(
                    &OperationContext::new(),
                    ENGINE,
                    &server.connection(),
                    &ConnectionContext::new("test", "ch-1"),
                )
                .await
                .unwrap();
            driver
        }

        fn statuses(server: &FakeClickHouse) -> Vec<(i64, String)> {
            server
                .history()
                .into_iter()
                .map(|row| (row.sequence, row.status))
                .collect()
        }

        #[tokio::test]
        async fn test_pending_marker_precedes_done() {
            let server = FakeClickHouse::start().await;
            let driver = open(&server).await;

            let (sequence, _) = driver
                .execute_migration(&OperationContext::new(), &info("v1"), CREATE_EVENTS)
                .await
                .unwrap();

            assert_eq!(sequence, 1);
            let written: Vec<String> = server.inserts().into_iter().map(|r| r.status).collect();
            assert_eq!(written, vec!["PENDING", "DONE"]);
            assert_eq!(statuses(&server), vec![(1, "DONE".to_string())]);
        }

        #[tokio::test]
        async fn test_reinvoking_applied_migration_writes_nothing() {
            let server = FakeClickHouse::start().await;
            let driver = open(&server).await;
            let ctx = OperationContext::new();

            let first = driver
                .execute_migration(&ctx, &info("v1"), CREATE_EVENTS)
                .await
                .unwrap();
            let writes = server.inserts().len();
            let second = driver
                .execute_migration(&ctx, &info("v1"), CREATE_EVENTS)
                .await
                .unwrap();

            assert_eq!(first.0, second.0);
            assert_eq!(server.inserts().len(), writes);
            assert_eq!(server.statements(), vec![CREATE_EVENTS]);
            assert_eq!(statuses(&server), vec![(1, "DONE".to_string())]);
        }

        #[tokio::test]
        async fn test_stale_pending_marker_is_reconciled_to_failed() {
            let server = FakeClickHouse::start().await;
            let interrupted = "ALTER TABLE events ADD COLUMN x UInt8";
            server.seed(HistoryRow::pending(&info("v0"), 1, interrupted, ""));
            let driver = open(&server).await;
            let ctx = OperationContext::new();

            driver.setup_migration_if_needed(&ctx).await.unwrap();
            assert_eq!(statuses(&server), vec![(1, "FAILED".to_string())]);
            let reconciled = MigrationHistory::try_from(server.history().remove(0)).unwrap();
            assert_eq!(reconciled.payload["error"], INTERRUPTED_NOTE);

            let (sequence, _) = driver
                .execute_migration(&ctx, &info("v1"), CREATE_EVENTS)
                .await
                .unwrap();
            assert_eq!(sequence, 2);
            assert_eq!(
                statuses(&server),
                vec![(1, "FAILED".to_string()), (2, "DONE".to_string())]
            );
        }

        #[tokio::test]
        async fn test_done_is_recorded_when_cancelled_after_apply() {
            let server = FakeClickHouse::start().await;
            let driver = open(&server).await;
            let ctx = OperationContext::new();
            server.cancel_after(CREATE_EVENTS, &ctx);

            let (sequence, _) = driver
                .execute_migration(&ctx, &info("v1"), CREATE_EVENTS)
                .await
                .unwrap();

            assert!(ctx.is_cancelled());
            assert_eq!(sequence, 1);
            assert_eq!(statuses(&server), vec![(1, "DONE".to_string())]);

            let (again, _) = driver
                .execute_migration(&OperationContext::new(), &info("v1"), CREATE_EVENTS)
                .await
                .unwrap();
            assert_eq!(again, 1);
            assert_eq!(server.statements().len(), 1);
        }

        #[tokio::test]
        async fn test_failed_statement_replaces_marker_with_failed() {
            let server = FakeClickHouse::start().await;
            server.fail_statement(CREATE_EVENTS);
            let driver = open(&server).await;

            let err = driver
                .execute_migration(&OperationContext::new(), &info("v1"), CREATE_EVENTS)
                .await
                .unwrap_err();

            assert_eq!(err.kind(), ErrorKind::Query);
            assert_eq!(statuses(&server), vec![(1, "FAILED".to_string())]);
            let failed = MigrationHistory::try_from(server.history().remove(0)).unwrap();
            assert!(failed.payload["error"].as_str().unwrap().contains("Syntax error"));
        }
    }

    #[tokio::test]
    async fn test_operations_require_open() {
        let driver = ClickHouseDriver::new(DriverConfig::default());
        let ctx = OperationContext::new();
        let err = driver.get_version(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        let err = driver
            .find_migration_history_list(&ctx, &MigrationHistoryFind::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_open_unreachable_host_redacts_password() {
        let mut driver = ClickHouseDriver::new(DriverConfig {
            connect_timeout_seconds: 1,
            ..Default::default()
        });
        let config = ConnectionConfig::new("127.0.0.1")
            .with_port(1)
            .with_credentials("default", "t0ps3cret");
        let err = driver
            .open(
                &OperationContext::new(),
                EngineType::ClickHouse,
                &config,
                &ConnectionContext::new("test", "ch-1"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(!err.to_string().contains("t0ps3cret"));
        assert!(!driver.is_open());
    }
}
