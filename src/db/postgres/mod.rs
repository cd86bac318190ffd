//! # PostgreSQL Driver
//!
//! [`Driver`] implementation over `sqlx`.
//!
//! ## Overview
//!
//! `open` builds a connection pool for the configured database. Operations on
//! other databases of the same instance (`sync_schema`, `dump`,
//! `execute_migration` against another target) use a short-lived direct
//! connection built from the same options.
//!
//! Migration history is stored per target database in
//! `<internal>.migration_history`; see [`history`].

mod dump;
mod history;
mod introspect;

use super::driver::{ensure_engine, Driver, DriverConfig};
use super::statement::{is_transaction_control, split_statements, statement_kind};
use super::types::{
    ConnectionConfig, ConnectionContext, DbSchema, DbUser, EngineType, ExcludedDatabases,
    MigrationHistory, MigrationHistoryFind, MigrationInfo, REDACTED_PASSWORD,
};
use crate::context::OperationContext;
use crate::constants::operations;
use crate::error::{Result, SchemaflowError};
use crate::logging::log_driver_operation;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::{Connection, FromRow, PgConnection, Postgres};
use std::ops::{Deref, DerefMut};
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, info, instrument};

const ENGINE: EngineType = EngineType::Postgres;

/// Registry constructor
pub fn new_driver(config: DriverConfig) -> Box<dyn Driver> {
    Box::new(PostgresDriver::new(config))
}

pub struct PostgresDriver {
    config: DriverConfig,
    state: Option<OpenState>,
}

struct OpenState {
    pool: PgPool,
    options: PgConnectOptions,
    /// Database the pool is connected to
    database: String,
    /// `host:port` or socket directory, for diagnostics
    target: String,
    connection: ConnectionContext,
}

/// A connection to one database: from the pool, or opened for another database
enum PgConn {
    Pooled(PoolConnection<Postgres>),
    Direct(PgConnection),
}

impl Deref for PgConn {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            PgConn::Pooled(conn) => conn,
            PgConn::Direct(conn) => conn,
        }
    }
}

impl DerefMut for PgConn {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            PgConn::Pooled(conn) => conn,
            PgConn::Direct(conn) => conn,
        }
    }
}

impl PgConn {
    async fn release(self) {
        if let PgConn::Direct(conn) = self {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Error closing direct connection");
            }
        }
    }
}

impl OpenState {
    fn connection_error(&self, reason: impl Into<String>) -> SchemaflowError {
        SchemaflowError::connection(ENGINE, &self.target, reason)
    }

    async fn connect(&self, ctx: &OperationContext, database: Option<&str>) -> Result<PgConn> {
        match database {
            Some(database) if database != self.database => {
                let options = self.options.clone().database(database);
                let conn = ctx
                    .run("connect", async {
                        PgConnection::connect_with(&options).await.map_err(|e| {
                            self.connection_error(format!("database {database}: {e}"))
                        })
                    })
                    .await?;
                Ok(PgConn::Direct(conn))
            }
            _ => {
                let conn = ctx
                    .run("connect", async {
                        self.pool
                            .acquire()
                            .await
                            .map_err(|e| self.connection_error(e.to_string()))
                    })
                    .await?;
                Ok(PgConn::Pooled(conn))
            }
        }
    }
}

#[derive(Debug, FromRow)]
struct RoleRow {
    name: String,
    rolsuper: bool,
    rolinherit: bool,
    rolcreaterole: bool,
    rolcreatedb: bool,
    rolcanlogin: bool,
    rolreplication: bool,
    rolbypassrls: bool,
}

impl RoleRow {
    /// Role attributes, one per line
    fn attributes(&self) -> String {
        [
            (self.rolsuper, "Superuser"),
            (!self.rolinherit, "No inheritance"),
            (self.rolcreaterole, "Create role"),
            (self.rolcreatedb, "Create DB"),
            (!self.rolcanlogin, "Cannot login"),
            (self.rolreplication, "Replication"),
            (self.rolbypassrls, "Bypass RLS"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join("\n")
    }
}

#[derive(Debug, FromRow)]
struct DatabaseRow {
    name: String,
    character_set: String,
    collation: String,
}

impl PostgresDriver {
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

    fn internal(&self) -> &str {
        &self.config.internal_database
    }

    fn connect_options(&self, config: &ConnectionConfig, target: &str) -> Result<PgConnectOptions> {
        let mut options = PgConnectOptions::new()
            .port(config.port_or_default(ENGINE))
            .username(&config.username)
            .password(&config.password)
            .application_name("schemaflow");
        options = if config.is_unix_socket() {
            options.socket(&config.host)
        } else {
            options.host(&config.host)
        };
        if let Some(database) = &config.database {
            options = options.database(database);
        }

        let tls = config
            .tls
            .resolve(&self.config.tls_profiles, ENGINE, target)?;
        Ok(match tls {
            None => options.ssl_mode(PgSslMode::Prefer),
            Some(material) => {
                let mode = if material.ca.is_some() {
                    PgSslMode::VerifyCa
                } else {
                    PgSslMode::Require
                };
                let mut options = options.ssl_mode(mode);
                if let Some(ca) = material.ca {
                    options = options.ssl_root_cert_from_pem(ca.into_bytes());
                }
                if let Some((cert, key)) = material.identity {
                    options = options
                        .ssl_client_cert_from_pem(cert.as_bytes())
                        .ssl_client_key_from_pem(key.as_bytes());
                }
                options
            }
        })
    }

    async fn load_schema(
        &self,
        ctx: &OperationContext,
        database: &DatabaseRow,
    ) -> Result<DbSchema> {
        let state = self.state()?;
        let mut conn = state.connect(ctx, Some(&database.name)).await?;
        let tables = ctx
            .run(
                "sync_schema",
                introspect::load_tables(&mut conn, self.internal()),
            )
            .await;
        conn.release().await;
        Ok(DbSchema {
            name: database.name.clone(),
            character_set: database.character_set.clone(),
            collation: database.collation.clone(),
            tables: tables?,
        })
    }
}

#[async_trait]
impl Driver for PostgresDriver {
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
                "PostgreSQL driver is already open".to_string(),
            ));
        }

        let port = config.port_or_default(ENGINE);
        let target = if config.is_unix_socket() {
            config.host.clone()
        } else {
            format!("{}:{port}", config.host)
        };
        let options = self.connect_options(config, &target)?;
        let database = config
            .database
            .clone()
            .unwrap_or_else(|| "postgres".to_string());

        debug!(
            dsn = %format!(
                "postgres://{}:{REDACTED_PASSWORD}@{target}/{database}",
                config.username
            ),
            environment = %connection.environment_name,
            "Opening PostgreSQL connection"
        );

        let started = Instant::now();
        let pool_options = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.connect_timeout());
        let pool = ctx
            .run(operations::OPEN, async {
                pool_options
                    .connect_with(options.clone())
                    .await
                    .map_err(|e| {
                        SchemaflowError::connection(ENGINE, &target, config.redact(&e.to_string()))
                    })
            })
            .await?;

        log_driver_operation(
            &ENGINE.to_string(),
            operations::OPEN,
            &target,
            "connected",
            Some(started.elapsed().as_millis() as u64),
            Some(&connection.instance_name),
        );
        self.state = Some(OpenState {
            pool,
            options,
            database,
            target,
            connection: connection.clone(),
        });
        Ok(())
    }

    async fn close(&mut self, _ctx: &OperationContext) -> Result<()> {
        if let Some(state) = self.state.take() {
            state.pool.close().await;
            log_driver_operation(
                &ENGINE.to_string(),
                operations::CLOSE,
                &state.target,
                "closed",
                None,
                Some(&state.connection.instance_name),
            );
        }
        Ok(())
    }

    async fn ping(&self, ctx: &OperationContext) -> Result<()> {
        let state = self.state()?;
        ctx.run("ping", async {
            sqlx::query("SELECT 1")
                .execute(&state.pool)
                .await
                .map_err(|e| state.connection_error(e.to_string()))
        })
        .await?;
        Ok(())
    }

    async fn get_version(&self, ctx: &OperationContext) -> Result<String> {
        let state = self.state()?;
        let sql = "SHOW server_version";
        ctx.run("get_version", async {
            sqlx::query_scalar::<_, String>(sql)
                .fetch_one(&state.pool)
                .await
                .map_err(|e| SchemaflowError::from_sqlx(sql, e))
        })
        .await
    }

    #[instrument(skip_all)]
    async fn sync_schema(&self, ctx: &OperationContext) -> Result<(Vec<DbUser>, Vec<DbSchema>)> {
        let state = self.state()?;
        let roles_sql = "SELECT rolname::text AS name, rolsuper, rolinherit, rolcreaterole, \
                         rolcreatedb, rolcanlogin, rolreplication, rolbypassrls \
                         FROM pg_catalog.pg_roles WHERE rolname NOT LIKE 'pg\\_%' \
                         ORDER BY rolname";
        let databases_sql = "SELECT datname::text AS name, \
                             pg_catalog.pg_encoding_to_char(encoding)::text AS character_set, \
                             datcollate::text AS collation \
                             FROM pg_catalog.pg_database \
                             WHERE NOT datistemplate AND datallowconn ORDER BY datname";

        let (roles, databases) = ctx
            .run("sync_schema", async {
                let roles: Vec<RoleRow> = sqlx::query_as(roles_sql)
                    .fetch_all(&state.pool)
                    .await
                    .map_err(|e| SchemaflowError::from_sqlx(roles_sql, e))?;
                let databases: Vec<DatabaseRow> = sqlx::query_as(databases_sql)
                    .fetch_all(&state.pool)
                    .await
                    .map_err(|e| SchemaflowError::from_sqlx(databases_sql, e))?;
                Ok::<_, SchemaflowError>((roles, databases))
            })
            .await?;

        let users = roles
            .iter()
            .map(|role| DbUser {
                name: role.name.clone(),
                grant: role.attributes(),
            })
            .collect();

        let excluded = ExcludedDatabases::new(ENGINE, self.internal());
        let mut schemas = Vec::new();
        for database in databases.iter().filter(|d| !excluded.contains(&d.name)) {
            schemas.push(self.load_schema(ctx, database).await?);
        }

        info!(
            users = roles.len(),
            databases = schemas.len(),
            "Synced PostgreSQL schema"
        );
        Ok((users, schemas))
    }

    #[instrument(skip_all)]
    async fn execute(&self, ctx: &OperationContext, statement: &str) -> Result<()> {
        let state = self.state()?;
        let statements = split_statements(statement, false)?;
        if let Some(control) = statements.iter().find(|s| is_transaction_control(s)) {
            return Err(SchemaflowError::Validation(format!(
                "execute runs in its own transaction; {} is not allowed",
                statement_kind(control)
            )));
        }

        let mut conn = state.connect(ctx, None).await?;
        let mut tx = ctx.run("execute", history::begin(&mut conn)).await?;
        let result = ctx
            .run("execute", history::execute_all(&mut tx, &statements))
            .await;

        match result {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| SchemaflowError::from_sqlx("COMMIT", e)),
            Err(error) => {
                history::rollback(tx).await;
                Err(error)
            }
        }
    }

    async fn needs_setup_migration(&self, ctx: &OperationContext) -> Result<bool> {
        let state = self.state()?;
        let mut conn = state.connect(ctx, None).await?;
        let exists = ctx
            .run(
                "needs_setup_migration",
                history::history_exists(&mut conn, self.internal()),
            )
            .await?;
        Ok(!exists)
    }

    async fn setup_migration_if_needed(&self, ctx: &OperationContext) -> Result<()> {
        if !self.needs_setup_migration(ctx).await? {
            return Ok(());
        }
        let state = self.state()?;
        let mut conn = state.connect(ctx, None).await?;
        ctx.run(
            "setup_migration",
            history::ensure_history(&mut conn, self.internal()),
        )
        .await?;
        info!(
            schema = %self.internal(),
            database = %state.database,
            "Created migration history table"
        );
        Ok(())
    }

    async fn execute_migration(
        &self,
        ctx: &OperationContext,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<(i64, String)> {
        let state = self.state()?;
        let mut conn = state.connect(ctx, Some(&info.database)).await?;
        let result =
            history::execute_migration(&mut conn, ctx, self.internal(), info, statement).await;
        conn.release().await;
        result
    }

    async fn find_migration_history_list(
        &self,
        ctx: &OperationContext,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>> {
        let state = self.state()?;
        let mut conn = state.connect(ctx, find.database.as_deref()).await?;
        let result = ctx
            .run(
                "find_migration_history_list",
                history::list(&mut conn, self.internal(), find),
            )
            .await;
        conn.release().await;
        result
    }

    #[instrument(skip_all, fields(database = %database, schema_only = schema_only))]
    async fn dump(
        &self,
        ctx: &OperationContext,
        database: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
        schema_only: bool,
    ) -> Result<()> {
        let state = self.state()?;
        let started = Instant::now();
        let mut conn = state.connect(ctx, Some(database)).await?;
        let result = dump::dump(&mut conn, ctx, self.internal(), out, schema_only).await;
        conn.release().await;
        result?;
        log_driver_operation(
            &ENGINE.to_string(),
            operations::DUMP,
            &state.target,
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
        let started = Instant::now();
        let mut conn = state.connect(ctx, None).await?;
        let result = dump::restore(&mut conn, ctx, input).await;
        conn.release().await;
        let statements = result?;
        log_driver_operation(
            &ENGINE.to_string(),
            operations::RESTORE,
            &state.target,
            "completed",
            Some(started.elapsed().as_millis() as u64),
            Some(&format!("{statements} statements")),
        );
        Ok(())
    }
}
