//! Migration history for PostgreSQL.
//!
//! History lives in `<internal>.migration_history` inside each target
//! database. A migration's statements and its `DONE` record commit in the same
//! transaction, and the history table is locked for that transaction so that
//! sequence numbers are assigned in application order.

use super::introspect;
use crate::ast::Dialect;
use crate::constants::{operations, MIGRATION_HISTORY_TABLE};
use crate::context::OperationContext;
use crate::db::statement::{is_transaction_control, split_statements, statement_kind};
use crate::db::types::{
    payload_with_error, MigrationHistory, MigrationHistoryFind, MigrationInfo, MigrationStatus,
};
use crate::error::{ErrorKind, Result, SchemaflowError};
use crate::logging::log_migration_operation;
use chrono::{DateTime, Utc};
use sqlx::{Connection, Executor, FromRow, PgConnection, Postgres, QueryBuilder, Transaction};
use std::time::Instant;
use tracing::{info, instrument, warn};

const OPERATION: &str = operations::EXECUTE_MIGRATION;

#[derive(Debug, FromRow)]
struct HistoryRow {
    id: i64,
    created_by: String,
    created_ts: DateTime<Utc>,
    updated_ts: DateTime<Utc>,
    namespace: String,
    sequence: i64,
    source: String,
    #[sqlx(rename = "type")]
    migration_type: String,
    status: String,
    version: String,
    description: String,
    statement: String,
    schema: String,
    schema_prev: String,
    execution_duration_ns: i64,
    issue_id: Option<String>,
    payload: serde_json::Value,
}

impl TryFrom<HistoryRow> for MigrationHistory {
    type Error = SchemaflowError;

    fn try_from(row: HistoryRow) -> Result<Self> {
        Ok(MigrationHistory {
            id: row.id,
            creator: row.created_by,
            created_at: row.created_ts,
            updated_at: row.updated_ts,
            namespace: row.namespace,
            sequence: row.sequence,
            source: row.source.parse()?,
            migration_type: row.migration_type.parse()?,
            status: row.status.parse()?,
            version: row.version,
            description: row.description,
            statement: row.statement,
            schema: row.schema,
            schema_prev: row.schema_prev,
            execution_duration_ns: row.execution_duration_ns,
            issue_id: row.issue_id,
            payload: row.payload,
        })
    }
}

const HISTORY_COLUMNS: &str = "id, created_by, created_ts, updated_ts, namespace, sequence, \
     source, type, status, version, description, statement, schema, schema_prev, \
     execution_duration_ns, issue_id, payload";

pub(super) fn history_table(internal: &str) -> String {
    format!(
        "{}.{MIGRATION_HISTORY_TABLE}",
        Dialect::Postgres.quote_ident(internal)
    )
}

/// Idempotent DDL creating the internal schema and history table
pub(super) fn setup_statements(internal: &str) -> Vec<String> {
    let schema = Dialect::Postgres.quote_ident(internal);
    let table = history_table(internal);
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n\
             \x20 id BIGSERIAL PRIMARY KEY,\n\
             \x20 created_by TEXT NOT NULL,\n\
             \x20 created_ts TIMESTAMPTZ NOT NULL DEFAULT now(),\n\
             \x20 updated_by TEXT NOT NULL,\n\
             \x20 updated_ts TIMESTAMPTZ NOT NULL DEFAULT now(),\n\
             \x20 namespace TEXT NOT NULL,\n\
             \x20 sequence BIGINT NOT NULL CHECK (sequence >= 0),\n\
             \x20 source TEXT NOT NULL CHECK (source IN ('UI', 'VCS', 'LIBRARY')),\n\
             \x20 type TEXT NOT NULL CHECK (type IN ('BASELINE', 'MIGRATE', 'DATA')),\n\
             \x20 status TEXT NOT NULL CHECK (status IN ('PENDING', 'DONE', 'FAILED')),\n\
             \x20 version TEXT NOT NULL,\n\
             \x20 description TEXT NOT NULL,\n\
             \x20 statement TEXT NOT NULL,\n\
             \x20 schema TEXT NOT NULL,\n\
             \x20 schema_prev TEXT NOT NULL,\n\
             \x20 execution_duration_ns BIGINT NOT NULL,\n\
             \x20 issue_id TEXT,\n\
             \x20 payload JSONB NOT NULL DEFAULT '{{}}'\n\
             )"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS migration_history_namespace_sequence_idx \
             ON {table} (namespace, sequence)"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS migration_history_namespace_version_done_idx \
             ON {table} (namespace, version) WHERE status = 'DONE'"
        ),
    ]
}

pub(super) async fn history_exists(conn: &mut PgConnection, internal: &str) -> Result<bool> {
    let sql = "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_tables \
               WHERE schemaname = $1 AND tablename = 'migration_history')";
    sqlx::query_scalar::<_, bool>(sql)
        .bind(internal)
        .fetch_one(conn)
        .await
        .map_err(|e| SchemaflowError::from_sqlx(sql, e))
}

/// Run `sql` over the simple query protocol; it may hold several statements
pub(super) async fn execute_raw(conn: &mut PgConnection, sql: &str) -> Result<()> {
    Executor::execute(&mut *conn, sql)
        .await
        .map_err(|e| SchemaflowError::from_sqlx(sql, e))?;
    Ok(())
}

/// Run each statement in order, stopping at the first failure
pub(super) async fn execute_all(conn: &mut PgConnection, statements: &[String]) -> Result<()> {
    for sql in statements {
        execute_raw(&mut *conn, sql).await?;
    }
    Ok(())
}

pub(super) async fn ensure_history(conn: &mut PgConnection, internal: &str) -> Result<()> {
    execute_all(conn, &setup_statements(internal)).await
}

pub(super) async fn begin(conn: &mut PgConnection) -> Result<Transaction<'_, Postgres>> {
    conn.begin()
        .await
        .map_err(|e| SchemaflowError::from_sqlx("BEGIN", e))
}

pub(super) async fn rollback(tx: Transaction<'_, Postgres>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed; the connection discards the transaction");
    }
}

async fn lock_history(conn: &mut PgConnection, internal: &str) -> Result<()> {
    let sql = format!("LOCK TABLE {} IN EXCLUSIVE MODE", history_table(internal));
    execute_raw(conn, &sql).await
}

async fn find_done(
    conn: &mut PgConnection,
    internal: &str,
    namespace: &str,
    version: &str,
) -> Result<Option<MigrationHistory>> {
    let sql = format!(
        "SELECT {HISTORY_COLUMNS} FROM {} \
         WHERE namespace = $1 AND version = $2 AND status = 'DONE'",
        history_table(internal)
    );
    let row: Option<HistoryRow> = sqlx::query_as(&sql)
        .bind(namespace)
        .bind(version)
        .fetch_optional(conn)
        .await
        .map_err(|e| SchemaflowError::from_sqlx(&sql, e))?;
    row.map(MigrationHistory::try_from).transpose()
}

async fn next_sequence(conn: &mut PgConnection, internal: &str, namespace: &str) -> Result<i64> {
    let sql = format!(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM {} WHERE namespace = $1",
        history_table(internal)
    );
    sqlx::query_scalar::<_, i64>(&sql)
        .bind(namespace)
        .fetch_one(conn)
        .await
        .map_err(|e| SchemaflowError::from_sqlx(&sql, e))
}

struct NewRecord<'a> {
    info: &'a MigrationInfo,
    sequence: i64,
    status: MigrationStatus,
    statement: &'a str,
    schema: &'a str,
    schema_prev: &'a str,
    execution_duration_ns: i64,
    payload: serde_json::Value,
}

async fn insert_record(conn: &mut PgConnection, internal: &str, record: &NewRecord<'_>) -> Result<i64> {
    let sql = format!(
        "INSERT INTO {} (created_by, updated_by, namespace, sequence, source, type, status, \
         version, description, statement, schema, schema_prev, execution_duration_ns, \
         issue_id, payload) \
         VALUES ($1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
         RETURNING id",
        history_table(internal)
    );
    let info = record.info;
    sqlx::query_scalar::<_, i64>(&sql)
        .bind(&info.creator)
        .bind(&info.namespace)
        .bind(record.sequence)
        .bind(info.source.as_str())
        .bind(info.migration_type.as_str())
        .bind(record.status.as_str())
        .bind(&info.version)
        .bind(&info.description)
        .bind(record.statement)
        .bind(record.schema)
        .bind(record.schema_prev)
        .bind(record.execution_duration_ns)
        .bind(&info.issue_id)
        .bind(&record.payload)
        .fetch_one(conn)
        .await
        .map_err(|e| SchemaflowError::from_sqlx(&sql, e))
}

enum Prepared {
    AlreadyApplied(MigrationHistory),
    Next(i64),
}

/// Lock the history table, then re-check for a concurrent `DONE` record
async fn prepare(conn: &mut PgConnection, internal: &str, info: &MigrationInfo) -> Result<Prepared> {
    lock_history(&mut *conn, internal).await?;
    if let Some(done) = find_done(&mut *conn, internal, &info.namespace, &info.version).await? {
        return Ok(Prepared::AlreadyApplied(done));
    }
    Ok(Prepared::Next(
        next_sequence(conn, internal, &info.namespace).await?,
    ))
}

async fn apply(conn: &mut PgConnection, internal: &str, statements: &[String]) -> Result<String> {
    execute_all(&mut *conn, statements).await?;
    introspect::schema_snapshot(conn, internal).await
}

fn elapsed_ns(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

/// Apply `statement` to the database `conn` is connected to and record it.
#[instrument(skip_all, fields(namespace = %info.namespace, version = %info.version))]
pub(super) async fn execute_migration(
    conn: &mut PgConnection,
    ctx: &OperationContext,
    internal: &str,
    info: &MigrationInfo,
    statement: &str,
) -> Result<(i64, String)> {
    let statements = split_statements(statement, false)?;
    if let Some(control) = statements.iter().find(|s| is_transaction_control(s)) {
        return Err(SchemaflowError::Validation(format!(
            "Migration {} cannot contain transaction control ({})",
            info.version,
            statement_kind(control)
        )));
    }

    ctx.run(OPERATION, ensure_history(&mut *conn, internal)).await?;
    if let Some(done) = ctx
        .run(
            OPERATION,
            find_done(&mut *conn, internal, &info.namespace, &info.version),
        )
        .await?
    {
        info!(sequence = done.sequence, "Migration already applied; skipping");
        return Ok((done.sequence, done.schema));
    }

    let schema_prev = ctx
        .run(OPERATION, introspect::schema_snapshot(&mut *conn, internal))
        .await?;
    let started = Instant::now();

    let mut tx = ctx.run(OPERATION, begin(&mut *conn)).await?;
    let sequence = match ctx.run(OPERATION, prepare(&mut tx, internal, info)).await {
        Ok(Prepared::Next(sequence)) => sequence,
        Ok(Prepared::AlreadyApplied(done)) => {
            rollback(tx).await;
            info!(sequence = done.sequence, "Migration applied concurrently; skipping");
            return Ok((done.sequence, done.schema));
        }
        Err(error) => {
            rollback(tx).await;
            return Err(error);
        }
    };

    let applied = ctx
        .run(OPERATION, apply(&mut tx, internal, &statements))
        .await;
    let schema = match applied {
        Ok(schema) => schema,
        Err(error) => {
            rollback(tx).await;
            if error.kind() != ErrorKind::Cancellation {
                let failure = FailedAttempt {
                    info,
                    statement,
                    schema_prev: &schema_prev,
                    execution_duration_ns: elapsed_ns(started),
                    error: &error,
                };
                if let Err(record_error) =
                    ctx.run(OPERATION, record_failure(conn, internal, failure)).await
                {
                    warn!(error = %record_error, "Failed to record failed migration");
                }
            }
            log_migration_operation(
                OPERATION,
                None,
                Some(&info.database),
                Some(&info.version),
                "failed",
                Some(&error.to_string()),
            );
            return Err(error);
        }
    };

    let record = NewRecord {
        info,
        sequence,
        status: MigrationStatus::Done,
        statement,
        schema: &schema,
        schema_prev: &schema_prev,
        execution_duration_ns: elapsed_ns(started),
        payload: info.payload.clone(),
    };
    if let Err(error) = ctx
        .run(OPERATION, insert_record(&mut tx, internal, &record))
        .await
    {
        rollback(tx).await;
        return Err(error);
    }
    tx.commit()
        .await
        .map_err(|e| SchemaflowError::from_sqlx("COMMIT", e))?;

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

struct FailedAttempt<'a> {
    info: &'a MigrationInfo,
    statement: &'a str,
    schema_prev: &'a str,
    execution_duration_ns: i64,
    error: &'a SchemaflowError,
}

/// Write a `FAILED` record in its own transaction
async fn record_failure(conn: &mut PgConnection, internal: &str, failure: FailedAttempt<'_>) -> Result<()> {
    let mut tx = begin(conn).await?;
    let result = async {
        lock_history(&mut tx, internal).await?;
        let sequence = next_sequence(&mut tx, internal, &failure.info.namespace).await?;
        let record = NewRecord {
            info: failure.info,
            sequence,
            status: MigrationStatus::Failed,
            statement: failure.statement,
            schema: failure.schema_prev,
            schema_prev: failure.schema_prev,
            execution_duration_ns: failure.execution_duration_ns,
            payload: payload_with_error(&failure.info.payload, &failure.error.to_string()),
        };
        insert_record(&mut tx, internal, &record).await
    }
    .await;

    match result {
        Ok(_) => tx
            .commit()
            .await
            .map_err(|e| SchemaflowError::from_sqlx("COMMIT", e)),
        Err(error) => {
            rollback(tx).await;
            Err(error)
        }
    }
}

/// History records of the database `conn` is connected to, newest first
pub(super) async fn list(
    conn: &mut PgConnection,
    internal: &str,
    find: &MigrationHistoryFind,
) -> Result<Vec<MigrationHistory>> {
    if !history_exists(&mut *conn, internal).await? {
        return Ok(Vec::new());
    }

    let mut query = QueryBuilder::<Postgres>::new(format!(
        "SELECT {HISTORY_COLUMNS} FROM {} WHERE TRUE",
        history_table(internal)
    ));
    if let Some(id) = find.id {
        query.push(" AND id = ").push_bind(id);
    }
    if let Some(database) = &find.database {
        query.push(" AND namespace = ").push_bind(database.clone());
    }
    if let Some(version) = &find.version {
        query.push(" AND version = ").push_bind(version.clone());
    }
    query.push(" ORDER BY namespace, sequence DESC");
    if let Some(limit) = find.limit {
        query.push(" LIMIT ").push_bind(limit);
    }

    let sql = query.sql().to_string();
    let rows: Vec<HistoryRow> = query
        .build_query_as()
        .fetch_all(conn)
        .await
        .map_err(|e| SchemaflowError::from_sqlx(&sql, e))?;
    rows.into_iter().map(MigrationHistory::try_from).collect()
}
