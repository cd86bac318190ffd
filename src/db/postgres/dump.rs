//! Dump and restore for PostgreSQL.
//!
//! A dump is a `;`-terminated statement stream in dependency order: schemas,
//! sequences, tables, rows, foreign keys, then sequence positions.

use super::history::{begin, execute_raw, rollback};
use super::introspect;
use crate::ast::{Dialect, TableDef};
use crate::constants::operations;
use crate::context::OperationContext;
use crate::db::statement::StatementSplitter;
use crate::db::types::DbTable;
use crate::error::{Result, SchemaflowError};
use futures::TryStreamExt;
use sqlx::{FromRow, PgConnection};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

type Output<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

#[derive(Debug, FromRow)]
struct SequenceRow {
    schema_name: String,
    sequence_name: String,
    data_type: String,
    start_value: i64,
    increment_by: i64,
    min_value: i64,
    max_value: i64,
    cycle: bool,
    last_value: Option<i64>,
}

impl SequenceRow {
    fn qualified(&self) -> String {
        Dialect::Postgres.quote_table(&TableDef::qualified(&self.schema_name, &self.sequence_name))
    }

    fn create_statement(&self) -> String {
        format!(
            "CREATE SEQUENCE {} AS {} START WITH {} INCREMENT BY {} MINVALUE {} MAXVALUE {} {}",
            self.qualified(),
            self.data_type,
            self.start_value,
            self.increment_by,
            self.min_value,
            self.max_value,
            if self.cycle { "CYCLE" } else { "NO CYCLE" }
        )
    }

    fn setval_statement(&self) -> Option<String> {
        let last_value = self.last_value?;
        Some(format!(
            "SELECT pg_catalog.setval({}, {last_value}, true)",
            crate::db::statement::quote_literal(&self.qualified())
        ))
    }
}

async fn load_sequences(conn: &mut PgConnection, internal: &str) -> Result<Vec<SequenceRow>> {
    let sql = "SELECT schemaname::text AS schema_name, sequencename::text AS sequence_name, \
               data_type::text AS data_type, start_value, increment_by, min_value, max_value, \
               cycle, last_value \
               FROM pg_catalog.pg_sequences \
               WHERE schemaname NOT IN ('pg_catalog', 'information_schema', $1) \
               ORDER BY schemaname, sequencename";
    sqlx::query_as(sql)
        .bind(internal)
        .fetch_all(conn)
        .await
        .map_err(|e| SchemaflowError::from_sqlx(sql, e))
}

async fn write_statement(out: Output<'_>, statement: &str) -> Result<()> {
    out.write_all(statement.as_bytes()).await?;
    out.write_all(b";\n").await?;
    Ok(())
}

/// Select every row of `table` as a ready-made `VALUES` tuple body
fn row_select(table: &DbTable) -> String {
    let dialect = Dialect::Postgres;
    let values = table
        .columns
        .iter()
        .map(|c| format!("quote_nullable({}::text)", dialect.quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT array_to_string(ARRAY[{values}], ', ') FROM {}",
        dialect.quote_table(&table.table_def())
    )
}

fn insert_prefix(table: &DbTable) -> String {
    let dialect = Dialect::Postgres;
    let columns = table
        .columns
        .iter()
        .map(|c| dialect.quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({columns}) VALUES",
        dialect.quote_table(&table.table_def())
    )
}

async fn dump_rows(
    conn: &mut PgConnection,
    ctx: &OperationContext,
    table: &DbTable,
    out: Output<'_>,
) -> Result<u64> {
    if table.columns.is_empty() {
        return Ok(0);
    }
    let sql = row_select(table);
    let prefix = insert_prefix(table);
    let mut rows = sqlx::query_scalar::<_, String>(&sql).fetch(conn);
    let mut count = 0;
    loop {
        let next = ctx
            .run(operations::DUMP, async {
                rows.try_next()
                    .await
                    .map_err(|e| SchemaflowError::from_sqlx(&sql, e))
            })
            .await?;
        let Some(values) = next else { break };
        write_statement(&mut *out, &format!("{prefix} ({values})")).await?;
        count += 1;
    }
    Ok(count)
}

pub(super) async fn dump(
    conn: &mut PgConnection,
    ctx: &OperationContext,
    internal: &str,
    out: Output<'_>,
    schema_only: bool,
) -> Result<()> {
    const OPERATION: &str = operations::DUMP;

    let schemas = ctx
        .run(OPERATION, introspect::load_schema_names(&mut *conn, internal))
        .await?;
    let sequences = ctx
        .run(OPERATION, load_sequences(&mut *conn, internal))
        .await?;
    let tables = ctx
        .run(OPERATION, introspect::load_tables(&mut *conn, internal))
        .await?;

    for schema in &schemas {
        write_statement(
            &mut *out,
            &format!("CREATE SCHEMA IF NOT EXISTS {}", Dialect::Postgres.quote_ident(schema)),
        )
        .await?;
    }
    for sequence in &sequences {
        write_statement(&mut *out, &sequence.create_statement()).await?;
    }

    let ddl = introspect::render_tables(&tables);
    let (creates, foreign_keys) = ddl.split_at(tables.len().min(ddl.len()));
    for statement in creates {
        write_statement(&mut *out, statement).await?;
    }

    if !schema_only {
        for table in &tables {
            let rows = dump_rows(&mut *conn, ctx, table, &mut *out).await?;
            debug!(table = %table.table_def(), rows, "Dumped table rows");
        }
    }

    for statement in foreign_keys {
        write_statement(&mut *out, statement).await?;
    }

    if !schema_only {
        for statement in sequences.iter().filter_map(SequenceRow::setval_statement) {
            write_statement(&mut *out, &statement).await?;
        }
    }

    out.flush().await?;
    Ok(())
}

async fn replay(
    conn: &mut PgConnection,
    input: &mut (dyn AsyncBufRead + Unpin + Send),
) -> Result<usize> {
    let mut splitter = StatementSplitter::new(false);
    let mut line = String::new();
    let mut count = 0;
    loop {
        line.clear();
        if input.read_line(&mut line).await? == 0 {
            break;
        }
        for statement in splitter.push(&line) {
            execute_raw(&mut *conn, &statement).await?;
            count += 1;
        }
    }
    if let Some(statement) = splitter.finish()? {
        execute_raw(conn, &statement).await?;
        count += 1;
    }
    Ok(count)
}

/// Replay a statement stream in a single transaction
pub(super) async fn restore(
    conn: &mut PgConnection,
    ctx: &OperationContext,
    input: &mut (dyn AsyncBufRead + Unpin + Send),
) -> Result<usize> {
    const OPERATION: &str = operations::RESTORE;

    let mut tx = ctx.run(OPERATION, begin(conn)).await?;

    let replayed = ctx.run(OPERATION, replay(&mut tx, input)).await;

    match replayed {
        Ok(count) => {
            tx.commit()
                .await
                .map_err(|e| SchemaflowError::from_sqlx("COMMIT", e))?;
            Ok(count)
        }
        Err(error) => {
            rollback(tx).await;
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::DbColumn;

    fn table() -> DbTable {
        DbTable {
            schema: Some("public".into()),
            name: "users".into(),
            columns: vec![
                DbColumn {
                    name: "id".into(),
                    position: 1,
                    data_type: "integer".into(),
                    ..Default::default()
                },
                DbColumn {
                    name: "email".into(),
                    position: 2,
                    data_type: "text".into(),
                    nullable: true,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_row_select_quotes_every_column() {
        assert_eq!(
            row_select(&table()),
            "SELECT array_to_string(ARRAY[quote_nullable(\"id\"::text), \
             quote_nullable(\"email\"::text)], ', ') FROM \"public\".\"users\""
        );
        assert_eq!(
            insert_prefix(&table()),
            "INSERT INTO \"public\".\"users\" (\"id\", \"email\") VALUES"
        );
    }

    #[test]
    fn test_sequence_statements() {
        let sequence = SequenceRow {
            schema_name: "public".into(),
            sequence_name: "users_id_seq".into(),
            data_type: "integer".into(),
            start_value: 1,
            increment_by: 1,
            min_value: 1,
            max_value: 2147483647,
            cycle: false,
            last_value: Some(42),
        };
        assert_eq!(
            sequence.create_statement(),
            "CREATE SEQUENCE \"public\".\"users_id_seq\" AS integer START WITH 1 INCREMENT BY 1 \
             MINVALUE 1 MAXVALUE 2147483647 NO CYCLE"
        );
        assert_eq!(
            sequence.setval_statement().unwrap(),
            "SELECT pg_catalog.setval('\"public\".\"users_id_seq\"', 42, true)"
        );

        let unused = SequenceRow {
            last_value: None,
            ..sequence
        };
        assert!(unused.setval_statement().is_none());
    }
}
