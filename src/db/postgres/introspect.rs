//! Catalog introspection for PostgreSQL.
//!
//! Reads tables, columns and constraints from `pg_catalog` into [`DbTable`]s.
//! System schemas and the internal metadata schema are never reported.

use crate::ast::{render, Dialect, TableDef};
use crate::db::types::{DbColumn, DbConstraint, DbConstraintKind, DbTable};
use crate::error::{Result, SchemaflowError};
use sqlx::{FromRow, PgConnection};
use std::collections::BTreeMap;

/// Schema filter shared by every catalog query; `$1` is the internal schema
const USER_SCHEMA_FILTER: &str = "n.nspname NOT IN ('pg_catalog', 'information_schema', $1) \
     AND n.nspname NOT LIKE 'pg_toast%' AND n.nspname NOT LIKE 'pg_temp%'";

#[derive(Debug, FromRow)]
struct TableRow {
    schema_name: String,
    table_name: String,
    row_count: i64,
}

#[derive(Debug, FromRow)]
struct ColumnRow {
    schema_name: String,
    table_name: String,
    column_name: String,
    position: i32,
    data_type: String,
    nullable: bool,
    column_default: Option<String>,
    comment: Option<String>,
}

#[derive(Debug, FromRow)]
struct ConstraintRow {
    schema_name: String,
    table_name: String,
    name: String,
    kind: String,
    columns: Vec<String>,
    ref_schema: Option<String>,
    ref_table: Option<String>,
    ref_columns: Vec<String>,
    on_delete: String,
    on_update: String,
    definition: Option<String>,
}

/// User schemas other than `public`, for `CREATE SCHEMA` in dumps
pub(super) async fn load_schema_names(conn: &mut PgConnection, internal: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT n.nspname::text FROM pg_catalog.pg_namespace n \
         WHERE {USER_SCHEMA_FILTER} AND n.nspname <> 'public' ORDER BY 1"
    );
    sqlx::query_scalar::<_, String>(&sql)
        .bind(internal)
        .fetch_all(conn)
        .await
        .map_err(|e| SchemaflowError::from_sqlx(&sql, e))
}

/// Every user table with its columns and constraints, ordered by schema and name
pub(super) async fn load_tables(conn: &mut PgConnection, internal: &str) -> Result<Vec<DbTable>> {
    let tables_sql = format!(
        "SELECT n.nspname::text AS schema_name, c.relname::text AS table_name, \
                GREATEST(c.reltuples, 0)::bigint AS row_count \
         FROM pg_catalog.pg_class c \
         JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
         WHERE c.relkind IN ('r', 'p') AND NOT c.relispartition AND {USER_SCHEMA_FILTER} \
         ORDER BY n.nspname, c.relname"
    );
    let table_rows: Vec<TableRow> = sqlx::query_as(&tables_sql)
        .bind(internal)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SchemaflowError::from_sqlx(&tables_sql, e))?;

    let columns_sql = format!(
        "SELECT n.nspname::text AS schema_name, c.relname::text AS table_name, \
                a.attname::text AS column_name, a.attnum::int4 AS position, \
                pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type, \
                NOT a.attnotnull AS nullable, \
                pg_catalog.pg_get_expr(d.adbin, d.adrelid) AS column_default, \
                pg_catalog.col_description(c.oid, a.attnum) AS comment \
         FROM pg_catalog.pg_attribute a \
         JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
         JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
         LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
         WHERE a.attnum > 0 AND NOT a.attisdropped AND c.relkind IN ('r', 'p') \
           AND {USER_SCHEMA_FILTER} \
         ORDER BY n.nspname, c.relname, a.attnum"
    );
    let column_rows: Vec<ColumnRow> = sqlx::query_as(&columns_sql)
        .bind(internal)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SchemaflowError::from_sqlx(&columns_sql, e))?;

    let constraints_sql = format!(
        "SELECT n.nspname::text AS schema_name, c.relname::text AS table_name, \
                con.conname::text AS name, con.contype::text AS kind, \
                ARRAY(SELECT a.attname::text \
                      FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord) \
                      JOIN pg_catalog.pg_attribute a \
                        ON a.attrelid = con.conrelid AND a.attnum = k.attnum \
                      ORDER BY k.ord) AS columns, \
                rn.nspname::text AS ref_schema, rc.relname::text AS ref_table, \
                ARRAY(SELECT a.attname::text \
                      FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord) \
                      JOIN pg_catalog.pg_attribute a \
                        ON a.attrelid = con.confrelid AND a.attnum = k.attnum \
                      ORDER BY k.ord) AS ref_columns, \
                con.confdeltype::text AS on_delete, con.confupdtype::text AS on_update, \
                CASE WHEN con.contype = 'c' \
                     THEN pg_catalog.pg_get_constraintdef(con.oid) END AS definition \
         FROM pg_catalog.pg_constraint con \
         JOIN pg_catalog.pg_class c ON c.oid = con.conrelid \
         JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
         LEFT JOIN pg_catalog.pg_class rc ON rc.oid = con.confrelid \
         LEFT JOIN pg_catalog.pg_namespace rn ON rn.oid = rc.relnamespace \
         WHERE con.contype IN ('p', 'u', 'f', 'c') AND c.relkind IN ('r', 'p') \
           AND {USER_SCHEMA_FILTER} \
         ORDER BY n.nspname, c.relname, con.contype, con.conname"
    );
    let constraint_rows: Vec<ConstraintRow> = sqlx::query_as(&constraints_sql)
        .bind(internal)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SchemaflowError::from_sqlx(&constraints_sql, e))?;

    Ok(assemble_tables(table_rows, column_rows, constraint_rows))
}

fn assemble_tables(
    tables: Vec<TableRow>,
    columns: Vec<ColumnRow>,
    constraints: Vec<ConstraintRow>,
) -> Vec<DbTable> {
    let mut by_name: BTreeMap<(String, String), DbTable> = tables
        .into_iter()
        .map(|row| {
            let table = DbTable {
                schema: Some(row.schema_name.clone()),
                name: row.table_name.clone(),
                engine: None,
                columns: Vec::new(),
                constraints: Vec::new(),
                row_count: Some(row.row_count),
            };
            ((row.schema_name, row.table_name), table)
        })
        .collect();

    for row in columns {
        if let Some(table) = by_name.get_mut(&(row.schema_name, row.table_name)) {
            table.columns.push(DbColumn {
                name: row.column_name,
                position: row.position,
                data_type: row.data_type,
                nullable: row.nullable,
                default: row.column_default,
                comment: row.comment,
            });
        }
    }

    for row in constraints {
        let Some(kind) = constraint_kind(&row.kind) else {
            continue;
        };
        let key = (row.schema_name, row.table_name);
        let Some(table) = by_name.get_mut(&key) else {
            continue;
        };
        let is_foreign = kind == DbConstraintKind::ForeignKey;
        let referenced_table = match (row.ref_schema, row.ref_table) {
            (Some(schema), Some(name)) if is_foreign => Some(TableDef::qualified(schema, name)),
            _ => None,
        };
        table.constraints.push(DbConstraint {
            name: row.name,
            kind,
            columns: row.columns,
            check_expression: row.definition.as_deref().map(check_expression),
            referenced_table,
            referenced_columns: if is_foreign { row.ref_columns } else { Vec::new() },
            on_delete: is_foreign.then(|| referential_action(&row.on_delete)).flatten(),
            on_update: is_foreign.then(|| referential_action(&row.on_update)).flatten(),
        });
    }

    by_name.into_values().collect()
}

fn constraint_kind(contype: &str) -> Option<DbConstraintKind> {
    match contype {
        "p" => Some(DbConstraintKind::PrimaryKey),
        "u" => Some(DbConstraintKind::Unique),
        "f" => Some(DbConstraintKind::ForeignKey),
        "c" => Some(DbConstraintKind::Check),
        _ => None,
    }
}

/// `NO ACTION` is the default and rendered as no clause at all
fn referential_action(code: &str) -> Option<String> {
    let action = match code {
        "r" => "RESTRICT",
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        _ => return None,
    };
    Some(action.to_string())
}

/// Strip `CHECK (` ... `)` from `pg_get_constraintdef` output
fn check_expression(definition: &str) -> String {
    let body = definition.trim();
    let body = body.strip_suffix(" NOT VALID").unwrap_or(body);
    body.strip_prefix("CHECK (")
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or(body)
        .to_string()
}

/// DDL for `tables`: every table first, then foreign keys
pub(crate) fn render_tables(tables: &[DbTable]) -> Vec<String> {
    let creates = tables
        .iter()
        .flat_map(|t| render(&t.create_statement(), Dialect::Postgres));
    let foreign_keys = tables
        .iter()
        .flat_map(DbTable::foreign_key_statements)
        .flat_map(|s| render(&s, Dialect::Postgres));
    creates.chain(foreign_keys).collect()
}

/// Textual schema snapshot stored with migration history
pub(super) async fn schema_snapshot(conn: &mut PgConnection, internal: &str) -> Result<String> {
    let tables = load_tables(conn, internal).await?;
    Ok(render_tables(&tables)
        .into_iter()
        .map(|statement| format!("{statement};\n"))
        .collect())
}
