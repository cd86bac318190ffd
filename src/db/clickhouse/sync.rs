//! Schema sync for ClickHouse: fetch from `system.*` and assemble.

use super::client::{ClickHouseClient, Scope};
use crate::ast::Dialect;
use crate::db::types::{
    DbColumn, DbConstraint, DbConstraintKind, DbSchema, DbTable, DbUser, ExcludedDatabases,
};
use crate::error::Result;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub(super) struct UserRow {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct DatabaseRow {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct TableRow {
    pub database: String,
    pub name: String,
    pub engine: String,
    pub total_rows: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct ColumnRow {
    pub database: String,
    pub table: String,
    pub name: String,
    pub position: u64,
    #[serde(rename = "type")]
    pub data_type: String,
    pub default_expression: String,
    pub comment: String,
    pub is_in_primary_key: u8,
}

/// Everything `sync_schema` reads, before filtering
#[derive(Debug, Default)]
pub(super) struct SyncSnapshot {
    /// Users with their `SHOW GRANTS` lines
    pub users: Vec<(UserRow, Vec<String>)>,
    pub databases: Vec<DatabaseRow>,
    pub tables: Vec<TableRow>,
    pub columns: Vec<ColumnRow>,
}

pub(super) async fn fetch(client: &ClickHouseClient) -> Result<SyncSnapshot> {
    let scope = Scope::default();
    let user_rows: Vec<UserRow> = client
        .rows(&scope, "SELECT name FROM system.users ORDER BY name")
        .await?;
    let mut users = Vec::with_capacity(user_rows.len());
    for user in user_rows {
        let grants = client
            .lines(
                &scope,
                &format!("SHOW GRANTS FOR {}", Dialect::ClickHouse.quote_ident(&user.name)),
            )
            .await?;
        users.push((user, grants));
    }

    let databases = client
        .rows(&scope, "SELECT name FROM system.databases ORDER BY name")
        .await?;
    let tables = client
        .rows(
            &scope,
            "SELECT database, name, engine, total_rows FROM system.tables \
             WHERE NOT is_temporary ORDER BY database, name",
        )
        .await?;
    let columns = client
        .rows(
            &scope,
            "SELECT database, table, name, position, type, default_expression, comment, \
             is_in_primary_key FROM system.columns ORDER BY database, table, position",
        )
        .await?;

    Ok(SyncSnapshot {
        users,
        databases,
        tables,
        columns,
    })
}

/// Users and per-database schemas, without excluded databases
pub(super) fn assemble(
    snapshot: SyncSnapshot,
    excluded: &ExcludedDatabases,
) -> (Vec<DbUser>, Vec<DbSchema>) {
    let users = snapshot
        .users
        .into_iter()
        .map(|(user, grants)| DbUser {
            name: user.name,
            grant: grants.join("\n"),
        })
        .collect();

    let mut tables: BTreeMap<(String, String), DbTable> = snapshot
        .tables
        .into_iter()
        .filter(|t| !excluded.contains(&t.database))
        .map(|t| {
            let table = DbTable {
                schema: None,
                name: t.name.clone(),
                engine: Some(t.engine),
                columns: Vec::new(),
                constraints: Vec::new(),
                row_count: t.total_rows.and_then(|n| i64::try_from(n).ok()),
            };
            ((t.database, t.name), table)
        })
        .collect();

    let mut primary_keys: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for column in snapshot.columns {
        let key = (column.database, column.table);
        let Some(table) = tables.get_mut(&key) else {
            continue;
        };
        if column.is_in_primary_key != 0 {
            primary_keys
                .entry(key)
                .or_default()
                .push(column.name.clone());
        }
        table.columns.push(DbColumn {
            nullable: column.data_type.starts_with("Nullable("),
            name: column.name,
            position: i32::try_from(column.position).unwrap_or(i32::MAX),
            data_type: column.data_type,
            default: Some(column.default_expression).filter(|d| !d.is_empty()),
            comment: Some(column.comment).filter(|c| !c.is_empty()),
        });
    }
    for (key, columns) in primary_keys {
        if let Some(table) = tables.get_mut(&key) {
            table.constraints.push(DbConstraint {
                name: "PRIMARY".to_string(),
                kind: DbConstraintKind::PrimaryKey,
                columns,
                check_expression: None,
                referenced_table: None,
                referenced_columns: Vec::new(),
                on_delete: None,
                on_update: None,
            });
        }
    }

    let mut schemas: BTreeMap<String, DbSchema> = excluded
        .filter(snapshot.databases.into_iter().map(|d| d.name))
        .into_iter()
        .map(|name| {
            let schema = DbSchema {
                name: name.clone(),
                ..Default::default()
            };
            (name, schema)
        })
        .collect();
    for ((database, _), table) in tables {
        if let Some(schema) = schemas.get_mut(&database) {
            schema.tables.push(table);
        }
    }

    (users, schemas.into_values().collect())
}
