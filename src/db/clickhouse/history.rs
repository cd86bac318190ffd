//! Migration history for ClickHouse.
//!
//! ClickHouse has no transactional DDL, so history is a write-ahead log: a
//! `PENDING` row is written before the statement runs and replaced by a
//! `DONE` or `FAILED` row with the same `(namespace, sequence)` key once the
//! outcome is known. The table is a `ReplacingMergeTree` versioned by
//! `updated_ts` and always read with `FINAL`.
//!
//! A `PENDING` row that outlives its execution (process crash, lost network)
//! is reconciled to `FAILED`.

use super::client::{quote_string, ClickHouseClient, Scope};
use crate::ast::Dialect;
use crate::constants::MIGRATION_HISTORY_TABLE;
use crate::db::types::{
    payload_with_error, MigrationHistory, MigrationHistoryFind, MigrationInfo, MigrationStatus,
};
use crate::error::{Result, SchemaflowError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Note stored on markers reconciled from `PENDING`
pub(super) const INTERRUPTED_NOTE: &str =
    "execution was interrupted before its outcome was recorded; the statement may be partially applied";

pub(super) struct HistoryTable<'a> {
    internal: &'a str,
}

/// Row as stored; timestamps are microseconds since the epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) struct HistoryRow {
    pub id: i64,
    pub created_by: String,
    pub created_ts: u64,
    pub updated_by: String,
    pub updated_ts: u64,
    pub namespace: String,
    pub sequence: i64,
    pub source: String,
    #[serde(rename = "type")]
    pub migration_type: String,
    pub status: String,
    pub version: String,
    pub description: String,
    pub statement: String,
    pub schema: String,
    pub schema_prev: String,
    pub execution_duration_ns: i64,
    pub issue_id: Option<String>,
    /// JSON text
    pub payload: String,
}

fn now_micros() -> u64 {
    u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0)
}

fn timestamp(micros: u64) -> DateTime<Utc> {
    i64::try_from(micros)
        .ok()
        .and_then(DateTime::from_timestamp_micros)
        .unwrap_or_default()
}

impl HistoryRow {
    /// `PENDING` marker for a new attempt
    pub fn pending(info: &MigrationInfo, sequence: i64, statement: &str, schema_prev: &str) -> Self {
        let now = now_micros();
        Self {
            id: i64::try_from(now).unwrap_or(i64::MAX),
            created_by: info.creator.clone(),
            created_ts: now,
            updated_by: info.creator.clone(),
            updated_ts: now,
            namespace: info.namespace.clone(),
            sequence,
            source: info.source.as_str().to_string(),
            migration_type: info.migration_type.as_str().to_string(),
            status: MigrationStatus::Pending.as_str().to_string(),
            version: info.version.clone(),
            description: info.description.clone(),
            statement: statement.to_string(),
            schema: schema_prev.to_string(),
            schema_prev: schema_prev.to_string(),
            execution_duration_ns: 0,
            issue_id: info.issue_id.clone(),
            payload: info.payload.to_string(),
        }
    }

    /// Same key, new outcome
    pub fn resolve(&self, status: MigrationStatus, schema: &str, duration_ns: i64) -> Self {
        Self {
            status: status.as_str().to_string(),
            schema: schema.to_string(),
            execution_duration_ns: duration_ns,
            // strictly newer so the replacement always wins the merge
            updated_ts: now_micros().max(self.updated_ts + 1),
            ..self.clone()
        }
    }

    pub fn with_error(mut self, note: &str) -> Self {
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).unwrap_or(serde_json::Value::Null);
        self.payload = payload_with_error(&payload, note).to_string();
        self
    }
}

impl TryFrom<HistoryRow> for MigrationHistory {
    type Error = SchemaflowError;

    fn try_from(row: HistoryRow) -> Result<Self> {
        let payload = if row.payload.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&row.payload).map_err(|e| {
                SchemaflowError::Consistency(format!(
                    "History record {} has a malformed payload: {e}",
                    row.id
                ))
            })?
        };
        Ok(MigrationHistory {
            id: row.id,
            creator: row.created_by,
            created_at: timestamp(row.created_ts),
            updated_at: timestamp(row.updated_ts),
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
            payload,
        })
    }
}

const COLUMNS: &str = "id, created_by, created_ts, updated_by, updated_ts, namespace, sequence, \
     source, type, status, version, description, statement, schema, schema_prev, \
     execution_duration_ns, issue_id, payload";

impl<'a> HistoryTable<'a> {
    pub fn new(internal: &'a str) -> Self {
        Self { internal }
    }

    pub fn qualified(&self) -> String {
        format!(
            "{}.{}",
            Dialect::ClickHouse.quote_ident(self.internal),
            Dialect::ClickHouse.quote_ident(MIGRATION_HISTORY_TABLE)
        )
    }

    pub fn setup_statements(&self) -> Vec<String> {
        vec![
            format!(
                "CREATE DATABASE IF NOT EXISTS {}",
                Dialect::ClickHouse.quote_ident(self.internal)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\n\
                 \x20 id Int64,\n\
                 \x20 created_by String,\n\
                 \x20 created_ts UInt64,\n\
                 \x20 updated_by String,\n\
                 \x20 updated_ts UInt64,\n\
                 \x20 namespace String,\n\
                 \x20 sequence Int64,\n\
                 \x20 source LowCardinality(String),\n\
                 \x20 type LowCardinality(String),\n\
                 \x20 status LowCardinality(String),\n\
                 \x20 version String,\n\
                 \x20 description String,\n\
                 \x20 statement String,\n\
                 \x20 schema String,\n\
                 \x20 schema_prev String,\n\
                 \x20 execution_duration_ns Int64,\n\
                 \x20 issue_id Nullable(String),\n\
                 \x20 payload String\n\
                 )\n\
                 ENGINE = ReplacingMergeTree(updated_ts)\n\
                 ORDER BY (namespace, sequence)",
                self.qualified()
            ),
        ]
    }

    pub async fn exists(&self, client: &ClickHouseClient) -> Result<bool> {
        let sql = format!("EXISTS TABLE {}", self.qualified());
        let lines = client.lines(&Scope::default(), &sql).await?;
        Ok(lines.first().map(|l| l.trim() == "1").unwrap_or(false))
    }

    pub async fn ensure(&self, client: &ClickHouseClient) -> Result<()> {
        for sql in self.setup_statements() {
            client.execute(&Scope::default(), &sql).await?;
        }
        Ok(())
    }

    pub async fn insert(&self, client: &ClickHouseClient, row: &HistoryRow) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({COLUMNS}) FORMAT JSONEachRow\n{}",
            self.qualified(),
            serde_json::to_string(row)?
        );
        client.execute(&Scope::default(), &sql).await
    }

    async fn select(&self, client: &ClickHouseClient, filter: &str, tail: &str) -> Result<Vec<HistoryRow>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} FINAL WHERE {filter} {tail}",
            self.qualified()
        );
        client.rows(&Scope::default(), &sql).await
    }

    pub async fn find_done(
        &self,
        client: &ClickHouseClient,
        namespace: &str,
        version: &str,
    ) -> Result<Option<HistoryRow>> {
        let filter = format!(
            "namespace = {} AND version = {} AND status = 'DONE'",
            quote_string(namespace),
            quote_string(version)
        );
        let mut rows = self
            .select(client, &filter, "ORDER BY sequence LIMIT 1")
            .await?;
        Ok(rows.pop())
    }

    pub async fn next_sequence(&self, client: &ClickHouseClient, namespace: &str) -> Result<i64> {
        #[derive(Deserialize)]
        struct MaxSequence {
            max_sequence: i64,
        }
        let sql = format!(
            "SELECT max(sequence) AS max_sequence FROM {} FINAL WHERE namespace = {}",
            self.qualified(),
            quote_string(namespace)
        );
        let rows: Vec<MaxSequence> = client.rows(&Scope::default(), &sql).await?;
        Ok(rows.first().map(|r| r.max_sequence).unwrap_or(0) + 1)
    }

    /// Mark markers still `PENDING` as `FAILED`; all namespaces when `None`.
    /// Returns the number of records reconciled.
    pub async fn reconcile_pending(
        &self,
        client: &ClickHouseClient,
        namespace: Option<&str>,
    ) -> Result<usize> {
        let mut filter = "status = 'PENDING'".to_string();
        if let Some(namespace) = namespace {
            filter.push_str(&format!(" AND namespace = {}", quote_string(namespace)));
        }
        let stale = self.select(client, &filter, "ORDER BY namespace, sequence").await?;
        for row in &stale {
            warn!(
                namespace = %row.namespace,
                sequence = row.sequence,
                version = %row.version,
                "Reconciling interrupted migration to FAILED"
            );
            let failed = row
                .resolve(MigrationStatus::Failed, &row.schema_prev, row.execution_duration_ns)
                .with_error(INTERRUPTED_NOTE);
            self.insert(client, &failed).await?;
        }
        Ok(stale.len())
    }

    pub async fn list(
        &self,
        client: &ClickHouseClient,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>> {
        if !self.exists(client).await? {
            return Ok(Vec::new());
        }
        let mut conditions = vec!["1".to_string()];
        if let Some(id) = find.id {
            conditions.push(format!("id = {id}"));
        }
        if let Some(database) = &find.database {
            conditions.push(format!("namespace = {}", quote_string(database)));
        }
        if let Some(version) = &find.version {
            conditions.push(format!("version = {}", quote_string(version)));
        }
        let mut tail = "ORDER BY namespace, sequence DESC".to_string();
        if let Some(limit) = find.limit {
            tail.push_str(&format!(" LIMIT {}", limit.max(0)));
        }
        self.select(client, &conditions.join(" AND "), &tail)
            .await?
            .into_iter()
            .map(MigrationHistory::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn info() -> MigrationInfo {
        MigrationInfo::new("analytics", "20240101_add_events").with_creator("ci")
    }

    #[test]
    fn test_marker_lifecycle_keeps_key() {
        let pending = HistoryRow::pending(&info(), 3, "CREATE TABLE e (id UInt64) ENGINE = Log", "");
        assert_eq!(pending.status, "PENDING");
        assert_eq!(pending.namespace, "analytics");

        let done = pending.resolve(MigrationStatus::Done, "CREATE TABLE e", 42);
        assert_eq!((done.namespace.as_str(), done.sequence), ("analytics", 3));
        assert_eq!(done.id, pending.id);
        assert!(done.updated_ts > pending.updated_ts);
        assert_eq!(done.status, "DONE");
    }

    #[test]
    fn test_reconciled_marker_carries_note() {
        let pending = HistoryRow::pending(&info(), 1, "ALTER TABLE e ADD COLUMN x UInt8", "");
        let failed = pending
            .resolve(MigrationStatus::Failed, "", 0)
            .with_error(INTERRUPTED_NOTE);
        let history = MigrationHistory::try_from(failed).unwrap();
        assert_eq!(history.status, MigrationStatus::Failed);
        assert_eq!(history.payload["error"], INTERRUPTED_NOTE);
    }

    #[test]
    fn test_row_serializes_type_column() {
        let row = HistoryRow::pending(&info(), 1, "SELECT 1", "");
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["type"], "MIGRATE");
        assert!(json.get("migration_type").is_none());
    }

    #[test]
    fn test_unknown_status_is_consistency_error() {
        let mut row = HistoryRow::pending(&info(), 1, "SELECT 1", "");
        row.status = "RUNNING".into();
        let err = MigrationHistory::try_from(row).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
    }

    #[test]
    fn test_setup_uses_replacing_merge_tree() {
        let statements = HistoryTable::new("bytebase").setup_statements();
        assert_eq!(statements[0], "CREATE DATABASE IF NOT EXISTS `bytebase`");
        assert!(statements[1].contains("ReplacingMergeTree(updated_ts)"));
        assert!(statements[1].contains("ORDER BY (namespace, sequence)"));
    }
}
