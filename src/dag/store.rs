//! # Task Edge Store
//!
//! Persistence for dependency edges between tasks.
//!
//! Edges are stored as `(from_task_id, to_task_id, payload)` rows and read back
//! primarily by destination task: the rows found for a task are its complete
//! prerequisite set.
//!
//! ```rust
//! use schemaflow_core::dag::{InMemoryTaskDagStore, Task, TaskDagCreate, TaskDagStore, TaskGraph, TaskId};
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryTaskDagStore::new();
//! store.create_task_dag(&TaskDagCreate::new(1, 2)).await?;
//!
//! let graph = TaskGraph::load_from_store(&store, vec![Task::new(1, "a"), Task::new(2, "b")]).await?;
//! assert_eq!(graph.resolve_all()?, vec![TaskId(1), TaskId(2)]);
//! # Ok::<(), schemaflow_core::error::SchemaflowError>(())
//! # }).unwrap();
//! ```

use super::task::TaskId;
use crate::error::{Result, SchemaflowError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{debug, instrument};

/// A persisted dependency edge: `from_task_id` must complete before `to_task_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDag {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub from_task_id: TaskId,
    pub to_task_id: TaskId,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDagCreate {
    pub from_task_id: TaskId,
    pub to_task_id: TaskId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskDagCreate {
    pub fn new(from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        Self {
            from_task_id: from.into(),
            to_task_id: to.into(),
            payload: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDagFind {
    pub to_task_id: TaskId,
}

#[async_trait]
pub trait TaskDagStore: Send + Sync {
    async fn create_task_dag(&self, create: &TaskDagCreate) -> Result<TaskDag>;

    async fn find_task_dag_list(&self, find: &TaskDagFind) -> Result<Vec<TaskDag>>;

    /// The single edge pointing at `to_task_id`.
    ///
    /// Zero or several matches is a `Consistency` error.
    async fn get_task_dag_by_to_task_id(&self, to_task_id: TaskId) -> Result<TaskDag> {
        let mut list = self.find_task_dag_list(&TaskDagFind { to_task_id }).await?;
        if list.len() != 1 {
            return Err(SchemaflowError::Consistency(format!(
                "Expected 1 task dag for to_task_id {to_task_id}, found {}",
                list.len()
            )));
        }
        Ok(list.remove(0))
    }
}

#[derive(Debug, FromRow)]
struct TaskDagRow {
    id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    from_task_id: i64,
    to_task_id: i64,
    payload: serde_json::Value,
}

impl From<TaskDagRow> for TaskDag {
    fn from(row: TaskDagRow) -> Self {
        Self {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            from_task_id: TaskId(row.from_task_id),
            to_task_id: TaskId(row.to_task_id),
            payload: row.payload,
        }
    }
}

const CREATE_TASK_DAG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS task_dag (
    id BIGSERIAL PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    from_task_id BIGINT NOT NULL,
    to_task_id BIGINT NOT NULL,
    payload JSONB NOT NULL DEFAULT '{}',
    CONSTRAINT task_dag_no_self_edge CHECK (from_task_id <> to_task_id),
    CONSTRAINT task_dag_unique_edge UNIQUE (from_task_id, to_task_id)
);
CREATE INDEX IF NOT EXISTS idx_task_dag_to_task_id ON task_dag (to_task_id);
"#;

const INSERT_TASK_DAG: &str = r#"
INSERT INTO task_dag (from_task_id, to_task_id, payload, created_at, updated_at)
VALUES ($1, $2, $3, NOW(), NOW())
RETURNING id, created_at, updated_at, from_task_id, to_task_id, payload
"#;

const FIND_TASK_DAG_BY_TO: &str = r#"
SELECT id, created_at, updated_at, from_task_id, to_task_id, payload
FROM task_dag
WHERE to_task_id = $1
ORDER BY from_task_id
"#;

/// PostgreSQL-backed edge store
#[derive(Debug, Clone)]
pub struct PgTaskDagStore {
    pool: PgPool,
}

impl PgTaskDagStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `task_dag` table and its lookup index if missing
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_TASK_DAG_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| SchemaflowError::from_sqlx(CREATE_TASK_DAG_TABLE, e))?;
        Ok(())
    }
}

#[async_trait]
impl TaskDagStore for PgTaskDagStore {
    #[instrument(skip(self, create), fields(from = %create.from_task_id, to = %create.to_task_id))]
    async fn create_task_dag(&self, create: &TaskDagCreate) -> Result<TaskDag> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SchemaflowError::from_sqlx("BEGIN", e))?;

        let row = sqlx::query_as::<_, TaskDagRow>(INSERT_TASK_DAG)
            .bind(create.from_task_id.0)
            .bind(create.to_task_id.0)
            .bind(&create.payload)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| SchemaflowError::from_sqlx(INSERT_TASK_DAG, e))?;

        tx.commit()
            .await
            .map_err(|e| SchemaflowError::from_sqlx("COMMIT", e))?;

        debug!(id = row.id, "Created task dag edge");
        Ok(row.into())
    }

    async fn find_task_dag_list(&self, find: &TaskDagFind) -> Result<Vec<TaskDag>> {
        let rows = sqlx::query_as::<_, TaskDagRow>(FIND_TASK_DAG_BY_TO)
            .bind(find.to_task_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SchemaflowError::from_sqlx(FIND_TASK_DAG_BY_TO, e))?;
        Ok(rows.into_iter().map(TaskDag::from).collect())
    }
}

/// Process-local edge store with the same constraints as the table
#[derive(Debug, Default)]
pub struct InMemoryTaskDagStore {
    inner: RwLock<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    next_id: i64,
    rows: Vec<TaskDag>,
}

impl InMemoryTaskDagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskDagStore for InMemoryTaskDagStore {
    async fn create_task_dag(&self, create: &TaskDagCreate) -> Result<TaskDag> {
        if create.from_task_id == create.to_task_id {
            return Err(SchemaflowError::Validation(format!(
                "Task {} cannot depend on itself",
                create.from_task_id
            )));
        }

        let mut state = self.inner.write();
        if state
            .rows
            .iter()
            .any(|r| r.from_task_id == create.from_task_id && r.to_task_id == create.to_task_id)
        {
            return Err(SchemaflowError::Validation(format!(
                "Edge {} -> {} already exists",
                create.from_task_id, create.to_task_id
            )));
        }

        state.next_id += 1;
        let now = Utc::now();
        let row = TaskDag {
            id: state.next_id,
            created_at: now,
            updated_at: now,
            from_task_id: create.from_task_id,
            to_task_id: create.to_task_id,
            payload: create.payload.clone(),
        };
        state.rows.push(row.clone());
        Ok(row)
    }

    async fn find_task_dag_list(&self, find: &TaskDagFind) -> Result<Vec<TaskDag>> {
        let state = self.inner.read();
        let mut rows: Vec<TaskDag> = state
            .rows
            .iter()
            .filter(|r| r.to_task_id == find.to_task_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.from_task_id);
        Ok(rows)
    }
}
