//! Migration units, their targets and the plan the engine runs.

use crate::dag::{TaskGraph, TaskId};
use crate::db::{ConnectionConfig, ConnectionContext, EngineType, MigrationInfo};
use crate::error::{Result, SchemaflowError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One versioned change: what to run and how to record it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationUnit {
    pub id: String,
    pub info: MigrationInfo,
    pub statement: String,
    pub issuer: String,
    pub issued_at: DateTime<Utc>,
}

impl MigrationUnit {
    pub fn new(id: impl Into<String>, info: MigrationInfo, statement: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            issuer: info.creator.clone(),
            info,
            statement: statement.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }
}

/// Instance a unit is applied to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationTarget {
    pub engine: EngineType,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub context: ConnectionContext,
}

impl MigrationTarget {
    pub fn new(engine: EngineType, connection: ConnectionConfig) -> Self {
        Self {
            engine,
            connection,
            context: ConnectionContext::default(),
        }
    }

    pub fn with_context(mut self, context: ConnectionContext) -> Self {
        self.context = context;
        self
    }
}

/// A graph task bound to its unit and target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationTask {
    pub task_id: TaskId,
    pub unit: MigrationUnit,
    pub target: MigrationTarget,
}

impl MigrationTask {
    pub fn new(task_id: impl Into<TaskId>, unit: MigrationUnit, target: MigrationTarget) -> Self {
        Self {
            task_id: task_id.into(),
            unit,
            target,
        }
    }

    /// Target database this task writes, for logs
    pub fn target_key(&self) -> String {
        format!("{}/{}", self.instance_key(), self.unit.info.database)
    }

    /// Locks a task holds while it runs, in acquisition order.
    ///
    /// Tasks on the same database never overlap, and neither do tasks drawing
    /// history sequences from the same namespace of one instance.
    pub fn serialization_keys(&self) -> Vec<String> {
        let instance = self.instance_key();
        let mut keys = vec![
            format!("{instance}/database/{}", self.unit.info.database),
            format!("{instance}/namespace/{}", self.unit.info.namespace),
        ];
        keys.sort();
        keys
    }

    fn instance_key(&self) -> String {
        format!(
            "{}://{}:{}",
            self.target.engine,
            self.target.connection.host,
            self.target.connection.port_or_default(self.target.engine)
        )
    }
}

/// Dependency graph plus one migration task per graph node
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    graph: TaskGraph,
    tasks: BTreeMap<TaskId, MigrationTask>,
}

impl MigrationPlan {
    pub fn new(graph: TaskGraph) -> Self {
        Self {
            graph,
            tasks: BTreeMap::new(),
        }
    }

    /// Bind `task` to its graph node
    pub fn add_task(&mut self, task: MigrationTask) -> Result<()> {
        let Some(node) = self.graph.task(task.task_id) else {
            return Err(SchemaflowError::Validation(format!(
                "Task {} is not part of the dependency graph",
                task.task_id
            )));
        };
        if let Some(unit_id) = &node.unit_id {
            if unit_id != &task.unit.id {
                return Err(SchemaflowError::Validation(format!(
                    "Task {} expects migration unit '{unit_id}' but got '{}'",
                    task.task_id, task.unit.id
                )));
            }
        }
        if self.tasks.contains_key(&task.task_id) {
            return Err(SchemaflowError::Validation(format!(
                "Task {} already has a migration",
                task.task_id
            )));
        }
        self.tasks.insert(task.task_id, task);
        Ok(())
    }

    pub fn with_task(mut self, task: MigrationTask) -> Result<Self> {
        self.add_task(task)?;
        Ok(self)
    }

    /// Check completeness and return the execution order
    pub fn validate(&self) -> Result<Vec<TaskId>> {
        let missing: Vec<String> = self
            .graph
            .tasks()
            .filter(|t| !self.tasks.contains_key(&t.id))
            .map(|t| t.id.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(SchemaflowError::Validation(format!(
                "Tasks without a migration: {}",
                missing.join(", ")
            )));
        }
        self.graph.resolve_all()
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn task(&self, id: TaskId) -> Option<&MigrationTask> {
        self.tasks.get(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &MigrationTask> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
