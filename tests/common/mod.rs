#![allow(dead_code)]

pub mod fake_driver;
pub mod strategies;

pub use fake_driver::*;
pub use strategies::*;

use schemaflow_core::dag::{Task, TaskGraph, TaskId};
use schemaflow_core::db::{ConnectionConfig, EngineType, MigrationInfo};
use schemaflow_core::execution::{MigrationPlan, MigrationTarget, MigrationTask, MigrationUnit};

/// Plan over fake-driver tasks `(id, database, statement)` on `host`
pub fn build_plan(host: &str, tasks: &[(i64, &str, &str)], edges: &[(i64, i64)]) -> MigrationPlan {
    plan_with_namespace(host, None, tasks, edges)
}

/// Like [`build_plan`], with every task recording history under `namespace`
pub fn build_plan_in_namespace(
    host: &str,
    namespace: &str,
    tasks: &[(i64, &str, &str)],
    edges: &[(i64, i64)],
) -> MigrationPlan {
    plan_with_namespace(host, Some(namespace), tasks, edges)
}

fn plan_with_namespace(
    host: &str,
    namespace: Option<&str>,
    tasks: &[(i64, &str, &str)],
    edges: &[(i64, i64)],
) -> MigrationPlan {
    let graph = TaskGraph::load(
        tasks.iter().map(|(id, _, _)| Task::new(*id, format!("task {id}"))),
        edges.iter().map(|(from, to)| (TaskId(*from), TaskId(*to))),
    )
    .expect("valid graph");

    let mut plan = MigrationPlan::new(graph);
    for (id, database, statement) in tasks {
        let mut info = MigrationInfo::new(*database, format!("v{id:04}")).with_creator("ci");
        if let Some(namespace) = namespace {
            info = info.with_namespace(namespace);
        }
        let unit = MigrationUnit::new(format!("unit-{id}"), info, *statement);
        let target = MigrationTarget::new(FAKE_ENGINE, ConnectionConfig::new(host));
        plan.add_task(MigrationTask::new(*id, unit, target))
            .expect("task binds to graph");
    }
    plan
}

/// Engine type the fake driver is registered under
pub const FAKE_ENGINE: EngineType = EngineType::Postgres;
