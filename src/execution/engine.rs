//! # Migration Engine
//!
//! Runs a [`MigrationPlan`] against live drivers.
//!
//! ## Scheduling
//!
//! Ready tasks (pending, every prerequisite succeeded or skipped) are launched
//! in plan order onto a `JoinSet`, bounded by a semaphore of
//! `max_concurrent_tasks` permits. Each task opens its own driver through the
//! registry, runs `setup_migration_if_needed` and one `execute_migration`,
//! then closes the driver. Tasks writing the same target database, or drawing
//! history sequences from the same namespace, are serialized by per-key locks
//! taken in a fixed order.
//!
//! A failure never triggers a retry. Dependents of a failed task stay pending
//! and are reported as blocked. State survives across [`MigrationEngine::run`]
//! calls, so an operator can [`retry`](MigrationEngine::retry) or
//! [`skip`](MigrationEngine::skip) and run the plan again; succeeded tasks are
//! never re-executed.

use super::events::MigrationEvent;
use super::plan::{MigrationPlan, MigrationTask};
use super::state_machine::{MigrationStateMachine, StateTransition};
use super::states::MigrationTaskState;
use crate::config::{ExecutionConfig, SchemaflowConfig};
use crate::constants::operations;
use crate::context::OperationContext;
use crate::dag::TaskId;
use crate::db::{DriverConfig, DriverRegistry};
use crate::error::{Result, SchemaflowError};
use crate::logging::{log_error, log_migration_operation};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Final disposition of one task in a run
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Applied (now or in an earlier run) under this history sequence
    Succeeded { sequence: i64 },
    Failed { error: SchemaflowError },
    /// Not run because the upstream task `by` failed with `error`
    Blocked { by: TaskId, error: SchemaflowError },
    Skipped,
    /// Not launched because the run was cancelled
    NotStarted,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Skipped)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub outcomes: BTreeMap<TaskId, TaskOutcome>,
    /// Tasks launched by this run, in launch order
    pub launched: Vec<TaskId>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineReport {
    /// Every task succeeded or was skipped
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(TaskOutcome::is_success)
    }

    pub fn outcome(&self, id: TaskId) -> Option<&TaskOutcome> {
        self.outcomes.get(&id)
    }

    pub fn failed(&self) -> Vec<TaskId> {
        self.matching(|o| matches!(o, TaskOutcome::Failed { .. }))
    }

    pub fn blocked(&self) -> Vec<TaskId> {
        self.matching(|o| matches!(o, TaskOutcome::Blocked { .. }))
    }

    pub fn succeeded(&self) -> Vec<TaskId> {
        self.matching(|o| matches!(o, TaskOutcome::Succeeded { .. }))
    }

    fn matching(&self, predicate: impl Fn(&TaskOutcome) -> bool) -> Vec<TaskId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| predicate(outcome))
            .map(|(id, _)| *id)
            .collect()
    }
}

struct TaskEntry {
    machine: MigrationStateMachine,
    error: Option<SchemaflowError>,
}

type TaskResult = (TaskId, Result<(i64, String)>);

/// Tasks moved to `Running` by one `run` call whose result is not recorded yet
struct InFlight<'a> {
    states: &'a DashMap<TaskId, TaskEntry>,
    ids: BTreeSet<TaskId>,
}

impl<'a> InFlight<'a> {
    fn new(states: &'a DashMap<TaskId, TaskEntry>) -> Self {
        Self {
            states,
            ids: BTreeSet::new(),
        }
    }

    fn launch(&mut self, id: TaskId) {
        self.ids.insert(id);
    }

    fn finish(&mut self, id: TaskId) {
        self.ids.remove(&id);
    }

    /// Move every unrecorded task from `Running` to `Failed`
    fn fail_remaining(&mut self, reason: &str) {
        for id in std::mem::take(&mut self.ids) {
            let Some(mut entry) = self.states.get_mut(&id) else {
                continue;
            };
            if entry.machine.current_state() != MigrationTaskState::Running {
                continue;
            }
            let error = SchemaflowError::cancelled(operations::RUN_TASK, reason);
            match entry
                .machine
                .transition(MigrationEvent::fail_with_error(error.to_string()), &[])
            {
                Ok(_) => {
                    warn!(task_id = %id, reason, "In-flight task marked failed");
                    entry.error = Some(error);
                }
                Err(e) => warn!(task_id = %id, error = %e, "Could not release in-flight task"),
            }
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.ids.is_empty() {
            self.fail_remaining("run was dropped while the task was in flight");
        }
    }
}

pub struct MigrationEngine {
    registry: Arc<DriverRegistry>,
    driver_config: DriverConfig,
    config: ExecutionConfig,
    states: DashMap<TaskId, TaskEntry>,
    target_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MigrationEngine {
    pub fn new(
        registry: Arc<DriverRegistry>,
        driver_config: DriverConfig,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            registry,
            driver_config,
            config,
            states: DashMap::new(),
            target_locks: DashMap::new(),
        }
    }

    pub fn from_config(registry: Arc<DriverRegistry>, config: &SchemaflowConfig) -> Self {
        Self::new(registry, config.driver_config(), config.execution.clone())
    }

    pub fn state(&self, id: TaskId) -> Option<MigrationTaskState> {
        self.states.get(&id).map(|e| e.machine.current_state())
    }

    pub fn transitions(&self, id: TaskId) -> Vec<StateTransition> {
        self.states
            .get(&id)
            .map(|e| e.machine.transitions().to_vec())
            .unwrap_or_default()
    }

    /// Operator decision: run a failed task again on the next `run`
    pub fn retry(&self, id: TaskId) -> Result<()> {
        self.apply(id, MigrationEvent::Retry, &[])?;
        if let Some(mut entry) = self.states.get_mut(&id) {
            entry.error = None;
        }
        info!(task_id = %id, "Task marked for retry");
        Ok(())
    }

    /// Operator decision: treat a pending or failed task as done without running it
    pub fn skip(&self, id: TaskId) -> Result<()> {
        self.apply(id, MigrationEvent::Skip, &[])?;
        info!(task_id = %id, "Task skipped");
        Ok(())
    }

    fn apply(
        &self,
        id: TaskId,
        event: MigrationEvent,
        prerequisites: &[(TaskId, MigrationTaskState)],
    ) -> Result<MigrationTaskState> {
        let mut entry = self
            .states
            .get_mut(&id)
            .ok_or_else(|| SchemaflowError::Validation(format!("Unknown task {id}")))?;
        entry.machine.transition(event, prerequisites)
    }

    fn prerequisite_states(
        &self,
        plan: &MigrationPlan,
        id: TaskId,
    ) -> Result<Vec<(TaskId, MigrationTaskState)>> {
        Ok(plan
            .graph()
            .prerequisites_of(id)?
            .into_iter()
            .map(|p| (p, self.state(p).unwrap_or_default()))
            .collect())
    }

    fn target_lock(&self, key: String) -> Arc<Mutex<()>> {
        self.target_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run every ready task of `plan` until nothing more can start.
    ///
    /// Dropping the returned future aborts the tasks still in flight and marks
    /// them failed with a cancellation error, so they can be retried or skipped.
    #[instrument(skip_all, fields(tasks = plan.len()))]
    pub async fn run(&self, plan: &MigrationPlan, ctx: &OperationContext) -> Result<PipelineReport> {
        let order = plan.validate()?;
        let started_at = Utc::now();
        for &id in &order {
            self.states.entry(id).or_insert_with(|| TaskEntry {
                machine: MigrationStateMachine::new(id),
                error: None,
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1)));
        let mut in_flight = InFlight::new(&self.states);
        let mut running: JoinSet<TaskResult> = JoinSet::new();
        let mut launched = Vec::new();
        let mut halted: Option<SchemaflowError> = None;

        loop {
            if halted.is_none() && !ctx.is_cancelled() {
                let launch = self.launch_ready(
                    plan,
                    &order,
                    &semaphore,
                    &mut running,
                    &mut in_flight,
                    &mut launched,
                    ctx,
                );
                // stop launching but let running tasks report back
                if let Err(error) = launch {
                    halted = Some(error);
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok((id, result)) => match self.record(plan, id, result) {
                    Ok(()) => in_flight.finish(id),
                    Err(error) => {
                        halted.get_or_insert(error);
                    }
                },
                Err(join_error) => {
                    log_error("engine", "join", &join_error.to_string(), None);
                }
            }
        }

        in_flight.fail_remaining("task ended without reporting a result");
        if let Some(error) = halted {
            return Err(error);
        }

        let report = self.report(plan, &order, launched, ctx.is_cancelled(), started_at)?;
        info!(
            succeeded = report.succeeded().len(),
            failed = report.failed().len(),
            blocked = report.blocked().len(),
            cancelled = report.cancelled,
            "Migration run finished"
        );
        Ok(report)
    }

    /// Start every pending task whose prerequisites are satisfied, up to the
    /// free permits
    #[allow(clippy::too_many_arguments)]
    fn launch_ready(
        &self,
        plan: &MigrationPlan,
        order: &[TaskId],
        semaphore: &Arc<Semaphore>,
        running: &mut JoinSet<TaskResult>,
        in_flight: &mut InFlight<'_>,
        launched: &mut Vec<TaskId>,
        ctx: &OperationContext,
    ) -> Result<()> {
        for &id in order {
            if self.state(id) != Some(MigrationTaskState::Pending) {
                continue;
            }
            let prerequisites = self.prerequisite_states(plan, id)?;
            if !prerequisites.iter().all(|(_, s)| s.satisfies_dependencies()) {
                continue;
            }
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                break;
            };
            let Some(task) = plan.task(id) else {
                continue;
            };
            self.apply(id, MigrationEvent::Start, &prerequisites)?;
            in_flight.launch(id);
            launched.push(id);
            debug!(task_id = %id, target = %task.target_key(), "Launching migration task");
            self.spawn(running, task.clone(), permit, ctx);
        }
        Ok(())
    }

    fn spawn(
        &self,
        running: &mut JoinSet<TaskResult>,
        task: MigrationTask,
        permit: OwnedSemaphorePermit,
        ctx: &OperationContext,
    ) {
        let registry = self.registry.clone();
        let driver_config = self.driver_config.clone();
        let locks = task
            .serialization_keys()
            .into_iter()
            .map(|key| self.target_lock(key))
            .collect();
        let task_ctx = match self.config.task_timeout() {
            Some(timeout) => ctx.child().with_timeout(timeout),
            None => ctx.child(),
        };

        running.spawn(async move {
            let id = task.task_id;
            let work = execute_task(&registry, driver_config, &task, locks, &task_ctx);
            let result = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    Err(SchemaflowError::Internal(format!("Task {id} panicked: {message}")))
                }
            };
            drop(permit);
            (id, result)
        });
    }

    fn record(&self, plan: &MigrationPlan, id: TaskId, result: Result<(i64, String)>) -> Result<()> {
        let task = plan.task(id);
        let database = task.map(|t| t.unit.info.database.as_str());
        let version = task.map(|t| t.unit.info.version.as_str());
        match result {
            Ok((sequence, _schema)) => {
                self.apply(id, MigrationEvent::Succeed(sequence), &[])?;
                log_migration_operation(
                    operations::RUN_TASK,
                    Some(id.0),
                    database,
                    version,
                    "succeeded",
                    Some(&format!("sequence {sequence}")),
                );
            }
            Err(error) => {
                let message = error.to_string();
                self.apply(id, MigrationEvent::fail_with_error(&message), &[])?;
                if let Some(mut entry) = self.states.get_mut(&id) {
                    entry.error = Some(error);
                }
                warn!(task_id = %id, error = %message, "Migration task failed");
                log_migration_operation(
                    operations::RUN_TASK,
                    Some(id.0),
                    database,
                    version,
                    "failed",
                    Some(&message),
                );
            }
        }
        Ok(())
    }

    fn report(
        &self,
        plan: &MigrationPlan,
        order: &[TaskId],
        launched: Vec<TaskId>,
        cancelled: bool,
        started_at: DateTime<Utc>,
    ) -> Result<PipelineReport> {
        let mut outcomes = BTreeMap::new();
        let mut failures = Vec::new();
        for &id in order {
            let entry = self
                .states
                .get(&id)
                .ok_or_else(|| SchemaflowError::Internal(format!("Task {id} has no state")))?;
            let outcome = match entry.machine.current_state() {
                MigrationTaskState::Succeeded => TaskOutcome::Succeeded {
                    sequence: entry.machine.sequence().unwrap_or_default(),
                },
                MigrationTaskState::Failed => {
                    let error = entry.error.clone().unwrap_or_else(|| {
                        SchemaflowError::Internal(
                            entry.machine.last_error().unwrap_or("unknown failure").to_string(),
                        )
                    });
                    failures.push((id, error.clone()));
                    TaskOutcome::Failed { error }
                }
                MigrationTaskState::Skipped => TaskOutcome::Skipped,
                MigrationTaskState::Pending | MigrationTaskState::Running => TaskOutcome::NotStarted,
            };
            outcomes.insert(id, outcome);
        }

        // upstream failures first, so `by` names the earliest failing ancestor
        for (failed, error) in failures {
            for dependent in plan.graph().transitive_dependents_of(failed)? {
                if let Some(outcome) = outcomes.get_mut(&dependent) {
                    if *outcome == TaskOutcome::NotStarted {
                        *outcome = TaskOutcome::Blocked {
                            by: failed,
                            error: error.clone(),
                        };
                    }
                }
            }
        }

        Ok(PipelineReport {
            outcomes,
            launched,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// One task: open, set up history, apply, close
async fn execute_task(
    registry: &DriverRegistry,
    driver_config: DriverConfig,
    task: &MigrationTask,
    locks: Vec<Arc<Mutex<()>>>,
    ctx: &OperationContext,
) -> Result<(i64, String)> {
    let _held = ctx
        .run("acquire_target", async {
            let mut guards = Vec::with_capacity(locks.len());
            for lock in locks {
                guards.push(lock.lock_owned().await);
            }
            Ok(guards)
        })
        .await?;

    let mut driver = registry
        .open(
            ctx,
            task.target.engine,
            driver_config,
            &task.target.connection,
            &task.target.context,
        )
        .await?;

    let result = async {
        driver.setup_migration_if_needed(ctx).await?;
        driver
            .execute_migration(ctx, &task.unit.info, &task.unit.statement)
            .await
    }
    .await;

    if let Err(error) = driver.close(&OperationContext::new()).await {
        warn!(task_id = %task.task_id, error = %error, "Failed to close driver");
    }
    result
}
