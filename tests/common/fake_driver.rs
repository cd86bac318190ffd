//! In-process driver for engine tests.
//!
//! Driver constructors are plain `fn` pointers, so per-test state lives in a
//! process-wide map keyed by connection host. Give every test its own host.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use schemaflow_core::context::OperationContext;
use schemaflow_core::db::{
    ensure_engine, ConnectionConfig, ConnectionContext, DbSchema, DbUser, Driver, DriverConfig,
    DriverRegistry, EngineType, MigrationHistory, MigrationHistoryFind, MigrationInfo,
};
use schemaflow_core::error::{Result, SchemaflowError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};

use super::FAKE_ENGINE;

/// Host name whose `open` always fails
pub const UNREACHABLE_HOST: &str = "unreachable.invalid";

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMigration {
    pub namespace: String,
    pub version: String,
    pub sequence: i64,
    pub statement: String,
}

#[derive(Default)]
pub struct FakeBackend {
    applied: Mutex<Vec<AppliedMigration>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    active: Mutex<HashMap<String, usize>>,
    max_active_per_key: Mutex<HashMap<String, usize>>,
    active_total: AtomicUsize,
    max_active_total: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub setups: AtomicUsize,
}

impl FakeBackend {
    /// Make every migration whose statement equals `statement` fail
    pub fn fail_statement(&self, statement: &str) {
        self.failing.lock().insert(statement.to_string());
    }

    pub fn heal_statement(&self, statement: &str) {
        self.failing.lock().remove(statement);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn applied(&self) -> Vec<AppliedMigration> {
        self.applied.lock().clone()
    }

    pub fn applied_statements(&self) -> Vec<String> {
        self.applied.lock().iter().map(|a| a.statement.clone()).collect()
    }

    pub fn max_active_total(&self) -> usize {
        self.max_active_total.load(Ordering::SeqCst)
    }

    pub fn max_active_for(&self, database: &str) -> usize {
        self.peak(&format!("database/{database}"))
    }

    pub fn max_active_in_namespace(&self, namespace: &str) -> usize {
        self.peak(&format!("namespace/{namespace}"))
    }

    fn peak(&self, key: &str) -> usize {
        self.max_active_per_key.lock().get(key).copied().unwrap_or(0)
    }

    fn done(&self, namespace: &str, version: &str) -> Option<i64> {
        self.applied
            .lock()
            .iter()
            .find(|a| a.namespace == namespace && a.version == version)
            .map(|a| a.sequence)
    }

    fn record(&self, info: &MigrationInfo, statement: &str) -> i64 {
        let mut applied = self.applied.lock();
        let sequence = applied
            .iter()
            .filter(|a| a.namespace == info.namespace)
            .count() as i64
            + 1;
        applied.push(AppliedMigration {
            namespace: info.namespace.clone(),
            version: info.version.clone(),
            sequence,
            statement: statement.to_string(),
        });
        sequence
    }

    fn keys(info: &MigrationInfo) -> [String; 2] {
        [
            format!("database/{}", info.database),
            format!("namespace/{}", info.namespace),
        ]
    }

    fn enter(&self, info: &MigrationInfo) {
        let total = self.active_total.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_total.fetch_max(total, Ordering::SeqCst);

        let mut active = self.active.lock();
        let mut max = self.max_active_per_key.lock();
        for key in Self::keys(info) {
            let count = active.entry(key.clone()).or_default();
            *count += 1;
            let peak = max.entry(key).or_default();
            *peak = (*peak).max(*count);
        }
    }

    fn leave(&self, info: &MigrationInfo) {
        self.active_total.fetch_sub(1, Ordering::SeqCst);
        let mut active = self.active.lock();
        for key in Self::keys(info) {
            if let Some(count) = active.get_mut(&key) {
                *count -= 1;
            }
        }
    }
}

fn backends() -> &'static DashMap<String, Arc<FakeBackend>> {
    static BACKENDS: OnceLock<DashMap<String, Arc<FakeBackend>>> = OnceLock::new();
    BACKENDS.get_or_init(DashMap::new)
}

/// Shared state behind every fake driver opened against `host`
pub fn backend(host: &str) -> Arc<FakeBackend> {
    backends().entry(host.to_string()).or_default().clone()
}

pub fn new_fake_driver(_config: DriverConfig) -> Box<dyn Driver> {
    Box::new(FakeDriver { backend: None })
}

/// Registry with only the fake driver, under [`FAKE_ENGINE`]
pub fn fake_registry() -> Arc<DriverRegistry> {
    let registry = DriverRegistry::builder()
        .register(FAKE_ENGINE, new_fake_driver)
        .expect("first registration")
        .build();
    Arc::new(registry)
}

pub struct FakeDriver {
    backend: Option<Arc<FakeBackend>>,
}

impl FakeDriver {
    fn backend(&self) -> Result<&Arc<FakeBackend>> {
        self.backend
            .as_ref()
            .ok_or_else(|| SchemaflowError::not_open(FAKE_ENGINE))
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn engine(&self) -> EngineType {
        FAKE_ENGINE
    }

    fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    async fn open(
        &mut self,
        ctx: &OperationContext,
        engine: EngineType,
        config: &ConnectionConfig,
        _connection: &ConnectionContext,
    ) -> Result<()> {
        ensure_engine(FAKE_ENGINE, engine)?;
        ctx.check("open")?;
        if config.host == UNREACHABLE_HOST {
            return Err(SchemaflowError::connection(
                FAKE_ENGINE,
                &config.host,
                "connection refused",
            ));
        }
        let backend = backend(&config.host);
        backend.opens.fetch_add(1, Ordering::SeqCst);
        self.backend = Some(backend);
        Ok(())
    }

    async fn close(&mut self, _ctx: &OperationContext) -> Result<()> {
        if let Some(backend) = self.backend.take() {
            backend.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn ping(&self, _ctx: &OperationContext) -> Result<()> {
        self.backend().map(|_| ())
    }

    async fn get_version(&self, _ctx: &OperationContext) -> Result<String> {
        self.backend()?;
        Ok("fake-1.0".to_string())
    }

    async fn sync_schema(&self, _ctx: &OperationContext) -> Result<(Vec<DbUser>, Vec<DbSchema>)> {
        self.backend()?;
        Ok((Vec::new(), Vec::new()))
    }

    async fn execute(&self, _ctx: &OperationContext, _statement: &str) -> Result<()> {
        self.backend().map(|_| ())
    }

    async fn needs_setup_migration(&self, _ctx: &OperationContext) -> Result<bool> {
        Ok(self.backend()?.setups.load(Ordering::SeqCst) == 0)
    }

    async fn setup_migration_if_needed(&self, _ctx: &OperationContext) -> Result<()> {
        self.backend()?.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute_migration(
        &self,
        ctx: &OperationContext,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<(i64, String)> {
        let backend = self.backend()?;
        if let Some(sequence) = backend.done(&info.namespace, &info.version) {
            return Ok((sequence, format!("-- schema after {}", info.version)));
        }

        backend.enter(info);
        let delay = *backend.delay.lock();
        let waited = ctx
            .run("execute_migration", async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await;
        backend.leave(info);
        waited?;

        if backend.failing.lock().contains(statement) {
            return Err(SchemaflowError::query(statement, "injected failure"));
        }
        let sequence = backend.record(info, statement);
        Ok((sequence, format!("-- schema after {}", info.version)))
    }

    async fn find_migration_history_list(
        &self,
        _ctx: &OperationContext,
        _find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>> {
        self.backend()?;
        Ok(Vec::new())
    }

    async fn dump(
        &self,
        _ctx: &OperationContext,
        _database: &str,
        _out: &mut (dyn AsyncWrite + Unpin + Send),
        _schema_only: bool,
    ) -> Result<()> {
        self.backend().map(|_| ())
    }

    async fn restore(
        &self,
        _ctx: &OperationContext,
        _input: &mut (dyn AsyncBufRead + Unpin + Send),
    ) -> Result<()> {
        self.backend().map(|_| ())
    }
}
