//! Live PostgreSQL checks. Each test gets a fresh database from `sqlx::test`;
//! run with `DATABASE_URL` set and `--ignored`.

use reqwest::Url;
use schemaflow_core::context::OperationContext;
use schemaflow_core::dag::{
    InMemoryTaskDagStore, PgTaskDagStore, Task, TaskDagCreate, TaskDagStore, TaskGraph, TaskId,
};
use schemaflow_core::db::{
    register_builtin_drivers, ConnectionConfig, ConnectionContext, Driver, DriverConfig,
    DriverRegistry, EngineType, MigrationHistoryFind, MigrationInfo, MigrationStatus,
};
use schemaflow_core::error::ErrorKind;
use sqlx::PgPool;

async fn open_driver(pool: &PgPool) -> Box<dyn Driver> {
    let database = current_database(pool).await;
    let url = Url::parse(&std::env::var("DATABASE_URL").unwrap()).unwrap();
    let mut config = ConnectionConfig::new(url.host_str().unwrap_or("localhost"))
        .with_credentials(url.username(), url.password().unwrap_or_default())
        .with_database(database);
    if let Some(port) = url.port() {
        config = config.with_port(port);
    }

    register_builtin_drivers(DriverRegistry::builder())
        .unwrap()
        .build()
        .open(
            &OperationContext::new(),
            EngineType::Postgres,
            DriverConfig::default(),
            &config,
            &ConnectionContext::new("test", "local"),
        )
        .await
        .unwrap()
}

async fn current_database(pool: &PgPool) -> String {
    sqlx::query_scalar("SELECT current_database()")
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn dump_to_string(driver: &dyn Driver, database: &str) -> String {
    let mut out = Vec::new();
    driver
        .dump(&OperationContext::new(), database, &mut out, false)
        .await
        .unwrap();
    String::from_utf8(out).unwrap()
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_migration_is_applied_exactly_once(pool: PgPool) {
    let database = current_database(&pool).await;
    let driver = open_driver(&pool).await;
    let ctx = OperationContext::new();
    driver.setup_migration_if_needed(&ctx).await.unwrap();
    assert!(!driver.needs_setup_migration(&ctx).await.unwrap());

    let info = MigrationInfo::new(&database, "0001").with_creator("ci");
    let statement = "CREATE TABLE accounts (id BIGINT PRIMARY KEY, email TEXT NOT NULL);";
    let (first, schema) = driver.execute_migration(&ctx, &info, statement).await.unwrap();
    let (second, _) = driver.execute_migration(&ctx, &info, statement).await.unwrap();

    assert_eq!(first, 1);
    assert_eq!(second, first);
    assert!(schema.contains("accounts"));

    let history = driver
        .find_migration_history_list(&ctx, &MigrationHistoryFind::database(&database))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MigrationStatus::Done);
    assert_eq!(history[0].creator, "ci");
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_failed_migration_rolls_back_and_is_recorded(pool: PgPool) {
    let database = current_database(&pool).await;
    let driver = open_driver(&pool).await;
    let ctx = OperationContext::new();

    let info = MigrationInfo::new(&database, "0001");
    let statement = "CREATE TABLE half_done (id INT); SELECT * FROM no_such_table;";
    let err = driver.execute_migration(&ctx, &info, statement).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);

    let exists: bool = sqlx::query_scalar("SELECT to_regclass('public.half_done') IS NOT NULL")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(!exists);

    let history = driver
        .find_migration_history_list(&ctx, &MigrationHistoryFind::database(&database).with_version("0001"))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MigrationStatus::Failed);
    assert!(history[0].payload.to_string().contains("no_such_table"));
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_dump_restore_round_trip(pool: PgPool) {
    let database = current_database(&pool).await;
    let driver = open_driver(&pool).await;
    let ctx = OperationContext::new();

    driver
        .execute(
            &ctx,
            "CREATE SCHEMA shop;
             CREATE TABLE shop.customers (id SERIAL PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE shop.orders (
                 id SERIAL PRIMARY KEY,
                 customer_id INT NOT NULL REFERENCES shop.customers (id),
                 note TEXT
             );
             CREATE VIEW shop.order_names AS
                 SELECT o.id, c.name FROM shop.orders o JOIN shop.customers c ON c.id = o.customer_id;
             INSERT INTO shop.customers (name) VALUES ('ada'), ('o''brien');
             INSERT INTO shop.orders (customer_id, note) VALUES (1, NULL), (2, 'tab\there');",
        )
        .await
        .unwrap();

    let before = dump_to_string(driver.as_ref(), &database).await;
    assert!(before.contains("CREATE TABLE"));
    assert!(before.contains("o''brien"));

    driver.execute(&ctx, "DROP SCHEMA shop CASCADE;").await.unwrap();
    let mut input = before.as_bytes();
    driver.restore(&ctx, &mut input).await.unwrap();

    let after = dump_to_string(driver.as_ref(), &database).await;
    assert_eq!(before, after);

    let names: Vec<String> = sqlx::query_scalar("SELECT name FROM shop.order_names ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(names, vec!["ada".to_string(), "o'brien".to_string()]);
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_sync_schema_hides_internal_database(pool: PgPool) {
    let driver = open_driver(&pool).await;
    let ctx = OperationContext::new();
    driver.setup_migration_if_needed(&ctx).await.unwrap();

    let (_, schemas) = driver.sync_schema(&ctx).await.unwrap();
    let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
    assert!(!names.contains(&"bytebase"));
    assert!(!names.contains(&"template0"));
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_task_dag_store_matches_in_memory(pool: PgPool) {
    let store = PgTaskDagStore::new(pool);
    store.ensure_schema().await.unwrap();
    let reference = InMemoryTaskDagStore::new();

    for (from, to) in [(1, 3), (2, 3), (3, 4)] {
        let persisted = store.create_task_dag(&TaskDagCreate::new(from, to)).await.unwrap();
        reference.create_task_dag(&TaskDagCreate::new(from, to)).await.unwrap();
        assert_eq!(persisted.to_task_id, TaskId(to));
    }

    let err = store.create_task_dag(&TaskDagCreate::new(5, 5)).await.unwrap_err();
    assert_ne!(err.kind(), ErrorKind::Internal);

    assert_eq!(store.get_task_dag_by_to_task_id(TaskId(4)).await.unwrap().from_task_id, TaskId(3));
    let several = store.get_task_dag_by_to_task_id(TaskId(3)).await.unwrap_err();
    assert_eq!(several.kind(), ErrorKind::Consistency);

    let tasks: Vec<Task> = (1..=4).map(|id| Task::new(id, "t")).collect();
    let from_pg = TaskGraph::load_from_store(&store, tasks.clone()).await.unwrap();
    let from_memory = TaskGraph::load_from_store(&reference, tasks).await.unwrap();
    assert_eq!(from_pg.resolve_all().unwrap(), from_memory.resolve_all().unwrap());
}
