//! End-to-end runs against the in-memory source and target.

mod common;

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{column, config, orders, table, users, MemorySource, MemoryTarget};
use mysql_pg_migrate::core::SqlValue;
use mysql_pg_migrate::pool::{MemoryPoolStore, PoolStore};
use mysql_pg_migrate::state::{MemoryStateBackend, StateBackend};
use mysql_pg_migrate::{
    dry_run, status, Config, MigrateError, MigrationContext, Stage, Stores, TableOutcome,
    TableStatus,
};

fn context(
    config: Config,
    source: Arc<MemorySource>,
    target: Arc<MemoryTarget>,
    stores: Stores,
) -> MigrationContext {
    MigrationContext::new(config, source, target, stores).unwrap()
}

/// Stores that outlive a context, as a restarted process would see them.
struct SharedStores {
    state: Arc<MemoryStateBackend>,
    pool: Arc<MemoryPoolStore>,
}

impl SharedStores {
    fn new() -> Self {
        Self {
            state: Arc::new(MemoryStateBackend::new()),
            pool: Arc::new(MemoryPoolStore::new()),
        }
    }

    fn stores(&self) -> Stores {
        let state: Arc<dyn StateBackend> = self.state.clone();
        let pool: Arc<dyn PoolStore> = self.pool.clone();
        Stores { state, pool }
    }
}

#[tokio::test]
async fn test_run_loads_table_in_chunks() {
    let source = Arc::new(MemorySource::new().with_table(users(250)));
    let target = Arc::new(MemoryTarget::new());
    let ctx = context(config(""), source, target.clone(), Stores::memory());

    let result = ctx.run().await.unwrap();

    assert_eq!(result.status, "completed");
    assert!(!result.resumed);
    assert_eq!(result.tables_success, 1);
    assert_eq!(result.rows_transferred, 250);
    assert_eq!(target.ids("users"), (1..=250).collect::<Vec<_>>());

    let progress = ctx.pool().progress("users").await;
    assert_eq!(progress.total, 3);
    assert_eq!(progress.done, 3);
    assert_eq!(target.writes("users"), 3);

    let report = &result.tables[0];
    assert_eq!(report.status, TableStatus::ConstraintsDone);
    assert_eq!(report.rows_transferred, 250);
    assert!(ctx.state().is_done("users", Stage::ConstraintsApplied).await);
    assert!(!target.executed_matching("PRIMARY KEY").is_empty());
}

#[tokio::test]
async fn test_rows_are_cast_to_target_types() {
    let source = Arc::new(MemorySource::new().with_table(users(10)));
    let target = Arc::new(MemoryTarget::new());
    let ctx = context(config(""), source, target.clone(), Stores::memory());
    ctx.run().await.unwrap();

    let rows = target.rows("users");
    assert_eq!(rows.len(), 10);
    // int -> integer
    assert!(rows.iter().all(|r| matches!(r[0], SqlValue::I32(_))));
    assert!(matches!(&rows[0][1], SqlValue::Text(_)));
}

#[tokio::test]
async fn test_unmapped_type_fails_only_its_table() {
    let mut map = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        map,
        "types:\n  - source: \"int\"\n    target: \"integer\"\n  - source: \"varchar\"\n    target: \"character varying({{size}})\""
    )
    .unwrap();
    let extra = format!(
        "  type_map_file: {}\n  type_map_mode: replace",
        map.path().display()
    );

    let tags = table(
        "tags",
        vec![
            column("id", "int", 1, false),
            column("kind", "enum('a','b')", 2, true),
        ],
    );
    let source = Arc::new(
        MemorySource::new()
            .with_table(users(20))
            .with_table((tags, vec![])),
    );
    let target = Arc::new(MemoryTarget::new());
    let ctx = context(config(&extra), source, target.clone(), Stores::memory());

    let result = ctx.run().await.unwrap();

    assert_eq!(result.status, "failed");
    assert_eq!(result.failed_tables(), vec!["tags"]);
    let tags = result.tables.iter().find(|t| t.table == "tags").unwrap();
    assert_eq!(tags.status, TableStatus::Failed(Stage::SchemaCreated));
    assert!(tags.error.as_deref().unwrap().contains("Unmapped source type"));

    let users = result.tables.iter().find(|t| t.table == "users").unwrap();
    assert_eq!(users.outcome, TableOutcome::Success);
    assert_eq!(target.ids("users").len(), 20);
}

#[tokio::test]
async fn test_foreign_keys_and_views_after_data() {
    let source = Arc::new(
        MemorySource::new()
            .with_table(users(30))
            .with_table(orders(120, 30))
            .with_view("user_ids", "select `id` AS `id` from `shop`.`users`"),
    );
    let target = Arc::new(MemoryTarget::new());
    let ctx = context(config(""), source, target.clone(), Stores::memory());

    let result = ctx.run().await.unwrap();

    assert!(result.is_success(), "{}", result.summary());
    assert_eq!(result.rows_transferred, 150);
    assert_eq!(result.views_created, 1);

    let executed = target.executed.lock().unwrap().clone();
    let fk = executed
        .iter()
        .position(|s| s.contains("FOREIGN KEY"))
        .expect("foreign key applied");
    let users_pk = executed
        .iter()
        .position(|s| s.contains("PRIMARY KEY") && s.contains("\"users\""))
        .expect("users primary key built");
    assert!(users_pk < fk);
    assert!(executed.last().unwrap().starts_with("CREATE OR REPLACE VIEW"));
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let source = Arc::new(MemorySource::new().with_table(users(250)));
    let target = Arc::new(MemoryTarget::new());
    target.transient_failures.store(2, Ordering::SeqCst);
    let ctx = context(config(""), source, target.clone(), Stores::memory());

    let result = ctx.run().await.unwrap();

    assert!(result.is_success());
    assert_eq!(target.ids("users"), (1..=250).collect::<Vec<_>>());
    assert_eq!(target.writes("users"), 5);
}

#[tokio::test]
async fn test_resume_skips_completed_work() {
    let source = Arc::new(
        MemorySource::new()
            .with_table(users(250))
            .with_table(orders(300, 250)),
    );
    let target = Arc::new(MemoryTarget::new());
    target.fail_once.lock().unwrap().insert("orders".into());
    let shared = SharedStores::new();

    let first = context(config(""), source.clone(), target.clone(), shared.stores());
    let result = first.run().await.unwrap();
    assert_eq!(result.status, "failed");
    assert_eq!(result.failed_tables(), vec!["orders"]);
    let orders_report = result.tables.iter().find(|t| t.table == "orders").unwrap();
    assert_eq!(orders_report.status, TableStatus::Failed(Stage::DataLoaded));
    let users_writes = target.writes("users");

    // a new process over the same stores
    let second = context(config(""), source, target.clone(), shared.stores());
    let result = second.resume(false).await.unwrap();

    assert!(result.is_success(), "{}", result.summary());
    assert!(result.resumed);
    assert_eq!(target.writes("users"), users_writes);
    assert_eq!(target.ids("users").len(), 250);
    assert_eq!(target.ids("orders"), (1..=300).collect::<Vec<_>>());

    let users = result.tables.iter().find(|t| t.table == "users").unwrap();
    assert_eq!(users.skipped_stages, Stage::ALL.to_vec());
    assert_eq!(users.rows_transferred, 0);
    let orders = result.tables.iter().find(|t| t.table == "orders").unwrap();
    assert_eq!(orders.skipped_stages, vec![Stage::SchemaCreated]);
    assert_eq!(orders.status, TableStatus::ConstraintsDone);
}

#[tokio::test]
async fn test_resume_refuses_changed_plan() {
    let source = Arc::new(MemorySource::new().with_table(users(50)));
    let target = Arc::new(MemoryTarget::new());
    let shared = SharedStores::new();

    context(config(""), source.clone(), target.clone(), shared.stores())
        .run()
        .await
        .unwrap();

    let changed = config("  include_tables: [\"users\"]");
    let err = context(changed.clone(), source.clone(), target.clone(), shared.stores())
        .resume(false)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::ConfigChanged));

    let result = context(changed, source, target, shared.stores())
        .resume(true)
        .await
        .unwrap();
    assert!(result.is_success());
}

#[tokio::test]
async fn test_fresh_run_replaces_earlier_load() {
    let source = Arc::new(MemorySource::new().with_table(users(120)));
    let target = Arc::new(MemoryTarget::new());
    let shared = SharedStores::new();

    for _ in 0..2 {
        let result = context(config(""), source.clone(), target.clone(), shared.stores())
            .run()
            .await
            .unwrap();
        assert!(result.is_success());
    }
    assert_eq!(target.ids("users"), (1..=120).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_cancelled_run_resumes_later() {
    let source = Arc::new(MemorySource::new().with_table(users(100)));
    let target = Arc::new(MemoryTarget::new());
    let shared = SharedStores::new();

    let ctx = context(config(""), source.clone(), target.clone(), shared.stores());
    ctx.cancel_token().cancel();
    let result = ctx.run().await.unwrap();
    assert_eq!(result.status, "cancelled");
    assert_eq!(result.tables[0].outcome, TableOutcome::Incomplete);
    assert!(target.ids("users").is_empty());

    let result = context(config(""), source, target.clone(), shared.stores())
        .resume(false)
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(target.ids("users").len(), 100);
}

#[tokio::test]
async fn test_dry_run_plans_without_writing() {
    let source = MemorySource::new()
        .with_table(users(250))
        .with_table(orders(40, 250))
        .with_view("user_ids", "select `id` AS `id` from `shop`.`users`");
    let config = config("");

    let report = dry_run(&config, &source).await.unwrap();

    assert_eq!(report.plan_hash, config.plan_hash());
    assert_eq!(report.tables.len(), 2);
    let users = report.tables.iter().find(|t| t.table == "users").unwrap();
    assert_eq!(users.chunks, 3);
    assert_eq!(users.estimated_rows, 250);
    assert_eq!(users.target, "public.users");
    assert!(users.ddl[0].starts_with("CREATE TABLE"));
    let orders = report.tables.iter().find(|t| t.table == "orders").unwrap();
    assert!(orders.deferred.iter().any(|s| s.contains("FOREIGN KEY")));
    assert_eq!(report.views.len(), 1);
    assert_eq!(source.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_validate_compares_row_counts() {
    let source = Arc::new(MemorySource::new().with_table(users(75)));
    let target = Arc::new(MemoryTarget::new());
    let ctx = context(config(""), source, target, Stores::memory());

    let before = ctx.validate().await.unwrap();
    assert_eq!(before.tables[0].target_rows, None);
    assert!(!before.all_match());

    ctx.run().await.unwrap();
    let after = ctx.validate().await.unwrap();
    assert!(after.all_match());
    assert_eq!(after.tables[0].target_rows, Some(75));
}

#[tokio::test]
async fn test_status_reads_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let config = config("");
    let source = Arc::new(
        MemorySource::new()
            .with_table(users(250))
            .with_table(orders(300, 250)),
    );
    let target = Arc::new(MemoryTarget::new());
    target.fail_once.lock().unwrap().insert("orders".into());

    let stores = Stores::file(&path, &config.plan_hash(), true).unwrap();
    context(config.clone(), source, target, stores)
        .run()
        .await
        .unwrap();

    let stores = Stores::file(&path, &config.plan_hash(), false).unwrap();
    let report = status(stores).await.unwrap();

    assert!(report.run.is_some());
    let users = report.tables.iter().find(|t| t.table == "users").unwrap();
    assert_eq!(users.status, TableStatus::ConstraintsDone);
    assert_eq!(users.progress.done, 3);
    let orders = report.tables.iter().find(|t| t.table == "orders").unwrap();
    assert_eq!(orders.status, TableStatus::Failed(Stage::DataLoaded));
    assert!(orders.error.is_some());
    assert!(report.summary().contains("failed at"));
}
