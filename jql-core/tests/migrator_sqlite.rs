#[cfg(feature = "sqlite")]
mod common;

#[cfg(feature = "sqlite")]
use std::sync::Arc;

#[cfg(feature = "sqlite")]
use jql_core::test_utils::{memory_pool, registry_from_json, run_script};
#[cfg(feature = "sqlite")]
use jql_core::{MigrationAction, Migrator};
#[cfg(feature = "sqlite")]
use sqlx::SqlitePool;

#[cfg(feature = "sqlite")]
async fn table_names(pool: &SqlitePool) -> Vec<String> {
    sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .expect("tables")
}

#[cfg(feature = "sqlite")]
async fn column_names(pool: &SqlitePool, table: &str) -> Vec<String> {
    sqlx::query_scalar(&format!("SELECT name FROM pragma_table_info('{}')", table))
        .fetch_all(pool)
        .await
        .expect("columns")
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_auto_sync_creates_every_declared_table() {
    let pool = memory_pool().await.expect("pool");
    let registry = Arc::new(registry_from_json(common::MODELS));
    let migrator = Migrator::new(pool.clone(), registry);

    let applied = migrator.auto_sync().await.expect("sync");
    let creates = applied
        .changes
        .iter()
        .filter(|c| c.action == MigrationAction::CreateTable)
        .count();
    assert_eq!(creates, 5);
    assert!(applied
        .changes
        .iter()
        .any(|c| c.action == MigrationAction::AddIndex && c.table == "post_tags"));
    assert!(!applied.has_destructive());

    assert_eq!(
        table_names(&pool).await,
        vec!["post_tags", "posts", "profiles", "tags", "users"]
    );

    let again = migrator.plan().await.expect("plan");
    assert!(again.is_empty(), "{}", again.summary());
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_new_fields_become_add_column() {
    let pool = memory_pool().await.expect("pool");
    run_script(
        &pool,
        &["CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT NOT NULL)"],
    )
    .await
    .expect("seed");
    let registry = Arc::new(registry_from_json(
        r#"[{"table": "tags", "fields": [
            {"name": "id", "type": "big_int", "primary_key": true, "auto_increment": true},
            {"name": "label", "type": "string"},
            {"name": "color", "type": "string", "nullable": true}
        ]}]"#,
    ));
    let migrator = Migrator::new(pool.clone(), registry);

    let plan = migrator.plan().await.expect("plan");
    assert_eq!(plan.changes.len(), 1);
    assert_eq!(plan.changes[0].action, MigrationAction::AddColumn);
    assert_eq!(plan.changes[0].column.as_deref(), Some("color"));

    migrator.execute(&plan).await.expect("execute");
    assert_eq!(column_names(&pool, "tags").await, vec!["id", "label", "color"]);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_aggressive_sync_backs_up_before_dropping() {
    let pool = memory_pool().await.expect("pool");
    run_script(
        &pool,
        &[
            "CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT NOT NULL, legacy TEXT)",
            "INSERT INTO tags (label, legacy) VALUES ('a', 'old')",
            "CREATE TABLE scratch (id INTEGER PRIMARY KEY, note TEXT)",
            "INSERT INTO scratch (note) VALUES ('keep me')",
        ],
    )
    .await
    .expect("seed");
    let registry = Arc::new(registry_from_json(
        r#"[{"table": "tags", "fields": [
            {"name": "id", "type": "big_int", "primary_key": true, "auto_increment": true},
            {"name": "label", "type": "string"}
        ]}]"#,
    ));

    let cautious = Migrator::new(pool.clone(), registry.clone());
    assert!(cautious.plan().await.expect("plan").is_empty());

    let migrator = Migrator::new(pool.clone(), registry).aggressive(true);
    let plan = migrator.auto_sync().await.expect("sync");
    assert!(plan.has_destructive());
    let actions: Vec<_> = plan.changes.iter().map(|c| c.action).collect();
    assert_eq!(
        actions,
        vec![MigrationAction::DropColumn, MigrationAction::DropTable]
    );

    assert_eq!(column_names(&pool, "tags").await, vec!["id", "label"]);
    let tables = table_names(&pool).await;
    assert!(!tables.contains(&"scratch".to_owned()));

    let scratch_backup = plan.changes[1].backup_table.clone().expect("backup name");
    assert!(tables.contains(&scratch_backup));
    let note: String = sqlx::query_scalar(&format!("SELECT note FROM \"{}\"", scratch_backup))
        .fetch_one(&pool)
        .await
        .expect("backup rows");
    assert_eq!(note, "keep me");

    let column_backup = plan.changes[0].backup_table.clone().expect("backup name");
    assert_eq!(column_names(&pool, &column_backup).await, vec!["id", "legacy"]);

    // Backups are never treated as undeclared tables.
    assert!(migrator.plan().await.expect("plan").is_empty());
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_no_backup_drops_without_copies() {
    let pool = memory_pool().await.expect("pool");
    run_script(&pool, &["CREATE TABLE scratch (id INTEGER PRIMARY KEY)"])
        .await
        .expect("seed");
    let registry = Arc::new(registry_from_json("[]"));
    let migrator = Migrator::new(pool.clone(), registry)
        .aggressive(true)
        .auto_backup(false);

    let plan = migrator.auto_sync().await.expect("sync");
    assert_eq!(plan.changes.len(), 1);
    assert!(table_names(&pool).await.is_empty());
}
