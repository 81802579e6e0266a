#![allow(dead_code)]

use std::sync::Arc;

use jql_core::schema::MemoryRegistry;
use jql_core::test_utils::{memory_pool, registry_from_json};
use jql_core::{Config, Engine, Migrator, Query, QueryResult};
use sqlx::{Sqlite, SqlitePool};

pub const MODELS: &str = r#"[
    {
        "table": "users",
        "model": "User",
        "fields": [
            {"name": "id", "type": "big_int", "primary_key": true, "auto_increment": true},
            {"name": "name", "type": "string"},
            {"name": "email", "type": "string", "unique": true},
            {"name": "age", "type": "int", "nullable": true},
            {"name": "created_at", "type": "date_time", "nullable": true},
            {"name": "updated_at", "type": "date_time", "nullable": true}
        ],
        "relations": [
            {"name": "posts", "type": "has_many", "model": "posts", "fk": "user_id"},
            {"name": "profile", "type": "has_one", "model": "profiles", "fk": "user_id"}
        ]
    },
    {
        "table": "posts",
        "fields": [
            {"name": "id", "type": "big_int", "primary_key": true, "auto_increment": true},
            {"name": "user_id", "type": "big_int"},
            {"name": "title", "type": "string"},
            {"name": "views", "type": "int", "default": "0"},
            {"name": "deleted_at", "type": "date_time", "nullable": true}
        ],
        "relations": [
            {"name": "author", "type": "belongs_to", "model": "users", "fk": "user_id"},
            {"name": "tags", "type": "many_to_many", "model": "tags",
             "join_table": "post_tags", "join_fk": "post_id", "join_ref": "tag_id"}
        ]
    },
    {
        "table": "profiles",
        "fields": [
            {"name": "id", "type": "big_int", "primary_key": true, "auto_increment": true},
            {"name": "user_id", "type": "big_int"},
            {"name": "bio", "type": "text"}
        ]
    },
    {
        "table": "tags",
        "fields": [
            {"name": "id", "type": "big_int", "primary_key": true, "auto_increment": true},
            {"name": "label", "type": "string"}
        ]
    },
    {
        "table": "post_tags",
        "fields": [
            {"name": "post_id", "type": "big_int"},
            {"name": "tag_id", "type": "big_int"}
        ],
        "indexes": [
            {"name": "post_tags_pair", "columns": ["post_id", "tag_id"], "unique": true}
        ]
    }
]"#;

pub struct Fixture {
    pub pool: SqlitePool,
    pub registry: Arc<MemoryRegistry>,
    pub engine: Engine<Sqlite>,
}

pub async fn fixture() -> Fixture {
    fixture_with(Config::default()).await
}

/// Fresh in-memory database with every model's table created by the migrator.
pub async fn fixture_with(config: Config) -> Fixture {
    let pool = memory_pool().await.expect("pool");
    let registry = Arc::new(registry_from_json(MODELS));
    Migrator::new(pool.clone(), registry.clone())
        .with_config(&config)
        .auto_sync()
        .await
        .expect("sync");
    let engine = Engine::with_config(pool.clone(), registry.clone(), config);
    Fixture {
        pool,
        registry,
        engine,
    }
}

pub async fn run(engine: &Engine<Sqlite>, jql: &str) -> QueryResult {
    engine.execute_json(jql).await
}

pub async fn count(engine: &Engine<Sqlite>, table: &str) -> i64 {
    let res = engine.execute(&Query::count(table)).await;
    assert!(res.success, "{:?}", res.error);
    res.count.expect("count")
}
