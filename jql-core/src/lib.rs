//! Structured JSON queries (JQL) compiled to parameterised SQL.
//!
//! A [`Query`] is built in code or parsed from JSON, compiled by [`SqlBuilder`] for a
//! [`Dialect`], and run by an [`Engine`] which returns a [`QueryResult`]. The
//! [`Migrator`] keeps the tables declared in a [`Registry`] in sync with the database.

pub use sqlx;

pub mod builder;
pub mod config;
pub mod confirm;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod migrator;
pub mod query;
pub mod relation;
pub mod result;
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod test_utils;
pub mod transaction;
pub mod value;

pub use builder::{BuildResult, SqlBuilder};
pub use config::Config;
pub use dialect::{Backend, Dialect, MySqlDialect, PostgresDialect, SqliteDialect};
pub use engine::Engine;
pub use error::{ErrorCode, JqlError, JqlResult};
pub use executor::Executor;
pub use hooks::{HookContext, HookKind, HookManager, hook};
pub use migrator::{MigrationAction, MigrationChange, MigrationPlan, Migrator};
pub use query::{Action, Condition, Operator, Order, Query, WithSpec};
pub use relation::RelationLoader;
pub use result::{QueryResult, ResultError, Status};
pub use schema::{FieldMeta, FieldType, MemoryRegistry, ModelMeta, Registry, RelationKind, RelationSchema};
pub use value::{Record, Reference, Value};

pub mod prelude {
    pub use crate::{
        Action, Condition, Config, Engine, MemoryRegistry, Migrator, Operator, Order, Query,
        QueryResult, Record, Registry, Value,
    };
}
