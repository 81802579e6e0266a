use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Database, IntoArguments, Pool};

use crate::config::{Config, MigrationConfig};
use crate::dialect::{Backend, Dialect};
use crate::error::{JqlError, JqlResult};
use crate::executor::Executor;
use crate::schema::{FieldMeta, IndexSchema, ModelMeta, Registry, SchemaTable, introspect_schema, types_compatible};

/// Live tables the migrator never touches.
const SYSTEM_PREFIXES: &[&str] = &["_backup_", "pg_", "sql_", "sqlite_", "_jql_"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationAction {
    CreateTable,
    AddColumn,
    ModifyColumn,
    DropColumn,
    DropTable,
    AddIndex,
}

impl MigrationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateTable => "CREATE_TABLE",
            Self::AddColumn => "ADD_COLUMN",
            Self::ModifyColumn => "MODIFY_COLUMN",
            Self::DropColumn => "DROP_COLUMN",
            Self::DropTable => "DROP_TABLE",
            Self::AddIndex => "ADD_INDEX",
        }
    }
}

impl std::fmt::Display for MigrationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One schema edit of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationChange {
    pub action: MigrationAction,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    /// Statement to run. A change the database cannot apply carries a `--` comment.
    pub sql: String,
    pub destructive: bool,
    /// Copy made before the change runs, when auto backup is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_type: Option<String>,
}

impl MigrationChange {
    fn new(action: MigrationAction, table: &str, sql: String) -> Self {
        Self {
            action,
            table: table.to_owned(),
            column: None,
            sql,
            destructive: false,
            backup_table: None,
            old_type: None,
            new_type: None,
        }
    }

    fn column(mut self, column: &str) -> Self {
        self.column = Some(column.to_owned());
        self
    }

    fn destructive(mut self, backup_table: Option<String>) -> Self {
        self.destructive = true;
        self.backup_table = backup_table;
        self
    }

    /// False for changes recorded only as a comment.
    pub fn is_executable(&self) -> bool {
        !self.sql.trim_start().starts_with("--")
    }
}

/// An ordered list of changes computed from one look at the live schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub changes: Vec<MigrationChange>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn has_destructive(&self) -> bool {
        self.changes.iter().any(|c| c.destructive)
    }

    /// One line per change, destructive ones flagged.
    pub fn summary(&self) -> String {
        if self.changes.is_empty() {
            return "no changes".to_owned();
        }
        let destructive = self.changes.iter().filter(|c| c.destructive).count();
        let mut out = format!(
            "{} change(s), {} destructive\n",
            self.changes.len(),
            destructive
        );
        for change in &self.changes {
            let target = match &change.column {
                Some(column) => format!("{}.{}", change.table, column),
                None => change.table.clone(),
            };
            let flag = if change.destructive { " [destructive]" } else { "" };
            out.push_str(&format!("  {} {}{}\n", change.action, target, flag));
            if let (Some(old), Some(new)) = (&change.old_type, &change.new_type) {
                out.push_str(&format!("    {} -> {}\n", old, new));
            }
            if let Some(backup) = &change.backup_table {
                out.push_str(&format!("    backup: {}\n", backup));
            }
        }
        out
    }
}

/// Reconciles registered models with the live database.
///
/// DDL is not transactional on most databases: a failure part way through
/// `execute` leaves the changes before it applied.
pub struct Migrator<DB: Backend> {
    pool: Pool<DB>,
    dialect: Arc<dyn Dialect>,
    registry: Arc<dyn Registry>,
    config: MigrationConfig,
    primary_key: String,
}

impl<DB: Backend> Migrator<DB> {
    pub fn new(pool: Pool<DB>, registry: Arc<dyn Registry>) -> Self {
        let config = Config::default();
        Self {
            pool,
            dialect: DB::default_dialect(),
            registry,
            config: config.migration,
            primary_key: config.naming.primary_key,
        }
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.config = config.migration.clone();
        self.primary_key = config.naming.primary_key.clone();
        self
    }

    pub fn with_dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn aggressive(mut self, aggressive: bool) -> Self {
        self.config.aggressive = aggressive;
        self
    }

    pub fn auto_backup(mut self, auto_backup: bool) -> Self {
        self.config.auto_backup = auto_backup;
        self
    }

    fn models(&self) -> Vec<Arc<ModelMeta>> {
        self.registry
            .list_tables()
            .iter()
            .filter_map(|t| self.registry.get(&t.name))
            .collect()
    }

    /// Column definition used by CREATE TABLE, ADD COLUMN and MySQL's MODIFY COLUMN.
    fn column_def(&self, field: &FieldMeta) -> String {
        let mut parts = vec![self.dialect.quote(&field.name)];
        if field.primary_key && field.auto_increment {
            parts.push(self.dialect.auto_increment_pk().to_owned());
            return parts.join(" ");
        }
        parts.push(self.dialect.type_for(field));
        if field.primary_key {
            parts.push("PRIMARY KEY".to_owned());
        }
        if !field.nullable && !field.primary_key {
            parts.push("NOT NULL".to_owned());
        }
        if field.unique {
            parts.push("UNIQUE".to_owned());
        }
        if let Some(default) = &field.default {
            parts.push(format!("DEFAULT {}", default));
        }
        parts.join(" ")
    }

    fn create_table_sql(&self, meta: &ModelMeta) -> String {
        let columns: Vec<String> = meta
            .fields
            .iter()
            .map(|f| format!("  {}", self.column_def(f)))
            .collect();
        format!(
            "CREATE TABLE {} (\n{}\n)",
            self.dialect.quote(&meta.table),
            columns.join(",\n")
        )
    }

    fn create_index_sql(&self, table: &str, index: &IndexSchema) -> String {
        let name = if index.name.is_empty() {
            format!("idx_{}_{}", table, index.columns.join("_"))
        } else {
            index.name.clone()
        };
        let columns: Vec<String> = index.columns.iter().map(|c| self.dialect.quote(c)).collect();
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.dialect.quote(&name),
            self.dialect.quote(table),
            columns.join(", ")
        )
    }

    /// Diffs the registry against the live schema. Running it again on an
    /// unchanged database yields the same plan.
    #[tracing::instrument(skip(self), fields(dialect = self.dialect.name(), aggressive = self.config.aggressive))]
    pub async fn plan(&self) -> JqlResult<MigrationPlan>
    where
        for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
        for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    {
        let live = introspect_schema(&mut Executor::Pool(&self.pool), &*self.dialect).await?;
        Ok(self.diff(&self.models(), &live, &backup_stamp()))
    }

    fn diff(&self, models: &[Arc<ModelMeta>], live: &[SchemaTable], stamp: &str) -> MigrationPlan {
        let live_by_name: HashMap<&str, &SchemaTable> =
            live.iter().map(|t| (t.name.as_str(), t)).collect();
        let mut changes = Vec::new();

        for meta in models {
            let Some(table) = live_by_name.get(meta.table.as_str()) else {
                changes.push(MigrationChange::new(
                    MigrationAction::CreateTable,
                    &meta.table,
                    self.create_table_sql(meta),
                ));
                for index in &meta.indexes {
                    changes.push(MigrationChange::new(
                        MigrationAction::AddIndex,
                        &meta.table,
                        self.create_index_sql(&meta.table, index),
                    ));
                }
                continue;
            };

            for field in &meta.fields {
                let declared = self.dialect.type_for(field);
                match table.column(&field.name) {
                    None => {
                        let sql = format!(
                            "ALTER TABLE {} ADD COLUMN {}",
                            self.dialect.quote(&meta.table),
                            self.column_def(field)
                        );
                        let mut change = MigrationChange::new(MigrationAction::AddColumn, &meta.table, sql)
                            .column(&field.name);
                        change.new_type = Some(declared);
                        changes.push(change);
                    }
                    // Serial keys report their storage type, never the declared clause.
                    Some(_) if field.primary_key && field.auto_increment => {}
                    Some(column) if !types_compatible(&declared, &column.sql_type) => {
                        let sql = self
                            .dialect
                            .modify_column_sql(&meta.table, &field.name, &declared, &self.column_def(field))
                            .unwrap_or_else(|| {
                                format!("-- {} cannot alter column type", self.dialect.name())
                            });
                        let backup = backup_name(&meta.table, Some(&field.name), stamp);
                        let mut change = MigrationChange::new(MigrationAction::ModifyColumn, &meta.table, sql)
                            .column(&field.name)
                            .destructive(Some(backup));
                        change.old_type = Some(column.sql_type.clone());
                        change.new_type = Some(declared);
                        changes.push(change);
                    }
                    Some(_) => {}
                }
            }
        }

        if self.config.aggressive {
            let declared: HashMap<&str, &ModelMeta> =
                models.iter().map(|m| (m.table.as_str(), m.as_ref())).collect();
            for table in live {
                match declared.get(table.name.as_str()) {
                    None if is_system_table(&table.name) => {}
                    None => {
                        let sql = format!("DROP TABLE {}", self.dialect.quote(&table.name));
                        let backup = backup_name(&table.name, None, stamp);
                        changes.push(
                            MigrationChange::new(MigrationAction::DropTable, &table.name, sql)
                                .destructive(Some(backup)),
                        );
                    }
                    Some(meta) => {
                        for column in table.columns.iter().filter(|c| !meta.has_column(&c.name)) {
                            let sql = format!(
                                "ALTER TABLE {} DROP COLUMN {}",
                                self.dialect.quote(&table.name),
                                self.dialect.quote(&column.name)
                            );
                            let backup = backup_name(&table.name, Some(&column.name), stamp);
                            let mut change =
                                MigrationChange::new(MigrationAction::DropColumn, &table.name, sql)
                                    .column(&column.name)
                                    .destructive(Some(backup));
                            change.old_type = Some(column.sql_type.clone());
                            changes.push(change);
                        }
                    }
                }
            }
        }

        MigrationPlan { changes }
    }

    fn backup_sql(&self, change: &MigrationChange, backup: &str) -> String {
        let source = match &change.column {
            Some(column) => {
                let pk = self
                    .registry
                    .get(&change.table)
                    .and_then(|m| m.primary_key().map(|f| f.name.clone()))
                    .unwrap_or_else(|| self.primary_key.clone());
                format!("{}, {}", self.dialect.quote(&pk), self.dialect.quote(column))
            }
            None => "*".to_owned(),
        };
        format!(
            "CREATE TABLE {} AS SELECT {} FROM {}",
            self.dialect.quote(backup),
            source,
            self.dialect.quote(&change.table)
        )
    }

    /// Applies non-destructive changes, then backups, then destructive changes.
    ///
    /// Stops at the first failure; earlier changes stay applied.
    #[tracing::instrument(skip_all, fields(changes = plan.changes.len()))]
    pub async fn execute(&self, plan: &MigrationPlan) -> JqlResult<()>
    where
        for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
        for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    {
        let mut exec = Executor::Pool(&self.pool);
        let (destructive, safe): (Vec<&MigrationChange>, Vec<&MigrationChange>) =
            plan.changes.iter().partition(|c| c.destructive);

        for change in safe {
            self.apply(&mut exec, change).await?;
        }

        if self.config.auto_backup {
            for change in &destructive {
                let Some(backup) = &change.backup_table else {
                    continue;
                };
                if !change.is_executable() {
                    continue;
                }
                let sql = self.backup_sql(change, backup);
                tracing::info!(
                    operation = "migration_backup",
                    table = %change.table,
                    backup = %backup,
                    "jql migration"
                );
                exec.execute(&sql, &[])
                    .await
                    .map_err(|source| JqlError::Migration {
                        action: change.action,
                        table: change.table.clone(),
                        source,
                    })?;
            }
        }

        for change in destructive {
            self.apply(&mut exec, change).await?;
        }
        Ok(())
    }

    async fn apply(&self, exec: &mut Executor<'_, DB>, change: &MigrationChange) -> JqlResult<()>
    where
        for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
        for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    {
        if !change.is_executable() {
            tracing::warn!(
                table = %change.table,
                column = ?change.column,
                action = %change.action,
                "skipping migration change the database cannot apply"
            );
            return Ok(());
        }
        tracing::info!(
            operation = "migration_apply",
            action = %change.action,
            table = %change.table,
            column = ?change.column,
            "jql migration"
        );
        exec.execute(&change.sql, &[])
            .await
            .map(|_| ())
            .map_err(|source| JqlError::Migration {
                action: change.action,
                table: change.table.clone(),
                source,
            })
    }

    /// Plans and applies in one go, returning what was applied.
    pub async fn auto_sync(&self) -> JqlResult<MigrationPlan>
    where
        for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
        for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    {
        let plan = self.plan().await?;
        self.execute(&plan).await?;
        Ok(plan)
    }
}

fn is_system_table(name: &str) -> bool {
    SYSTEM_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn backup_stamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn backup_name(table: &str, column: Option<&str>, stamp: &str) -> String {
    match column {
        Some(column) => format!("_backup_{}_{}_{}", table, column, stamp),
        None => format!("_backup_{}_{}", table, stamp),
    }
}
