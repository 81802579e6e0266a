use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use sqlx::{Database, IntoArguments};

use crate::dialect::{Backend, Dialect};
use crate::error::{JqlError, JqlResult};
use crate::executor::Executor;
use crate::value::Value;

/// Declared column type, mapped to a native type by each [`Dialect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Bool,
    #[default]
    String,
    Text,
    Bytes,
    #[serde(alias = "timestamp", alias = "time")]
    DateTime,
    Json,
    Uuid,
}

/// One declared column of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    /// Column name.
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    /// Overrides the dialect's mapping for `field_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_type: Option<String>,
    /// Length for `string` columns (`VARCHAR(size)`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub unique: bool,
    /// Raw SQL default expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl FieldMeta {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            sql_type: None,
            size: None,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            unique: false,
            default: None,
            description: String::new(),
        }
    }

    /// An auto-incrementing integer primary key.
    pub fn id(name: impl Into<String>) -> Self {
        Self {
            primary_key: true,
            auto_increment: true,
            ..Self::new(name, FieldType::BigInt)
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn default_value(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    HasOne,
    HasMany,
    BelongsTo,
    ManyToMany,
}

/// A declared association from one model to another.
///
/// For `has_one`/`has_many`, `foreign_key` lives on the related table and points at
/// `reference_key` on this one. For `belongs_to` it is the other way round. For
/// `many_to_many`, `join_fk` on the join table points at this model and `join_ref`
/// at the related one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RelationKind,
    /// Related table.
    pub model: String,
    #[serde(rename = "fk", default, skip_serializing_if = "String::is_empty")]
    pub foreign_key: String,
    #[serde(rename = "ref", default = "default_reference_key")]
    pub reference_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub join_table: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub join_fk: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub join_ref: String,
}

fn default_reference_key() -> String {
    "id".to_owned()
}

impl RelationSchema {
    pub fn new(
        name: impl Into<String>,
        kind: RelationKind,
        model: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            model: model.into(),
            foreign_key: foreign_key.into(),
            reference_key: default_reference_key(),
            join_table: String::new(),
            join_fk: String::new(),
            join_ref: String::new(),
        }
    }

    /// Every key column the relation's kind joins on must be named.
    pub fn validate(&self, table: &str) -> JqlResult<()> {
        let required = match self.kind {
            RelationKind::HasOne | RelationKind::HasMany | RelationKind::BelongsTo => vec![
                ("fk", self.foreign_key.as_str()),
                ("ref", self.reference_key.as_str()),
            ],
            RelationKind::ManyToMany => vec![
                ("join_table", self.join_table.as_str()),
                ("join_fk", self.join_fk.as_str()),
                ("join_ref", self.join_ref.as_str()),
                ("ref", self.reference_key.as_str()),
            ],
        };
        let missing = std::iter::once(("model", self.model.as_str()))
            .chain(required)
            .find(|(_, value)| value.trim().is_empty());
        match missing {
            Some((key, _)) => Err(JqlError::Validation(format!(
                "relation {:?} on table {:?} is missing {}",
                self.name, table, key
            ))),
            None => Ok(()),
        }
    }

    pub fn many_to_many(
        name: impl Into<String>,
        model: impl Into<String>,
        join_table: impl Into<String>,
        join_fk: impl Into<String>,
        join_ref: impl Into<String>,
    ) -> Self {
        Self {
            join_table: join_table.into(),
            join_fk: join_fk.into(),
            join_ref: join_ref.into(),
            ..Self::new(name, RelationKind::ManyToMany, model, "")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// Immutable metadata for one registered model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub table: String,
    /// Display name of the model; defaults to the table name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub fields: Vec<FieldMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<RelationSchema>,
}

impl ModelMeta {
    pub fn new(table: impl Into<String>, fields: Vec<FieldMeta>) -> Self {
        Self {
            table: table.into(),
            model: String::new(),
            description: String::new(),
            fields,
            indexes: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn with_relation(mut self, relation: RelationSchema) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn field(&self, column: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.name == column)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.field(column).is_some()
    }

    pub fn primary_key(&self) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.primary_key)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationSchema> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Rejects declarations the compiler cannot turn into SQL.
    pub fn validate(&self) -> JqlResult<()> {
        if self.table.is_empty() {
            return Err(JqlError::Validation("model declaration without table".to_owned()));
        }
        self.relations
            .iter()
            .try_for_each(|relation| relation.validate(&self.table))
    }

    fn display_name(&self) -> &str {
        if self.model.is_empty() {
            &self.table
        } else {
            &self.model
        }
    }
}

/// Summary row returned by `list_tables`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub columns: Vec<String>,
    pub primary_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_type: Option<String>,
    pub nullable: bool,
    pub primary: bool,
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Full declared schema of one table, returned by `describe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub columns: Vec<ColumnSchema>,
    pub indexes: Vec<IndexSchema>,
    pub relations: Vec<RelationSchema>,
}

impl From<&ModelMeta> for TableInfo {
    fn from(meta: &ModelMeta) -> Self {
        Self {
            name: meta.table.clone(),
            model: meta.display_name().to_owned(),
            description: meta.description.clone(),
            columns: meta.fields.iter().map(|f| f.name.clone()).collect(),
            primary_key: meta
                .primary_key()
                .map(|f| f.name.clone())
                .unwrap_or_else(|| "id".to_owned()),
        }
    }
}

impl From<&ModelMeta> for TableSchema {
    fn from(meta: &ModelMeta) -> Self {
        Self {
            table: meta.table.clone(),
            model: meta.display_name().to_owned(),
            description: meta.description.clone(),
            columns: meta
                .fields
                .iter()
                .map(|f| ColumnSchema {
                    name: f.name.clone(),
                    field_type: f.field_type,
                    sql_type: f.sql_type.clone(),
                    nullable: f.nullable,
                    primary: f.primary_key,
                    unique: f.unique,
                    default: f.default.clone(),
                    description: f.description.clone(),
                })
                .collect(),
            indexes: meta.indexes.clone(),
            relations: meta.relations.clone(),
        }
    }
}

/// Source of truth for declared models.
pub trait Registry: Send + Sync {
    fn get(&self, table: &str) -> Option<Arc<ModelMeta>>;

    /// Every registered table, ordered by name.
    fn list_tables(&self) -> Vec<TableInfo>;

    fn schema(&self, table: &str) -> Option<TableSchema> {
        self.get(table).map(|meta| TableSchema::from(meta.as_ref()))
    }
}

/// In-process registry. Reads run concurrently; `register` takes the write lock.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    models: RwLock<BTreeMap<String, Arc<ModelMeta>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a model under its table name.
    pub fn register(&self, meta: ModelMeta) -> Arc<ModelMeta> {
        let meta = Arc::new(meta);
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(meta.table.clone(), Arc::clone(&meta));
        meta
    }

    /// Loads a JSON array of model declarations.
    pub fn from_json(json: &str) -> JqlResult<Self> {
        let models: Vec<ModelMeta> = serde_json::from_str(json)?;
        let registry = Self::new();
        for meta in models {
            meta.validate()?;
            registry.register(meta);
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered model, ordered by table name.
    pub fn models(&self) -> Vec<Arc<ModelMeta>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl Registry for MemoryRegistry {
    fn get(&self, table: &str) -> Option<Arc<ModelMeta>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
    }

    fn list_tables(&self) -> Vec<TableInfo> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|meta| TableInfo::from(meta.as_ref()))
            .collect()
    }
}

/// Metadata about a live database column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaColumn {
    pub name: String,
    /// Type as reported by the database catalog.
    pub sql_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

/// Metadata about a live database table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaTable {
    pub name: String,
    pub columns: Vec<SchemaColumn>,
}

impl SchemaTable {
    pub fn column(&self, name: &str) -> Option<&SchemaColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Reads the live schema through the catalog query matching the dialect.
#[tracing::instrument(skip_all, fields(dialect = dialect.name()))]
pub async fn introspect_schema<DB>(
    exec: &mut Executor<'_, DB>,
    dialect: &dyn Dialect,
) -> JqlResult<Vec<SchemaTable>>
where
    DB: Backend,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
{
    match dialect.name() {
        "sqlite" => introspect_sqlite(exec, dialect).await,
        "postgres" => {
            introspect_catalog(
                exec,
                "SELECT table_name::text AS table_name, column_name::text AS column_name, \
                 data_type::text AS data_type, is_nullable::text AS is_nullable \
                 FROM information_schema.columns WHERE table_schema = 'public' \
                 ORDER BY table_name, ordinal_position",
            )
            .await
        }
        "mysql" => {
            introspect_catalog(
                exec,
                "SELECT TABLE_NAME AS table_name, COLUMN_NAME AS column_name, \
                 DATA_TYPE AS data_type, IS_NULLABLE AS is_nullable \
                 FROM information_schema.columns WHERE table_schema = DATABASE() \
                 ORDER BY TABLE_NAME, ORDINAL_POSITION",
            )
            .await
        }
        other => Err(JqlError::Message(format!(
            "no schema introspection for dialect {:?}",
            other
        ))),
    }
}

fn text(record: &crate::value::Record, key: &str) -> String {
    match record.get(key) {
        Some(Value::Text(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

async fn introspect_sqlite<DB>(
    exec: &mut Executor<'_, DB>,
    dialect: &dyn Dialect,
) -> JqlResult<Vec<SchemaTable>>
where
    DB: Backend,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
{
    let names = exec
        .fetch_records(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &[],
        )
        .await?;

    let mut tables = Vec::with_capacity(names.len());
    for row in names {
        let name = text(&row, "name");
        let pragma = format!("PRAGMA table_info({})", dialect.quote(&name));
        let columns = exec
            .fetch_records(&pragma, &[])
            .await?
            .into_iter()
            .map(|col| {
                let primary_key = col.get("pk").and_then(Value::as_i64).unwrap_or(0) > 0;
                let not_null = col.get("notnull").and_then(Value::as_i64).unwrap_or(0) != 0;
                SchemaColumn {
                    name: text(&col, "name"),
                    sql_type: text(&col, "type"),
                    nullable: !primary_key && !not_null,
                    primary_key,
                }
            })
            .collect();
        tables.push(SchemaTable { name, columns });
    }
    Ok(tables)
}

async fn introspect_catalog<DB>(exec: &mut Executor<'_, DB>, sql: &str) -> JqlResult<Vec<SchemaTable>>
where
    DB: Backend,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
{
    let mut tables: Vec<SchemaTable> = Vec::new();
    for row in exec.fetch_records(sql, &[]).await? {
        let table = text(&row, "table_name");
        let column = SchemaColumn {
            name: text(&row, "column_name"),
            sql_type: text(&row, "data_type"),
            nullable: text(&row, "is_nullable").eq_ignore_ascii_case("YES"),
            primary_key: false,
        };
        match tables.last_mut() {
            Some(last) if last.name == table => last.columns.push(column),
            _ => tables.push(SchemaTable {
                name: table,
                columns: vec![column],
            }),
        }
    }
    Ok(tables)
}

/// Type families treated as interchangeable, matched on whole words of the base name.
const TYPE_CLASSES: &[(&str, &[&str])] = &[
    ("BIGINT", &["BIGINT", "INT8", "BIGSERIAL"]),
    ("INTEGER", &["INTEGER", "INT", "INT4", "SERIAL"]),
    ("VARCHAR", &["VARCHAR", "CHARACTER VARYING", "TEXT"]),
    ("BOOLEAN", &["BOOLEAN", "BOOL"]),
    ("TIMESTAMP", &["TIMESTAMP", "TIMESTAMPTZ"]),
];

/// `VARCHAR(255)` -> `VARCHAR`, `INT(11) UNSIGNED` -> `INT`.
fn base_type(sql_type: &str) -> &str {
    sql_type.split('(').next().unwrap_or(sql_type).trim()
}

fn type_class(sql_type: &str) -> Option<&'static str> {
    let words: Vec<&str> = base_type(sql_type).split_whitespace().collect();
    TYPE_CLASSES
        .iter()
        .find(|(_, members)| {
            members.iter().any(|m| {
                let member: Vec<&str> = m.split_whitespace().collect();
                words.starts_with(&member)
            })
        })
        .map(|(class, _)| *class)
}

/// Heuristic compatibility between a declared and a live column type.
///
/// Compatible when the base names match once sizes are stripped (`VARCHAR(255)` vs
/// `varchar`) or both fall in the same family. Unknown pairs are reported as incompatible.
pub fn types_compatible(declared: &str, live: &str) -> bool {
    let declared = declared.trim().to_ascii_uppercase();
    let live = live.trim().to_ascii_uppercase();
    if declared == live || base_type(&declared) == base_type(&live) {
        return true;
    }
    match (type_class(&declared), type_class(&live)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODELS: &str = r#"[
        {
            "table": "users",
            "model": "User",
            "fields": [
                {"name": "id", "type": "big_int", "primary_key": true, "auto_increment": true},
                {"name": "email", "type": "string", "size": 120, "unique": true},
                {"name": "bio", "type": "text", "nullable": true}
            ],
            "relations": [
                {"name": "posts", "type": "has_many", "model": "posts", "fk": "user_id"}
            ]
        },
        {
            "table": "posts",
            "fields": [
                {"name": "id", "type": "int", "primary_key": true},
                {"name": "user_id", "type": "int"}
            ]
        }
    ]"#;

    #[test]
    fn registry_loads_json_models() {
        let registry = MemoryRegistry::from_json(MODELS).unwrap();
        assert_eq!(registry.len(), 2);

        let users = registry.get("users").unwrap();
        assert_eq!(users.primary_key().unwrap().name, "id");
        assert_eq!(users.field("email").unwrap().size, Some(120));
        let posts = users.relation("posts").unwrap();
        assert_eq!(posts.kind, RelationKind::HasMany);
        assert_eq!(posts.reference_key, "id");
        assert!(registry.get("ghosts").is_none());
    }

    #[test]
    fn list_tables_is_sorted_and_defaults_model_name() {
        let registry = MemoryRegistry::from_json(MODELS).unwrap();
        let tables = registry.list_tables();
        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["posts", "users"]);
        assert_eq!(tables[0].model, "posts");
        assert_eq!(tables[1].model, "User");
        assert_eq!(tables[1].columns, vec!["id", "email", "bio"]);
    }

    #[test]
    fn describe_includes_relations() {
        let registry = MemoryRegistry::from_json(MODELS).unwrap();
        let schema = registry.schema("users").unwrap();
        assert_eq!(schema.columns.len(), 3);
        assert!(schema.columns[0].primary);
        assert_eq!(schema.relations[0].name, "posts");
        assert!(registry.schema("ghosts").is_none());
    }

    #[test]
    fn relations_without_key_columns_are_rejected_on_load() {
        let err = MemoryRegistry::from_json(
            r#"[{"table": "users", "fields": [{"name": "id", "type": "big_int", "primary_key": true}],
                "relations": [{"name": "posts", "type": "has_many", "model": "posts"}]}]"#,
        )
        .unwrap_err();
        assert!(matches!(&err, JqlError::Validation(m) if m.contains("missing fk")), "{}", err);

        let err = MemoryRegistry::from_json(
            r#"[{"table": "posts", "fields": [{"name": "id", "type": "big_int", "primary_key": true}],
                "relations": [{"name": "tags", "type": "many_to_many", "model": "tags",
                               "join_table": "post_tags", "join_fk": "post_id"}]}]"#,
        )
        .unwrap_err();
        assert!(matches!(&err, JqlError::Validation(m) if m.contains("missing join_ref")), "{}", err);

        let empty_ref = RelationSchema {
            reference_key: String::new(),
            ..RelationSchema::new("author", RelationKind::BelongsTo, "users", "user_id")
        };
        assert!(empty_ref.validate("posts").is_err());
        assert!(RelationSchema::new("author", RelationKind::BelongsTo, "users", "user_id")
            .validate("posts")
            .is_ok());
    }

    #[test]
    fn concurrent_readers_see_registration() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register(ModelMeta::new("a", vec![FieldMeta::id("id")]));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = Arc::clone(&registry);
                std::thread::spawn(move || r.get("a").is_some())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn type_compatibility_families_and_prefixes() {
        assert!(types_compatible("VARCHAR(255)", "character varying"));
        assert!(types_compatible("VARCHAR(255)", "varchar"));
        assert!(types_compatible("TEXT", "VARCHAR(10)"));
        assert!(types_compatible("INTEGER", "int4"));
        assert!(types_compatible("BIGINT", "bigint"));
        assert!(types_compatible("BOOLEAN", "bool"));
        assert!(types_compatible("TIMESTAMP WITH TIME ZONE", "timestamp with time zone"));
        assert!(types_compatible("TINYINT(1)", "tinyint"));
        assert!(!types_compatible("INTEGER", "TEXT"));
        assert!(!types_compatible("BIGINT", "INTEGER"));
        assert!(!types_compatible("REAL", "BLOB"));
        assert!(types_compatible("INT(11) UNSIGNED", "integer"));
    }

    #[test]
    fn unrelated_types_sharing_letters_do_not_alias() {
        assert!(!types_compatible("INTERVAL", "INTEGER"));
        assert!(!types_compatible("INT", "INTERVAL"));
        assert!(!types_compatible("POINT", "INT"));
        assert!(!types_compatible("TEXTUAL", "TEXT"));
        assert_eq!(type_class("INTERVAL"), None);
        assert_eq!(type_class("TIMESTAMP WITHOUT TIME ZONE"), Some("TIMESTAMP"));
    }
}
