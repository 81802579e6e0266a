use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Database;
use sqlx::error::BoxDynError;

use crate::schema::{FieldMeta, FieldType};
use crate::value::{Record, Value};

/// Per-database SQL rules: quoting, placeholders, type names and feature support.
///
/// The three implementations are plain data tables. A dialect instance is handed to
/// the builder, engine and migrator explicitly; nothing looks one up by name.
pub trait Dialect: Send + Sync + std::fmt::Debug {
    /// Short name: "postgres", "mysql" or "sqlite".
    fn name(&self) -> &'static str;

    /// Quotes an identifier (table/column name).
    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Returns the placeholder for the `n`-th parameter (1-based).
    fn placeholder(&self, n: usize) -> String;

    /// Native column type for a declared field; an explicit `sql_type` wins.
    fn type_for(&self, field: &FieldMeta) -> String;

    /// Returns true if `INSERT ... RETURNING` is available.
    fn supports_returning(&self) -> bool;

    fn supports_upsert(&self) -> bool {
        true
    }

    /// Returns true if `ILIKE` exists; otherwise it is emulated with `LOWER()`.
    fn supports_ilike(&self) -> bool {
        false
    }

    /// The bare auto-increment keyword.
    fn auto_increment_clause(&self) -> &'static str;

    /// Full column definition tail for an auto-incrementing primary key.
    fn auto_increment_pk(&self) -> &'static str;

    fn current_timestamp(&self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }

    /// ALTER statement changing a column's type, or `None` if the database cannot do it in place.
    fn modify_column_sql(&self, table: &str, column: &str, sql_type: &str, column_def: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }
    fn placeholder(&self, n: usize) -> String {
        format!("${}", n)
    }
    fn type_for(&self, field: &FieldMeta) -> String {
        if let Some(sql_type) = &field.sql_type {
            return sql_type.clone();
        }
        match field.field_type {
            FieldType::SmallInt => "SMALLINT".to_owned(),
            FieldType::Int => "INTEGER".to_owned(),
            FieldType::BigInt => "BIGINT".to_owned(),
            FieldType::Float => "REAL".to_owned(),
            FieldType::Double => "DOUBLE PRECISION".to_owned(),
            FieldType::Bool => "BOOLEAN".to_owned(),
            FieldType::String => format!("VARCHAR({})", field.size.unwrap_or(255)),
            FieldType::Text => "TEXT".to_owned(),
            FieldType::Bytes => "BYTEA".to_owned(),
            FieldType::DateTime => "TIMESTAMP WITH TIME ZONE".to_owned(),
            FieldType::Json => "JSONB".to_owned(),
            FieldType::Uuid => "UUID".to_owned(),
        }
    }
    fn supports_returning(&self) -> bool {
        true
    }
    fn supports_ilike(&self) -> bool {
        true
    }
    fn auto_increment_clause(&self) -> &'static str {
        "BIGSERIAL"
    }
    fn auto_increment_pk(&self) -> &'static str {
        "BIGSERIAL PRIMARY KEY"
    }
    fn current_timestamp(&self) -> &'static str {
        "NOW()"
    }
    fn modify_column_sql(&self, table: &str, column: &str, sql_type: &str, _column_def: &str) -> Option<String> {
        Some(format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
            self.quote(table),
            self.quote(column),
            sql_type
        ))
    }
}

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }
    fn quote(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }
    fn placeholder(&self, _n: usize) -> String {
        "?".to_owned()
    }
    fn type_for(&self, field: &FieldMeta) -> String {
        if let Some(sql_type) = &field.sql_type {
            return sql_type.clone();
        }
        match field.field_type {
            FieldType::SmallInt => "SMALLINT".to_owned(),
            FieldType::Int => "INT".to_owned(),
            FieldType::BigInt => "BIGINT".to_owned(),
            FieldType::Float => "FLOAT".to_owned(),
            FieldType::Double => "DOUBLE".to_owned(),
            FieldType::Bool => "TINYINT(1)".to_owned(),
            FieldType::String => format!("VARCHAR({})", field.size.unwrap_or(255)),
            FieldType::Text => "TEXT".to_owned(),
            FieldType::Bytes => "BLOB".to_owned(),
            FieldType::DateTime => "DATETIME".to_owned(),
            FieldType::Json => "JSON".to_owned(),
            FieldType::Uuid => "CHAR(36)".to_owned(),
        }
    }
    fn supports_returning(&self) -> bool {
        false
    }
    fn auto_increment_clause(&self) -> &'static str {
        "AUTO_INCREMENT"
    }
    fn auto_increment_pk(&self) -> &'static str {
        "BIGINT AUTO_INCREMENT PRIMARY KEY"
    }
    fn current_timestamp(&self) -> &'static str {
        "NOW()"
    }
    fn modify_column_sql(&self, table: &str, _column: &str, _sql_type: &str, column_def: &str) -> Option<String> {
        Some(format!(
            "ALTER TABLE {} MODIFY COLUMN {}",
            self.quote(table),
            column_def
        ))
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }
    fn placeholder(&self, _n: usize) -> String {
        "?".to_owned()
    }
    fn type_for(&self, field: &FieldMeta) -> String {
        if let Some(sql_type) = &field.sql_type {
            return sql_type.clone();
        }
        match field.field_type {
            FieldType::SmallInt | FieldType::Int | FieldType::BigInt | FieldType::Bool => {
                "INTEGER".to_owned()
            }
            FieldType::Float | FieldType::Double => "REAL".to_owned(),
            FieldType::String | FieldType::Text | FieldType::Json | FieldType::Uuid => {
                "TEXT".to_owned()
            }
            FieldType::Bytes => "BLOB".to_owned(),
            FieldType::DateTime => "DATETIME".to_owned(),
        }
    }
    fn supports_returning(&self) -> bool {
        true
    }
    fn auto_increment_clause(&self) -> &'static str {
        "AUTOINCREMENT"
    }
    fn auto_increment_pk(&self) -> &'static str {
        "INTEGER PRIMARY KEY AUTOINCREMENT"
    }
    fn modify_column_sql(&self, _table: &str, _column: &str, _sql_type: &str, _column_def: &str) -> Option<String> {
        None
    }
}

/// Driver glue for a sqlx database: everything about a backend that is not plain data.
pub trait Backend: Database + Sized + Send + Sync {
    /// The dialect used when the caller does not inject one.
    fn default_dialect() -> Arc<dyn Dialect>;
    /// Returns the number of rows affected by a statement.
    fn rows_affected(res: &Self::QueryResult) -> u64;
    /// Returns the id generated by the last insert, if the driver reports one.
    fn last_insert_id(res: &Self::QueryResult) -> Option<i64>;
    /// Ids of a multi-row insert, derived from the driver's last-insert id.
    ///
    /// Only valid for sequential auto-increment keys with no interleaved writers.
    fn batch_ids(_res: &Self::QueryResult, _rows: usize) -> Vec<i64> {
        Vec::new()
    }
    /// Appends one parameter to an argument buffer.
    fn bind_param<'q>(args: &mut Self::Arguments<'q>, value: &Value) -> Result<(), BoxDynError>;
    /// Decodes a row into an ordered record. Binary columns come back as text.
    fn decode_row(row: &Self::Row) -> Result<Record, sqlx::Error>;
}

/// Shared binding for every backend; `Array`/`Object` payloads are stored as JSON text.
fn add_param<'q, DB>(args: &mut DB::Arguments<'q>, value: &Value) -> Result<(), BoxDynError>
where
    DB: Database,
    bool: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    i64: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    f64: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    String: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    Option<String>: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    DateTime<Utc>: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    use sqlx::Arguments;
    match value {
        Value::Null => args.add(Option::<String>::None),
        Value::Bool(v) => args.add(*v),
        Value::Int(v) => args.add(*v),
        Value::Float(v) => args.add(*v),
        Value::Text(v) => args.add(v.clone()),
        Value::Timestamp(v) => args.add(*v),
        Value::Array(_) | Value::Object(_) => args.add(value.to_json().to_string()),
        Value::Ref(reference) => Err(format!("unresolved reference {}", reference).into()),
    }
}

fn bytes_to_text(bytes: Vec<u8>) -> Value {
    Value::Text(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(feature = "sqlite")]
impl Backend for sqlx::Sqlite {
    fn default_dialect() -> Arc<dyn Dialect> {
        Arc::new(SqliteDialect)
    }
    fn rows_affected(res: &sqlx::sqlite::SqliteQueryResult) -> u64 {
        res.rows_affected()
    }
    fn last_insert_id(res: &sqlx::sqlite::SqliteQueryResult) -> Option<i64> {
        Some(res.last_insert_rowid())
    }
    fn batch_ids(res: &sqlx::sqlite::SqliteQueryResult, rows: usize) -> Vec<i64> {
        // SQLite reports the rowid of the last row inserted.
        let last = res.last_insert_rowid();
        let rows = rows as i64;
        (last - rows + 1..=last).collect()
    }
    fn bind_param<'q>(args: &mut Self::Arguments<'q>, value: &Value) -> Result<(), BoxDynError> {
        add_param::<Self>(args, value)
    }
    fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<Record, sqlx::Error> {
        use sqlx::{Column, Row, TypeInfo, ValueRef};

        let mut record = Record::with_capacity(row.columns().len());
        for (idx, column) in row.columns().iter().enumerate() {
            let raw = row.try_get_raw(idx)?;
            // SQLite types values, not columns: ask the value.
            let value = if raw.is_null() {
                Value::Null
            } else {
                match raw.type_info().name() {
                    "INTEGER" | "BOOLEAN" => Value::Int(row.try_get_unchecked::<i64, _>(idx)?),
                    "REAL" => Value::Float(row.try_get_unchecked::<f64, _>(idx)?),
                    "BLOB" => bytes_to_text(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
                    _ => Value::Text(row.try_get_unchecked::<String, _>(idx)?),
                }
            };
            record.insert(column.name().to_owned(), value);
        }
        Ok(record)
    }
}

#[cfg(feature = "postgres")]
impl Backend for sqlx::Postgres {
    fn default_dialect() -> Arc<dyn Dialect> {
        Arc::new(PostgresDialect)
    }
    fn rows_affected(res: &sqlx::postgres::PgQueryResult) -> u64 {
        res.rows_affected()
    }
    fn last_insert_id(_res: &sqlx::postgres::PgQueryResult) -> Option<i64> {
        None
    }
    fn bind_param<'q>(args: &mut Self::Arguments<'q>, value: &Value) -> Result<(), BoxDynError> {
        add_param::<Self>(args, value)
    }
    fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Record, sqlx::Error> {
        use sqlx::{Column, Row, TypeInfo, ValueRef};

        let mut record = Record::with_capacity(row.columns().len());
        for (idx, column) in row.columns().iter().enumerate() {
            if row.try_get_raw(idx)?.is_null() {
                record.insert(column.name().to_owned(), Value::Null);
                continue;
            }
            let value = match column.type_info().name() {
                "INT2" => Value::Int(i64::from(row.try_get_unchecked::<i16, _>(idx)?)),
                "INT4" => Value::Int(i64::from(row.try_get_unchecked::<i32, _>(idx)?)),
                "INT8" => Value::Int(row.try_get_unchecked::<i64, _>(idx)?),
                "FLOAT4" => Value::Float(f64::from(row.try_get_unchecked::<f32, _>(idx)?)),
                "FLOAT8" => Value::Float(row.try_get_unchecked::<f64, _>(idx)?),
                "BOOL" => Value::Bool(row.try_get_unchecked::<bool, _>(idx)?),
                "BYTEA" => bytes_to_text(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
                "TIMESTAMPTZ" => Value::Timestamp(row.try_get_unchecked::<DateTime<Utc>, _>(idx)?),
                "TIMESTAMP" => Value::Timestamp(
                    row.try_get_unchecked::<chrono::NaiveDateTime, _>(idx)?.and_utc(),
                ),
                "DATE" => Value::Text(row.try_get_unchecked::<chrono::NaiveDate, _>(idx)?.to_string()),
                "UUID" => Value::Text(row.try_get_unchecked::<uuid::Uuid, _>(idx)?.to_string()),
                "JSON" | "JSONB" => {
                    Value::from(row.try_get_unchecked::<serde_json::Value, _>(idx)?)
                }
                _ => Value::Text(row.try_get_unchecked::<String, _>(idx)?),
            };
            record.insert(column.name().to_owned(), value);
        }
        Ok(record)
    }
}

#[cfg(feature = "mysql")]
impl Backend for sqlx::MySql {
    fn default_dialect() -> Arc<dyn Dialect> {
        Arc::new(MySqlDialect)
    }
    fn rows_affected(res: &sqlx::mysql::MySqlQueryResult) -> u64 {
        res.rows_affected()
    }
    fn last_insert_id(res: &sqlx::mysql::MySqlQueryResult) -> Option<i64> {
        i64::try_from(res.last_insert_id()).ok()
    }
    fn batch_ids(res: &sqlx::mysql::MySqlQueryResult, rows: usize) -> Vec<i64> {
        // MySQL reports the id of the first row of a multi-row insert.
        match Self::last_insert_id(res) {
            Some(first) => (first..first + rows as i64).collect(),
            None => Vec::new(),
        }
    }
    fn bind_param<'q>(args: &mut Self::Arguments<'q>, value: &Value) -> Result<(), BoxDynError> {
        add_param::<Self>(args, value)
    }
    fn decode_row(row: &sqlx::mysql::MySqlRow) -> Result<Record, sqlx::Error> {
        use sqlx::{Column, Row, TypeInfo, ValueRef};

        let mut record = Record::with_capacity(row.columns().len());
        for (idx, column) in row.columns().iter().enumerate() {
            if row.try_get_raw(idx)?.is_null() {
                record.insert(column.name().to_owned(), Value::Null);
                continue;
            }
            let type_name = column.type_info().name();
            let value = match type_name {
                "BOOLEAN" => Value::Bool(row.try_get_unchecked::<bool, _>(idx)?),
                "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
                    Value::Int(row.try_get_unchecked::<i64, _>(idx)?)
                }
                "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
                | "BIGINT UNSIGNED" => {
                    let v = row.try_get_unchecked::<u64, _>(idx)?;
                    i64::try_from(v).map(Value::Int).unwrap_or(Value::Float(v as f64))
                }
                "FLOAT" => Value::Float(f64::from(row.try_get_unchecked::<f32, _>(idx)?)),
                "DOUBLE" => Value::Float(row.try_get_unchecked::<f64, _>(idx)?),
                "DATETIME" => Value::Timestamp(
                    row.try_get_unchecked::<chrono::NaiveDateTime, _>(idx)?.and_utc(),
                ),
                "TIMESTAMP" => Value::Timestamp(row.try_get_unchecked::<DateTime<Utc>, _>(idx)?),
                "DATE" => Value::Text(row.try_get_unchecked::<chrono::NaiveDate, _>(idx)?.to_string()),
                "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
                    bytes_to_text(row.try_get_unchecked::<Vec<u8>, _>(idx)?)
                }
                "JSON" => Value::from(row.try_get_unchecked::<serde_json::Value, _>(idx)?),
                _ => Value::Text(row.try_get_unchecked::<String, _>(idx)?),
            };
            record.insert(column.name().to_owned(), value);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(field_type: FieldType) -> FieldMeta {
        FieldMeta::new("name", field_type)
    }

    #[test]
    fn quoting_and_placeholders_per_dialect() {
        assert_eq!(PostgresDialect.quote("users"), "\"users\"");
        assert_eq!(PostgresDialect.placeholder(3), "$3");
        assert_eq!(MySqlDialect.quote("users"), "`users`");
        assert_eq!(MySqlDialect.placeholder(3), "?");
        assert_eq!(SqliteDialect.quote("users"), "\"users\"");
        assert_eq!(SqliteDialect.placeholder(3), "?");
    }

    #[test]
    fn quote_escapes_embedded_quotes() {
        assert_eq!(PostgresDialect.quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(MySqlDialect.quote("we`ird"), "`we``ird`");
    }

    #[test]
    fn type_mapping_honours_size_and_override() {
        let mut f = field(FieldType::String);
        f.size = Some(64);
        assert_eq!(PostgresDialect.type_for(&f), "VARCHAR(64)");
        assert_eq!(MySqlDialect.type_for(&f), "VARCHAR(64)");
        assert_eq!(SqliteDialect.type_for(&f), "TEXT");

        f.sql_type = Some("CITEXT".into());
        assert_eq!(PostgresDialect.type_for(&f), "CITEXT");
    }

    #[test]
    fn bool_and_time_types_differ_by_dialect() {
        assert_eq!(PostgresDialect.type_for(&field(FieldType::Bool)), "BOOLEAN");
        assert_eq!(MySqlDialect.type_for(&field(FieldType::Bool)), "TINYINT(1)");
        assert_eq!(SqliteDialect.type_for(&field(FieldType::Bool)), "INTEGER");
        assert_eq!(
            PostgresDialect.type_for(&field(FieldType::DateTime)),
            "TIMESTAMP WITH TIME ZONE"
        );
    }

    #[test]
    fn feature_flags() {
        assert!(PostgresDialect.supports_returning());
        assert!(SqliteDialect.supports_returning());
        assert!(!MySqlDialect.supports_returning());
        assert!(PostgresDialect.supports_ilike());
        assert!(!SqliteDialect.supports_ilike());
        assert_eq!(SqliteDialect.auto_increment_clause(), "AUTOINCREMENT");
        assert_eq!(MySqlDialect.auto_increment_clause(), "AUTO_INCREMENT");
        assert_eq!(PostgresDialect.auto_increment_clause(), "BIGSERIAL");
    }

    #[test]
    fn modify_column_sql_per_dialect() {
        assert_eq!(
            PostgresDialect
                .modify_column_sql("t", "c", "BIGINT", "\"c\" BIGINT")
                .unwrap(),
            "ALTER TABLE \"t\" ALTER COLUMN \"c\" TYPE BIGINT"
        );
        assert_eq!(
            MySqlDialect
                .modify_column_sql("t", "c", "BIGINT", "`c` BIGINT NOT NULL")
                .unwrap(),
            "ALTER TABLE `t` MODIFY COLUMN `c` BIGINT NOT NULL"
        );
        assert!(SqliteDialect.modify_column_sql("t", "c", "BIGINT", "").is_none());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn sqlite_rows_decode_by_value_type() {
        use sqlx::SqlitePool;

        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let row = sqlx::query("SELECT 1 AS i, 2.5 AS f, 'x' AS s, NULL AS n, X'6869' AS b")
            .fetch_one(&pool)
            .await
            .unwrap();
        let record = <sqlx::Sqlite as Backend>::decode_row(&row).unwrap();
        assert_eq!(record["i"], Value::Int(1));
        assert_eq!(record["f"], Value::Float(2.5));
        assert_eq!(record["s"], Value::Text("x".into()));
        assert_eq!(record["n"], Value::Null);
        assert_eq!(record["b"], Value::Text("hi".into()));
        let keys: Vec<_> = record.keys().cloned().collect();
        assert_eq!(keys, vec!["i", "f", "s", "n", "b"]);
    }
}
