use futures_util::TryStreamExt;
use sqlx::{Database, IntoArguments};

use crate::dialect::Backend;
use crate::value::{Record, Value};

/// A database handle that wraps either the shared pool or one borrowed connection.
///
/// Every statement path in the crate runs against this type, so the same code serves
/// single statements (pool) and transaction steps (the transaction's connection).
pub enum Executor<'a, DB: Database> {
    /// A shared connection pool.
    Pool(&'a sqlx::Pool<DB>),
    /// A single, mutable database connection.
    Conn(&'a mut DB::Connection),
}

impl<DB: Database> std::fmt::Debug for Executor<'_, DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pool(_) => f.write_str("Executor::Pool"),
            Self::Conn(_) => f.write_str("Executor::Conn"),
        }
    }
}

impl<'a, DB: Database> From<&'a sqlx::Pool<DB>> for Executor<'a, DB> {
    fn from(pool: &'a sqlx::Pool<DB>) -> Self {
        Self::Pool(pool)
    }
}

impl<'a, DB: Database> From<&'a mut DB::Connection> for Executor<'a, DB> {
    fn from(conn: &'a mut DB::Connection) -> Self {
        Self::Conn(conn)
    }
}

/// Builds the argument buffer for a parameter list, in placeholder order.
pub(crate) fn arguments<'q, DB: Backend>(params: &[Value]) -> Result<DB::Arguments<'q>, sqlx::Error> {
    let mut args = DB::Arguments::default();
    for param in params {
        DB::bind_param(&mut args, param).map_err(sqlx::Error::Encode)?;
    }
    Ok(args)
}

impl<DB> Executor<'_, DB>
where
    DB: Backend,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
{
    /// Runs a statement and returns the driver's result (rows affected, last id).
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<DB::QueryResult, sqlx::Error> {
        let query = sqlx::query_with(sql, arguments::<DB>(params)?);
        match self {
            Self::Pool(pool) => query.execute(*pool).await,
            Self::Conn(conn) => query.execute(&mut **conn).await,
        }
    }

    /// Runs a statement and decodes every returned row into a [`Record`].
    pub async fn fetch_records(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Record>, sqlx::Error> {
        let query = sqlx::query_with(sql, arguments::<DB>(params)?);
        let mut rows = match self {
            Self::Pool(pool) => query.fetch(*pool),
            Self::Conn(conn) => query.fetch(&mut **conn),
        };
        let mut records = Vec::new();
        while let Some(row) = rows.try_next().await? {
            records.push(DB::decode_row(&row)?);
        }
        Ok(records)
    }

    /// Runs a single-value statement such as `SELECT COUNT(*)`.
    pub async fn fetch_i64(&mut self, sql: &str, params: &[Value]) -> Result<i64, sqlx::Error> {
        let records = self.fetch_records(sql, params).await?;
        records
            .first()
            .and_then(|row| row.values().next())
            .and_then(Value::as_i64)
            .ok_or(sqlx::Error::RowNotFound)
    }
}
