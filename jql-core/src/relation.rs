use std::collections::{HashMap, HashSet};

use sqlx::{Database, IntoArguments};

use crate::builder::SqlBuilder;
use crate::dialect::{Backend, Dialect};
use crate::error::{JqlError, JqlResult};
use crate::executor::Executor;
use crate::query::{Condition, Operator, Query, WithSpec};
use crate::schema::{RelationKind, RelationSchema, Registry};
use crate::value::{Record, Value};

/// Eager loads declared relations onto a result set with one query per relation.
///
/// Related rows are attached under the relation's name: an array for `has_many` and
/// `many_to_many`, a single object (or null) for `has_one` and `belongs_to`.
pub struct RelationLoader<'a> {
    dialect: &'a dyn Dialect,
    registry: &'a dyn Registry,
}

impl<'a> RelationLoader<'a> {
    pub fn new(dialect: &'a dyn Dialect, registry: &'a dyn Registry) -> Self {
        Self { dialect, registry }
    }

    pub async fn load<DB>(
        &self,
        exec: &mut Executor<'_, DB>,
        records: &mut [Record],
        table: &str,
        specs: &[WithSpec],
    ) -> JqlResult<()>
    where
        DB: Backend,
        for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
        for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    {
        if records.is_empty() || specs.is_empty() {
            return Ok(());
        }
        let meta = self
            .registry
            .get(table)
            .ok_or_else(|| JqlError::Relation(format!("table {:?} not found", table)))?;

        for spec in specs {
            for (name, nested) in spec.entries() {
                let relation = meta.relation(name).ok_or_else(|| {
                    JqlError::Relation(format!(
                        "relation {:?} not found on table {:?}",
                        name, table
                    ))
                })?;
                relation.validate(table)?;
                tracing::debug!(table, relation = name, kind = ?relation.kind, "jql preload");
                match relation.kind {
                    RelationKind::HasOne | RelationKind::HasMany => {
                        self.load_owned(exec, records, relation, nested).await?
                    }
                    RelationKind::BelongsTo => {
                        self.load_belongs_to(exec, records, relation, nested).await?
                    }
                    RelationKind::ManyToMany => {
                        self.load_many_to_many(exec, records, relation, nested).await?
                    }
                }
            }
        }
        Ok(())
    }

    /// Selects `table` rows whose `column` is one of `keys`, then preloads `nested` on them.
    async fn fetch_in<DB>(
        &self,
        exec: &mut Executor<'_, DB>,
        table: &str,
        column: &str,
        keys: Vec<Value>,
        nested: &[WithSpec],
    ) -> JqlResult<Vec<Record>>
    where
        DB: Backend,
        for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
        for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    {
        let query = Query::find(table).filter(Condition::new(column, Operator::In, keys));
        let built = SqlBuilder::new(self.dialect).build(&query)?;
        tracing::debug!(operation = "preload", sql = %built.sql, params = built.params.len(), "jql query");
        let mut rows = exec
            .fetch_records(&built.sql, &built.params)
            .await
            .map_err(|e| JqlError::Relation(format!("failed to load {}: {}", table, e)))?;
        if !nested.is_empty() {
            Box::pin(self.load(exec, &mut rows, table, nested)).await?;
        }
        Ok(rows)
    }

    async fn load_owned<DB>(
        &self,
        exec: &mut Executor<'_, DB>,
        records: &mut [Record],
        relation: &RelationSchema,
        nested: &[WithSpec],
    ) -> JqlResult<()>
    where
        DB: Backend,
        for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
        for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    {
        let many = relation.kind == RelationKind::HasMany;
        let keys = distinct_values(records, &relation.reference_key);
        let related = if keys.is_empty() {
            Vec::new()
        } else {
            self.fetch_in(exec, &relation.model, &relation.foreign_key, keys, nested)
                .await?
        };

        let mut grouped: HashMap<String, Vec<Record>> = HashMap::new();
        for row in related {
            if let Some(key) = row.get(&relation.foreign_key).and_then(Value::match_key) {
                grouped.entry(key).or_default().push(row);
            }
        }

        for record in records.iter_mut() {
            let matches = record
                .get(&relation.reference_key)
                .and_then(Value::match_key)
                .and_then(|key| grouped.get(&key));
            let value = if many {
                Value::Array(
                    matches
                        .map(|rows| rows.iter().cloned().map(Value::Object).collect())
                        .unwrap_or_default(),
                )
            } else {
                matches
                    .and_then(|rows| rows.first())
                    .cloned()
                    .map(Value::Object)
                    .unwrap_or(Value::Null)
            };
            record.insert(relation.name.clone(), value);
        }
        Ok(())
    }

    async fn load_belongs_to<DB>(
        &self,
        exec: &mut Executor<'_, DB>,
        records: &mut [Record],
        relation: &RelationSchema,
        nested: &[WithSpec],
    ) -> JqlResult<()>
    where
        DB: Backend,
        for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
        for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    {
        let keys = distinct_values(records, &relation.foreign_key);
        let related = if keys.is_empty() {
            Vec::new()
        } else {
            self.fetch_in(exec, &relation.model, &relation.reference_key, keys, nested)
                .await?
        };
        let by_key = index_by(related, &relation.reference_key);

        for record in records.iter_mut() {
            let value = record
                .get(&relation.foreign_key)
                .and_then(Value::match_key)
                .and_then(|key| by_key.get(&key))
                .cloned()
                .map(Value::Object)
                .unwrap_or(Value::Null);
            record.insert(relation.name.clone(), value);
        }
        Ok(())
    }

    async fn load_many_to_many<DB>(
        &self,
        exec: &mut Executor<'_, DB>,
        records: &mut [Record],
        relation: &RelationSchema,
        nested: &[WithSpec],
    ) -> JqlResult<()>
    where
        DB: Backend,
        for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
        for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    {
        for record in records.iter_mut() {
            record.insert(relation.name.clone(), Value::Array(Vec::new()));
        }
        let owner_keys = distinct_values(records, &relation.reference_key);
        if owner_keys.is_empty() {
            return Ok(());
        }

        let pairs = self
            .fetch_in(exec, &relation.join_table, &relation.join_fk, owner_keys, &[])
            .await?;
        let mut links: HashMap<String, Vec<String>> = HashMap::new();
        for pair in &pairs {
            let owner = pair.get(&relation.join_fk).and_then(Value::match_key);
            let target = pair.get(&relation.join_ref).and_then(Value::match_key);
            if let (Some(owner), Some(target)) = (owner, target) {
                links.entry(owner).or_default().push(target);
            }
        }
        let target_keys = distinct_values(&pairs, &relation.join_ref);
        if target_keys.is_empty() {
            return Ok(());
        }

        let related = self
            .fetch_in(exec, &relation.model, &relation.reference_key, target_keys, nested)
            .await?;
        let by_key = index_by(related, &relation.reference_key);

        for record in records.iter_mut() {
            let Some(owner) = record.get(&relation.reference_key).and_then(Value::match_key) else {
                continue;
            };
            let attached: Vec<Value> = links
                .get(&owner)
                .into_iter()
                .flatten()
                .filter_map(|target| by_key.get(target))
                .cloned()
                .map(Value::Object)
                .collect();
            record.insert(relation.name.clone(), Value::Array(attached));
        }
        Ok(())
    }
}

/// Non-null values of `column`, first occurrence of each key only.
fn distinct_values(records: &[Record], column: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter_map(|r| r.get(column))
        .filter(|v| v.match_key().is_some_and(|k| seen.insert(k)))
        .cloned()
        .collect()
}

fn index_by(rows: Vec<Record>, column: &str) -> HashMap<String, Record> {
    let mut map = HashMap::with_capacity(rows.len());
    for row in rows {
        if let Some(key) = row.get(column).and_then(Value::match_key) {
            map.entry(key).or_insert(row);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn distinct_values_skip_nulls_and_duplicates() {
        let rows = vec![
            row(&[("user_id", Value::Int(1))]),
            row(&[("user_id", Value::Null)]),
            row(&[("user_id", Value::Text("1".into()))]),
            row(&[("user_id", Value::Int(2))]),
            row(&[]),
        ];
        assert_eq!(
            distinct_values(&rows, "user_id"),
            vec![Value::Int(1), Value::Int(2)]
        );
    }

    #[test]
    fn index_by_keeps_first_row_per_key() {
        let rows = vec![
            row(&[("id", Value::Int(1)), ("n", Value::from("a"))]),
            row(&[("id", Value::Int(1)), ("n", Value::from("b"))]),
        ];
        let map = index_by(rows, "id");
        assert_eq!(map["1"]["n"], Value::from("a"));
    }
}
