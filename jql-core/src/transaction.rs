use std::collections::HashMap;

use sqlx::{Database, IntoArguments};
use uuid::Uuid;

use crate::dialect::Backend;
use crate::engine::Engine;
use crate::error::{ErrorCode, JqlError, JqlResult};
use crate::executor::Executor;
use crate::query::{Action, Condition, Query};
use crate::result::{QueryResult, ResultError};
use crate::value::{Record, Reference, Value};

/// Results of completed steps, by their `as` alias.
type Aliases = HashMap<String, QueryResult>;

impl<DB> Engine<DB>
where
    DB: Backend,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
{
    /// Runs `operations` atomically on one connection.
    ///
    /// A step may refer to an earlier aliased step's result with `"$alias.field"`
    /// anywhere in its `data`, `data_batch` or `where` values. The first failing
    /// step rolls everything back. The transaction's own `timeout` bounds the whole
    /// unit; each step is bounded by its own `timeout` or the configured default.
    #[tracing::instrument(skip(self, query), fields(steps = query.operations.len()))]
    pub async fn transaction(&self, query: &Query) -> QueryResult {
        let tx_id = format!("tx_{}", Uuid::new_v4().simple());
        let limit = match query.timeout_duration() {
            Ok(limit) => limit,
            Err(err) => return err.into(),
        };
        let mut result = match limit {
            Some(limit) => match tokio::time::timeout(limit, self.run_transaction(query, &tx_id)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(transaction_id = %tx_id, "jql transaction timed out, rolled back");
                    JqlError::Timeout(limit).into()
                }
            },
            None => self.run_transaction(query, &tx_id).await,
        };
        result.transaction_id = Some(tx_id);
        result
    }

    async fn run_transaction(&self, query: &Query, tx_id: &str) -> QueryResult {
        if query.operations.is_empty() {
            return QueryResult::failure(
                ErrorCode::NoOperations,
                "transaction requires at least one operation",
            );
        }

        let mut tx = match self.pool().begin().await {
            Ok(tx) => tx,
            Err(err) => {
                return QueryResult::failure(
                    ErrorCode::TxBeginError,
                    format!("failed to begin transaction: {}", err),
                );
            }
        };
        tracing::debug!(transaction_id = %tx_id, "jql transaction begin");

        let mut results = Vec::with_capacity(query.operations.len());
        let mut aliases = Aliases::new();
        for (index, op) in query.operations.iter().enumerate() {
            let step = {
                let mut exec = Executor::Conn(&mut *tx);
                self.run_step(&mut exec, op, &aliases).await
            };
            if !step.success {
                if let Err(err) = tx.rollback().await {
                    tracing::warn!(transaction_id = %tx_id, error = %err, "jql rollback failed");
                }
                tracing::warn!(transaction_id = %tx_id, index, "jql transaction rolled back");
                let cause = step.error.clone();
                results.push(step);
                let message = cause
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "unknown error".to_owned());
                let mut error = ResultError::new(
                    ErrorCode::TxOperationError,
                    format!("operation {} failed: {}", index, message),
                )
                .with_detail("operation_index", index as i64);
                if let Some(cause) = cause {
                    error = error.with_detail("cause", cause.code.as_str());
                    error.details.extend(cause.details);
                    error.suggestion = cause.suggestion;
                }
                return QueryResult {
                    results,
                    ..QueryResult::from_error(error)
                };
            }
            if let Some(alias) = &op.alias {
                aliases.insert(alias.clone(), step.clone());
            }
            results.push(step);
        }

        if let Err(err) = tx.commit().await {
            return QueryResult {
                results,
                ..QueryResult::failure(
                    ErrorCode::TxCommitError,
                    format!("failed to commit transaction: {}", err),
                )
            };
        }
        tracing::debug!(transaction_id = %tx_id, steps = results.len(), "jql transaction committed");

        QueryResult {
            affected: Some(results.iter().filter_map(|r| r.affected).sum()),
            results,
            ..QueryResult::ok()
        }
    }

    async fn run_step(&self, exec: &mut Executor<'_, DB>, op: &Query, aliases: &Aliases) -> QueryResult {
        if let Err(err) = op.validate() {
            return err.into();
        }
        let op = match resolve_query(op, aliases) {
            Ok(op) => op,
            Err(err) => return err.into(),
        };
        let limit = match self.time_limit(&op) {
            Ok(limit) => limit,
            Err(err) => return err.into(),
        };
        let step = async {
            match op.action {
                Some(Action::Find) => self.run_find(exec, op.clone()).await,
                Some(Action::Create) | Some(Action::CreateBatch) => {
                    self.run_create(exec, op.clone()).await
                }
                Some(Action::Update) => self.run_update(exec, op.clone()).await,
                Some(Action::Delete) => self.run_delete(exec, op.clone()).await,
                Some(other) => QueryResult::from_error(
                    ResultError::new(
                        ErrorCode::UnsupportedTxAction,
                        format!("action {:?} is not allowed in a transaction", other.as_str()),
                    )
                    .with_suggestion("Use find, create, update or delete"),
                ),
                None => QueryResult::failure(ErrorCode::ValidationError, "action is required"),
            }
        };
        match limit {
            Some(limit) => tokio::time::timeout(limit, step)
                .await
                .unwrap_or_else(|_| JqlError::Timeout(limit).into()),
            None => step.await,
        }
    }
}

/// Replaces every `$alias.field` value in `query` with the referenced step's value.
/// Whole strings of that shape count as references here and nowhere else.
pub(crate) fn resolve_query(query: &Query, aliases: &Aliases) -> JqlResult<Query> {
    let mut query = query.clone();
    resolve_record(&mut query.data, aliases)?;
    for record in &mut query.data_batch {
        resolve_record(record, aliases)?;
    }
    for condition in &mut query.filters {
        resolve_condition(condition, aliases)?;
    }
    for having in &mut query.having {
        resolve_value(&mut having.value, aliases)?;
    }
    Ok(query)
}

fn resolve_record(record: &mut Record, aliases: &Aliases) -> JqlResult<()> {
    record
        .values_mut()
        .try_for_each(|value| resolve_value(value, aliases))
}

fn resolve_condition(condition: &mut Condition, aliases: &Aliases) -> JqlResult<()> {
    resolve_value(&mut condition.value, aliases)?;
    for nested in condition.and.iter_mut().chain(condition.or_group.iter_mut()) {
        resolve_condition(nested, aliases)?;
    }
    if let Some(sub) = condition.subquery.as_mut() {
        **sub = resolve_query(sub, aliases)?;
    }
    Ok(())
}

fn resolve_value(value: &mut Value, aliases: &Aliases) -> JqlResult<()> {
    match value {
        Value::Ref(reference) => {
            *value = lookup_reference(reference, aliases)?;
            Ok(())
        }
        Value::Text(text) => {
            if let Some(reference) = Reference::parse(text) {
                *value = lookup_reference(&reference, aliases)?;
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter_mut()
            .try_for_each(|item| resolve_value(item, aliases)),
        Value::Object(record) => resolve_record(record, aliases),
        _ => Ok(()),
    }
}

fn lookup_reference(reference: &Reference, aliases: &Aliases) -> JqlResult<Value> {
    aliases
        .get(&reference.alias)
        .and_then(|result| result.lookup(&reference.field))
        .ok_or_else(|| JqlError::UnresolvedReference(reference.clone()))
}
