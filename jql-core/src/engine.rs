use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::{Database, IntoArguments};

use crate::builder::{BuildResult, SqlBuilder};
use crate::config::Config;
use crate::confirm::ConfirmationStore;
use crate::dialect::{Backend, Dialect};
use crate::error::{ErrorCode, JqlError};
use crate::executor::Executor;
use crate::hooks::{HookContext, HookKind, HookManager};
use crate::query::{Action, Query};
use crate::relation::RelationLoader;
use crate::result::{ExplainResult, QueryResult, ResultError, ResultMeta, Status};
use crate::schema::Registry;
use crate::value::Value;

#[cfg(feature = "metrics")]
fn record_query_metrics(operation: &str, table: &str, elapsed: Duration) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    let labels = [
        ("operation", operation.to_string()),
        ("table", table.to_string()),
    ];
    metrics::histogram!("jql.query.duration_ms", &labels).record(elapsed_ms);
    metrics::counter!("jql.query.count", &labels).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn record_query_metrics(_operation: &str, _table: &str, _elapsed: Duration) {}

/// Runs JQL queries against one database.
///
/// Every entry point returns a [`QueryResult`]; failures are reported in it rather
/// than as `Err`. Cloning is cheap and clones share the pool, hooks and pending
/// confirmation tokens.
pub struct Engine<DB: Backend> {
    pool: sqlx::Pool<DB>,
    dialect: Arc<dyn Dialect>,
    registry: Arc<dyn Registry>,
    hooks: Arc<HookManager>,
    config: Arc<Config>,
    confirmations: Arc<ConfirmationStore>,
}

impl<DB: Backend> Clone for Engine<DB> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            dialect: Arc::clone(&self.dialect),
            registry: Arc::clone(&self.registry),
            hooks: Arc::clone(&self.hooks),
            config: Arc::clone(&self.config),
            confirmations: Arc::clone(&self.confirmations),
        }
    }
}

impl<DB: Backend> std::fmt::Debug for Engine<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dialect", &self.dialect.name())
            .field("hooks", &self.hooks)
            .field("config", &self.config)
            .field("confirmations", &self.confirmations)
            .finish()
    }
}

impl<DB: Backend> Engine<DB> {
    pub fn new(pool: sqlx::Pool<DB>, registry: Arc<dyn Registry>) -> Self {
        Self::with_config(pool, registry, Config::default())
    }

    /// An engine with the backend's default dialect and the timestamp hook installed.
    pub fn with_config(pool: sqlx::Pool<DB>, registry: Arc<dyn Registry>, config: Config) -> Self {
        Self {
            pool,
            dialect: DB::default_dialect(),
            registry,
            hooks: Arc::new(HookManager::with_defaults(&config.naming)),
            confirmations: Arc::new(ConfirmationStore::new(config.confirm_ttl())),
            config: Arc::new(config),
        }
    }

    pub fn with_dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Replaces the hook set, including the default timestamp hook.
    pub fn with_hooks(mut self, hooks: HookManager) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn pool(&self) -> &sqlx::Pool<DB> {
        &self.pool
    }

    pub fn dialect(&self) -> &dyn Dialect {
        &*self.dialect
    }

    pub fn registry(&self) -> &dyn Registry {
        &*self.registry
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Key returned by inserts into `table`. `None` when the model declares no primary key.
    fn primary_key(&self, table: &str) -> Option<String> {
        match self.registry.get(table) {
            Some(model) => model.primary_key().map(|f| f.name.clone()),
            None => Some(self.config.naming.primary_key.clone()),
        }
    }

    fn build(&self, query: &Query) -> Result<BuildResult, JqlError> {
        let pk = self.primary_key(&query.table);
        let builder = SqlBuilder::new(&*self.dialect);
        match pk.as_deref() {
            Some(pk) => builder.with_primary_key(pk).build(query),
            None => builder.without_returning().build(query),
        }
    }

    /// Compiles the inner query without running it.
    pub fn explain(&self, query: &Query) -> QueryResult {
        let target = query.inner.as_deref().unwrap_or(query);
        if let Err(err) = target.validate() {
            return err.into();
        }
        let built = match self.build(target) {
            Ok(built) => built,
            Err(err) => return err.into(),
        };
        let mut warnings = Vec::new();
        let action = target.action.unwrap_or(Action::Find);
        if matches!(action, Action::Update | Action::Delete) && target.filters.is_empty() {
            warnings.push(format!("{} without where affects every row", action));
        }
        if action == Action::Find && target.limit == 0 && target.filters.is_empty() {
            warnings.push("find without where or limit reads the whole table".to_owned());
        }
        if self.registry.get(&target.table).is_none() {
            warnings.push(format!("table {:?} is not registered", target.table));
        }
        QueryResult {
            explain: Some(ExplainResult {
                sql: built.sql,
                params: built.params,
                warnings,
            }),
            ..QueryResult::ok()
        }
    }

    /// Checks the inner query for structural errors and that it compiles.
    pub fn validate(&self, query: &Query) -> QueryResult {
        let target = query.inner.as_deref().unwrap_or(query);
        if let Err(err) = target.validate() {
            return err.into();
        }
        match target.action {
            Some(Action::Transaction) => {
                for op in &target.operations {
                    if let Err(err) = op.validate() {
                        return err.into();
                    }
                }
                QueryResult::ok()
            }
            Some(Action::Find)
            | Some(Action::Aggregate)
            | Some(Action::Create)
            | Some(Action::CreateBatch)
            | Some(Action::Update)
            | Some(Action::Delete)
            | Some(Action::Count) => match self.build(target) {
                Ok(_) | Err(JqlError::UnresolvedReference(_)) => QueryResult::ok(),
                Err(err) => err.into(),
            },
            _ => QueryResult::ok(),
        }
    }

    pub fn list_tables(&self) -> QueryResult {
        QueryResult {
            tables: self.registry.list_tables(),
            ..QueryResult::ok()
        }
    }

    pub fn describe(&self, table: &str) -> QueryResult {
        match self.registry.schema(table) {
            Some(schema) => QueryResult {
                schema: Some(schema),
                ..QueryResult::ok()
            },
            None => QueryResult::from_error(
                ResultError::new(ErrorCode::TableNotFound, format!("table {:?} not found", table))
                    .with_suggestion("Use list_tables to see registered tables"),
            ),
        }
    }

    /// The statement limit for `query`: its own `timeout`, else the configured default.
    pub(crate) fn time_limit(&self, query: &Query) -> Result<Option<Duration>, JqlError> {
        Ok(query.timeout_duration()?.or_else(|| self.config.query_timeout()))
    }

    pub(crate) async fn with_timeout<F>(&self, query: &Query, fut: F) -> QueryResult
    where
        F: Future<Output = QueryResult>,
    {
        match self.time_limit(query) {
            Ok(Some(limit)) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(table = %query.table, limit_ms = limit.as_millis() as u64, "jql query timed out");
                    JqlError::Timeout(limit).into()
                }
            },
            Ok(None) => fut.await,
            Err(err) => err.into(),
        }
    }

    fn sql_failure(&self, err: sqlx::Error, built: &BuildResult) -> QueryResult {
        tracing::warn!(sql = %built.sql, error = %err, "jql statement failed");
        QueryResult::from_error(
            ResultError::from(&JqlError::Sqlx(err)).with_statement(&built.sql, &built.params),
        )
    }

    /// Attaches `meta` when the query or the engine asks for debugging.
    fn finish(&self, query: &Query, built: &BuildResult, started: Instant, mut result: QueryResult) -> QueryResult {
        if query.debug || self.config.debug {
            result.meta = Some(ResultMeta {
                sql: built.sql.clone(),
                params: built.params.clone(),
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                rows_returned: result.data.len() as u64,
            });
        }
        result
    }

    fn after(&self, kind: HookKind, mut ctx: HookContext, result: QueryResult) -> QueryResult {
        if !result.success {
            return result;
        }
        ctx.result = Some(result);
        if let Err(err) = self.hooks.run(kind, &mut ctx) {
            return err.into();
        }
        ctx.result.unwrap_or_else(QueryResult::ok)
    }

    fn context(&self, query: Query) -> HookContext {
        let model = self.registry.get(&query.table);
        HookContext::new(query, model)
    }
}

impl<DB> Engine<DB>
where
    DB: Backend,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
{
    /// Dispatches a query on its action.
    #[tracing::instrument(skip(self, query), fields(table = %query.table, action = ?query.action))]
    pub async fn execute(&self, query: &Query) -> QueryResult {
        if let Err(err) = query.validate() {
            return err.into();
        }
        match query.action {
            Some(Action::Find) => self.execute_find(query).await,
            Some(Action::Aggregate) => self.execute_aggregate(query).await,
            Some(Action::Create) => self.execute_create(query).await,
            Some(Action::CreateBatch) => self.execute_create_batch(query).await,
            Some(Action::Update) => self.execute_update(query).await,
            Some(Action::Delete) => self.execute_delete(query).await,
            Some(Action::Count) => self.execute_count(query).await,
            Some(Action::Transaction) => self.transaction(query).await,
            Some(Action::Explain) => self.explain(query),
            Some(Action::Validate) => self.validate(query),
            Some(Action::ListTables) => self.list_tables(),
            Some(Action::Describe) => self.describe(&query.table),
            None => QueryResult::failure(ErrorCode::UnknownAction, "action is required"),
        }
    }

    /// Parses a JQL document and executes it.
    pub async fn execute_json(&self, jql: &str) -> QueryResult {
        match Query::parse(jql) {
            Ok(query) => self.execute(&query).await,
            Err(err) => err.into(),
        }
    }

    pub async fn execute_find(&self, query: &Query) -> QueryResult {
        self.with_timeout(query, async {
            let mut exec = Executor::Pool(&self.pool);
            self.run_find(&mut exec, query.clone()).await
        })
        .await
    }

    /// Aggregates run through the find path; `select` carries the functions.
    pub async fn execute_aggregate(&self, query: &Query) -> QueryResult {
        self.execute_find(query).await
    }

    pub async fn execute_create(&self, query: &Query) -> QueryResult {
        self.with_timeout(query, async {
            let mut exec = Executor::Pool(&self.pool);
            self.run_create(&mut exec, query.clone()).await
        })
        .await
    }

    pub async fn execute_create_batch(&self, query: &Query) -> QueryResult {
        self.with_timeout(query, async {
            let mut exec = Executor::Pool(&self.pool);
            self.run_create(&mut exec, query.clone()).await
        })
        .await
    }

    pub async fn execute_update(&self, query: &Query) -> QueryResult {
        self.with_timeout(query, async {
            if let Some(held) = self.confirm_gate(query).await {
                return held;
            }
            let mut exec = Executor::Pool(&self.pool);
            self.run_update(&mut exec, query.clone()).await
        })
        .await
    }

    pub async fn execute_delete(&self, query: &Query) -> QueryResult {
        self.with_timeout(query, async {
            if let Some(held) = self.confirm_gate(query).await {
                return held;
            }
            let mut exec = Executor::Pool(&self.pool);
            self.run_delete(&mut exec, query.clone()).await
        })
        .await
    }

    pub async fn execute_count(&self, query: &Query) -> QueryResult {
        self.with_timeout(query, async {
            let mut exec = Executor::Pool(&self.pool);
            self.run_count(&mut exec, query).await
        })
        .await
    }

    /// Holds back an unfiltered UPDATE/DELETE over more rows than the threshold.
    /// Callers run it inside the query's time limit, pre-flight COUNT included.
    ///
    /// Returns `None` when the write may proceed: it is filtered, the gate is off, the
    /// table is small enough, or a valid token for this exact query was supplied.
    async fn confirm_gate(&self, query: &Query) -> Option<QueryResult> {
        let security = &self.config.security;
        if !query.filters.is_empty() || !security.confirm_destructive {
            return None;
        }
        if let Some(token) = &query.confirm_token {
            if self.confirmations.redeem(token, query) {
                tracing::info!(table = %query.table, "jql destructive write confirmed");
                return None;
            }
            return Some(QueryResult::from_error(
                ResultError::new(
                    ErrorCode::InvalidConfirmToken,
                    "confirmation token is invalid, expired or was issued for a different query",
                )
                .with_suggestion("Resubmit without confirm_token to obtain a new one"),
            ));
        }

        let count_query = Query::count(&query.table);
        let built = match self.build(&count_query) {
            Ok(built) => built,
            Err(err) => return Some(err.into()),
        };
        let count = match Executor::Pool(&self.pool)
            .fetch_i64(&built.sql, &built.params)
            .await
        {
            Ok(count) => count,
            Err(err) => return Some(self.sql_failure(err, &built)),
        };
        if count <= security.confirm_threshold {
            return None;
        }

        let verb = query.action.unwrap_or(Action::Delete);
        let token = self.confirmations.issue(query);
        tracing::warn!(table = %query.table, action = %verb, count, "jql destructive write held for confirmation");
        Some(QueryResult {
            status: Some(Status::PendingConfirm),
            confirm_token: Some(token),
            affected: u64::try_from(count).ok(),
            ..QueryResult::from_error(
                ResultError::new(
                    ErrorCode::ConfirmRequired,
                    format!("This will {} {} records, confirmation required", verb, count),
                )
                .with_suggestion("Resubmit the same query with confirm_token set")
                .with_detail("count", count),
            )
        })
    }

    pub(crate) async fn run_find(&self, exec: &mut Executor<'_, DB>, query: Query) -> QueryResult {
        let mut ctx = self.context(query);
        if let Err(err) = self.hooks.run(HookKind::BeforeFind, &mut ctx) {
            return err.into();
        }
        if ctx.skip {
            return QueryResult::ok();
        }
        let built = match self.build(&ctx.query) {
            Ok(built) => built,
            Err(err) => return err.into(),
        };

        #[cfg(debug_assertions)]
        tracing::debug!(operation = "select", sql = %built.sql, params = built.params.len(), "jql query");

        let started = Instant::now();
        let mut rows = match exec.fetch_records(&built.sql, &built.params).await {
            Ok(rows) => rows,
            Err(err) => return self.sql_failure(err, &built),
        };
        record_query_metrics("select", &ctx.table, started.elapsed());

        if !ctx.query.with.is_empty() {
            let loader = RelationLoader::new(&*self.dialect, &*self.registry);
            if let Err(err) = loader.load(exec, &mut rows, &ctx.table, &ctx.query.with).await {
                return err.into();
            }
        }

        let result = QueryResult {
            count: i64::try_from(rows.len()).ok(),
            data: rows,
            ..QueryResult::ok()
        };
        let result = self.finish(&ctx.query, &built, started, result);
        self.after(HookKind::AfterFind, ctx, result)
    }

    pub(crate) async fn run_create(&self, exec: &mut Executor<'_, DB>, query: Query) -> QueryResult {
        let mut ctx = self.context(query);
        if let Err(err) = self.hooks.run(HookKind::BeforeCreate, &mut ctx) {
            return err.into();
        }
        if ctx.skip {
            return QueryResult::ok();
        }
        let built = match self.build(&ctx.query) {
            Ok(built) => built,
            Err(err) => return err.into(),
        };
        let batch = ctx.query.action == Some(Action::CreateBatch);
        let operation = if batch { "insert_batch" } else { "insert" };

        #[cfg(debug_assertions)]
        tracing::debug!(operation, sql = %built.sql, params = built.params.len(), "jql query");

        let started = Instant::now();
        let mut result = QueryResult::ok();
        let pk = self.primary_key(&ctx.table);
        match pk.as_deref().filter(|_| self.dialect.supports_returning()) {
            Some(pk) => match exec.fetch_records(&built.sql, &built.params).await {
                Ok(rows) => {
                    let ids: Vec<i64> = rows
                        .iter()
                        .filter_map(|row| row.get(pk).and_then(Value::as_i64))
                        .collect();
                    result.affected = Some(rows.len() as u64);
                    if batch {
                        result.ids = ids;
                    } else {
                        result.id = ids.first().copied();
                    }
                }
                Err(err) => return self.sql_failure(err, &built),
            },
            None => match exec.execute(&built.sql, &built.params).await {
                Ok(done) => {
                    let affected = DB::rows_affected(&done);
                    result.affected = Some(affected);
                    if pk.is_some() {
                        if batch {
                            result.ids = DB::batch_ids(&done, ctx.query.data_batch.len());
                        } else {
                            result.id = DB::last_insert_id(&done);
                        }
                    }
                }
                Err(err) => return self.sql_failure(err, &built),
            },
        }
        record_query_metrics(operation, &ctx.table, started.elapsed());

        let result = self.finish(&ctx.query, &built, started, result);
        self.after(HookKind::AfterCreate, ctx, result)
    }

    pub(crate) async fn run_update(&self, exec: &mut Executor<'_, DB>, query: Query) -> QueryResult {
        let mut ctx = self.context(query);
        if let Err(err) = self.hooks.run(HookKind::BeforeUpdate, &mut ctx) {
            return err.into();
        }
        if ctx.skip {
            return QueryResult::ok();
        }
        let result = self.write(exec, &ctx.query, "update").await;
        self.after(HookKind::AfterUpdate, ctx, result)
    }

    /// Deletes, or updates when a `before_delete` hook rewrote the query (soft delete).
    pub(crate) async fn run_delete(&self, exec: &mut Executor<'_, DB>, query: Query) -> QueryResult {
        let mut ctx = self.context(query);
        if let Err(err) = self.hooks.run(HookKind::BeforeDelete, &mut ctx) {
            return err.into();
        }
        if ctx.skip {
            return QueryResult::ok();
        }
        let operation = match ctx.query.action {
            Some(Action::Update) => "soft_delete",
            _ => "delete",
        };
        let result = self.write(exec, &ctx.query, operation).await;
        self.after(HookKind::AfterDelete, ctx, result)
    }

    /// Runs an UPDATE or DELETE and reports the affected row count.
    async fn write(&self, exec: &mut Executor<'_, DB>, query: &Query, operation: &str) -> QueryResult {
        let built = match self.build(query) {
            Ok(built) => built,
            Err(err) => return err.into(),
        };

        #[cfg(debug_assertions)]
        tracing::debug!(operation, sql = %built.sql, params = built.params.len(), "jql query");

        let started = Instant::now();
        let done = match exec.execute(&built.sql, &built.params).await {
            Ok(done) => done,
            Err(err) => return self.sql_failure(err, &built),
        };
        record_query_metrics(operation, &query.table, started.elapsed());

        let result = QueryResult {
            affected: Some(DB::rows_affected(&done)),
            ..QueryResult::ok()
        };
        self.finish(query, &built, started, result)
    }

    pub(crate) async fn run_count(&self, exec: &mut Executor<'_, DB>, query: &Query) -> QueryResult {
        let built = match self.build(query) {
            Ok(built) => built,
            Err(err) => return err.into(),
        };

        #[cfg(debug_assertions)]
        tracing::debug!(operation = "count", sql = %built.sql, params = built.params.len(), "jql query");

        let started = Instant::now();
        let count = match exec.fetch_i64(&built.sql, &built.params).await {
            Ok(count) => count,
            Err(err) => return self.sql_failure(err, &built),
        };
        record_query_metrics("count", &query.table, started.elapsed());

        let result = QueryResult {
            count: Some(count),
            ..QueryResult::ok()
        };
        self.finish(query, &built, started, result)
    }
}
