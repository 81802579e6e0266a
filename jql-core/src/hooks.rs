use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;

use crate::config::NamingConfig;
use crate::error::{JqlError, JqlResult};
use crate::query::{Action, Query};
use crate::result::QueryResult;
use crate::schema::ModelMeta;
use crate::value::{Record, Value};

/// Lifecycle points at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    BeforeFind,
    AfterFind,
}

/// Mutable view of one operation, handed to each hook in turn.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub table: String,
    pub action: Action,
    /// The query about to run. Its `data`/`data_batch` is the write payload.
    pub query: Query,
    /// Declared model of `table`, when registered.
    pub model: Option<Arc<ModelMeta>>,
    /// Set on `after_*` hooks.
    pub result: Option<QueryResult>,
    /// Stop here and report success without touching the database.
    pub skip: bool,
}

impl HookContext {
    pub fn new(query: Query, model: Option<Arc<ModelMeta>>) -> Self {
        Self {
            table: query.table.clone(),
            action: query.action.unwrap_or(Action::Find),
            query,
            model,
            result: None,
            skip: false,
        }
    }

    fn declares(&self, column: &str) -> bool {
        self.model.as_ref().is_some_and(|m| m.has_column(column))
    }

    /// Every payload record: `data` for single writes, each entry of `data_batch` otherwise.
    pub fn payloads_mut(&mut self) -> Vec<&mut Record> {
        if self.query.data_batch.is_empty() {
            vec![&mut self.query.data]
        } else {
            self.query.data_batch.iter_mut().collect()
        }
    }
}

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

pub type HookFn = Arc<dyn Fn(&mut HookContext) -> Result<(), HookError> + Send + Sync>;

/// Wraps a closure as a [`HookFn`].
pub fn hook<F>(f: F) -> HookFn
where
    F: Fn(&mut HookContext) -> Result<(), HookError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Global and per-table hook lists.
#[derive(Default)]
pub struct HookManager {
    global: RwLock<HashMap<HookKind, Vec<HookFn>>>,
    tables: RwLock<HashMap<String, HashMap<HookKind, Vec<HookFn>>>>,
}

impl std::fmt::Debug for HookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let global = self.global.read().unwrap_or_else(PoisonError::into_inner);
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("HookManager")
            .field("global", &global.values().map(Vec::len).sum::<usize>())
            .field("tables", &tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager with the timestamp hook installed for creates and updates.
    pub fn with_defaults(naming: &NamingConfig) -> Self {
        let manager = Self::new();
        let stamp = timestamp_hook(naming.clone());
        manager.register_global(HookKind::BeforeCreate, Arc::clone(&stamp));
        manager.register_global(HookKind::BeforeUpdate, stamp);
        manager
    }

    pub fn register(&self, table: impl Into<String>, kind: HookKind, hook: HookFn) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(table.into())
            .or_default()
            .entry(kind)
            .or_default()
            .push(hook);
    }

    pub fn register_global(&self, kind: HookKind, hook: HookFn) {
        self.global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(hook);
    }

    /// Runs global hooks then the table's hooks, in registration order.
    ///
    /// Stops at the first error or as soon as a hook sets `skip`.
    pub fn run(&self, kind: HookKind, ctx: &mut HookContext) -> JqlResult<()> {
        let mut chain: Vec<HookFn> = self
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        if let Some(hooks) = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ctx.table)
            .and_then(|t| t.get(&kind))
        {
            chain.extend(hooks.iter().cloned());
        }

        for hook in chain {
            hook(ctx).map_err(|e| JqlError::Hook(e.to_string()))?;
            if ctx.skip {
                break;
            }
        }
        Ok(())
    }
}

/// Fills `created_at`/`updated_at` on create and refreshes `updated_at` on update.
///
/// Only columns the registered model declares are touched; an explicit value on
/// create is kept.
pub fn timestamp_hook(naming: NamingConfig) -> HookFn {
    hook(move |ctx| {
        let now = Value::Timestamp(Utc::now());
        let created = ctx.declares(&naming.created_at);
        let updated = ctx.declares(&naming.updated_at);
        match ctx.action {
            Action::Create | Action::CreateBatch => {
                for payload in ctx.payloads_mut() {
                    if created && !payload.contains_key(&naming.created_at) {
                        payload.insert(naming.created_at.clone(), now.clone());
                    }
                    if updated && !payload.contains_key(&naming.updated_at) {
                        payload.insert(naming.updated_at.clone(), now.clone());
                    }
                }
            }
            Action::Update if updated => {
                ctx.query.data.insert(naming.updated_at.clone(), now);
            }
            _ => {}
        }
        Ok(())
    })
}

/// Turns a delete into an update that stamps `column` with the current time.
pub fn soft_delete_hook(column: impl Into<String>) -> HookFn {
    let column = column.into();
    hook(move |ctx| {
        if ctx.action != Action::Delete {
            return Ok(());
        }
        let mut data = Record::new();
        data.insert(column.clone(), Value::Timestamp(Utc::now()));
        ctx.query.action = Some(Action::Update);
        ctx.query.data = data;
        ctx.action = Action::Update;
        Ok(())
    })
}
