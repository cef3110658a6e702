//! Typed local store
//!
//! Tables are declared with a column schema, materialized once by
//! [`LocalStore::initialize`], and then queried with the same [`Query`]
//! values that render to OData for the remote service.
//!
//! ```ignore
//! let store = LocalStore::open("./offline");
//! store.define_table("todo", [("text", ColumnType::String), ("complete", ColumnType::Boolean)])?;
//! store.initialize()?;
//! store.upsert("todo", &json!({"id": "1", "text": "milk", "complete": false}))?;
//! let open = store.read(&Query::table("todo").field("complete").eq().val(false))?;
//! ```
//!
//! Lifecycle: `Uninitialized → Defining → Initialized`. Tables can only be
//! defined before `initialize`; data operations are only legal after it.
//! Each table sits behind its own mutex, so operations on one table are
//! serialized while different tables proceed independently.

mod schema;
mod table;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError, RwLock};

use indexmap::IndexMap;
use polars::prelude::PolarsError;
use serde_json::Value;
use thiserror::Error;

use crate::query::{Query, QueryError};

pub use schema::{ColumnDef, ColumnType, TableSchema};
pub use table::Row;
use schema::normalize;
use table::Table;

#[derive(Error, Debug)]
pub enum LocalStoreError {
    #[error("the local store is already initialized")]
    AlreadyInitialized,

    #[error("cannot define a table after the local store has been initialized")]
    DefineAfterInitialize,

    #[error("the local store is not initialized")]
    NotInitialized,

    #[error("invalid table name '{name}': {reason}")]
    InvalidTableName { name: String, reason: &'static str },

    #[error("invalid column name '{name}': {reason}")]
    InvalidColumnName { name: String, reason: &'static str },

    #[error("column '{column}' must be declared as {expected:?}")]
    ReservedColumnType { column: String, expected: ColumnType },

    #[error("table {0} is not defined")]
    UnknownTable(String),

    #[error("table {table} has no column named {column}")]
    UnknownColumn { table: String, column: String },

    #[error("item must be a JSON object")]
    NotAnObject,

    #[error("item has no id")]
    MissingId,

    #[error("cannot store {value} in column '{column}' of type {expected:?}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        value: String,
    },

    #[error("unsupported filter: {0}")]
    Filter(String),

    #[error("query is not bound to a table")]
    MissingTable,

    #[error("incomplete query: {0}")]
    Query(#[from] QueryError),

    #[error("storage engine error: {0}")]
    Polars(#[from] PolarsError),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<PoisonError<T>> for LocalStoreError {
    fn from(e: PoisonError<T>) -> Self {
        LocalStoreError::Poisoned(e.to_string())
    }
}

type Result<T> = std::result::Result<T, LocalStoreError>;

/// Lifecycle phase of a [`LocalStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Defining,
    Initialized,
}

enum Phase {
    Defining(IndexMap<String, TableSchema>),
    Initialized(HashMap<String, Mutex<Table>>),
}

/// Rows returned by [`LocalStore::read`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub rows: Vec<Row>,
    /// Total matches before skip/top, when the query asked for it
    pub count: Option<usize>,
}

impl ReadResult {
    /// A JSON array, or `{"count": n, "results": [...]}` with an inline count
    pub fn to_json(&self) -> Value {
        let results = Value::Array(self.rows.iter().cloned().map(Value::Object).collect());
        match self.count {
            Some(count) => serde_json::json!({ "count": count, "results": results }),
            None => results,
        }
    }
}

/// Schema-typed local table store
pub struct LocalStore {
    location: Option<PathBuf>,
    phase: RwLock<Phase>,
}

impl LocalStore {
    /// A store that lives only as long as this value
    pub fn in_memory() -> Self {
        Self {
            location: None,
            phase: RwLock::new(Phase::Defining(IndexMap::new())),
        }
    }

    /// A store persisted under `dir`, one Arrow IPC file per table
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            location: Some(dir.into()),
            ..Self::in_memory()
        }
    }

    pub fn state(&self) -> Result<StoreState> {
        Ok(match &*self.phase.read()? {
            Phase::Defining(tables) if tables.is_empty() => StoreState::Uninitialized,
            Phase::Defining(_) => StoreState::Defining,
            Phase::Initialized(_) => StoreState::Initialized,
        })
    }

    /// Register a table schema. Defining a table twice merges the columns.
    pub fn define_table<I, K>(&self, name: &str, columns: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, ColumnType)>,
        K: AsRef<str>,
    {
        self.register(TableSchema::new(name, columns)?)
    }

    /// Register one of the crate's own `__` tables
    pub(crate) fn define_system_table<I, K>(&self, name: &str, columns: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, ColumnType)>,
        K: AsRef<str>,
    {
        self.register(TableSchema::system(name, columns)?)
    }

    fn register(&self, schema: TableSchema) -> Result<()> {
        let mut phase = self.phase.write()?;
        let Phase::Defining(tables) = &mut *phase else {
            return Err(LocalStoreError::DefineAfterInitialize);
        };
        match tables.get_mut(schema.key()) {
            Some(existing) => existing.merge(schema),
            None => {
                tables.insert(schema.key().to_string(), schema);
            }
        }
        Ok(())
    }

    /// Materialize every defined table, loading persisted rows if any.
    ///
    /// If any table fails to load the store stays in its defining phase
    /// with all definitions intact, so `initialize` can be retried.
    pub fn initialize(&self) -> Result<()> {
        let mut phase = self.phase.write()?;
        let Phase::Defining(schemas) = &*phase else {
            return Err(LocalStoreError::AlreadyInitialized);
        };
        if let Some(dir) = &self.location {
            std::fs::create_dir_all(dir)?;
        }

        let mut tables = HashMap::with_capacity(schemas.len());
        for (key, schema) in schemas {
            let path = self.location.as_ref().map(|dir| dir.join(format!("{key}.ipc")));
            let table = Table::load(schema.clone(), path)?;
            tables.insert(key.clone(), Mutex::new(table));
        }
        log::info!(
            "Initialized local store with {} table(s){}",
            tables.len(),
            self.location
                .as_ref()
                .map(|d| format!(" at {}", d.display()))
                .unwrap_or_default()
        );
        *phase = Phase::Initialized(tables);
        Ok(())
    }

    fn with_table<R>(&self, name: &str, f: impl FnOnce(&mut Table) -> Result<R>) -> Result<R> {
        let phase = self.phase.read()?;
        let Phase::Initialized(tables) = &*phase else {
            return Err(LocalStoreError::NotInitialized);
        };
        let table = tables
            .get(&normalize(name))
            .ok_or_else(|| LocalStoreError::UnknownTable(name.to_string()))?;
        let mut guard = table.lock()?;
        f(&mut guard)
    }

    fn query_table<'q>(query: &'q Query) -> Result<&'q str> {
        query.table_name().ok_or(LocalStoreError::MissingTable)
    }

    /// Schema of an initialized table
    pub fn schema(&self, table: &str) -> Result<TableSchema> {
        self.with_table(table, |t| Ok(t.schema().clone()))
    }

    // ============ Writes ============

    /// Insert or replace one item by its `id`
    pub fn upsert(&self, table: &str, item: &Value) -> Result<()> {
        self.upsert_many(table, std::slice::from_ref(item), false)
            .map(|_| ())
    }

    /// Insert or replace a batch of items.
    ///
    /// Items coming from the server may carry properties the local schema
    /// does not know; `from_server` drops those instead of failing.
    pub fn upsert_many(&self, table: &str, items: &[Value], from_server: bool) -> Result<usize> {
        self.with_table(table, |t| t.upsert(items, from_server))
    }

    /// Delete one row by id; returns whether a row was removed
    pub fn delete(&self, table: &str, id: &str) -> Result<bool> {
        let ids = HashSet::from([id.to_string()]);
        self.with_table(table, |t| t.delete_ids(&ids)).map(|n| n > 0)
    }

    pub fn delete_many<I, S>(&self, table: &str, ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: HashSet<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
        self.with_table(table, |t| t.delete_ids(&ids))
    }

    /// Delete every row matching the query's filter (all rows without one)
    pub fn delete_query(&self, query: &Query) -> Result<usize> {
        self.with_table(Self::query_table(query)?, |t| t.delete_matching(query))
    }

    // ============ Reads ============

    pub fn lookup(&self, table: &str, id: &str) -> Result<Option<Row>> {
        self.with_table(table, |t| t.lookup(id))
    }

    /// Run a query: filter, order, skip, top, then project
    pub fn read(&self, query: &Query) -> Result<ReadResult> {
        self.with_table(Self::query_table(query)?, |t| t.read(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todo_store() -> LocalStore {
        let store = LocalStore::in_memory();
        store
            .define_table(
                "todo",
                [("text", ColumnType::String), ("complete", ColumnType::Boolean)],
            )
            .unwrap();
        store
    }

    #[test]
    fn lifecycle_states() {
        let store = LocalStore::in_memory();
        assert_eq!(store.state().unwrap(), StoreState::Uninitialized);
        store
            .define_table("todo", [("text", ColumnType::String)])
            .unwrap();
        assert_eq!(store.state().unwrap(), StoreState::Defining);
        store.initialize().unwrap();
        assert_eq!(store.state().unwrap(), StoreState::Initialized);
    }

    #[test]
    fn data_operations_need_initialize() {
        let store = todo_store();
        let err = store.lookup("todo", "1").unwrap_err();
        assert!(matches!(err, LocalStoreError::NotInitialized));
        let err = store.upsert("todo", &json!({"id": "1"})).unwrap_err();
        assert!(matches!(err, LocalStoreError::NotInitialized));
    }

    #[test]
    fn redefinition_merges_columns() {
        let store = todo_store();
        store
            .define_table("TODO", [("due", ColumnType::Date)])
            .unwrap();
        store.initialize().unwrap();
        let schema = store.schema("todo").unwrap();
        let names: Vec<_> = schema.columns().map(|c| c.key.as_str()).collect();
        assert_eq!(names, ["id", "text", "complete", "due"]);
    }

    #[test]
    fn unknown_table() {
        let store = todo_store();
        store.initialize().unwrap();
        let err = store.lookup("nope", "1").unwrap_err();
        assert!(matches!(err, LocalStoreError::UnknownTable(ref t) if t == "nope"));
    }

    #[test]
    fn poisoned_locks_are_store_errors() {
        let store = std::sync::Arc::new(todo_store());
        store.initialize().unwrap();

        // A writer that panics mid-operation poisons its table
        let s = std::sync::Arc::clone(&store);
        let joined = std::thread::spawn(move || {
            s.with_table("todo", |_| -> Result<()> { panic!("writer died") })
        })
        .join();
        assert!(joined.is_err());
        let err = store.lookup("todo", "1").unwrap_err();
        assert!(matches!(err, LocalStoreError::Poisoned(_)));

        // Panicking under the phase write lock poisons the whole store
        let s = std::sync::Arc::clone(&store);
        let joined: std::thread::Result<()> = std::thread::spawn(move || {
            let _phase = s.phase.write();
            panic!("lifecycle died");
        })
        .join();
        assert!(joined.is_err());
        assert!(matches!(store.state(), Err(LocalStoreError::Poisoned(_))));
    }

    #[test]
    fn read_needs_a_table_name() {
        let store = todo_store();
        store.initialize().unwrap();
        let err = store.read(&Query::new()).unwrap_err();
        assert!(matches!(err, LocalStoreError::MissingTable));
    }
}
