//! Offline sync between a [`LocalStore`] and a remote table service
//!
//! Local inserts, updates and deletes land in the store immediately and are
//! recorded in a persisted operation queue. [`SyncContext::push`] replays the
//! queue against the service in order. [`SyncContext::pull`] pages server
//! rows into the store, and [`SyncContext::purge`] drops local rows that have
//! nothing left to push.
//!
//! ```ignore
//! let store = LocalStore::open("./offline");
//! store.define_table("todo", [("text", ColumnType::String), ("__version", ColumnType::String)])?;
//! let sync = SyncContext::initialize(store, ClientConfig::new(url), HttpTransport::new())?;
//!
//! let item = sync.insert("todo", &json!({"text": "milk"})).await?;
//! sync.push().await?;
//! sync.pull_incremental(&Query::table("todo"), "all").await?;
//! ```

mod pull;
mod queue;

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::query::{Query, QueryError};
use crate::remote::{ClientConfig, ConfigError, RemoteTable, ServiceError, Transport};
use crate::store::{LocalStore, LocalStoreError, ReadResult, Row};
use pull::PullStrategy;
use queue::{OperationQueue, generate_id};

pub use queue::{OperationKind, TableOperation};

const ID_SPELLINGS: [&str; 4] = ["id", "Id", "iD", "ID"];
const MAX_ID_LEN: usize = 255;

// ============ Errors ============

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("local store error: {0}")]
    Store(#[from] LocalStoreError),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("incomplete query: {0}")]
    Query(#[from] QueryError),

    #[error("invalid item: {0}")]
    InvalidItem(&'static str),

    #[error("invalid item id '{0}'")]
    InvalidId(String),

    #[error("a queued {existing} of item {item_id} in {table} conflicts with this operation")]
    OperationConflict {
        existing: OperationKind,
        table: String,
        item_id: String,
    },

    #[error("table {0} has operations waiting to be pushed")]
    PendingOperations(String),

    #[error("invalid pull query: {0}")]
    InvalidPullQuery(&'static str),

    #[error("corrupt operation queue: {0}")]
    CorruptQueue(String),

    #[error("push failed: {0}")]
    PushFailed(PushCompletion),
}

type Result<T> = std::result::Result<T, SyncError>;

// ============ Push results ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Complete,
    /// The service could not be reached; the current operation stays queued
    CancelledByNetworkError,
    /// The service answered 401; the current operation stays queued
    CancelledByAuthenticationError,
    /// The local store failed; the current operation stays queued
    CancelledByLocalStoreError,
}

/// An operation the service rejected. It has been removed from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationError {
    pub kind: OperationKind,
    pub table: String,
    pub item_id: String,
    pub status: Option<u16>,
    pub message: String,
    pub response_body: Option<String>,
    /// Local copy of the item when the error was recorded
    pub item: Option<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushCompletion {
    pub status: PushStatus,
    pub errors: Vec<OperationError>,
}

impl fmt::Display for PushCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} with {} rejected operation(s)", self.status, self.errors.len())
    }
}

fn cancel_status(err: &SyncError) -> Option<PushStatus> {
    match err {
        SyncError::Service(ServiceError::Transport(_)) => Some(PushStatus::CancelledByNetworkError),
        SyncError::Service(ServiceError::Status { status: 401, .. }) => {
            Some(PushStatus::CancelledByAuthenticationError)
        }
        SyncError::Store(_) => Some(PushStatus::CancelledByLocalStoreError),
        _ => None,
    }
}

// ============ Context ============

/// Local store, operation queue and remote service for offline tables
pub struct SyncContext<T> {
    store: LocalStore,
    config: ClientConfig,
    transport: Arc<T>,
    queue: Mutex<OperationQueue>,
}

impl<T: Transport> SyncContext<T> {
    /// Define the sync bookkeeping tables, initialize `store` and load the
    /// operations an earlier session left queued.
    ///
    /// User tables must be defined on `store` before this is called.
    pub fn initialize(store: LocalStore, config: ClientConfig, transport: T) -> Result<Self> {
        OperationQueue::define_table(&store)?;
        pull::define_table(&store)?;
        store.initialize()?;
        let queue = OperationQueue::load(&store)?;
        if queue.count_pending() > 0 {
            log::info!("Loaded {} pending operation(s)", queue.count_pending());
        }
        Ok(Self {
            store,
            config,
            transport: Arc::new(transport),
            queue: Mutex::new(queue),
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub async fn pending_operations(&self) -> usize {
        self.queue.lock().await.count_pending()
    }

    pub async fn pending_operations_for(&self, table: &str) -> Result<usize> {
        let table = self.table_key(table)?;
        Ok(self.queue.lock().await.count_pending_for(&table))
    }

    /// Queued operations, oldest first
    pub async fn pending(&self) -> Vec<TableOperation> {
        self.queue.lock().await.operations().cloned().collect()
    }

    fn table_key(&self, table: &str) -> Result<String> {
        Ok(self.store.schema(table)?.key().to_string())
    }

    fn query_table(&self, query: &Query) -> Result<String> {
        self.table_key(query.table_name().ok_or(LocalStoreError::MissingTable)?)
    }

    fn remote(&self, table: &str) -> Result<RemoteTable<Arc<T>>> {
        let name = self.store.schema(table)?.name().to_string();
        Ok(RemoteTable::new(
            self.config.clone(),
            Arc::clone(&self.transport),
            name,
        )?)
    }

    // ============ Local operations ============

    /// Insert an item locally and queue it for the service. An item without
    /// an id gets a generated one; the stored item is returned.
    pub async fn insert(&self, table: &str, item: &Value) -> Result<Value> {
        let (id, item) = prepare_insert(item)?;
        self.record(table, &id, OperationKind::Insert, |store, table| {
            store.upsert(table, &item)
        })
        .await?;
        Ok(item)
    }

    pub async fn update(&self, table: &str, item: &Value) -> Result<()> {
        let (id, item) = prepare_update(item)?;
        self.record(table, &id, OperationKind::Update, |store, table| {
            store.upsert(table, &item)
        })
        .await
    }

    pub async fn delete(&self, table: &str, id: &str) -> Result<()> {
        validate_id(id)?;
        self.record(table, id, OperationKind::Delete, |store, table| {
            store.delete(table, id).map(|_| ())
        })
        .await
    }

    /// Check the queue, write the store, then queue. A refused operation
    /// leaves both untouched.
    async fn record<F>(&self, table: &str, item_id: &str, kind: OperationKind, write: F) -> Result<()>
    where
        F: FnOnce(&LocalStore, &str) -> std::result::Result<(), LocalStoreError>,
    {
        let table = self.table_key(table)?;
        let mut queue = self.queue.lock().await;
        let collapse = queue.check(&table, item_id, kind)?;
        write(&self.store, &table)?;
        queue.apply(&self.store, collapse, &table, item_id, kind)
    }

    pub fn read(&self, query: &Query) -> Result<ReadResult> {
        Ok(self.store.read(query)?)
    }

    pub fn lookup(&self, table: &str, id: &str) -> Result<Option<Row>> {
        Ok(self.store.lookup(table, id)?)
    }

    // ============ Push ============

    /// Send every queued operation to the service, oldest first.
    ///
    /// Operations the service rejects are dropped from the queue and
    /// reported. Network, authentication and local store failures stop the
    /// push and leave the current operation queued.
    pub async fn push(&self) -> Result<()> {
        let mut queue = self.queue.lock().await;
        self.push_queue(&mut queue).await
    }

    async fn push_queue(&self, queue: &mut OperationQueue) -> Result<()> {
        let mut status = PushStatus::Complete;
        let mut errors = Vec::new();
        let mut pushed = 0;
        while let Some(op) = queue.peek().cloned() {
            if let Err(err) = self.push_operation(&op).await {
                if let Some(cancelled) = cancel_status(&err) {
                    log::warn!(
                        "Push stopped at {} of {}/{}: {}",
                        op.kind,
                        op.table,
                        op.item_id,
                        err
                    );
                    status = cancelled;
                    break;
                }
                log::warn!("Service rejected {} of {}/{}: {}", op.kind, op.table, op.item_id, err);
                errors.push(self.operation_error(&op, err));
            }
            queue.dequeue(&self.store)?;
            pushed += 1;
        }
        log::info!("Pushed {pushed} operation(s), {} rejected", errors.len());
        if status == PushStatus::Complete && errors.is_empty() {
            Ok(())
        } else {
            Err(SyncError::PushFailed(PushCompletion { status, errors }))
        }
    }

    async fn push_operation(&self, op: &TableOperation) -> Result<()> {
        let remote = self.remote(&op.table)?;
        if op.kind == OperationKind::Delete {
            return match remote.delete(&op.item_id).await {
                // already gone on the server
                Ok(()) | Err(ServiceError::Status { status: 404, .. }) => Ok(()),
                Err(err) => Err(err.into()),
            };
        }

        let Some(item) = self.store.lookup(&op.table, &op.item_id)? else {
            log::warn!(
                "Item {}/{} is gone locally, skipping its {}",
                op.table,
                op.item_id,
                op.kind
            );
            return Ok(());
        };
        let result = match op.kind {
            OperationKind::Insert => remote.insert(&outgoing(item, false)).await?,
            _ => remote.update(&outgoing(item, true)).await?,
        };
        if matches!(result.get("id"), Some(Value::String(_) | Value::Number(_))) {
            self.store
                .upsert_many(&op.table, std::slice::from_ref(&result), true)?;
        }
        Ok(())
    }

    fn operation_error(&self, op: &TableOperation, err: SyncError) -> OperationError {
        let (status, response_body) = match &err {
            SyncError::Service(ServiceError::Status { status, body }) => {
                (Some(*status), Some(body.clone()))
            }
            _ => (None, None),
        };
        OperationError {
            kind: op.kind,
            table: op.table.clone(),
            item_id: op.item_id.clone(),
            status,
            message: err.to_string(),
            response_body,
            item: self.store.lookup(&op.table, &op.item_id).ok().flatten(),
        }
    }

    // ============ Pull and purge ============

    /// Page the query's rows from the service into the local table.
    ///
    /// Pending operations on the table are pushed first. Rows the service
    /// reports as deleted are removed locally. Returns the number of rows
    /// written or removed.
    pub async fn pull(&self, query: &Query) -> Result<usize> {
        self.pull_with(query, None).await
    }

    /// Like [`pull`](Self::pull), but only asks for rows updated since the
    /// last pull with the same `query_id`. The query may not order, skip or
    /// take rows.
    pub async fn pull_incremental(&self, query: &Query, query_id: &str) -> Result<usize> {
        self.pull_with(query, Some(query_id)).await
    }

    async fn pull_with(&self, query: &Query, query_id: Option<&str>) -> Result<usize> {
        let table = self.query_table(query)?;
        let mut strategy = PullStrategy::new(query, &table, query_id, &self.store)?;
        let remote = self.remote(&table)?;

        let mut queue = self.queue.lock().await;
        if queue.count_pending_for(&table) > 0 {
            log::info!("Pushing pending operations before pulling {table}");
            self.push_queue(&mut queue).await?;
        }

        let mut received = 0;
        loop {
            let response = remote.read(&strategy.page_query()?).await?;
            let page = pull::page_elements(response)?;
            received += pull::apply_page(&self.store, &table, &page)?;
            if !strategy.advance(&page, &self.store)? {
                break;
            }
        }
        log::info!("Pulled {received} row(s) into {table}");
        Ok(received)
    }

    /// Delete local rows matching the query without telling the service.
    ///
    /// Refused while the table has pending operations. Purging a whole table
    /// also forgets its incremental pull positions.
    pub async fn purge(&self, query: &Query) -> Result<usize> {
        let table = self.query_table(query)?;
        let unfiltered = query.filter()?.is_none();
        let queue = self.queue.lock().await;
        if queue.count_pending_for(&table) > 0 {
            return Err(SyncError::PendingOperations(table));
        }
        let removed = self.store.delete_query(query)?;
        if unfiltered {
            pull::forget_tokens(&self.store, &table)?;
        }
        log::info!("Purged {removed} row(s) from {table}");
        Ok(removed)
    }
}

// ============ Items ============

/// Item body sent to the service. System properties are dropped, except
/// `__version` on updates.
fn outgoing(item: Row, keep_version: bool) -> Value {
    let body: Map<String, Value> = item
        .into_iter()
        .filter(|(key, value)| {
            !key.starts_with("__") || (keep_version && key == "__version" && !value.is_null())
        })
        .collect();
    Value::Object(body)
}

fn id_property(object: &Map<String, Value>) -> Result<Option<&'static str>> {
    let mut found = ID_SPELLINGS.into_iter().filter(|key| object.contains_key(*key));
    let first = found.next();
    if found.next().is_some() {
        return Err(SyncError::InvalidItem("item has more than one id property"));
    }
    Ok(first)
}

/// Normalize the id property to `id`, generating one when it is missing
fn prepare_insert(item: &Value) -> Result<(String, Value)> {
    let Value::Object(object) = item else {
        return Err(SyncError::InvalidItem("item must be a JSON object"));
    };
    let mut object = object.clone();
    let id = match id_property(&object)?.and_then(|key| object.remove(key)) {
        None | Some(Value::Null) => generate_id(),
        Some(Value::String(id)) => {
            validate_id(&id)?;
            id
        }
        Some(_) => return Err(SyncError::InvalidItem("id must be a string")),
    };
    object.insert("id".to_string(), Value::String(id.clone()));
    Ok((id, Value::Object(object)))
}

fn prepare_update(item: &Value) -> Result<(String, Value)> {
    let Value::Object(object) = item else {
        return Err(SyncError::InvalidItem("item must be a JSON object"));
    };
    let mut object = object.clone();
    let id = match id_property(&object)?.and_then(|key| object.remove(key)) {
        Some(Value::String(id)) => {
            validate_id(&id)?;
            id
        }
        _ => return Err(SyncError::InvalidItem("item needs a string id")),
    };
    object.insert("id".to_string(), Value::String(id.clone()));
    Ok((id, Value::Object(object)))
}

fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.chars().count() <= MAX_ID_LEN
        && id != "."
        && id != ".."
        && !id
            .chars()
            .any(|c| c.is_control() || matches!(c, '"' | '+' | '/' | '?' | '\\' | '`'));
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_rules() {
        let long = "x".repeat(256);
        for bad in ["", ".", "..", "a/b", "a+b", "a?b", "a\"b", "a\\b", "a`b", "a\nb", long.as_str()] {
            assert!(matches!(validate_id(bad), Err(SyncError::InvalidId(_))), "{bad:?}");
        }
        for good in ["abc", "a.b", "ünïcode", "x".repeat(255).as_str()] {
            assert!(validate_id(good).is_ok(), "{good}");
        }
    }

    #[test]
    fn insert_ids_are_normalized_or_generated() {
        let (id, item) = prepare_insert(&json!({"ID": "abc", "text": "t"})).unwrap();
        assert_eq!(id, "abc");
        assert_eq!(item, json!({"id": "abc", "text": "t"}));

        let (generated, item) = prepare_insert(&json!({"id": null, "text": "t"})).unwrap();
        assert!(!generated.is_empty());
        assert_eq!(item["id"], json!(generated));

        let (_, item) = prepare_insert(&json!({"text": "t"})).unwrap();
        assert!(item["id"].is_string());
    }

    #[test]
    fn malformed_items_are_refused() {
        assert!(matches!(
            prepare_insert(&json!({"id": "a", "Id": "b"})),
            Err(SyncError::InvalidItem(_))
        ));
        assert!(matches!(prepare_insert(&json!({"id": 5})), Err(SyncError::InvalidItem(_))));
        assert!(matches!(prepare_insert(&json!([1])), Err(SyncError::InvalidItem(_))));
        assert!(matches!(prepare_update(&json!({"text": "t"})), Err(SyncError::InvalidItem(_))));
        assert!(matches!(prepare_update(&json!({"id": "a/b"})), Err(SyncError::InvalidId(_))));
    }

    #[test]
    fn outgoing_items_drop_system_properties() {
        let mut row = Row::new();
        row.insert("id".into(), json!("a"));
        row.insert("text".into(), json!("t"));
        row.insert("__version".into(), json!("v1"));
        row.insert("__updatedAt".into(), json!("2024-01-01T00:00:00.000Z"));
        assert_eq!(outgoing(row.clone(), false), json!({"id": "a", "text": "t"}));
        assert_eq!(outgoing(row, true), json!({"id": "a", "text": "t", "__version": "v1"}));
    }
}
