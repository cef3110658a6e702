//! Persisted queue of local operations waiting to be pushed
//!
//! An item has at most one pending operation. A later operation on the same
//! item either folds into the queued one or is refused, see [`Collapse`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use super::{Result, SyncError};
use crate::ast::parse_timestamp;
use crate::query::{Query, QueryOrder};
use crate::render::DATE_FORMAT;
use crate::store::{ColumnType, LocalStore, Row};

pub(crate) const OPERATIONS_TABLE: &str = "__operations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    fn code(self) -> i64 {
        match self {
            OperationKind::Insert => 0,
            OperationKind::Update => 1,
            OperationKind::Delete => 2,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(OperationKind::Insert),
            1 => Some(OperationKind::Update),
            2 => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        })
    }
}

/// A local change waiting to be sent to the service
#[derive(Debug, Clone, PartialEq)]
pub struct TableOperation {
    pub id: String,
    pub kind: OperationKind,
    /// Normalized table name
    pub table: String,
    pub item_id: String,
    pub created_at: DateTime<Utc>,
    queue_loaded_at: DateTime<Utc>,
    sequence: u64,
}

/// How a new operation combines with the one already queued for its item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Collapse {
    /// Nothing queued for the item
    Append,
    /// The queued operation already covers the new one
    KeepExisting,
    /// Insert then delete: the server never needs to hear about the item
    CancelBoth,
    /// Update then delete: only the delete is sent
    ReplaceExisting,
}

/// A fresh identifier: the clock in nanoseconds plus a process-wide counter
pub(crate) fn generate_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{nanos:016x}-{n:08x}")
}

/// Current time truncated to what the store keeps
fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

pub(crate) struct OperationQueue {
    ops: VecDeque<TableOperation>,
    loaded_at: DateTime<Utc>,
    sequence: u64,
}

impl OperationQueue {
    pub(crate) fn define_table(store: &LocalStore) -> Result<()> {
        store.define_system_table(
            OPERATIONS_TABLE,
            [
                ("kind", ColumnType::Number),
                ("tablename", ColumnType::String),
                ("itemid", ColumnType::String),
                ("__createdat", ColumnType::Date),
                ("__queueloadedat", ColumnType::Date),
                ("sequence", ColumnType::Number),
            ],
        )?;
        Ok(())
    }

    /// Read the operations persisted by earlier sessions, oldest first.
    ///
    /// Each session numbers its operations from zero and stamps them with
    /// the time it loaded the queue, so ordering by both restores the
    /// original order.
    pub(crate) fn load(store: &LocalStore) -> Result<Self> {
        let query = Query::table(OPERATIONS_TABLE)
            .order_by("__queueloadedat", QueryOrder::Ascending)
            .order_by("sequence", QueryOrder::Ascending);
        let ops = store
            .read(&query)?
            .rows
            .iter()
            .map(decode)
            .collect::<Result<VecDeque<_>>>()?;
        Ok(Self {
            ops,
            loaded_at: now(),
            sequence: 0,
        })
    }

    pub(crate) fn count_pending(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn count_pending_for(&self, table: &str) -> usize {
        self.ops.iter().filter(|op| op.table == table).count()
    }

    pub(crate) fn operations(&self) -> impl Iterator<Item = &TableOperation> {
        self.ops.iter()
    }

    pub(crate) fn peek(&self) -> Option<&TableOperation> {
        self.ops.front()
    }

    fn position(&self, table: &str, item_id: &str) -> Option<usize> {
        self.ops
            .iter()
            .position(|op| op.table == table && op.item_id == item_id)
    }

    /// Decide what a new operation does to the queue, before anything is written
    pub(crate) fn check(&self, table: &str, item_id: &str, kind: OperationKind) -> Result<Collapse> {
        let Some(index) = self.position(table, item_id) else {
            return Ok(Collapse::Append);
        };
        let existing = self.ops[index].kind;
        match (existing, kind) {
            (OperationKind::Insert | OperationKind::Update, OperationKind::Update) => {
                Ok(Collapse::KeepExisting)
            }
            (OperationKind::Insert, OperationKind::Delete) => Ok(Collapse::CancelBoth),
            (OperationKind::Update, OperationKind::Delete) => Ok(Collapse::ReplaceExisting),
            _ => Err(SyncError::OperationConflict {
                existing,
                table: table.to_string(),
                item_id: item_id.to_string(),
            }),
        }
    }

    pub(crate) fn apply(
        &mut self,
        store: &LocalStore,
        collapse: Collapse,
        table: &str,
        item_id: &str,
        kind: OperationKind,
    ) -> Result<()> {
        match collapse {
            Collapse::KeepExisting => Ok(()),
            Collapse::Append => self.append(store, table, item_id, kind),
            Collapse::CancelBoth => self.cancel(store, table, item_id),
            Collapse::ReplaceExisting => {
                self.cancel(store, table, item_id)?;
                self.append(store, table, item_id, kind)
            }
        }
    }

    fn append(&mut self, store: &LocalStore, table: &str, item_id: &str, kind: OperationKind) -> Result<()> {
        let op = TableOperation {
            id: generate_id(),
            kind,
            table: table.to_string(),
            item_id: item_id.to_string(),
            created_at: now(),
            queue_loaded_at: self.loaded_at,
            sequence: self.sequence,
        };
        store.upsert(OPERATIONS_TABLE, &encode(&op))?;
        log::debug!("Queued {} of {}/{}", kind, table, item_id);
        self.sequence += 1;
        self.ops.push_back(op);
        Ok(())
    }

    fn cancel(&mut self, store: &LocalStore, table: &str, item_id: &str) -> Result<()> {
        if let Some(index) = self.position(table, item_id) {
            store.delete(OPERATIONS_TABLE, &self.ops[index].id)?;
            if let Some(op) = self.ops.remove(index) {
                log::debug!("Cancelled queued {} of {}/{}", op.kind, table, item_id);
            }
        }
        Ok(())
    }

    /// Drop the oldest operation once the service has seen it
    pub(crate) fn dequeue(&mut self, store: &LocalStore) -> Result<Option<TableOperation>> {
        let Some(front) = self.ops.front() else {
            return Ok(None);
        };
        store.delete(OPERATIONS_TABLE, &front.id)?;
        Ok(self.ops.pop_front())
    }
}

fn encode(op: &TableOperation) -> Value {
    json!({
        "id": op.id,
        "kind": op.kind.code(),
        "tablename": op.table,
        "itemid": op.item_id,
        "__createdat": op.created_at.format(DATE_FORMAT).to_string(),
        "__queueloadedat": op.queue_loaded_at.format(DATE_FORMAT).to_string(),
        "sequence": op.sequence,
    })
}

fn decode(row: &Row) -> Result<TableOperation> {
    let code = number(row, "kind")? as i64;
    let kind = OperationKind::from_code(code)
        .ok_or_else(|| SyncError::CorruptQueue(format!("unknown operation kind {code}")))?;
    Ok(TableOperation {
        id: text(row, "id")?.to_string(),
        kind,
        table: text(row, "tablename")?.to_string(),
        item_id: text(row, "itemid")?.to_string(),
        created_at: date(row, "__createdat")?,
        queue_loaded_at: date(row, "__queueloadedat")?,
        sequence: number(row, "sequence")? as u64,
    })
}

fn text<'a>(row: &'a Row, key: &str) -> Result<&'a str> {
    row.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::CorruptQueue(format!("operation has no {key}")))
}

fn number(row: &Row, key: &str) -> Result<f64> {
    row.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| SyncError::CorruptQueue(format!("operation has no {key}")))
}

fn date(row: &Row, key: &str) -> Result<DateTime<Utc>> {
    let raw = text(row, key)?;
    parse_timestamp(raw).ok_or_else(|| SyncError::CorruptQueue(format!("bad {key}: {raw}")))
}
