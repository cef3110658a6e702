//! mobile-table - OData query builder and typed offline table store
//!
//! Queries are composed fluently, rendered to OData filter text and
//! row-set modifiers for the remote table service, and executed unchanged
//! against a local schema-typed store.
//!
//! ## Quick Start
//!
//! ```
//! use mobile_table::{Query, QueryOrder};
//!
//! let q = Query::table("people")
//!     .field("firstName").eq().val("John")
//!     .and().field("age").gt().val(20)
//!     .top(3)
//!     .skip(5)
//!     .order_by("Name", QueryOrder::Ascending)
//!     .select(["Id", "Name"]);
//!
//! assert_eq!(q.filter_text(), "firstName eq 'John' and age gt 20");
//! assert_eq!(q.row_set_modifiers(), "&$top=3&$skip=5&$orderby=Name+asc&$select=Id%2CName");
//! ```
//!
//! ## Local Store
//!
//! ```ignore
//! use mobile_table::{ColumnType, LocalStore, Query};
//!
//! let store = LocalStore::open("./offline");
//! store.define_table("todo", [("text", ColumnType::String), ("complete", ColumnType::Boolean)])?;
//! store.initialize()?;
//! store.upsert_many("todo", &items, true)?;
//! let page = store.read(&Query::table("todo").field("complete").eq().val(false).top(10))?;
//! ```
//!
//! ## Remote Tables
//!
//! [`RemoteTable`] renders the same queries into request URLs and sends them
//! through a [`Transport`]. Enable the `http` feature for a reqwest-backed
//! transport.
//!
//! ## Offline Sync
//!
//! [`SyncContext`] ties a local store to a remote service: local writes are
//! queued and pushed later, and pulls page server rows into the store.

mod ast;
mod eval;
mod parse;
mod query;
mod remote;
mod render;
mod store;
mod sync;

use thiserror::Error;

// ============ Primary Public API ============

pub use query::{IntoField, IntoOperand, Query, QueryError, QueryOrder, RowSetModifiers, field, val};
pub use render::{DATE_FORMAT, form_encode};

// ============ Expression Tree ============

pub use ast::{BinOp, Expr, Function, Literal, UnaryOp};
pub use parse::{ParseError, parse_filter};

// ============ Local Store ============

pub use store::{
    ColumnDef, ColumnType, LocalStore, LocalStoreError, ReadResult, Row, StoreState, TableSchema,
};

// ============ Remote Tables ============

#[cfg(feature = "http")]
pub use remote::HttpTransport;
pub use remote::{
    ClientConfig, ConfigError, FieldMapping, Method, RemoteTable, ServiceError, ServiceRequest,
    ServiceResponse, Transport, TypeMapping,
};

// ============ Offline Sync ============

pub use sync::{
    OperationError, OperationKind, PushCompletion, PushStatus, SyncContext, SyncError,
    TableOperation,
};

// ============ Errors ============

#[derive(Error, Debug)]
pub enum Error {
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Local store error: {0}")]
    Store(#[from] LocalStoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}
