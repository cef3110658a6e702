//! Paged and incremental pulls
//!
//! A pull asks for pages of [`PAGE_SIZE`] rows until the service returns a
//! short page or the caller's `top` is used up. An incremental pull also
//! orders by `__updatedAt` and remembers the newest timestamp it has seen,
//! so the next pull with the same query id only asks for newer rows.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use super::{Result, SyncError};
use crate::ast::parse_timestamp;
use crate::query::{Query, QueryOrder};
use crate::remote::ServiceError;
use crate::render::DATE_FORMAT;
use crate::store::{ColumnType, LocalStore};

pub(crate) const PAGE_SIZE: u32 = 50;
pub(crate) const PULL_STATE_TABLE: &str = "__incrementalpulldata";

const UPDATED_AT: &str = "__updatedAt";
const DELETED: &str = "__deleted";
const INCLUDE_DELETED: &str = "__includeDeleted";
const SYSTEM_PROPERTIES: &str = "__systemproperties";
const PULLED_PROPERTIES: &str = "__createdAt,__updatedAt,__version,__deleted";

pub(crate) fn define_table(store: &LocalStore) -> Result<()> {
    store.define_system_table(
        PULL_STATE_TABLE,
        [("tablename", ColumnType::String), ("maxupdateddate", ColumnType::Date)],
    )?;
    Ok(())
}

struct Incremental {
    table: String,
    key: String,
    token: Option<DateTime<Utc>>,
}

pub(crate) struct PullStrategy {
    /// Caller's filter, ordering and parameters, without paging
    base: Query,
    skip: u32,
    remaining: Option<u32>,
    incremental: Option<Incremental>,
}

impl PullStrategy {
    pub(crate) fn new(
        query: &Query,
        table: &str,
        query_id: Option<&str>,
        store: &LocalStore,
    ) -> Result<Self> {
        query.filter()?;
        let modifiers = query.modifiers();
        if !modifiers.select.is_empty() {
            return Err(SyncError::InvalidPullQuery("pull queries cannot select columns"));
        }
        let reserved = modifiers.parameters.iter().any(|(key, _)| {
            key.eq_ignore_ascii_case(INCLUDE_DELETED) || key.eq_ignore_ascii_case(SYSTEM_PROPERTIES)
        });
        if reserved {
            return Err(SyncError::InvalidPullQuery(
                "__includeDeleted and __systemproperties are set by the pull",
            ));
        }

        let mut base = query.clone();
        let modifiers = base.modifiers_mut();
        modifiers.inline_count = false;
        let skip = modifiers.skip.take().unwrap_or(0);
        let remaining = modifiers.top.take();

        let incremental = match query_id {
            None => None,
            Some(id) => {
                if id.trim().is_empty() {
                    return Err(SyncError::InvalidPullQuery("query id cannot be empty"));
                }
                if !base.modifiers().order_by.is_empty() {
                    return Err(SyncError::InvalidPullQuery(
                        "incremental pulls cannot order results",
                    ));
                }
                if skip > 0 || remaining.is_some() {
                    return Err(SyncError::InvalidPullQuery(
                        "incremental pulls cannot use skip or top",
                    ));
                }
                let key = format!("{table}_{id}");
                let token = load_token(store, &key)?;
                log::debug!("Incremental pull {key} resumes from {token:?}");
                Some(Incremental {
                    table: table.to_string(),
                    key,
                    token,
                })
            }
        };
        Ok(Self {
            base,
            skip,
            remaining,
            incremental,
        })
    }

    fn page_size(&self) -> u32 {
        self.remaining.map_or(PAGE_SIZE, |r| r.min(PAGE_SIZE))
    }

    /// The request for the next page
    pub(crate) fn page_query(&self) -> Result<Query> {
        let query = match &self.incremental {
            None => self.base.clone(),
            Some(Incremental { token, .. }) => {
                let query = match token {
                    Some(token) => updated_since(&self.base, *token)?,
                    None => self.base.clone(),
                };
                query.order_by(UPDATED_AT, QueryOrder::Ascending)
            }
        };
        Ok(query
            .skip(self.skip)
            .top(self.page_size())
            .parameter(INCLUDE_DELETED, Some("true"))
            .parameter(SYSTEM_PROPERTIES, Some(PULLED_PROPERTIES)))
    }

    /// Account for a received page; returns whether another page is needed
    pub(crate) fn advance(&mut self, page: &[Value], store: &LocalStore) -> Result<bool> {
        let requested = self.page_size();
        let received = u32::try_from(page.len()).unwrap_or(u32::MAX);
        if let Some(remaining) = &mut self.remaining {
            *remaining = remaining.saturating_sub(received);
        }
        let more = received >= requested && self.remaining != Some(0);

        match &mut self.incremental {
            Some(incremental) => {
                let newest = page.iter().filter_map(updated_at).max();
                match newest {
                    Some(newest) if incremental.token.is_none_or(|token| newest > token) => {
                        save_token(store, incremental, newest)?;
                        incremental.token = Some(newest);
                        self.skip = 0;
                    }
                    _ => self.skip += received,
                }
            }
            None => self.skip += received,
        }
        Ok(more)
    }
}

/// `(<filter>) and __updatedAt ge <token>`, or just the token comparison
fn updated_since(base: &Query, token: DateTime<Utc>) -> Result<Query> {
    let query = match base.filter()? {
        Some(filter) => base.clone().where_with(filter.clone()).and(),
        None => base.clone(),
    };
    Ok(query.field(UPDATED_AT).ge().val(token))
}

fn updated_at(item: &Value) -> Option<DateTime<Utc>> {
    item.as_object()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(UPDATED_AT))
        .and_then(|(_, value)| value.as_str())
        .and_then(parse_timestamp)
}

fn load_token(store: &LocalStore, key: &str) -> Result<Option<DateTime<Utc>>> {
    let row = store.lookup(PULL_STATE_TABLE, key)?;
    Ok(row
        .as_ref()
        .and_then(|row| row.get("maxupdateddate"))
        .and_then(Value::as_str)
        .and_then(parse_timestamp))
}

fn save_token(store: &LocalStore, incremental: &Incremental, token: DateTime<Utc>) -> Result<()> {
    let row = json!({
        "id": incremental.key,
        "tablename": incremental.table,
        "maxupdateddate": token.format(DATE_FORMAT).to_string(),
    });
    store.upsert(PULL_STATE_TABLE, &row)?;
    Ok(())
}

/// Drop every incremental position recorded for `table`
pub(crate) fn forget_tokens(store: &LocalStore, table: &str) -> Result<usize> {
    let query = Query::table(PULL_STATE_TABLE).field("tablename").eq().val(table);
    Ok(store.delete_query(&query)?)
}

/// Rows of one response page: a bare array or `{"results": [...]}`
pub(crate) fn page_elements(response: Value) -> Result<Vec<Value>> {
    match response {
        Value::Array(items) => Ok(items),
        Value::Object(mut object) => match object.remove("results") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(malformed()),
        },
        _ => Err(malformed()),
    }
}

fn malformed() -> SyncError {
    ServiceError::MalformedResponse("pull response is not an array of items".to_string()).into()
}

/// Write one page into the store: deleted rows are removed, the rest upserted.
/// Elements without an id are skipped.
pub(crate) fn apply_page(store: &LocalStore, table: &str, page: &[Value]) -> Result<usize> {
    let mut upserts = Vec::new();
    let mut deleted = Vec::new();
    for element in page {
        let id = match element.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                log::warn!("Skipping pulled element of {table} without an id");
                continue;
            }
        };
        if element.get(DELETED).and_then(Value::as_bool).unwrap_or(false) {
            deleted.push(id);
        } else {
            upserts.push(element.clone());
        }
    }
    if !upserts.is_empty() {
        store.upsert_many(table, &upserts, true)?;
    }
    if !deleted.is_empty() {
        store.delete_many(table, &deleted)?;
    }
    Ok(upserts.len() + deleted.len())
}
