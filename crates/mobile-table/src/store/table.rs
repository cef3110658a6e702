//! One local table: a schema plus the frame holding its rows
//!
//! Rows keep insertion order. Replacing a row removes it and appends the
//! new version at the end, the same way an `INSERT OR REPLACE` assigns a
//! fresh row position.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::PathBuf;

use indexmap::IndexMap;
use polars::prelude::*;
use serde_json::{Map, Number, Value};

use super::schema::{ColumnDef, ColumnType, ID_COLUMN, TableSchema, normalize};
use super::{LocalStoreError, ReadResult};
use crate::ast::parse_timestamp;
use crate::eval::compile_filter;
use crate::query::Query;
use crate::render::DATE_FORMAT;

type Result<T> = std::result::Result<T, LocalStoreError>;

/// A JSON row keyed by declared column names
pub type Row = Map<String, Value>;

/// One coerced value, ready for its physical column
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Text(String),
    Number(f64),
    Flag(i64),
    Null,
}

pub(crate) struct Table {
    schema: TableSchema,
    df: DataFrame,
    path: Option<PathBuf>,
}

impl Table {
    /// Open a table, loading its rows from `path` when the file exists
    pub(crate) fn load(schema: TableSchema, path: Option<PathBuf>) -> Result<Self> {
        let df = match &path {
            Some(p) if p.exists() => {
                let stored = IpcReader::new(File::open(p)?).finish()?;
                log::info!(
                    "Loaded {} rows for table {} from {}",
                    stored.height(),
                    schema.name(),
                    p.display()
                );
                reconcile(&schema, stored)?
            }
            _ => empty_frame(&schema)?,
        };
        Ok(Self { schema, df, path })
    }

    pub(crate) fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Write `df` to disk, then make it the table's contents. The frame in
    /// memory only changes once the file is in place.
    fn commit(&mut self, df: DataFrame) -> Result<()> {
        if let Some(path) = &self.path {
            let tmp = path.with_extension("ipc.tmp");
            let mut file = File::create(&tmp)?;
            IpcWriter::new(&mut file).finish(&mut df.clone())?;
            fs::rename(&tmp, path)?;
        }
        self.df = df;
        Ok(())
    }

    // ============ Writes ============

    /// Insert or replace rows by id.
    ///
    /// With `from_server`, properties without a matching column are ignored
    /// instead of rejected.
    pub(crate) fn upsert(&mut self, items: &[Value], from_server: bool) -> Result<usize> {
        // Later duplicates win and move to the end
        let mut batch: IndexMap<String, Vec<Cell>> = IndexMap::new();
        for item in items {
            let (id, cells) = self.coerce_item(item, from_server)?;
            batch.shift_remove(&id);
            batch.insert(id, cells);
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let mut columns = Vec::new();
        for (index, def) in self.schema.columns().enumerate() {
            let cells = batch.values().map(|row| &row[index]);
            columns.push(build_column(def, cells));
        }
        let incoming = DataFrame::new(columns)?;

        let keep = self.id_mask(|id| !batch.contains_key(id))?;
        let mut df = self.df.filter(&keep)?;
        df.vstack_mut(&incoming)?;
        df.as_single_chunk_par();
        self.commit(df)?;

        log::debug!("Upserted {} rows into {}", batch.len(), self.schema.name());
        Ok(batch.len())
    }

    pub(crate) fn delete_ids(&mut self, ids: &HashSet<String>) -> Result<usize> {
        let keep = self.id_mask(|id| !ids.contains(id))?;
        let remaining = self.df.filter(&keep)?;
        self.finish_delete(remaining)
    }

    pub(crate) fn delete_matching(&mut self, query: &Query) -> Result<usize> {
        let remaining = match query.filter()? {
            Some(filter) => {
                let predicate = compile_filter(filter, &self.schema)?;
                self.df
                    .clone()
                    .lazy()
                    .filter(predicate.fill_null(lit(false)).not())
                    .collect()?
            }
            None => empty_frame(&self.schema)?,
        };
        self.finish_delete(remaining)
    }

    fn finish_delete(&mut self, remaining: DataFrame) -> Result<usize> {
        let removed = self.df.height() - remaining.height();
        if removed > 0 {
            self.commit(remaining)?;
        }
        log::debug!("Deleted {} rows from {}", removed, self.schema.name());
        Ok(removed)
    }

    /// Row mask over the id column; rows without an id are kept
    fn id_mask(&self, keep: impl Fn(&str) -> bool) -> Result<BooleanChunked> {
        let ids = self.df.column(ID_COLUMN)?.str()?;
        Ok(ids
            .into_iter()
            .map(|id| Some(id.is_none_or(&keep)))
            .collect())
    }

    fn coerce_item(&self, item: &Value, from_server: bool) -> Result<(String, Vec<Cell>)> {
        let Value::Object(object) = item else {
            return Err(LocalStoreError::NotAnObject);
        };
        let mut cells = vec![Cell::Null; self.schema.columns().count()];
        let mut id = None;
        for (key, value) in object {
            let normalized = normalize(key);
            let found = self
                .schema
                .columns()
                .enumerate()
                .find(|(_, c)| c.key == normalized);
            let Some((index, def)) = found else {
                if from_server {
                    log::warn!(
                        "Skipping property {} with no column in {}",
                        key,
                        self.schema.name()
                    );
                    continue;
                }
                return Err(LocalStoreError::UnknownColumn {
                    table: self.schema.name().to_string(),
                    column: key.clone(),
                });
            };
            if normalized == ID_COLUMN {
                id = match value {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                };
            }
            cells[index] = coerce(def, value)?;
        }
        let id = id.ok_or(LocalStoreError::MissingId)?;
        cells[0] = Cell::Text(id.clone());
        Ok((id, cells))
    }

    // ============ Reads ============

    pub(crate) fn lookup(&self, id: &str) -> Result<Option<Row>> {
        let found = self
            .df
            .clone()
            .lazy()
            .filter(col(ID_COLUMN).eq(lit(id.to_string())))
            .limit(1)
            .collect()?;
        let columns: Vec<&ColumnDef> = self.schema.columns().collect();
        Ok(to_rows(&found, &columns)?.into_iter().next())
    }

    /// Filter, then order, then skip and take, then project
    pub(crate) fn read(&self, query: &Query) -> Result<ReadResult> {
        let mut lf = self.df.clone().lazy();
        if let Some(filter) = query.filter()? {
            lf = lf.filter(compile_filter(filter, &self.schema)?);
        }
        let matched = lf.collect()?;
        let modifiers = query.modifiers();
        let count = modifiers.inline_count.then(|| matched.height());

        let mut lf = matched.lazy();
        if !modifiers.order_by.is_empty() {
            let mut by = Vec::with_capacity(modifiers.order_by.len());
            let mut descending = Vec::with_capacity(modifiers.order_by.len());
            for (field, order) in &modifiers.order_by {
                by.push(self.schema.require(field)?.key.clone());
                descending.push(order.is_descending());
            }
            let opts = SortMultipleOptions::new()
                .with_order_descending_multi(descending.clone())
                .with_nulls_last_multi(descending)
                .with_maintain_order(true);
            lf = lf.sort(&by, opts);
        }
        if modifiers.skip.is_some() || modifiers.top.is_some() {
            let offset = modifiers.skip.unwrap_or(0) as i64;
            let len = modifiers.top.map_or(IdxSize::MAX, |n| n as IdxSize);
            lf = lf.slice(offset, len);
        }

        let projection: Vec<&ColumnDef> = if modifiers.select.is_empty() {
            self.schema.columns().collect()
        } else {
            modifiers
                .select
                .iter()
                .map(|name| self.schema.require(name))
                .collect::<Result<_>>()?
        };
        let exprs: Vec<_> = projection.iter().map(|c| col(c.key.as_str())).collect();
        let page = lf.select(exprs).collect()?;

        Ok(ReadResult {
            rows: to_rows(&page, &projection)?,
            count,
        })
    }
}

// ============ Frames ============

fn empty_frame(schema: &TableSchema) -> Result<DataFrame> {
    let columns = schema
        .columns()
        .map(|c| Column::full_null(c.key.as_str().into(), 0, &c.ty.dtype()))
        .collect();
    Ok(DataFrame::new(columns)?)
}

/// Align a stored frame with the declared schema
fn reconcile(schema: &TableSchema, stored: DataFrame) -> Result<DataFrame> {
    let height = stored.height();
    let mut columns = Vec::new();
    for def in schema.columns() {
        let dtype = def.ty.dtype();
        let column = match stored.column(&def.key) {
            Ok(existing) => existing.cast(&dtype)?,
            Err(_) => {
                log::warn!(
                    "Stored table {} has no column {}; filling with nulls",
                    schema.name(),
                    def.name
                );
                Column::full_null(def.key.as_str().into(), height, &dtype)
            }
        };
        columns.push(column);
    }
    Ok(DataFrame::new(columns)?)
}

fn build_column<'a>(def: &ColumnDef, cells: impl Iterator<Item = &'a Cell>) -> Column {
    let name: PlSmallStr = def.key.as_str().into();
    match def.ty {
        ColumnType::Number => {
            let values: Vec<Option<f64>> = cells
                .map(|c| match c {
                    Cell::Number(n) => Some(*n),
                    Cell::Flag(n) => Some(*n as f64),
                    _ => None,
                })
                .collect();
            Column::new(name, values)
        }
        ColumnType::Boolean => {
            let values: Vec<Option<i64>> = cells
                .map(|c| match c {
                    Cell::Flag(n) => Some(*n),
                    _ => None,
                })
                .collect();
            Column::new(name, values)
        }
        ColumnType::String | ColumnType::Date | ColumnType::Other => {
            let values: Vec<Option<String>> = cells
                .map(|c| match c {
                    Cell::Text(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            Column::new(name, values)
        }
    }
}

fn to_rows(df: &DataFrame, columns: &[&ColumnDef]) -> Result<Vec<Row>> {
    let mut rows = vec![Row::new(); df.height()];
    for def in columns {
        let column = df.column(&def.key)?;
        match def.ty {
            ColumnType::Number => {
                for (row, value) in rows.iter_mut().zip(column.f64()?.into_iter()) {
                    let json = value
                        .and_then(Number::from_f64)
                        .map_or(Value::Null, Value::Number);
                    row.insert(def.name.clone(), json);
                }
            }
            ColumnType::Boolean => {
                for (row, value) in rows.iter_mut().zip(column.i64()?.into_iter()) {
                    row.insert(def.name.clone(), value.map_or(Value::Null, |n| Value::Bool(n > 0)));
                }
            }
            ColumnType::Other => {
                for (row, value) in rows.iter_mut().zip(column.str()?.into_iter()) {
                    let json = value.map_or(Value::Null, |s| {
                        serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string()))
                    });
                    row.insert(def.name.clone(), json);
                }
            }
            ColumnType::String | ColumnType::Date => {
                for (row, value) in rows.iter_mut().zip(column.str()?.into_iter()) {
                    let json = value.map_or(Value::Null, |s| Value::String(s.to_string()));
                    row.insert(def.name.clone(), json);
                }
            }
        }
    }
    Ok(rows)
}

// ============ Coercion ============

fn coerce(def: &ColumnDef, value: &Value) -> Result<Cell> {
    let mismatch = || LocalStoreError::TypeMismatch {
        column: def.name.clone(),
        expected: def.ty,
        value: value.to_string(),
    };
    if value.is_null() {
        return Ok(Cell::Null);
    }
    let cell = match def.ty {
        ColumnType::String => match value {
            Value::String(s) => Cell::Text(s.clone()),
            other => Cell::Text(other.to_string()),
        },
        ColumnType::Other => Cell::Text(value.to_string()),
        ColumnType::Number => match value {
            Value::Number(n) => Cell::Number(n.as_f64().ok_or_else(mismatch)?),
            Value::Bool(b) => Cell::Number(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => Cell::Number(s.trim().parse().map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        },
        ColumnType::Boolean => match value {
            Value::Bool(b) => Cell::Flag(*b as i64),
            Value::Number(n) => Cell::Flag((n.as_f64().ok_or_else(mismatch)? != 0.0) as i64),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Cell::Flag(1),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Cell::Flag(0),
            _ => return Err(mismatch()),
        },
        ColumnType::Date => match value {
            Value::String(s) => Cell::Text(normalize_date(s)),
            Value::Number(n) => {
                let millis = n.as_i64().ok_or_else(mismatch)?;
                let date = chrono::DateTime::from_timestamp_millis(millis).ok_or_else(mismatch)?;
                Cell::Text(date.format(DATE_FORMAT).to_string())
            }
            _ => return Err(mismatch()),
        },
    };
    Ok(cell)
}

/// Canonical UTC text for parseable timestamps; anything else is kept as is
fn normalize_date(s: &str) -> String {
    match parse_timestamp(s) {
        Some(date) => date.format(DATE_FORMAT).to_string(),
        None => s.to_string(),
    }
}
