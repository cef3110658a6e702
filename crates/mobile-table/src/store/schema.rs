//! Column-typed table schemas
//!
//! Table and column names are matched case-insensitively: they are trimmed
//! and lowercased on the way in, while the declared spelling is kept for
//! output rows.

use indexmap::IndexMap;
use polars::prelude::DataType;
use serde::{Deserialize, Serialize};

use super::LocalStoreError;

type Result<T> = std::result::Result<T, LocalStoreError>;

/// Declared type of a local column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    /// ISO-8601 UTC text, compared lexicographically
    Date,
    /// Objects and arrays, kept as JSON text
    Other,
}

impl ColumnType {
    /// Physical column type in the backing frame
    pub(crate) fn dtype(self) -> DataType {
        match self {
            ColumnType::String | ColumnType::Date | ColumnType::Other => DataType::String,
            ColumnType::Number => DataType::Float64,
            ColumnType::Boolean => DataType::Int64,
        }
    }
}

pub const ID_COLUMN: &str = "id";

/// System columns and the type each one must be declared with
const SYSTEM_COLUMNS: [(&str, ColumnType); 6] = [
    (ID_COLUMN, ColumnType::String),
    ("__version", ColumnType::String),
    ("__createdat", ColumnType::Date),
    ("__updatedat", ColumnType::Date),
    ("__queueloadedat", ColumnType::Date),
    ("__deleted", ColumnType::Boolean),
];

const MAX_TABLE_NAME_LEN: usize = 60;
const MAX_COLUMN_NAME_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    /// Normalized name, used as the physical column name
    pub key: String,
    /// Name as declared, used in output rows
    pub name: String,
    pub ty: ColumnType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    key: String,
    name: String,
    columns: IndexMap<String, ColumnDef>,
}

pub(crate) fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

impl TableSchema {
    /// Validate and normalize a table definition. `id` is always present
    /// and always the first column.
    pub fn new<I, K>(name: &str, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, ColumnType)>,
        K: AsRef<str>,
    {
        let key = normalize(name);
        validate_table_name(&key)?;
        Self::build(key, name, columns)
    }

    /// Bookkeeping tables owned by the crate. Their names carry the
    /// reserved `__` prefix, so they cannot collide with user tables.
    pub(crate) fn system<I, K>(name: &str, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, ColumnType)>,
        K: AsRef<str>,
    {
        let key = normalize(name);
        if !key.starts_with("__") {
            return Err(LocalStoreError::InvalidTableName {
                name: key,
                reason: "system tables must start with __",
            });
        }
        Self::build(key, name, columns)
    }

    fn build<I, K>(key: String, name: &str, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, ColumnType)>,
        K: AsRef<str>,
    {
        let mut schema = TableSchema {
            key,
            name: name.trim().to_string(),
            columns: IndexMap::new(),
        };
        schema.insert(ID_COLUMN, ColumnType::String)?;
        for (column, ty) in columns {
            schema.insert(column.as_ref(), ty)?;
        }
        Ok(schema)
    }

    fn insert(&mut self, name: &str, ty: ColumnType) -> Result<()> {
        let key = normalize(name);
        validate_column_name(&key)?;
        if let Some((_, expected)) = SYSTEM_COLUMNS.iter().find(|(n, _)| *n == key) {
            if *expected != ty {
                return Err(LocalStoreError::ReservedColumnType {
                    column: key,
                    expected: *expected,
                });
            }
        }
        let def = ColumnDef {
            key: key.clone(),
            name: name.trim().to_string(),
            ty,
        };
        self.columns.insert(key, def);
        Ok(())
    }

    /// Fold a later definition of the same table into this one
    pub(crate) fn merge(&mut self, other: TableSchema) {
        for (key, def) in other.columns {
            self.columns.insert(key, def);
        }
    }

    /// Normalized table name
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Table name as declared
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a column by any spelling of its name
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.get(&normalize(name))
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.values()
    }

    pub(crate) fn require(&self, name: &str) -> Result<&ColumnDef> {
        self.column(name).ok_or_else(|| LocalStoreError::UnknownColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }
}

fn validate_table_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(LocalStoreError::InvalidTableName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.len() > MAX_TABLE_NAME_LEN {
        return invalid("name is longer than 60 characters");
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return invalid("name must start with a letter");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return invalid("name may only contain letters, digits and underscores");
    }
    if name.starts_with("sqlite_") {
        return invalid("the sqlite_ prefix is reserved");
    }
    Ok(())
}

fn validate_column_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(LocalStoreError::InvalidColumnName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.len() > MAX_COLUMN_NAME_LEN {
        return invalid("name is longer than 128 characters");
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        return invalid("name must start with a letter or underscore");
    }
    if name.starts_with("__") && !SYSTEM_COLUMNS.iter().any(|(n, _)| *n == name) {
        return invalid("the __ prefix is reserved for system columns");
    }
    Ok(())
}
