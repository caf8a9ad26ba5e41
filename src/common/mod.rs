// # Common Types
//
// Shared identifiers, value types and schema structures used across the
// cache, storage and store modules.

pub mod database;

pub use database::Database;

use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Unique identifier for rows within a table
pub type RowId = u64;

/// Unique identifier for pages in the data file
pub type PageId = u64;

/// Monotonic sequence number in the write-ahead log
pub type SequenceNumber = u64;

/// Transaction identifier carried by WAL entries (0 = none)
pub type TransactionId = u32;

/// Maximum length of a table name on disk (64-byte field, NUL-terminated)
pub const MAX_TABLE_NAME_LEN: usize = 63;

/// Maximum number of cache levels an engine may be configured with
pub const MAX_CACHE_LEVELS: usize = 8;

/// Current unix time in whole seconds, as stored in file headers, WAL
/// entries and cache entry timestamps.
pub fn unix_time_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Data Types and Values
// ============================================================================

/// Column data type with its on-disk wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int,
    Float,
    Varchar,
    Text,
    Bool,
}

impl DataType {
    /// Wire code used by the value and column encodings.
    pub fn code(&self) -> u32 {
        match self {
            DataType::Int => 1,
            DataType::Float => 2,
            DataType::Varchar => 3,
            DataType::Text => 4,
            DataType::Bool => 5,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(DataType::Int),
            2 => Ok(DataType::Float),
            3 => Ok(DataType::Varchar),
            4 => Ok(DataType::Text),
            5 => Ok(DataType::Bool),
            other => Err(DbError::Corruption(format!(
                "unknown data type code {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Int => "INT",
            DataType::Float => "FLOAT",
            DataType::Varchar => "VARCHAR",
            DataType::Text => "TEXT",
            DataType::Bool => "BOOL",
        };
        write!(f, "{}", s)
    }
}

/// A typed cell value.
///
/// A null cell retains the column's data type so that encoding a decoded
/// value reproduces the original bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Varchar(String),
    Text(String),
    Bool(bool),
    Null(DataType),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
            Value::Varchar(_) => DataType::Varchar,
            Value::Text(_) => DataType::Text,
            Value::Bool(_) => DataType::Bool,
            Value::Null(dt) => *dt,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }

    /// Whether this value can live in a column of the given type.
    pub fn matches(&self, data_type: DataType) -> bool {
        self.data_type() == data_type
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Varchar(s) | Value::Text(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Null(_) => write!(f, "NULL"),
        }
    }
}

// ============================================================================
// Schema Types
// ============================================================================

/// Column definition within a table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    /// Maximum payload length for Varchar columns; 0 = unbounded.
    pub max_length: u32,
    pub primary_key: bool,
    pub unique: bool,
    pub nullable: bool,
    pub is_foreign: bool,
    /// Rendered default value; empty = no default.
    pub default_value: String,
    pub foreign_table: String,
    pub foreign_column: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            max_length: 0,
            primary_key: false,
            unique: false,
            nullable: true,
            is_foreign: false,
            default_value: String::new(),
            foreign_table: String::new(),
            foreign_column: String::new(),
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.unique = true;
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn max_length(mut self, len: u32) -> Self {
        self.max_length = len;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.is_foreign = true;
        self.foreign_table = table.into();
        self.foreign_column = column.into();
        self
    }
}

/// Foreign key relationship between two tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

// ============================================================================
// Rows and Tables
// ============================================================================

/// A single table row: stable id plus one value per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(id: RowId, values: Vec<Value>) -> Self {
        Self { id, values }
    }
}

/// Equality predicate on a single column, used by update/delete/select.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub value: Value,
}

impl Condition {
    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

/// In-memory table: schema plus row storage in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    pub primary_key: String,
    pub next_row_id: RowId,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        let primary_key = columns
            .iter()
            .find(|c| c.primary_key)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
            primary_key,
            next_row_id: 1,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn find(&self, row_id: RowId) -> Option<&Row> {
        self.rows.iter().find(|r| r.id == row_id)
    }

    /// Validate a value vector against the schema: arity, types, NOT NULL,
    /// and the Varchar length cap, which is enforced here at put-time.
    pub fn validate_values(&self, values: &[Value]) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(DbError::Constraint(format!(
                "table {}: expected {} values, got {}",
                self.name,
                self.columns.len(),
                values.len()
            )));
        }
        for (col, value) in self.columns.iter().zip(values) {
            if value.is_null() {
                if !col.nullable {
                    return Err(DbError::Constraint(format!(
                        "column {}.{} is NOT NULL",
                        self.name, col.name
                    )));
                }
                continue;
            }
            if !value.matches(col.data_type) {
                return Err(DbError::Constraint(format!(
                    "column {}.{}: expected {}, got {}",
                    self.name,
                    col.name,
                    col.data_type,
                    value.data_type()
                )));
            }
            if col.data_type == DataType::Varchar && col.max_length > 0 {
                if let Value::Varchar(s) = value {
                    if s.len() > col.max_length as usize {
                        return Err(DbError::InvalidConfig(format!(
                            "column {}.{}: value length {} exceeds VARCHAR({})",
                            self.name,
                            col.name,
                            s.len(),
                            col.max_length
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Check primary-key and UNIQUE constraints against existing rows,
    /// ignoring the row with `exclude_id` (for updates).
    pub fn check_unique(&self, values: &[Value], exclude_id: RowId) -> Result<()> {
        for (idx, col) in self.columns.iter().enumerate() {
            if !col.unique || values[idx].is_null() {
                continue;
            }
            let clash = self
                .rows
                .iter()
                .any(|r| r.id != exclude_id && r.values.get(idx) == Some(&values[idx]));
            if clash {
                return Err(DbError::Constraint(format!(
                    "duplicate value for unique column {}.{}",
                    self.name, col.name
                )));
            }
        }
        Ok(())
    }

    /// Whether a row satisfies the (optional) predicate.
    pub fn matches(&self, row: &Row, condition: Option<&Condition>) -> bool {
        match condition {
            None => true,
            Some(cond) => match self.column_index(&cond.column) {
                Some(idx) => row.values.get(idx) == Some(&cond.value),
                None => false,
            },
        }
    }
}
