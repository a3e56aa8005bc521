//! Source and destination schema models
//!
//! A [`TableSchema`] is the ordered column list the source engine reports for
//! one table. Column order is load-bearing: export files carry columns in this
//! order and the loader assigns CSV fields to destination fields by position.

use serde::{Deserialize, Serialize};

pub mod store;

pub use store::{FileSchemaStore, SchemaStore};

/// Table identifier, unique within the configured source schema
pub type TableName = String;

/// One source column as reported by the engine's catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Engine type tag, e.g. `int4`, `varchar`, `numeric`
    pub source_type: String,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<i32>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, source_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
            nullable,
            length: None,
            precision: None,
            scale: None,
        }
    }

    pub fn with_length(mut self, length: i32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_precision(mut self, precision: i32, scale: i32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
}

/// Ordered column list of one source table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: TableName,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableSchema {
    pub fn new(table: impl Into<TableName>, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// BigQuery column type produced by the type mapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    Integer,
    String,
    Date,
    Bool,
    Timestamp,
    Float64,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Integer => "INTEGER",
            FieldType::String => "STRING",
            FieldType::Date => "DATE",
            FieldType::Bool => "BOOL",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Float64 => "FLOAT64",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nullability constraint of a destination column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    Nullable,
    Required,
}

impl FieldMode {
    pub fn from_nullable(nullable: bool) -> Self {
        if nullable {
            FieldMode::Nullable
        } else {
            FieldMode::Required
        }
    }
}

/// Destination field specification
///
/// `max_length` is set only for `STRING`; `precision` and `scale` only for
/// `FLOAT64`. [`crate::typemap::map_column`] is the only producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<i32>,
}
