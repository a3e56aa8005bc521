//! Type mapping between Redshift and BigQuery.
//!
//! The recognized source tags are a closed set. Anything else stops the run:
//! guessing a type would silently corrupt the destination schema.

use crate::error::{MigrateError, Result};
use crate::schema::{ColumnDescriptor, DestinationField, FieldMode, FieldType, TableSchema};

/// Source type tags the mapper accepts, in the order they are documented.
pub const SUPPORTED_SOURCE_TYPES: [&str; 8] = [
    "int2",
    "int4",
    "varchar",
    "bpchar",
    "date",
    "bool",
    "timestamp",
    "numeric",
];

/// Resolve the BigQuery type for a Redshift type tag.
pub fn destination_type(source_type: &str) -> Option<FieldType> {
    match source_type {
        // smallint / integer
        "int2" | "int4" => Some(FieldType::Integer),
        // varchar / char
        "varchar" | "bpchar" => Some(FieldType::String),
        "date" => Some(FieldType::Date),
        "bool" => Some(FieldType::Bool),
        "timestamp" => Some(FieldType::Timestamp),
        "numeric" => Some(FieldType::Float64),
        _ => None,
    }
}

/// Map one source column to its destination field.
pub fn map_column(column: &ColumnDescriptor) -> Result<DestinationField> {
    let field_type =
        destination_type(&column.source_type).ok_or_else(|| MigrateError::UnsupportedType {
            column: column.name.clone(),
            source_type: column.source_type.clone(),
        })?;

    let mut field = DestinationField {
        name: column.name.clone(),
        field_type,
        mode: FieldMode::from_nullable(column.nullable),
        max_length: None,
        precision: None,
        scale: None,
    };

    match field_type {
        FieldType::String => {
            field.max_length = Some(require(column, column.length, "length")?);
        },
        FieldType::Float64 => {
            field.precision = Some(require(column, column.precision, "precision")?);
            field.scale = Some(require(column, column.scale, "scale")?);
        },
        _ => {},
    }

    Ok(field)
}

/// Map every column of a table, preserving column order.
pub fn map_schema(schema: &TableSchema) -> Result<Vec<DestinationField>> {
    schema.columns.iter().map(map_column).collect()
}

fn require(column: &ColumnDescriptor, value: Option<i32>, attribute: &'static str) -> Result<i32> {
    value.ok_or_else(|| MigrateError::MissingAttribute {
        column: column.name.clone(),
        attribute,
    })
}
