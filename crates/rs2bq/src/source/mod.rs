//! Source query engine interface
//!
//! The migrator only needs three things from the source warehouse: run a
//! batch of statements, report the batch status, and describe a table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::ColumnDescriptor;

pub mod redshift;

pub use redshift::RedshiftDataEngine;

/// Identifier of a submitted statement batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportHandle {
    pub statement_id: String,
}

/// Lifecycle of a submitted statement batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementStatus {
    Submitted,
    Running,
    Finished,
    Failed(String),
    Aborted,
}

#[async_trait]
pub trait SourceEngine: Send + Sync {
    /// Submit statements as one batch; returns without waiting for them to run
    async fn batch_execute(&self, statements: Vec<String>) -> Result<ExportHandle>;

    async fn statement_status(&self, handle: &ExportHandle) -> Result<StatementStatus>;

    /// Columns of `schema.table` in the engine's native order
    async fn describe_table(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>>;
}
