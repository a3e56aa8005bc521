//! Destination warehouse interface

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::DestinationField;

pub mod auth;
pub mod bigquery;

pub use auth::{AccessToken, ServiceAccountKey, TokenProvider};
pub use bigquery::BigQueryWarehouse;

/// One record, keyed by destination field name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Rows read lazily from a staged file. An `Err` item aborts the upload.
pub type RowStream = BoxStream<'static, Result<Row>>;

/// Dispositions applied to every load job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Create the table from the supplied fields when it does not exist
    pub create_if_needed: bool,
    /// Append to existing rows rather than truncating
    pub append: bool,
    /// Let the warehouse infer the schema instead of using the field list
    pub autodetect: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            create_if_needed: true,
            append: true,
            autodetect: false,
        }
    }
}

/// Reference to a submitted load job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadJob {
    pub job_id: String,
    pub location: Option<String>,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Submit `rows` for loading into `table` under `fields`.
    ///
    /// A job is submitted even when the stream is empty, so the table is
    /// still created under `create_if_needed`.
    async fn load_rows(
        &self,
        table: &str,
        fields: &[DestinationField],
        rows: RowStream,
        options: LoadOptions,
    ) -> Result<LoadJob>;

    /// Block until the job is done; `Some(reason)` when it finished with an error
    async fn await_job(&self, job: &LoadJob) -> Result<Option<String>>;
}
