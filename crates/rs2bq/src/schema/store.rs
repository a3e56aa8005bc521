//! Persistence of fetched table schemas
//!
//! Schemas are written as soon as they are fetched so an interrupted run
//! leaves one JSON record per described table under `<work_dir>/schemas/`.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, instrument};

use super::TableSchema;
use crate::error::{MigrateError, Result};

/// Keyed storage of [`TableSchema`] records
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Persist a schema, replacing any previous record for the same table
    async fn put(&self, schema: &TableSchema) -> Result<()>;

    /// Read back the schema recorded for `table`
    async fn get(&self, table: &str) -> Result<TableSchema>;
}

/// One pretty-printed JSON file per table
#[derive(Debug, Clone)]
pub struct FileSchemaStore {
    root: PathBuf,
}

impl FileSchemaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, table: &str) -> PathBuf {
        self.root.join(format!("{}.json", table))
    }
}

#[async_trait]
impl SchemaStore for FileSchemaStore {
    #[instrument(skip(self, schema), fields(table = %schema.table))]
    async fn put(&self, schema: &TableSchema) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.path_for(&schema.table);
        let json = serde_json::to_vec_pretty(schema)?;
        tokio::fs::write(&path, json).await?;

        debug!(path = %path.display(), columns = schema.columns.len(), "Schema persisted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, table: &str) -> Result<TableSchema> {
        let path = self.path_for(table);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MigrateError::SchemaNotFound(table.to_string()));
            },
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_slice(&bytes)?)
    }
}
