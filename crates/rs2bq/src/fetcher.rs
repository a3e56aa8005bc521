//! Schema fetch phase
//!
//! Describes each table against the source engine and writes the result
//! through to the schema store before moving to the next table.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::{MigrateError, Result, TableError};
use crate::schema::{SchemaStore, TableName, TableSchema};
use crate::source::SourceEngine;

pub struct SchemaFetcher {
    engine: Arc<dyn SourceEngine>,
    store: Arc<dyn SchemaStore>,
    schema: String,
}

impl SchemaFetcher {
    pub fn new(
        engine: Arc<dyn SourceEngine>,
        store: Arc<dyn SchemaStore>,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            store,
            schema: schema.into(),
        }
    }

    /// Describe and persist one table
    #[instrument(skip(self))]
    pub async fn fetch_table(&self, table: &str) -> Result<TableSchema> {
        let columns = self.engine.describe_table(&self.schema, table).await?;
        if columns.is_empty() {
            return Err(MigrateError::source_engine(format!(
                "Table {}.{} has no columns or does not exist",
                self.schema, table
            )));
        }

        let schema = TableSchema::new(table, columns);
        self.store.put(&schema).await?;

        info!(table, columns = schema.columns.len(), "Schema fetched");
        Ok(schema)
    }

    /// Fetch every table's schema, returned in `tables` order.
    ///
    /// The first failure ends the phase; no partial set is returned.
    /// Up to `concurrency` describe calls run at once.
    pub async fn fetch(
        &self,
        tables: &[TableName],
        concurrency: usize,
    ) -> std::result::Result<Vec<TableSchema>, TableError> {
        stream::iter(tables)
            .map(|table| async move {
                self.fetch_table(table)
                    .await
                    .map_err(|e| TableError::new(table.as_str(), e))
            })
            .buffered(concurrency.max(1))
            .try_collect()
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescriptor, FileSchemaStore};
    use crate::source::{ExportHandle, StatementStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct DescribeOnly {
        described: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SourceEngine for DescribeOnly {
        async fn batch_execute(&self, _: Vec<String>) -> Result<ExportHandle> {
            unreachable!("fetcher never exports")
        }

        async fn statement_status(&self, _: &ExportHandle) -> Result<StatementStatus> {
            unreachable!("fetcher never polls")
        }

        async fn describe_table(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
            assert_eq!(schema, "public");
            self.described.lock().unwrap().push(table.to_string());
            match table {
                "orders" => Ok(vec![
                    ColumnDescriptor::new("id", "int4", false),
                    ColumnDescriptor::new("note", "varchar", true).with_length(64),
                ]),
                "empty" => Ok(Vec::new()),
                other => Err(MigrateError::source_engine(format!("{} not found", other))),
            }
        }
    }

    fn fetcher(dir: &tempfile::TempDir) -> (SchemaFetcher, Arc<DescribeOnly>, FileSchemaStore) {
        let engine = Arc::new(DescribeOnly {
            described: Mutex::new(Vec::new()),
        });
        let store = FileSchemaStore::new(dir.path());
        let fetcher = SchemaFetcher::new(engine.clone(), Arc::new(store.clone()), "public");
        (fetcher, engine, store)
    }

    #[tokio::test]
    async fn test_fetch_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, _, store) = fetcher(&dir);

        let schemas = fetcher.fetch(&["orders".to_string()], 1).await.unwrap();

        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].column_names(), vec!["id", "note"]);
        assert_eq!(store.get("orders").await.unwrap(), schemas[0]);
    }

    #[tokio::test]
    async fn test_first_failure_stops_the_phase() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, engine, store) = fetcher(&dir);
        let tables = vec![
            "orders".to_string(),
            "missing".to_string(),
            "customers".to_string(),
        ];

        let err = fetcher.fetch(&tables, 1).await.unwrap_err();

        assert_eq!(err.table, "missing");
        assert_eq!(*engine.described.lock().unwrap(), vec!["orders", "missing"]);
        // orders was persisted before the failure
        assert!(store.path_for("orders").exists());
    }

    #[tokio::test]
    async fn test_zero_columns_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, _, store) = fetcher(&dir);

        let err = fetcher.fetch_table("empty").await.unwrap_err();

        assert!(matches!(err, MigrateError::SourceEngine(_)));
        assert!(!store.path_for("empty").exists());
    }
}
