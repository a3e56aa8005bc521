//! Load phase for a single staged file
//!
//! Export files are CSV with a header row. Columns are matched to the
//! destination fields by position, never by header name, so the persisted
//! column order is what decides which value lands in which field.
//!
//! Rows are parsed on a blocking thread and handed to the warehouse through a
//! bounded channel, so memory use does not grow with the shard size.

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::destination::{LoadOptions, Row, RowStream, Warehouse};
use crate::error::{MigrateError, Result};
use crate::schema::{DestinationField, FieldType, SchemaStore, TableName, TableSchema};
use crate::typemap;

/// Parsed rows buffered between the CSV reader and the upload
const ROW_CHANNEL_CAPACITY: usize = 1024;

/// Result of one load job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Success { rows: usize },
    Error(String),
}

pub struct Loader {
    warehouse: Arc<dyn Warehouse>,
    schemas: Arc<dyn SchemaStore>,
    options: LoadOptions,
    fields: Mutex<HashMap<TableName, Arc<Vec<DestinationField>>>>,
}

impl Loader {
    pub fn new(warehouse: Arc<dyn Warehouse>, schemas: Arc<dyn SchemaStore>) -> Self {
        Self {
            warehouse,
            schemas,
            options: LoadOptions::default(),
            fields: Mutex::new(HashMap::new()),
        }
    }

    /// Map a freshly fetched schema so loads skip the store round-trip
    pub async fn prime(&self, schema: &TableSchema) -> Result<()> {
        let fields = Arc::new(typemap::map_schema(schema)?);
        self.fields.lock().await.insert(schema.table.clone(), fields);
        Ok(())
    }

    /// Destination fields for `table`, from cache or the schema store
    pub async fn fields_for(&self, table: &str) -> Result<Arc<Vec<DestinationField>>> {
        let mut cache = self.fields.lock().await;
        if let Some(fields) = cache.get(table) {
            return Ok(fields.clone());
        }

        let schema = self.schemas.get(table).await?;
        let fields = Arc::new(typemap::map_schema(&schema)?);
        cache.insert(table.to_string(), fields.clone());
        Ok(fields)
    }

    /// Load the rows of `path` into `table` as one job. No retry.
    ///
    /// A header-only file still submits a job so the table gets created.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn load(&self, path: &Path, table: &str) -> Result<LoadOutcome> {
        let fields = self.fields_for(table).await?;
        let reader = RowReader::open(path, fields.clone())?;

        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let producer = tokio::task::spawn_blocking(move || reader.forward(&tx));

        let counted = Arc::new(AtomicUsize::new(0));
        let rows: RowStream = {
            let counted = counted.clone();
            stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|row| (row, rx)) })
                .inspect_ok(move |_| {
                    counted.fetch_add(1, Ordering::Relaxed);
                })
                .boxed()
        };

        let submitted = self.warehouse.load_rows(table, &fields, rows, self.options).await;

        // a parse error explains a failed upload better than the transport error
        producer
            .await
            .map_err(|e| MigrateError::staged_file(path_str(path), e.to_string()))??;
        let job = submitted?;
        let row_count = counted.load(Ordering::Relaxed);
        if row_count == 0 {
            debug!(table, "File holds no data rows, submitted to create the table");
        }

        match self.warehouse.await_job(&job).await? {
            None => {
                info!(table, rows = row_count, job_id = %job.job_id, "File loaded");
                Ok(LoadOutcome::Success { rows: row_count })
            },
            Some(reason) => {
                warn!(table, job_id = %job.job_id, %reason, "Load job failed");
                Ok(LoadOutcome::Error(reason))
            },
        }
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

/// Reads a staged CSV file as rows keyed by field name.
///
/// The first record is the header and is discarded.
pub struct RowReader {
    path: PathBuf,
    fields: Arc<Vec<DestinationField>>,
    records: csv::StringRecordsIntoIter<File>,
}

impl RowReader {
    pub fn open(path: &Path, fields: Arc<Vec<DestinationField>>) -> Result<Self> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| MigrateError::staged_file(path_str(path), e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            fields,
            records: reader.into_records(),
        })
    }

    fn to_row(&self, record: csv::StringRecord) -> Result<Row> {
        if record.len() != self.fields.len() {
            let line = record.position().map_or(0, |p| p.line());
            return Err(MigrateError::staged_file(
                path_str(&self.path),
                format!(
                    "line {} has {} values, expected {}",
                    line,
                    record.len(),
                    self.fields.len()
                ),
            ));
        }

        Ok(self
            .fields
            .iter()
            .zip(record.iter())
            .map(|(field, raw)| (field.name.clone(), coerce(raw, field.field_type)))
            .collect())
    }

    /// Send every row to `tx`, blocking while the channel is full.
    ///
    /// On a parse error the receiver gets an error item so the upload is
    /// aborted, and the error itself is returned. A closed receiver stops
    /// reading without error.
    fn forward(self, tx: &mpsc::Sender<Result<Row>>) -> Result<()> {
        let path = path_str(&self.path);
        for row in self {
            match row {
                Ok(row) => {
                    if tx.blocking_send(Ok(row)).is_err() {
                        break;
                    }
                },
                Err(e) => {
                    let aborted = MigrateError::staged_file(path, e.to_string());
                    let _ = tx.blocking_send(Err(aborted));
                    return Err(e);
                },
            }
        }
        Ok(())
    }
}

impl Iterator for RowReader {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Result<Row>> {
        let record = self.records.next()?;
        Some(
            record
                .map_err(|e| MigrateError::staged_file(path_str(&self.path), e.to_string()))
                .and_then(|record| self.to_row(record)),
        )
    }
}

/// Convert a CSV cell to the JSON value sent for `field_type`.
///
/// Values that do not parse are passed through as strings and left for the
/// warehouse to accept or reject.
pub fn coerce(raw: &str, field_type: FieldType) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }

    match field_type {
        FieldType::Integer => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        FieldType::Float64 => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string())),
        FieldType::Bool => match raw.to_ascii_lowercase().as_str() {
            "t" | "true" | "1" => Value::Bool(true),
            "f" | "false" | "0" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        FieldType::String | FieldType::Date | FieldType::Timestamp => {
            Value::String(raw.to_string())
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::destination::LoadJob;
    use crate::schema::{ColumnDescriptor, FieldMode, FileSchemaStore};
    use async_trait::async_trait;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    fn field(name: &str, field_type: FieldType) -> DestinationField {
        DestinationField {
            name: name.to_string(),
            field_type,
            mode: FieldMode::Nullable,
            max_length: None,
            precision: None,
            scale: None,
        }
    }

    fn staged(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce("", FieldType::Integer), Value::Null);
        assert_eq!(coerce("42", FieldType::Integer), json!(42));
        assert_eq!(coerce("4x", FieldType::Integer), json!("4x"));
        assert_eq!(coerce("10.25", FieldType::Float64), json!(10.25));
        assert_eq!(coerce("t", FieldType::Bool), json!(true));
        assert_eq!(coerce("FALSE", FieldType::Bool), json!(false));
        assert_eq!(coerce("0", FieldType::Bool), json!(false));
        assert_eq!(coerce("2024-01-31", FieldType::Date), json!("2024-01-31"));
    }

    #[test]
    fn test_rows_are_positional_and_skip_header() {
        // header names deliberately disagree with the field names
        let file = staged("b,a\n1,\"x, y\"\n2,\n");
        let fields = Arc::new(vec![field("id", FieldType::Integer), field("note", FieldType::String)]);

        let rows: Vec<Row> = RowReader::open(file.path(), fields)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(Value::Object(rows[0].clone()), json!({"id": 1, "note": "x, y"}));
        assert_eq!(Value::Object(rows[1].clone()), json!({"id": 2, "note": null}));
    }

    #[test]
    fn test_width_mismatch_is_a_staged_file_error() {
        let file = staged("id,note\n1,a\n2\n");
        let fields = Arc::new(vec![field("id", FieldType::Integer), field("note", FieldType::String)]);

        let mut rows = RowReader::open(file.path(), fields).unwrap();
        assert!(rows.next().unwrap().is_ok());
        let err = rows.next().unwrap().unwrap_err();
        assert!(matches!(err, MigrateError::StagedFile { ref message, .. } if message.contains("line 3")));
    }

    struct RecordingWarehouse {
        loads: StdMutex<Vec<(String, usize)>>,
        reject_with: Option<String>,
    }

    #[async_trait]
    impl Warehouse for RecordingWarehouse {
        async fn load_rows(
            &self,
            table: &str,
            fields: &[DestinationField],
            rows: RowStream,
            options: LoadOptions,
        ) -> Result<LoadJob> {
            assert!(options.create_if_needed && options.append && !options.autodetect);
            assert_eq!(fields.len(), 2);
            let rows: Vec<Row> = rows.try_collect().await?;
            self.loads.lock().unwrap().push((table.to_string(), rows.len()));
            Ok(LoadJob {
                job_id: "job-1".to_string(),
                location: None,
            })
        }

        async fn await_job(&self, _job: &LoadJob) -> Result<Option<String>> {
            Ok(self.reject_with.clone())
        }
    }

    async fn loader(dir: &tempfile::TempDir, reject_with: Option<&str>) -> (Loader, Arc<RecordingWarehouse>) {
        let store = FileSchemaStore::new(dir.path());
        store
            .put(&TableSchema::new(
                "orders",
                vec![
                    ColumnDescriptor::new("id", "int4", false),
                    ColumnDescriptor::new("total", "numeric", true).with_precision(10, 2),
                ],
            ))
            .await
            .unwrap();
        let warehouse = Arc::new(RecordingWarehouse {
            loads: StdMutex::new(Vec::new()),
            reject_with: reject_with.map(str::to_string),
        });
        (Loader::new(warehouse.clone(), Arc::new(store)), warehouse)
    }

    #[tokio::test]
    async fn test_load_reads_persisted_schema() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, warehouse) = loader(&dir, None).await;
        let file = staged("id,total\n1,9.99\n2,\n");

        let outcome = loader.load(file.path(), "orders").await.unwrap();

        assert_eq!(outcome, LoadOutcome::Success { rows: 2 });
        assert_eq!(*warehouse.loads.lock().unwrap(), vec![("orders".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_job_error_becomes_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, _) = loader(&dir, Some("invalid: bad value")).await;
        let file = staged("id,total\n1,9.99\n");

        let outcome = loader.load(file.path(), "orders").await.unwrap();
        assert_eq!(outcome, LoadOutcome::Error("invalid: bad value".to_string()));
    }

    #[tokio::test]
    async fn test_header_only_file_still_submits_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, warehouse) = loader(&dir, None).await;
        let file = staged("id,total\n");

        let outcome = loader.load(file.path(), "orders").await.unwrap();

        assert_eq!(outcome, LoadOutcome::Success { rows: 0 });
        assert_eq!(*warehouse.loads.lock().unwrap(), vec![("orders".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_large_file_streams_through_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, warehouse) = loader(&dir, None).await;
        let mut contents = String::from("id,total\n");
        for i in 0..ROW_CHANNEL_CAPACITY * 3 {
            contents.push_str(&format!("{},1.5\n", i));
        }
        let file = staged(&contents);

        let outcome = loader.load(file.path(), "orders").await.unwrap();

        assert_eq!(outcome, LoadOutcome::Success { rows: ROW_CHANNEL_CAPACITY * 3 });
        assert_eq!(warehouse.loads.lock().unwrap()[0].1, ROW_CHANNEL_CAPACITY * 3);
    }

    #[tokio::test]
    async fn test_malformed_row_reports_the_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, warehouse) = loader(&dir, None).await;
        let file = staged("id,total\n1,9.99\n2\n");

        let err = loader.load(file.path(), "orders").await.unwrap_err();

        assert!(matches!(err, MigrateError::StagedFile { ref message, .. } if message == "line 3 has 1 values, expected 2"));
        assert!(warehouse.loads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_schema() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, _) = loader(&dir, None).await;
        let file = staged("id\n1\n");

        let err = loader.load(file.path(), "customers").await.unwrap_err();
        assert!(matches!(err, MigrateError::SchemaNotFound(ref t) if t == "customers"));
    }
}
