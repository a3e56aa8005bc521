//! In-memory collaborators for pipeline tests

#![allow(dead_code)]

use async_trait::async_trait;
use rs2bq::config::{
    AwsConfig, DestinationConfig, MigratorConfig, PipelineConfig, SourceConfig, StagingConfig,
    DEFAULT_UNLOAD_TEMPLATE,
};
use rs2bq::context::MigrationContext;
use futures::TryStreamExt;
use rs2bq::destination::{LoadJob, LoadOptions, Row, RowStream, Warehouse};
use rs2bq::schema::{ColumnDescriptor, DestinationField, FileSchemaStore};
use rs2bq::source::{ExportHandle, SourceEngine, StatementStatus};
use rs2bq::storage::{ObjectBody, ObjectEntry, ObjectStore};
use rs2bq::{MigrateError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const OUTPUT_DIR: &str = "exports";

pub fn config(work_dir: &Path, tables: &[&str]) -> MigratorConfig {
    MigratorConfig {
        aws: AwsConfig {
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
        },
        source: SourceConfig {
            database: "dev".to_string(),
            schema: "public".to_string(),
            tables: tables.iter().map(|t| t.to_string()).collect(),
            iam_role: "arn:aws:iam::123456789012:role/unload".to_string(),
            cluster_identifier: "analytics".to_string(),
            db_user: "etl".to_string(),
        },
        staging: StagingConfig {
            bucket: "staging".to_string(),
            output_dir: OUTPUT_DIR.to_string(),
            endpoint: None,
        },
        destination: DestinationConfig {
            project_id: Some("proj".to_string()),
            dataset: "warehouse".to_string(),
            credentials_path: work_dir.join("credentials.json"),
            access_token: Some("token".to_string()),
            endpoint: "http://127.0.0.1:1".to_string(),
        },
        pipeline: PipelineConfig {
            work_dir: work_dir.to_path_buf(),
            concurrency: 1,
            wait_for_export: true,
            export_poll_secs: 1,
            export_timeout_secs: 30,
            unload_template: DEFAULT_UNLOAD_TEMPLATE.to_string(),
        },
    }
}

/// Two-column table used by most scenarios: `id int4 not null, name varchar(32)`
pub fn id_name_columns() -> Vec<ColumnDescriptor> {
    vec![
        ColumnDescriptor::new("id", "int4", false),
        ColumnDescriptor::new("name", "varchar", true).with_length(32),
    ]
}

// ============================================================================
// Source engine
// ============================================================================

#[derive(Default)]
pub struct FakeEngine {
    pub tables: Mutex<HashMap<String, Vec<ColumnDescriptor>>>,
    pub batches: Mutex<Vec<Vec<String>>>,
    pub described: Mutex<Vec<String>>,
    pub export_status: Mutex<Option<StatementStatus>>,
}

impl FakeEngine {
    pub fn with_table(self, table: &str, columns: Vec<ColumnDescriptor>) -> Self {
        self.tables
            .lock()
            .unwrap()
            .insert(table.to_string(), columns);
        self
    }

    pub fn with_export_status(self, status: StatementStatus) -> Self {
        *self.export_status.lock().unwrap() = Some(status);
        self
    }
}

#[async_trait]
impl SourceEngine for FakeEngine {
    async fn batch_execute(&self, statements: Vec<String>) -> Result<ExportHandle> {
        self.batches.lock().unwrap().push(statements);
        Ok(ExportHandle {
            statement_id: "batch-1".to_string(),
        })
    }

    async fn statement_status(&self, _handle: &ExportHandle) -> Result<StatementStatus> {
        Ok(self
            .export_status
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(StatementStatus::Finished))
    }

    async fn describe_table(&self, _schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
        self.described.lock().unwrap().push(table.to_string());
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| MigrateError::source_engine(format!("relation \"{}\" does not exist", table)))
    }
}

// ============================================================================
// Object store
// ============================================================================

#[derive(Default)]
pub struct MemoryBucket {
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
    pub listed: Mutex<Vec<String>>,
}

impl MemoryBucket {
    /// Place an export shard for `table`
    pub fn with_shard(self, table: &str, shard: &str, body: &str) -> Self {
        self.objects.lock().unwrap().insert(
            format!("{}/{}/{}", OUTPUT_DIR, table, shard),
            body.as_bytes().to_vec(),
        );
        self
    }
}

#[async_trait]
impl ObjectStore for MemoryBucket {
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        self.listed.lock().unwrap().push(prefix.to_string());
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, body)| ObjectEntry {
                key: key.clone(),
                size: body.len() as i64,
                e_tag: None,
            })
            .collect())
    }

    async fn get_object(&self, key: &str) -> Result<ObjectBody> {
        let body = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| MigrateError::object_store(format!("NoSuchKey: {}", key)))?;
        Ok(Box::pin(std::io::Cursor::new(body)))
    }
}

// ============================================================================
// Warehouse
// ============================================================================

#[derive(Debug, Clone)]
pub struct RecordedLoad {
    pub table: String,
    pub fields: Vec<DestinationField>,
    pub rows: Vec<Row>,
}

#[derive(Default)]
pub struct FakeWarehouse {
    pub loads: Mutex<Vec<RecordedLoad>>,
    /// Tables whose load jobs finish with an error result
    pub failing: Mutex<HashMap<String, String>>,
    jobs: Mutex<HashMap<String, String>>,
}

impl FakeWarehouse {
    pub fn failing_on(self, table: &str, reason: &str) -> Self {
        self.failing
            .lock()
            .unwrap()
            .insert(table.to_string(), reason.to_string());
        self
    }

    pub fn loaded_tables(&self) -> Vec<String> {
        self.loads
            .lock()
            .unwrap()
            .iter()
            .map(|l| l.table.clone())
            .collect()
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn load_rows(
        &self,
        table: &str,
        fields: &[DestinationField],
        rows: RowStream,
        _options: LoadOptions,
    ) -> Result<LoadJob> {
        let rows: Vec<Row> = rows.try_collect().await?;
        let mut loads = self.loads.lock().unwrap();
        let job_id = format!("job-{}", loads.len());
        loads.push(RecordedLoad {
            table: table.to_string(),
            fields: fields.to_vec(),
            rows,
        });
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.clone(), table.to_string());
        Ok(LoadJob {
            job_id,
            location: Some("US".to_string()),
        })
    }

    async fn await_job(&self, job: &LoadJob) -> Result<Option<String>> {
        let table = self.jobs.lock().unwrap().get(&job.job_id).cloned();
        Ok(table.and_then(|t| self.failing.lock().unwrap().get(&t).cloned()))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub engine: Arc<FakeEngine>,
    pub bucket: Arc<MemoryBucket>,
    pub warehouse: Arc<FakeWarehouse>,
    pub schemas: FileSchemaStore,
}

impl Harness {
    pub fn new(engine: FakeEngine, bucket: MemoryBucket, warehouse: FakeWarehouse) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let schemas = FileSchemaStore::new(dir.path().join("schemas"));
        Self {
            dir,
            engine: Arc::new(engine),
            bucket: Arc::new(bucket),
            warehouse: Arc::new(warehouse),
            schemas,
        }
    }

    pub fn context(&self, config: MigratorConfig) -> MigrationContext {
        MigrationContext::new(
            config,
            self.engine.clone(),
            self.bucket.clone(),
            self.warehouse.clone(),
            Arc::new(self.schemas.clone()),
        )
    }

    pub fn config(&self, tables: &[&str]) -> MigratorConfig {
        config(self.dir.path(), tables)
    }

    pub fn staging_dir(&self, table: &str) -> std::path::PathBuf {
        self.dir.path().join("staging").join(table)
    }
}
