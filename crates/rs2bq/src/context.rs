//! Run context shared by every phase
//!
//! Holds the resolved configuration and one handle per external system.
//! Nothing in the crate reads process-wide state after this is built.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::Credentials;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::{AwsConfig, MigratorConfig};
use crate::destination::{BigQueryWarehouse, Warehouse};
use crate::error::Result;
use crate::schema::{FileSchemaStore, SchemaStore};
use crate::source::{RedshiftDataEngine, SourceEngine};
use crate::storage::{ObjectStore, S3Storage};

#[derive(Clone)]
pub struct MigrationContext {
    pub config: Arc<MigratorConfig>,
    pub engine: Arc<dyn SourceEngine>,
    pub objects: Arc<dyn ObjectStore>,
    pub warehouse: Arc<dyn Warehouse>,
    pub schemas: Arc<dyn SchemaStore>,
}

impl MigrationContext {
    pub fn new(
        config: MigratorConfig,
        engine: Arc<dyn SourceEngine>,
        objects: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        schemas: Arc<dyn SchemaStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            objects,
            warehouse,
            schemas,
        }
    }

    /// Connect the production adapters: Redshift Data API, S3, BigQuery REST
    /// and a file-backed schema store under the work directory.
    #[instrument(skip_all)]
    pub async fn from_config(config: MigratorConfig) -> Result<Self> {
        let sdk_config = aws_sdk_config(&config.aws).await;

        let engine = RedshiftDataEngine::new(&sdk_config, &config.source);
        let objects = S3Storage::new(&sdk_config, &config.staging);
        let warehouse = BigQueryWarehouse::from_config(&config.destination).await?;
        let schemas = FileSchemaStore::new(config.pipeline.schema_dir());

        Ok(Self::new(
            config,
            Arc::new(engine),
            Arc::new(objects),
            Arc::new(warehouse),
            Arc::new(schemas),
        ))
    }
}

/// Static keys when configured, otherwise the default provider chain
async fn aws_sdk_config(aws: &AwsConfig) -> SdkConfig {
    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(aws.region.clone()));

    if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
        debug!("Using static AWS credentials from the environment");
        loader = loader.credentials_provider(Credentials::new(key_id, secret, None, None, "rs2bq-env"));
    }

    loader.load().await
}
