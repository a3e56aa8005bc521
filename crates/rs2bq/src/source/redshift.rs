//! Redshift Data API adapter

use async_trait::async_trait;
use aws_sdk_redshiftdata::{error::DisplayErrorContext, types::ColumnMetadata, Client};
use tracing::{debug, info, instrument};

use super::{ExportHandle, SourceEngine, StatementStatus};
use crate::config::SourceConfig;
use crate::error::{MigrateError, Result};
use crate::schema::ColumnDescriptor;

/// JDBC-style nullability codes returned in `ColumnMetadata::nullable`
const COLUMN_NO_NULLS: i32 = 0;

/// Source engine backed by the Redshift Data API
#[derive(Clone)]
pub struct RedshiftDataEngine {
    client: Client,
    database: String,
    cluster_identifier: String,
    db_user: String,
}

impl RedshiftDataEngine {
    pub fn new(sdk_config: &aws_config::SdkConfig, source: &SourceConfig) -> Self {
        info!(
            cluster = %source.cluster_identifier,
            database = %source.database,
            "Redshift Data API client initialized"
        );

        Self {
            client: Client::new(sdk_config),
            database: source.database.clone(),
            cluster_identifier: source.cluster_identifier.clone(),
            db_user: source.db_user.clone(),
        }
    }
}

#[async_trait]
impl SourceEngine for RedshiftDataEngine {
    #[instrument(skip(self, statements), fields(count = statements.len()))]
    async fn batch_execute(&self, statements: Vec<String>) -> Result<ExportHandle> {
        let output = self
            .client
            .batch_execute_statement()
            .set_sqls(Some(statements))
            .database(&self.database)
            .cluster_identifier(&self.cluster_identifier)
            .db_user(&self.db_user)
            .send()
            .await
            .map_err(|e| {
                MigrateError::source_engine(format!(
                    "Batch submission failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        let statement_id = output
            .id()
            .map(str::to_string)
            .ok_or_else(|| MigrateError::source_engine("Batch submission returned no statement id"))?;

        debug!(%statement_id, "Batch submitted");
        Ok(ExportHandle { statement_id })
    }

    #[instrument(skip(self), fields(statement_id = %handle.statement_id))]
    async fn statement_status(&self, handle: &ExportHandle) -> Result<StatementStatus> {
        let output = self
            .client
            .describe_statement()
            .id(&handle.statement_id)
            .send()
            .await
            .map_err(|e| {
                MigrateError::source_engine(format!(
                    "Describe statement {} failed: {}",
                    handle.statement_id,
                    DisplayErrorContext(&e)
                ))
            })?;

        let status = output.status().map(|s| s.as_str()).unwrap_or("SUBMITTED");
        Ok(match status {
            "FINISHED" => StatementStatus::Finished,
            "FAILED" => StatementStatus::Failed(
                output
                    .error()
                    .unwrap_or("statement failed without an error message")
                    .to_string(),
            ),
            "ABORTED" => StatementStatus::Aborted,
            "PICKED" | "STARTED" => StatementStatus::Running,
            _ => StatementStatus::Submitted,
        })
    }

    #[instrument(skip(self))]
    async fn describe_table(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let mut columns = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .describe_table()
                .cluster_identifier(&self.cluster_identifier)
                .database(&self.database)
                .db_user(&self.db_user)
                .schema(schema)
                .table(table)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    MigrateError::source_engine(format!(
                        "Describe table {}.{} failed: {}",
                        schema,
                        table,
                        DisplayErrorContext(&e)
                    ))
                })?;

            for metadata in output.column_list() {
                columns.push(to_descriptor(metadata)?);
            }

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(columns = columns.len(), "Table described");
        Ok(columns)
    }
}

fn to_descriptor(metadata: &ColumnMetadata) -> Result<ColumnDescriptor> {
    let name = metadata
        .name()
        .ok_or_else(|| MigrateError::source_engine("Column metadata without a name"))?;
    let source_type = metadata.type_name().ok_or_else(|| {
        MigrateError::source_engine(format!("Column '{}' has no type name", name))
    })?;

    Ok(descriptor_from_parts(
        name,
        source_type,
        metadata.nullable(),
        metadata.length(),
        metadata.precision(),
        metadata.scale(),
    ))
}

/// The Data API reports absent attributes as 0. Character columns sometimes
/// carry their declared width in `precision` instead of `length`.
fn descriptor_from_parts(
    name: &str,
    source_type: &str,
    nullable: i32,
    length: i32,
    precision: i32,
    scale: i32,
) -> ColumnDescriptor {
    let is_character = matches!(source_type, "varchar" | "bpchar");
    let length = match (length, is_character) {
        (l, _) if l > 0 => Some(l),
        (_, true) if precision > 0 => Some(precision),
        _ => None,
    };

    let (precision, scale) = if source_type == "numeric" {
        (Some(precision), Some(scale))
    } else {
        (None, None)
    };

    ColumnDescriptor {
        name: name.to_string(),
        source_type: source_type.to_string(),
        nullable: nullable != COLUMN_NO_NULLS,
        length,
        precision,
        scale,
    }
}
