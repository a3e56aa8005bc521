//! BigQuery load jobs over the REST API
//!
//! Rows are uploaded as newline-delimited JSON in a `multipart/related`
//! jobs.insert request, then the job is polled with jobs.get until DONE.
//! The request body is streamed row by row, so a shard is never held in
//! memory as a whole.

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::auth::{ServiceAccountKey, TokenProvider};
use super::{LoadJob, LoadOptions, RowStream, Warehouse};
use crate::config::DestinationConfig;
use crate::error::{MigrateError, Result};
use crate::schema::{DestinationField, FieldMode, FieldType};

const HTTP_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct BigQueryWarehouse {
    http: reqwest::Client,
    endpoint: String,
    project_id: String,
    dataset: String,
    tokens: TokenProvider,
    poll_interval: Duration,
}

impl BigQueryWarehouse {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        project_id: impl Into<String>,
        dataset: impl Into<String>,
        tokens: TokenProvider,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            dataset: dataset.into(),
            tokens,
            poll_interval: DEFAULT_JOB_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Resolve credentials and project from configuration.
    ///
    /// `GCP_ACCESS_TOKEN` wins over the key file; the project id falls back to
    /// the one recorded in the key.
    pub async fn from_config(config: &DestinationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| MigrateError::config(format!("Failed to build HTTP client: {}", e)))?;

        let (tokens, project_id) = match &config.access_token {
            Some(token) => (TokenProvider::fixed(token.clone()), config.project_id.clone()),
            None => {
                let key = ServiceAccountKey::from_file(&config.credentials_path).await?;
                let project_id = config.project_id.clone().or_else(|| key.project_id.clone());
                (TokenProvider::service_account(key, http.clone()), project_id)
            },
        };

        let project_id = project_id.ok_or_else(|| {
            MigrateError::config(
                "BigQuery project is unknown: set GCP_PROJECT_ID or use project.dataset",
            )
        })?;

        info!(project = %project_id, dataset = %config.dataset, "BigQuery client initialized");
        Ok(Self::new(http, &config.endpoint, project_id, &config.dataset, tokens))
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.endpoint, self.project_id
        )
    }

    fn job_url(&self, job_id: &str) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/jobs/{}",
            self.endpoint, self.project_id, job_id
        )
    }

    fn job_configuration(
        &self,
        job_id: &str,
        table: &str,
        fields: &[DestinationField],
        options: LoadOptions,
    ) -> JobInsert {
        JobInsert {
            job_reference: JobReferenceOut {
                project_id: self.project_id.clone(),
                job_id: job_id.to_string(),
            },
            configuration: JobConfiguration {
                load: LoadConfiguration {
                    destination_table: TableReference {
                        project_id: self.project_id.clone(),
                        dataset_id: self.dataset.clone(),
                        table_id: table.to_string(),
                    },
                    schema: (!options.autodetect).then(|| TableSchemaOut {
                        fields: fields.iter().map(WireField::from).collect(),
                    }),
                    source_format: "NEWLINE_DELIMITED_JSON",
                    create_disposition: if options.create_if_needed {
                        "CREATE_IF_NEEDED"
                    } else {
                        "CREATE_NEVER"
                    },
                    write_disposition: if options.append {
                        "WRITE_APPEND"
                    } else {
                        "WRITE_TRUNCATE"
                    },
                    autodetect: options.autodetect,
                },
            },
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    #[instrument(skip(self, fields, rows, options))]
    async fn load_rows(
        &self,
        table: &str,
        fields: &[DestinationField],
        rows: RowStream,
        options: LoadOptions,
    ) -> Result<LoadJob> {
        let job_id = format!("rs2bq_{}_{}", table, uuid::Uuid::new_v4().simple());
        let metadata = serde_json::to_vec(&self.job_configuration(&job_id, table, fields, options))?;

        let boundary = format!("rs2bq_{}", uuid::Uuid::new_v4().simple());
        let body = reqwest::Body::wrap_stream(multipart_related(&boundary, &metadata, rows));

        let token = self.tokens.token().await?;
        let response = self
            .http
            .post(self.upload_url())
            .bearer_auth(token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| MigrateError::destination(format!("Load job upload failed: {}", e)))?;

        let job: JobResource = parse_response(response, "jobs.insert").await?;
        debug!(job_id = %job.job_reference.job_id, "Load job submitted");

        Ok(LoadJob {
            job_id: job.job_reference.job_id,
            location: job.job_reference.location,
        })
    }

    #[instrument(skip(self), fields(job_id = %job.job_id))]
    async fn await_job(&self, job: &LoadJob) -> Result<Option<String>> {
        loop {
            let token = self.tokens.token().await?;
            let mut request = self.http.get(self.job_url(&job.job_id)).bearer_auth(token);
            if let Some(location) = &job.location {
                request = request.query(&[("location", location)]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| MigrateError::destination(format!("Job status request failed: {}", e)))?;
            let resource: JobResource = parse_response(response, "jobs.get").await?;

            match resource.status {
                Some(status) if status.state == "DONE" => {
                    return Ok(status.error_result.map(|e| e.describe()));
                },
                status => {
                    debug!(state = ?status.map(|s| s.state), "Load job pending");
                },
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Frame the job metadata and the rows, one JSON line each, as the chunks
/// of a `multipart/related` body
fn multipart_related(
    boundary: &str,
    metadata: &[u8],
    rows: RowStream,
) -> impl Stream<Item = Result<Vec<u8>>> + Send + 'static {
    let mut head =
        format!("--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n", boundary)
            .into_bytes();
    head.extend_from_slice(metadata);
    head.extend_from_slice(
        format!("\r\n--{}\r\nContent-Type: application/octet-stream\r\n\r\n", boundary).as_bytes(),
    );
    let tail = format!("\r\n--{}--\r\n", boundary).into_bytes();

    let lines = rows.map(|row| -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(&row?)?;
        line.push(b'\n');
        Ok(line)
    });

    stream::once(future::ready(Ok(head)))
        .chain(lines)
        .chain(stream::once(future::ready(Ok(tail))))
}

async fn parse_response<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    call: &str,
) -> Result<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| MigrateError::destination(format!("{} response unreadable: {}", call, e)))?;

    if !status.is_success() {
        let message = serde_json::from_str::<ApiErrorBody>(&text)
            .map(|b| b.error.message)
            .unwrap_or(text);
        return Err(MigrateError::destination(format!(
            "{} returned {}: {}",
            call, status, message
        )));
    }

    serde_json::from_str(&text)
        .map_err(|e| MigrateError::destination(format!("Malformed {} response: {}", call, e)))
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobInsert {
    job_reference: JobReferenceOut,
    configuration: JobConfiguration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobReferenceOut {
    project_id: String,
    job_id: String,
}

#[derive(Debug, Serialize)]
struct JobConfiguration {
    load: LoadConfiguration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadConfiguration {
    destination_table: TableReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<TableSchemaOut>,
    source_format: &'static str,
    create_disposition: &'static str,
    write_disposition: &'static str,
    autodetect: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    project_id: String,
    dataset_id: String,
    table_id: String,
}

#[derive(Debug, Serialize)]
struct TableSchemaOut {
    fields: Vec<WireField>,
}

/// The REST API encodes int64 attributes as strings
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct WireField {
    name: String,
    #[serde(rename = "type")]
    field_type: &'static str,
    mode: FieldMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_length: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    precision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scale: Option<String>,
}

impl From<&DestinationField> for WireField {
    fn from(field: &DestinationField) -> Self {
        // BigQuery only accepts precision/scale on NUMERIC and BIGNUMERIC;
        // on FLOAT64 they are recorded in the schema file but not sent.
        let numeric_attrs = !matches!(field.field_type, FieldType::Float64);
        Self {
            name: field.name.clone(),
            field_type: field.field_type.as_str(),
            mode: field.mode,
            max_length: field.max_length.map(|v| v.to_string()),
            precision: field.precision.filter(|_| numeric_attrs).map(|v| v.to_string()),
            scale: field.scale.filter(|_| numeric_attrs).map(|v| v.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReferenceIn,
    status: Option<JobStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReferenceIn {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

impl ErrorProto {
    fn describe(self) -> String {
        match (self.reason, self.message) {
            (Some(reason), Some(message)) => format!("{}: {}", reason, message),
            (None, Some(message)) => message,
            (Some(reason), None) => reason,
            (None, None) => "load job failed without an error message".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}
