//! Configuration management
//!
//! All settings come from the environment, optionally seeded from a dotenv
//! file. When `IS_GCP=TRUE` the process runs on a provisioned VM that mounts
//! its env file and service account key under `/data`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MigrateError, Result};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_REDSHIFT_DATABASE: &str = "dev";
pub const DEFAULT_REDSHIFT_SCHEMA: &str = "public";
pub const DEFAULT_WORK_DIR: &str = "./tables";
pub const DEFAULT_CREDENTIALS_PATH: &str = "credentials.json";
pub const DEFAULT_BIGQUERY_ENDPOINT: &str = "https://bigquery.googleapis.com";
pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_EXPORT_POLL_SECS: u64 = 5;
pub const DEFAULT_EXPORT_TIMEOUT_SECS: u64 = 3600;

/// Env file and key locations on provisioned GCP hosts
pub const GCP_HOST_ENV_FILE: &str = "/data/env/current.env";
pub const GCP_HOST_CREDENTIALS_PATH: &str = "/data/credentials/current.json";

/// UNLOAD statement issued per table. Placeholders: `{database}`, `{schema}`,
/// `{table}`, `{prefix}` (ends with `/`), `{iam_role}`.
pub const DEFAULT_UNLOAD_TEMPLATE: &str = "UNLOAD ('SELECT * FROM \"{database}\".\"{schema}\".\"{table}\"') \
TO '{prefix}{table}/' IAM_ROLE '{iam_role}' CSV HEADER ALLOWOVERWRITE";

/// Complete migrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigratorConfig {
    pub aws: AwsConfig,
    pub source: SourceConfig,
    pub staging: StagingConfig,
    pub destination: DestinationConfig,
    pub pipeline: PipelineConfig,
}

/// Credentials shared by the Redshift Data API and S3 clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    /// Static credentials; when absent the default provider chain is used
    pub access_key_id: Option<String>,
    #[serde(skip_serializing, default)]
    pub secret_access_key: Option<String>,
}

/// Redshift cluster and the tables to migrate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub database: String,
    pub schema: String,
    pub tables: Vec<String>,
    pub iam_role: String,
    pub cluster_identifier: String,
    pub db_user: String,
}

/// S3 staging area written by UNLOAD
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub bucket: String,
    pub output_dir: String,
    pub endpoint: Option<String>,
}

impl StagingConfig {
    /// `s3://<bucket>/<output_dir>/`, the UNLOAD target prefix
    pub fn s3_prefix(&self) -> String {
        format!("s3://{}/{}/", self.bucket, self.output_dir)
    }

    /// Bucket key prefix holding one table's export files
    pub fn table_prefix(&self, table: &str) -> String {
        format!("{}/{}/", self.output_dir, table)
    }
}

/// BigQuery target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Project id; `None` means "take it from the service account key"
    pub project_id: Option<String>,
    pub dataset: String,
    pub credentials_path: PathBuf,
    #[serde(skip_serializing, default)]
    pub access_token: Option<String>,
    pub endpoint: String,
}

/// Local pipeline behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub work_dir: PathBuf,
    /// Tables described and loaded at once. After a failure no new table
    /// starts, but those already in flight finish their load and cleanup.
    pub concurrency: usize,
    pub wait_for_export: bool,
    pub export_poll_secs: u64,
    pub export_timeout_secs: u64,
    pub unload_template: String,
}

impl PipelineConfig {
    pub fn schema_dir(&self) -> PathBuf {
        self.work_dir.join("schemas")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.work_dir.join("staging")
    }

    pub fn export_poll_interval(&self) -> Duration {
        Duration::from_secs(self.export_poll_secs)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }
}

impl MigratorConfig {
    /// Load configuration from dotenv + process environment and validate it
    pub fn load() -> Result<Self> {
        Self::load_with(&ConfigOverrides::default())
    }

    /// Like [`MigratorConfig::load`], applying command-line overrides before validation
    pub fn load_with(overrides: &ConfigOverrides) -> Result<Self> {
        if is_gcp_host(|key| std::env::var(key).ok()) {
            dotenvy::from_path(GCP_HOST_ENV_FILE).map_err(|e| {
                MigrateError::config(format!("Failed to read {}: {}", GCP_HOST_ENV_FILE, e))
            })?;
        } else {
            dotenvy::dotenv().ok();
        }

        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            var(key).ok_or_else(|| MigrateError::config(format!("{} must be set", key)))
        };

        let default_credentials = if is_gcp_host(&lookup) {
            GCP_HOST_CREDENTIALS_PATH
        } else {
            DEFAULT_CREDENTIALS_PATH
        };

        // may be supplied on the command line instead; validate() checks it
        let tables = var("AWS_REDSHIFT_TABLES")
            .map(|raw| split_tables(&raw))
            .unwrap_or_default();

        let (project_id, dataset) =
            split_dataset(&required("GCP_BIGQUERY_DESTINATION_DATASET")?, var("GCP_PROJECT_ID"));

        let unload_template = match var("RS2BQ_UNLOAD_TEMPLATE") {
            Some(path) => std::fs::read_to_string(&path).map_err(|e| {
                MigrateError::config(format!("Failed to read UNLOAD template {}: {}", path, e))
            })?,
            None => DEFAULT_UNLOAD_TEMPLATE.to_string(),
        };

        Ok(Self {
            aws: AwsConfig {
                region: required("AWS_REGION")?,
                access_key_id: var("AWS_ACCESS_KEY_ID"),
                secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            },
            source: SourceConfig {
                database: var("AWS_REDSHIFT_DB")
                    .unwrap_or_else(|| DEFAULT_REDSHIFT_DATABASE.to_string()),
                schema: var("AWS_REDSHIFT_SCHEMA")
                    .unwrap_or_else(|| DEFAULT_REDSHIFT_SCHEMA.to_string()),
                tables,
                iam_role: required("AWS_IAM_ROLE")?,
                cluster_identifier: required("AWS_REDSHIFT_CLUSTER")?,
                db_user: required("AWS_REDSHIFT_DB_USER")?,
            },
            staging: StagingConfig {
                bucket: required("AWS_S3_BUCKET_NAME")?,
                output_dir: required("AWS_S3_OUTPUT_DIR")?
                    .trim_matches('/')
                    .to_string(),
                endpoint: var("S3_ENDPOINT"),
            },
            destination: DestinationConfig {
                project_id,
                dataset,
                credentials_path: var("GCP_CREDENTIALS_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(default_credentials)),
                access_token: var("GCP_ACCESS_TOKEN"),
                endpoint: var("BIGQUERY_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_BIGQUERY_ENDPOINT.to_string()),
            },
            pipeline: PipelineConfig {
                work_dir: var("RS2BQ_WORK_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR)),
                concurrency: parse_or(&var, "RS2BQ_CONCURRENCY", DEFAULT_CONCURRENCY)?,
                wait_for_export: parse_or(&var, "RS2BQ_WAIT_FOR_EXPORT", true)?,
                export_poll_secs: parse_or(&var, "RS2BQ_EXPORT_POLL_SECS", DEFAULT_EXPORT_POLL_SECS)?,
                export_timeout_secs: parse_or(
                    &var,
                    "RS2BQ_EXPORT_TIMEOUT_SECS",
                    DEFAULT_EXPORT_TIMEOUT_SECS,
                )?,
                unload_template,
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.source.tables.is_empty() {
            return Err(MigrateError::config("AWS_REDSHIFT_TABLES lists no tables"));
        }

        let mut seen = HashSet::new();
        for table in &self.source.tables {
            if !seen.insert(table.as_str()) {
                return Err(MigrateError::config(format!(
                    "Table '{}' is listed more than once",
                    table
                )));
            }
            if table.contains(['/', '\\', '"', '\'']) || table == "." || table == ".." {
                return Err(MigrateError::config(format!(
                    "Table name '{}' contains characters that cannot be used in a path or UNLOAD statement",
                    table
                )));
            }
        }

        if self.pipeline.concurrency == 0 {
            return Err(MigrateError::config("Concurrency must be greater than 0"));
        }

        if self.pipeline.wait_for_export && self.pipeline.export_poll_secs == 0 {
            return Err(MigrateError::config("Export poll interval must be greater than 0"));
        }

        if self.aws.access_key_id.is_some() != self.aws.secret_access_key.is_some() {
            return Err(MigrateError::config(
                "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set together",
            ));
        }

        if !self.pipeline.unload_template.contains("{table}") {
            return Err(MigrateError::config("UNLOAD template must reference {table}"));
        }

        if self.destination.dataset.is_empty() {
            return Err(MigrateError::config("Destination dataset cannot be empty"));
        }

        Ok(())
    }
}

/// Settings the CLI can override after the environment is read
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub tables: Option<Vec<String>>,
    pub work_dir: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub wait_for_export: Option<bool>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut MigratorConfig) {
        if let Some(tables) = &self.tables {
            config.source.tables = tables
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
        if let Some(work_dir) = &self.work_dir {
            config.pipeline.work_dir = work_dir.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.pipeline.concurrency = concurrency;
        }
        if let Some(wait) = self.wait_for_export {
            config.pipeline.wait_for_export = wait;
        }
    }
}

fn split_tables(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn is_gcp_host<F: Fn(&str) -> Option<String>>(lookup: F) -> bool {
    lookup("IS_GCP").is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Accept either `dataset` or `project.dataset`
fn split_dataset(value: &str, project_override: Option<String>) -> (Option<String>, String) {
    match value.split_once('.') {
        Some((project, dataset)) => (
            project_override.or_else(|| Some(project.to_string())),
            dataset.to_string(),
        ),
        None => (project_override, value.to_string()),
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| MigrateError::config(format!("Invalid value for {}: {}", key, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("AWS_REGION", "eu-west-1"),
            ("AWS_REDSHIFT_TABLES", "orders, customers ,"),
            ("AWS_IAM_ROLE", "arn:aws:iam::123456789012:role/unload"),
            ("AWS_REDSHIFT_CLUSTER", "analytics"),
            ("AWS_REDSHIFT_DB_USER", "etl"),
            ("AWS_S3_BUCKET_NAME", "staging-bucket"),
            ("AWS_S3_OUTPUT_DIR", "/exports/"),
            ("GCP_BIGQUERY_DESTINATION_DATASET", "warehouse"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<MigratorConfig> {
        MigratorConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults_and_trimming() {
        let config = load(&base_env()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.source.tables, vec!["orders", "customers"]);
        assert_eq!(config.source.database, DEFAULT_REDSHIFT_DATABASE);
        assert_eq!(config.source.schema, DEFAULT_REDSHIFT_SCHEMA);
        assert_eq!(config.staging.output_dir, "exports");
        assert_eq!(config.staging.s3_prefix(), "s3://staging-bucket/exports/");
        assert_eq!(config.staging.table_prefix("orders"), "exports/orders/");
        assert_eq!(config.destination.project_id, None);
        assert_eq!(config.destination.credentials_path, PathBuf::from(DEFAULT_CREDENTIALS_PATH));
        assert_eq!(config.pipeline.concurrency, 1);
        assert!(config.pipeline.wait_for_export);
        assert_eq!(config.pipeline.schema_dir(), PathBuf::from("./tables/schemas"));
    }

    #[test]
    fn test_missing_required_value() {
        let mut env = base_env();
        env.remove("AWS_IAM_ROLE");

        let err = load(&env).unwrap_err();
        assert!(matches!(err, MigrateError::Configuration(ref m) if m.contains("AWS_IAM_ROLE")));
    }

    #[test]
    fn test_project_qualified_dataset() {
        let mut env = base_env();
        env.insert("GCP_BIGQUERY_DESTINATION_DATASET", "my-project.warehouse");
        let config = load(&env).unwrap();
        assert_eq!(config.destination.project_id.as_deref(), Some("my-project"));
        assert_eq!(config.destination.dataset, "warehouse");

        env.insert("GCP_PROJECT_ID", "other-project");
        let config = load(&env).unwrap();
        assert_eq!(config.destination.project_id.as_deref(), Some("other-project"));
    }

    #[test]
    fn test_gcp_host_credentials_path() {
        let mut env = base_env();
        env.insert("IS_GCP", "TRUE");
        let config = load(&env).unwrap();
        assert_eq!(
            config.destination.credentials_path,
            PathBuf::from(GCP_HOST_CREDENTIALS_PATH)
        );
    }

    #[test]
    fn test_invalid_number() {
        let mut env = base_env();
        env.insert("RS2BQ_CONCURRENCY", "many");
        assert!(matches!(load(&env), Err(MigrateError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zero_concurrency() {
        let mut env = base_env();
        env.insert("AWS_REDSHIFT_TABLES", "orders,orders");
        assert!(load(&env).unwrap().validate().is_err());

        let mut env = base_env();
        env.insert("RS2BQ_CONCURRENCY", "0");
        assert!(load(&env).unwrap().validate().is_err());

        let mut env = base_env();
        env.insert("AWS_REDSHIFT_TABLES", "../etc");
        assert!(load(&env).unwrap().validate().is_err());
    }

    #[test]
    fn test_validate_requires_paired_aws_keys() {
        let mut env = base_env();
        env.insert("AWS_ACCESS_KEY_ID", "AKIA...");
        assert!(load(&env).unwrap().validate().is_err());

        env.insert("AWS_SECRET_ACCESS_KEY", "secret");
        assert!(load(&env).unwrap().validate().is_ok());
    }

    #[test]
    fn test_overrides_replace_environment_values() {
        let mut env = base_env();
        env.remove("AWS_REDSHIFT_TABLES");
        let mut config = load(&env).unwrap();
        assert!(config.validate().is_err());

        ConfigOverrides {
            tables: Some(vec!["events".to_string(), " ".to_string()]),
            work_dir: Some(PathBuf::from("/tmp/rs2bq")),
            concurrency: Some(4),
            wait_for_export: Some(false),
        }
        .apply(&mut config);

        config.validate().unwrap();
        assert_eq!(config.source.tables, vec!["events"]);
        assert_eq!(config.pipeline.staging_dir(), PathBuf::from("/tmp/rs2bq/staging"));
        assert_eq!(config.pipeline.concurrency, 4);
        assert!(!config.pipeline.wait_for_export);
    }

    #[test]
    fn test_secrets_are_not_serialized() {
        let mut env = base_env();
        env.insert("AWS_ACCESS_KEY_ID", "AKIA...");
        env.insert("AWS_SECRET_ACCESS_KEY", "very-secret");
        env.insert("GCP_ACCESS_TOKEN", "ya29.token");

        let json = serde_json::to_string(&load(&env).unwrap()).unwrap();
        assert!(!json.contains("very-secret"));
        assert!(!json.contains("ya29.token"));
    }
}
