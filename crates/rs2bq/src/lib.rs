//! rs2bq Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Moves tables from Amazon Redshift to Google BigQuery through S3:
//!
//! 1. **Export**: one batched `UNLOAD` writes every table as CSV under
//!    `s3://<bucket>/<output_dir>/<table>/`
//! 2. **Schema fetch**: each table is described through the Redshift Data
//!    API and its columns persisted under `<work_dir>/schemas/`
//! 3. **Load**: each table's shards are downloaded to
//!    `<work_dir>/staging/<table>/` and loaded file by file into BigQuery
//!
//! The external systems sit behind [`source::SourceEngine`],
//! [`storage::ObjectStore`], [`destination::Warehouse`] and
//! [`schema::SchemaStore`]; [`orchestrator::Orchestrator`] sequences the
//! phases over a [`context::MigrationContext`].
//!
//! # Example
//!
//! ```no_run
//! use rs2bq::{config::MigratorConfig, context::MigrationContext, orchestrator::Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MigratorConfig::load()?;
//!     let ctx = MigrationContext::from_config(config).await?;
//!     let report = Orchestrator::new(ctx).run().await?;
//!     println!("{} table(s) migrated", report.tables.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod destination;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod loader;
pub mod orchestrator;
pub mod schema;
pub mod source;
pub mod staging;
pub mod storage;
pub mod typemap;

pub use error::{MigrateError, Result};
