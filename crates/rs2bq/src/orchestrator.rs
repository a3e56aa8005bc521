//! Migration orchestrator
//!
//! Drives the three phases in order: export, schema fetch, load. Phases 1 and
//! 2 must complete for every table before any data is loaded. During loading,
//! the first failing table stops the run; tables loaded before it stay loaded
//! and the failing table's staging directory is left on disk for inspection.
//! With concurrency above one, tables already in flight when another fails
//! are run to completion, and no further table is started.
//!
//! Progress is published as [`RunState`] on a watch channel.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::context::MigrationContext;
use crate::error::{MigrateError, TableError};
use crate::export::Exporter;
use crate::fetcher::SchemaFetcher;
use crate::loader::{LoadOutcome, Loader};
use crate::schema::{TableName, TableSchema};
use crate::source::ExportHandle;
use crate::staging::StagingDownloader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Export,
    FetchSchemas,
    LoadTables,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Export => "export",
            Phase::FetchSchemas => "schema fetch",
            Phase::LoadTables => "table load",
        })
    }
}

/// Where a table is within the load phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableStep {
    Downloading,
    /// The export produced no objects
    Skipped,
    UploadingFile { index: usize, key: String },
    CleaningUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Exporting,
    FetchingSchemas,
    LoadingTables {
        index: usize,
        table: TableName,
        step: TableStep,
    },
    Done,
    Failed {
        phase: Phase,
        table: Option<TableName>,
    },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed { .. })
    }
}

/// A run failure with the phase, and table when known, that raised it
#[derive(Error, Debug)]
#[error("{phase} failed{}: {source}", .table.as_ref().map(|t| format!(" for table '{}'", t)).unwrap_or_default())]
pub struct PipelineError {
    pub phase: Phase,
    pub table: Option<TableName>,
    #[source]
    pub source: MigrateError,
}

impl PipelineError {
    fn phase(phase: Phase, source: MigrateError) -> Self {
        Self {
            phase,
            table: None,
            source,
        }
    }

    fn table(phase: Phase, failure: TableError) -> Self {
        Self {
            phase,
            table: Some(failure.table),
            source: failure.source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Loaded { files: usize, rows: usize },
    /// The export produced no objects
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: TableName,
    #[serde(flatten)]
    pub outcome: TableOutcome,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub export: Option<ExportHandle>,
    pub tables: Vec<TableReport>,
    pub duration_seconds: f64,
}

pub struct Orchestrator {
    ctx: MigrationContext,
    exporter: Exporter,
    fetcher: SchemaFetcher,
    downloader: StagingDownloader,
    loader: Loader,
    state: watch::Sender<RunState>,
}

impl Orchestrator {
    pub fn new(ctx: MigrationContext) -> Self {
        let config = ctx.config.clone();
        let (state, _) = watch::channel(RunState::Idle);

        Self {
            exporter: Exporter::new(ctx.engine.clone(), &config),
            fetcher: SchemaFetcher::new(
                ctx.engine.clone(),
                ctx.schemas.clone(),
                config.source.schema.clone(),
            ),
            downloader: StagingDownloader::new(
                ctx.objects.clone(),
                config.staging.clone(),
                config.pipeline.staging_dir(),
            ),
            loader: Loader::new(ctx.warehouse.clone(), ctx.schemas.clone()),
            ctx,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    fn tables(&self) -> &[TableName] {
        &self.ctx.config.source.tables
    }

    fn transition(&self, next: RunState) {
        self.state.send_replace(next);
    }

    fn fail(&self, err: PipelineError) -> PipelineError {
        error!(phase = %err.phase, table = ?err.table, "Migration failed: {}", err.source);
        self.transition(RunState::Failed {
            phase: err.phase,
            table: err.table.clone(),
        });
        err
    }

    /// Export, fetch schemas, then load every table
    #[instrument(skip(self), fields(tables = self.tables().len()))]
    pub async fn run(&self) -> Result<MigrationReport, PipelineError> {
        let start = Instant::now();
        info!("Starting migration of {} table(s)", self.tables().len());

        let handle = self.export_phase().await.map_err(|e| self.fail(e))?;
        let schemas = self.fetch_phase().await.map_err(|e| self.fail(e))?;
        for schema in &schemas {
            if let Err(e) = self.loader.prime(schema).await {
                let failure = TableError::new(schema.table.as_str(), e);
                return Err(self.fail(PipelineError::table(Phase::FetchSchemas, failure)));
            }
        }
        let tables = self.load_phase().await.map_err(|e| self.fail(e))?;

        self.transition(RunState::Done);
        let report = MigrationReport {
            export: Some(handle),
            tables,
            duration_seconds: start.elapsed().as_secs_f64(),
        };
        info!(
            duration_secs = report.duration_seconds,
            "Migration complete: {} table(s)",
            report.tables.len()
        );
        Ok(report)
    }

    /// Submit (and by default await) the export without loading anything
    pub async fn export_only(&self) -> Result<ExportHandle, PipelineError> {
        let handle = self.export_phase().await.map_err(|e| self.fail(e))?;
        self.transition(RunState::Done);
        Ok(handle)
    }

    /// Describe and persist every table's schema
    pub async fn fetch_schemas_only(&self) -> Result<Vec<TableSchema>, PipelineError> {
        let schemas = self.fetch_phase().await.map_err(|e| self.fail(e))?;
        self.transition(RunState::Done);
        Ok(schemas)
    }

    /// Load from an export and schemas produced by an earlier run
    pub async fn load_only(&self) -> Result<MigrationReport, PipelineError> {
        let start = Instant::now();
        let tables = self.load_phase().await.map_err(|e| self.fail(e))?;
        self.transition(RunState::Done);
        Ok(MigrationReport {
            export: None,
            tables,
            duration_seconds: start.elapsed().as_secs_f64(),
        })
    }

    async fn export_phase(&self) -> Result<ExportHandle, PipelineError> {
        self.transition(RunState::Exporting);
        info!("Phase 1/3: exporting tables");

        let to_err = |e| PipelineError::phase(Phase::Export, e);
        let handle = self.exporter.export(self.tables()).await.map_err(to_err)?;

        if self.ctx.config.pipeline.wait_for_export {
            self.exporter.await_completion(&handle).await.map_err(to_err)?;
        } else {
            warn!("Not waiting for the export; later phases may see partial output");
        }
        Ok(handle)
    }

    async fn fetch_phase(&self) -> Result<Vec<TableSchema>, PipelineError> {
        self.transition(RunState::FetchingSchemas);
        info!("Phase 2/3: fetching schemas");

        self.fetcher
            .fetch(self.tables(), self.ctx.config.pipeline.concurrency)
            .await
            .map_err(|e| PipelineError::table(Phase::FetchSchemas, e))
    }

    async fn load_phase(&self) -> Result<Vec<TableReport>, PipelineError> {
        let concurrency = self.ctx.config.pipeline.concurrency;
        info!("Phase 3/3: loading tables (concurrency={})", concurrency);

        let halted = AtomicBool::new(false);
        let halted = &halted;
        let results: Vec<Option<Result<TableReport, TableError>>> =
            stream::iter(self.tables().iter().enumerate())
                .map(|(index, table)| async move {
                    if halted.load(Ordering::SeqCst) {
                        return None;
                    }
                    let result = self
                        .load_table(index, table)
                        .await
                        .map_err(|e| TableError::new(table.as_str(), e));
                    if result.is_err() {
                        halted.store(true, Ordering::SeqCst);
                    }
                    Some(result)
                })
                .buffered(concurrency.max(1))
                .collect()
                .await;

        let mut reports = Vec::with_capacity(results.len());
        let mut failure: Option<TableError> = None;
        for result in results.into_iter().flatten() {
            match result {
                Ok(report) => reports.push(report),
                Err(e) if failure.is_none() => failure = Some(e),
                Err(e) => error!(table = %e.table, "Table load also failed: {}", e.source),
            }
        }

        match failure {
            Some(e) => {
                if !reports.is_empty() {
                    let loaded: Vec<&str> = reports.iter().map(|r| r.table.as_str()).collect();
                    warn!(?loaded, "Tables completed before the run stopped");
                }
                Err(PipelineError::table(Phase::LoadTables, e))
            },
            None => Ok(reports),
        }
    }

    #[instrument(skip(self))]
    async fn load_table(&self, index: usize, table: &str) -> Result<TableReport, MigrateError> {
        let start = Instant::now();
        let at = |step| RunState::LoadingTables {
            index,
            table: table.to_string(),
            step,
        };

        self.transition(at(TableStep::Downloading));
        let staged = self.downloader.download(table).await?;

        if staged.is_empty() {
            self.transition(at(TableStep::Skipped));
            info!(table, "Export is empty, skipping table");
            return Ok(TableReport {
                table: table.to_string(),
                outcome: TableOutcome::Skipped,
                duration_seconds: start.elapsed().as_secs_f64(),
            });
        }

        let mut rows = 0;
        for (file_index, object) in staged.iter().enumerate() {
            self.transition(at(TableStep::UploadingFile {
                index: file_index,
                key: object.key.clone(),
            }));

            match self.loader.load(&object.local_path, table).await? {
                LoadOutcome::Success { rows: loaded } => rows += loaded,
                LoadOutcome::Error(reason) => {
                    warn!(
                        table,
                        staging = %self.downloader.table_dir(table).display(),
                        "Keeping staged files after failed load"
                    );
                    return Err(MigrateError::destination(format!(
                        "{}: {}",
                        object.key, reason
                    )));
                },
            }
        }

        self.transition(at(TableStep::CleaningUp));
        self.downloader.cleanup(table).await?;

        info!(table, files = staged.len(), rows, "Table migrated");
        Ok(TableReport {
            table: table.to_string(),
            outcome: TableOutcome::Loaded {
                files: staged.len(),
                rows,
            },
            duration_seconds: start.elapsed().as_secs_f64(),
        })
    }
}
