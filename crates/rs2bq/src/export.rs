//! Export phase: one batched UNLOAD per run

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::config::MigratorConfig;
use crate::error::{MigrateError, Result};
use crate::source::{ExportHandle, SourceEngine, StatementStatus};

pub struct Exporter {
    engine: Arc<dyn SourceEngine>,
    template: String,
    database: String,
    schema: String,
    prefix: String,
    iam_role: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl Exporter {
    pub fn new(engine: Arc<dyn SourceEngine>, config: &MigratorConfig) -> Self {
        Self {
            engine,
            template: config.pipeline.unload_template.clone(),
            database: config.source.database.clone(),
            schema: config.source.schema.clone(),
            prefix: config.staging.s3_prefix(),
            iam_role: config.source.iam_role.clone(),
            poll_interval: config.pipeline.export_poll_interval(),
            timeout: config.pipeline.export_timeout(),
        }
    }

    /// Fill the UNLOAD template for one table
    pub fn render_statement(&self, table: &str) -> String {
        self.template
            .replace("{database}", &self.database)
            .replace("{schema}", &self.schema)
            .replace("{prefix}", &self.prefix)
            .replace("{iam_role}", &self.iam_role)
            .replace("{table}", table)
    }

    /// Submit one UNLOAD per table as a single batch.
    ///
    /// Returns as soon as the engine accepts the batch.
    #[instrument(skip(self, tables), fields(tables = tables.len()))]
    pub async fn export(&self, tables: &[String]) -> Result<ExportHandle> {
        let statements: Vec<String> = tables.iter().map(|t| self.render_statement(t)).collect();
        for statement in &statements {
            debug!("{}", statement);
        }

        let handle = self.engine.batch_execute(statements).await?;
        info!(
            statement_id = %handle.statement_id,
            "Export of {} table(s) submitted to {}",
            tables.len(),
            self.prefix
        );
        Ok(handle)
    }

    /// Poll the batch until it finishes, fails or the timeout elapses
    #[instrument(skip(self), fields(statement_id = %handle.statement_id))]
    pub async fn await_completion(&self, handle: &ExportHandle) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        loop {
            match self.engine.statement_status(handle).await? {
                StatementStatus::Finished => {
                    info!("Export finished");
                    return Ok(());
                },
                StatementStatus::Failed(message) => {
                    return Err(MigrateError::source_engine(format!(
                        "Export {} failed: {}",
                        handle.statement_id, message
                    )));
                },
                StatementStatus::Aborted => {
                    return Err(MigrateError::source_engine(format!(
                        "Export {} was aborted",
                        handle.statement_id
                    )));
                },
                status => debug!(?status, "Export still running"),
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(MigrateError::source_engine(format!(
                    "Export {} did not finish within {}s",
                    handle.statement_id,
                    self.timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
