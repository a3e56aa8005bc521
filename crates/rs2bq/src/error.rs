//! Error types for the migrator
//!
//! Every failure a collaborator can raise maps onto one variant here. The
//! orchestrator wraps them in [`crate::orchestrator::PipelineError`] to record
//! which phase and table were running.

use thiserror::Error;

/// Result type alias for migrator operations
pub type Result<T> = std::result::Result<T, MigrateError>;

#[derive(Error, Debug)]
pub enum MigrateError {
    /// Missing or invalid setting, raised before any collaborator is called
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Source column type has no BigQuery counterpart
    #[error("Unsupported source type '{source_type}' for column '{column}'")]
    UnsupportedType { column: String, source_type: String },

    /// Column descriptor lacks an attribute its destination type needs
    #[error("Column '{column}' is missing required attribute '{attribute}'")]
    MissingAttribute { column: String, attribute: &'static str },

    /// Export, describe or status call to the source engine failed
    #[error("Source engine error: {0}")]
    SourceEngine(String),

    /// Listing or download from the staging bucket failed
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// Destination warehouse rejected or failed a load
    #[error("Destination load error: {0}")]
    DestinationLoad(String),

    /// A downloaded export file could not be parsed
    #[error("Staged file {path}: {message}")]
    StagedFile { path: String, message: String },

    /// No persisted schema exists for the table
    #[error("No schema recorded for table '{0}'")]
    SchemaNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrateError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn source_engine(msg: impl Into<String>) -> Self {
        Self::SourceEngine(msg.into())
    }

    pub fn object_store(msg: impl Into<String>) -> Self {
        Self::ObjectStore(msg.into())
    }

    pub fn destination(msg: impl Into<String>) -> Self {
        Self::DestinationLoad(msg.into())
    }

    pub fn staged_file(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StagedFile {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A failure attributed to one table
#[derive(Error, Debug)]
#[error("table '{table}': {source}")]
pub struct TableError {
    pub table: String,
    #[source]
    pub source: MigrateError,
}

impl TableError {
    pub fn new(table: impl Into<String>, source: MigrateError) -> Self {
        Self {
            table: table.into(),
            source,
        }
    }
}
