//! Error types for item pipelines and the chain that drives them.

use thiserror::Error;

/// Errors raised by a single pipeline while opening, processing an item or closing.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The item is malformed for this pipeline (missing field, wrong shape).
    #[error("Item error: {0}")]
    ItemError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The pipeline's resource can no longer be used; the crawl must stop.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Whether this error makes the pipeline unusable for the rest of the crawl.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::ResourceUnavailable(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::SerializationError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Other(format!("spawn_blocking failed: {}", err))
    }
}

#[cfg(feature = "pipeline-sqlite")]
impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::DatabaseError(err.to_string())
    }
}

#[cfg(feature = "membership-redis")]
impl From<redis::RedisError> for PipelineError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() {
            PipelineError::ResourceUnavailable(err.to_string())
        } else {
            PipelineError::Other(format!("Redis error: {}", err))
        }
    }
}

/// Errors surfaced by a [`Chain`](crate::chain::Chain) as a whole.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A pipeline could not be opened; no item was processed.
    #[error("pipeline '{stage}' failed to open: {source}")]
    Startup {
        stage: String,
        #[source]
        source: PipelineError,
    },

    /// A pipeline reported its resource unusable while processing an item.
    #[error("pipeline '{stage}' became unusable: {source}")]
    StageUnusable {
        stage: String,
        #[source]
        source: PipelineError,
    },

    /// One or more pipelines failed to close. Every pipeline was still given the chance to close.
    #[error("{} pipeline(s) failed to close: {}", .0.len(), describe_failures(.0))]
    Shutdown(Vec<(String, PipelineError)>),
}

fn describe_failures(failures: &[(String, PipelineError)]) -> String {
    failures
        .iter()
        .map(|(stage, err)| format!("{}: {}", stage, err))
        .collect::<Vec<_>>()
        .join("; ")
}
