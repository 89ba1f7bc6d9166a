use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("{url} returned status {status} [{context}]")]
    ClientError {
        status: u16,
        url: String,
        context: String,
    },

    #[error("max retries ({attempts}) exhausted [{context}]: {last_error}")]
    RetryExhausted {
        attempts: u32,
        context: String,
        last_error: String,
    },

    #[error("fetch cancelled [{0}]")]
    Cancelled(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("failed to decode response [{context}]: {message}")]
    Decode { context: String, message: String },

    #[error("malformed response [{context}]: {message}")]
    Structural { context: String, message: String },

    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("missing config file indicator-ingest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid settings for source {source_name}: {message}")]
    InvalidSourceSettings {
        source_name: String,
        message: String,
    },

    #[error("missing API key for source {0}")]
    MissingApiKey(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("all {count} units of {source_name} failed: {details}")]
    AllUnitsFailed {
        source_name: String,
        count: usize,
        details: String,
    },

    #[error("all {0} configured sources failed")]
    AllSourcesFailed(usize),
}

impl IngestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            IngestError::ClientError { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn structural(context: &str, message: impl Into<String>) -> Self {
        IngestError::Structural {
            context: context.to_string(),
            message: message.into(),
        }
    }
}
