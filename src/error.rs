use std::path::PathBuf;
use thiserror::Error;

use crate::models::{ConfigError, JobState, ProviderErrorKind};

/// Main error type for sessionlens
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Report store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transcript error: {0}")]
    Transcript(#[from] TranscriptError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by an AI provider call
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Request timeout after {0} ms")]
    Timeout(u64),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Collapse into the classification the pipeline reasons about
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::Timeout(_) => ProviderErrorKind::Timeout,
            ProviderError::QuotaExceeded(_) => ProviderErrorKind::QuotaExceeded,
            ProviderError::HttpError { status: 429, .. } => ProviderErrorKind::QuotaExceeded,
            ProviderError::HttpError { message, .. } if mentions_quota(message) => {
                ProviderErrorKind::QuotaExceeded
            }
            ProviderError::ParseError(_) => ProviderErrorKind::MalformedResponse,
            ProviderError::Cancelled => ProviderErrorKind::Cancelled,
            ProviderError::ConnectionRefused(_)
            | ProviderError::HttpError { .. }
            | ProviderError::RequestFailed(_) => ProviderErrorKind::Transient,
        }
    }
}

fn mentions_quota(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("quota") || lower.contains("rate limit") || lower.contains("insufficient_quota")
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(0)
        } else if err.is_connect() {
            ProviderError::ConnectionRefused(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::HttpError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            ProviderError::ParseError(err.to_string())
        } else {
            ProviderError::RequestFailed(err.to_string())
        }
    }
}

/// Errors returned by the job queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} already finished as {state}")]
    AlreadyTerminal { job_id: String, state: JobState },

    #[error("Invalid media reference: {0:?}")]
    InvalidMediaRef(String),

    #[error("Queue is shutting down")]
    ShuttingDown,

    #[error("Report store error: {0}")]
    Store(String),
}

/// Errors related to report store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read report store {0}: {1}")]
    ReadError(PathBuf, std::io::Error),

    #[error("Failed to write report store {0}: {1}")]
    WriteError(PathBuf, std::io::Error),

    #[error("Failed to parse report store {0}: {1}")]
    ParseError(PathBuf, String),

    #[error("Failed to serialize report store: {0}")]
    SerializeError(String),

    #[error("Report store write task failed: {0}")]
    TaskFailed(String),
}

/// Errors from the transcription collaborator
#[derive(Error, Debug)]
pub enum TranscriptError {
    #[error("Transcript not found for {0}")]
    NotFound(String),

    #[error("Failed to read transcript {0}: {1}")]
    ReadError(PathBuf, std::io::Error),

    #[error("Transcript for {0} is empty")]
    Empty(String),

    #[error("Media reference escapes the transcript root: {0}")]
    OutsideRoot(String),
}

/// Errors that end a pass without producing a report update
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Job cancelled")]
    Cancelled,

    #[error("No providers configured")]
    NoProviders,
}

pub type Result<T> = std::result::Result<T, AnalyzerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_kind_mapping() {
        assert_eq!(ProviderError::Timeout(100).kind(), ProviderErrorKind::Timeout);
        assert_eq!(
            ProviderError::HttpError { status: 429, message: "slow down".to_string() }.kind(),
            ProviderErrorKind::QuotaExceeded
        );
        assert_eq!(
            ProviderError::HttpError { status: 403, message: "You exceeded your current quota".to_string() }.kind(),
            ProviderErrorKind::QuotaExceeded
        );
        assert_eq!(
            ProviderError::HttpError { status: 503, message: "unavailable".to_string() }.kind(),
            ProviderErrorKind::Transient
        );
        assert_eq!(ProviderError::ParseError("eof".to_string()).kind(), ProviderErrorKind::MalformedResponse);
        assert_eq!(ProviderError::ConnectionRefused("x".to_string()).kind(), ProviderErrorKind::Transient);
        assert_eq!(ProviderError::Cancelled.kind(), ProviderErrorKind::Cancelled);
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::AlreadyTerminal {
            job_id: "abc".to_string(),
            state: JobState::Complete,
        };
        assert_eq!(err.to_string(), "Job abc already finished as COMPLETE");
    }

    #[test]
    fn test_error_conversion() {
        let err: AnalyzerError = PipelineError::NoProviders.into();
        assert!(matches!(err, AnalyzerError::Pipeline(PipelineError::NoProviders)));
    }
}
