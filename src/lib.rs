//! Downly - download media from YouTube, Instagram and more, or extract MP3 audio
//!
//! This library provides a download-and-transcode job orchestrator: jobs are submitted
//! with a media URL and a format selector, probed through yt-dlp (or a plain HTTP HEAD
//! for direct links), downloaded and converted with bounded concurrency, and handed to
//! the caller as an artifact that can be consumed exactly once.

use std::time::Duration;

pub mod cli;
pub mod config;
pub mod extractors;
pub mod formats;
pub mod output;
pub mod scheduler;
pub mod store;
pub mod transcode;
pub mod utils;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use extractors::{Extractor, MetadataProbe};
pub use formats::{DownloadSelector, FormatCatalog, FormatOption};
pub use output::{Artifact, ContentKind, OutputManager};
pub use scheduler::{FetchOutcome, JobHandle, JobScheduler};
pub use store::{Job, JobKey, JobState, JobStore};
pub use transcode::{AudioTarget, TranscodeProvider, TranscodeRunner};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, DownlyError>;

/// Failure kinds recorded on a job and surfaced to callers
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DownlyError {
    #[error("Metadata probe failed: {0}")]
    ProbeNetworkError(String),

    #[error("Metadata probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("Could not parse provider response: {0}")]
    ProbeParseError(String),

    #[error("No matching format: {0}")]
    NoMatchingFormat(String),

    #[error("Transcode failed: {reason}")]
    TranscodeFailed { reason: String },

    #[error("Transcode timed out after {0:?}")]
    TranscodeTimeout(Duration),

    #[error("Transcode cancelled")]
    TranscodeCancelled,

    #[error("Artifact already consumed: {0}")]
    ArtifactAlreadyConsumed(String),

    #[error("Staging I/O error: {0}")]
    StagingIOError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job is not ready: {0}")]
    JobNotReady(String),

    #[error("Artifact expired: {0}")]
    ArtifactExpired(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl DownlyError {
    /// Whether the scheduler may retry the failed stage
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DownlyError::ProbeNetworkError(_)
                | DownlyError::ProbeTimeout(_)
                | DownlyError::TranscodeTimeout(_)
        )
    }

    pub fn transcode_failed(reason: impl Into<String>) -> Self {
        DownlyError::TranscodeFailed {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for DownlyError {
    fn from(err: std::io::Error) -> Self {
        DownlyError::StagingIOError(err.to_string())
    }
}
