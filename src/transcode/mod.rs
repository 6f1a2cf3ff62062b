use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod direct;
pub mod progress;
pub mod ytdlp;

pub use progress::Progress;

use crate::formats::FormatOption;
use crate::store::JobKey;
use crate::{DownlyError, Result};

/// Callback receiving provider progress reports
pub type ProgressSink = Arc<dyn Fn(Progress) + Send + Sync>;

/// Target codec and bitrate applied to audio requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTarget {
    pub codec: String,
    pub bitrate_kbps: u32,
}

impl Default for AudioTarget {
    fn default() -> Self {
        Self {
            codec: "mp3".to_string(),
            bitrate_kbps: 192,
        }
    }
}

impl AudioTarget {
    /// File extension of the converted output
    pub fn extension(&self) -> &str {
        match self.codec.as_str() {
            "vorbis" => "ogg",
            "aac" => "m4a",
            other => other,
        }
    }
}

/// Everything a provider needs to produce one output file
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub url: String,
    pub format: FormatOption,
    /// Set for audio requests: convert to this codec after download
    pub audio: Option<AudioTarget>,
    /// Private staging directory; the provider writes nowhere else
    pub output_dir: PathBuf,
    /// Filename stem for the produced file
    pub file_stem: String,
    pub ffmpeg_location: Option<PathBuf>,
}

/// Download+convert capability
#[async_trait]
pub trait TranscodeProvider: Send + Sync {
    /// Produce the output file and return its exact path. Dropping the
    /// returned future must stop any external process it started.
    async fn transcode(&self, request: &TranscodeRequest, progress: ProgressSink) -> Result<PathBuf>;

    /// Check if this provider handles the given URL
    fn supports_url(&self, url: &str) -> bool;

    fn provider_name(&self) -> &'static str;
}

/// Runs providers with a timeout and cooperative cancellation, and guarantees
/// that a failed run leaves nothing behind in the staging directory
pub struct TranscodeRunner {
    providers: Vec<Arc<dyn TranscodeProvider>>,
    timeout: Duration,
}

impl TranscodeRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            timeout,
        }
    }

    /// Runner with the direct-link downloader and yt-dlp registered
    pub fn with_defaults(timeout: Duration, yt_dlp_path: impl Into<String>) -> Self {
        let mut runner = Self::new(timeout);
        runner.register(Arc::new(direct::DirectDownloader::new()));
        runner.register(Arc::new(ytdlp::YtDlpTranscoder::new(yt_dlp_path)));
        runner
    }

    /// Register a provider; earlier registrations take precedence
    pub fn register(&mut self, provider: Arc<dyn TranscodeProvider>) {
        self.providers.push(provider);
    }

    fn provider_for(&self, url: &str) -> Result<&Arc<dyn TranscodeProvider>> {
        self.providers
            .iter()
            .find(|provider| provider.supports_url(url))
            .ok_or_else(|| DownlyError::transcode_failed(format!("no provider handles {}", url)))
    }

    pub async fn run(
        &self,
        key: &JobKey,
        request: TranscodeRequest,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let provider = self.provider_for(&request.url)?;
        tracing::info!(
            job = %key.short(),
            provider = provider.provider_name(),
            format = %request.format.id,
            "Starting transcode"
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownlyError::TranscodeCancelled),
            result = tokio::time::timeout(self.timeout, provider.transcode(&request, progress)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(DownlyError::TranscodeTimeout(self.timeout)),
                }
            }
        };

        match outcome {
            Ok(path) => {
                verify_output(&request.output_dir, &path).await?;
                Ok(path)
            }
            Err(e) => {
                // The provider future is gone at this point, so no process is
                // left writing into the staging directory
                if let Err(io_err) = clear_dir(&request.output_dir).await {
                    tracing::warn!(
                        job = %key.short(),
                        "Failed to clear staging directory {}: {}",
                        request.output_dir.display(),
                        io_err
                    );
                }
                tracing::debug!(job = %key.short(), "Transcode ended: {}", e);
                Err(e)
            }
        }
    }
}

/// The produced file must exist inside the staging directory
async fn verify_output(output_dir: &Path, path: &Path) -> Result<()> {
    if !path.starts_with(output_dir) {
        return Err(DownlyError::transcode_failed(format!(
            "provider wrote outside the staging directory: {}",
            path.display()
        )));
    }
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(DownlyError::transcode_failed(format!(
            "provider reported a missing output file: {}",
            path.display()
        ))),
    }
}

/// Remove every entry inside `dir`, keeping the directory itself
pub(crate) async fn clear_dir(dir: &Path) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}
