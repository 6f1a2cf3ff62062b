use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{AudioTarget, Progress, ProgressSink, TranscodeProvider, TranscodeRequest};
use crate::extractors::direct::is_media_url;
use crate::{DownlyError, Result};

/// Plain HTTP download for direct media links, with an ffmpeg pass for
/// audio requests
pub struct DirectDownloader {
    client: Client,
}

impl DirectDownloader {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Stream the response body into `part_path`
    async fn download(&self, url: &str, part_path: &Path, progress: &ProgressSink) -> Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownlyError::transcode_failed(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(DownlyError::transcode_failed(format!(
                "Failed to download media: HTTP {}",
                response.status()
            )));
        }

        let total_size = response.content_length();
        let mut file = tokio::fs::File::create(part_path).await?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| DownlyError::transcode_failed(format!("download interrupted: {}", e)))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress(Progress::bytes(downloaded, total_size));
        }
        file.flush().await?;

        Ok(downloaded)
    }

    /// Convert the downloaded file to the requested audio codec
    async fn convert_audio(
        &self,
        ffmpeg: &Path,
        input: &Path,
        output: &Path,
        target: &AudioTarget,
    ) -> Result<()> {
        let encoder = match target.codec.as_str() {
            "mp3" => "libmp3lame",
            "opus" => "libopus",
            "vorbis" => "libvorbis",
            other => other,
        };

        let result = Command::new(ffmpeg)
            .args(["-y", "-loglevel", "error", "-i"])
            .arg(input)
            .args(["-vn", "-codec:a", encoder, "-b:a"])
            .arg(format!("{}k", target.bitrate_kbps))
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DownlyError::transcode_failed(format!("failed to run ffmpeg: {}", e)))?;

        if !result.status.success() {
            let error = String::from_utf8_lossy(&result.stderr);
            return Err(DownlyError::transcode_failed(format!(
                "ffmpeg conversion failed: {}",
                error.trim()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl TranscodeProvider for DirectDownloader {
    async fn transcode(&self, request: &TranscodeRequest, progress: ProgressSink) -> Result<PathBuf> {
        let source_path = request
            .output_dir
            .join(format!("{}.{}", request.file_stem, request.format.ext));
        let part_path = request
            .output_dir
            .join(format!("{}.{}.part", request.file_stem, request.format.ext));

        let bytes = self.download(&request.url, &part_path, &progress).await?;
        tracing::debug!("Downloaded {} bytes from {}", bytes, request.url);

        let Some(target) = &request.audio else {
            tokio::fs::rename(&part_path, &source_path).await?;
            return Ok(source_path);
        };

        let output = request
            .output_dir
            .join(format!("{}.{}", request.file_stem, target.extension()));
        let converting = request
            .output_dir
            .join(format!("{}.converting.{}", request.file_stem, target.extension()));
        let ffmpeg = request
            .ffmpeg_location
            .clone()
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));

        self.convert_audio(&ffmpeg, &part_path, &converting, target).await?;
        tokio::fs::rename(&converting, &output).await?;
        tokio::fs::remove_file(&part_path).await?;

        Ok(output)
    }

    fn supports_url(&self, url: &str) -> bool {
        is_media_url(url)
    }

    fn provider_name(&self) -> &'static str {
        "direct"
    }
}

impl Default for DirectDownloader {
    fn default() -> Self {
        Self::new()
    }
}
