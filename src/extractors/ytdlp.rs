use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;

use super::MetadataProbe;
use crate::formats::FormatCatalog;
use crate::{DownlyError, Result};

/// Format probe backed by `yt-dlp --dump-json`
pub struct YtDlpProbe {
    yt_dlp_path: String,
}

impl YtDlpProbe {
    pub fn new(yt_dlp_path: impl Into<String>) -> Self {
        Self {
            yt_dlp_path: yt_dlp_path.into(),
        }
    }

    /// Get video information using yt-dlp
    async fn get_video_info(&self, url: &str) -> Result<Value> {
        tracing::debug!("Extracting video info for: {}", url);

        let output = Command::new(&self.yt_dlp_path)
            .args([
                "--dump-json",
                "--no-playlist",
                "--skip-download",
                "--no-warnings",
                url,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DownlyError::ProbeNetworkError(format!("failed to run yt-dlp: {}", e)))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(DownlyError::ProbeNetworkError(format!(
                "yt-dlp failed: {}",
                error.trim()
            )));
        }

        parse_info(&output.stdout)
    }
}

/// Parse the first JSON document printed by `--dump-json`
fn parse_info(stdout: &[u8]) -> Result<Value> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| DownlyError::ProbeParseError("yt-dlp printed nothing".to_string()))?;

    serde_json::from_str(line).map_err(|e| DownlyError::ProbeParseError(e.to_string()))
}

#[async_trait]
impl MetadataProbe for YtDlpProbe {
    async fn probe(&self, url: &str) -> Result<FormatCatalog> {
        let info = self.get_video_info(url).await?;
        let catalog = FormatCatalog::from_info_json(&info)?;

        tracing::debug!(
            "yt-dlp reported {} usable formats for {:?}",
            catalog.len(),
            catalog.title
        );
        Ok(catalog)
    }

    fn supports_url(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }

    fn platform_name(&self) -> &'static str {
        "yt-dlp"
    }
}

impl Default for YtDlpProbe {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}
