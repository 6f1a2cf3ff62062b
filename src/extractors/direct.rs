use async_trait::async_trait;
use reqwest::Client;
use std::path::Path;
use url::Url;

use super::MetadataProbe;
use crate::formats::{FormatCatalog, FormatOption};
use crate::output::ContentKind;
use crate::{DownlyError, Result};

/// Format identifier of the single option a direct link offers
pub const DIRECT_FORMAT_ID: &str = "direct";

/// Extension of the file a URL points at, if any
fn url_extension(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let filename = parsed.path_segments()?.last()?.to_string();
    Path::new(&filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

/// Check if URL points to an audio or video file
pub fn is_media_url(url: &str) -> bool {
    url_extension(url)
        .map(|ext| ContentKind::from_extension(&ext) != ContentKind::Other)
        .unwrap_or(false)
}

/// Probe for direct media links: a HEAD request instead of a full extraction
pub struct DirectProbe {
    client: Client,
}

impl DirectProbe {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Get content information via HEAD request
    async fn get_content_info(&self, url: &str) -> Result<(Option<String>, Option<u64>)> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| DownlyError::ProbeNetworkError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DownlyError::ProbeNetworkError(format!(
                "Failed to access URL: HTTP {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|ct| ct.to_str().ok())
            .map(|s| s.to_string());

        let content_length = response
            .headers()
            .get("content-length")
            .and_then(|cl| cl.to_str().ok())
            .and_then(|cl| cl.parse::<u64>().ok());

        Ok((content_type, content_length))
    }
}

/// Title from the last path segment, with the extension removed and URL
/// encoding decoded
fn title_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let filename = parsed
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|filename| !filename.is_empty())?
        .to_string();

    let name = match filename.rfind('.') {
        Some(dot_pos) => &filename[..dot_pos],
        None => filename.as_str(),
    };
    Some(
        urlencoding::decode(name)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| name.to_string())
            .replace(['_', '-'], " "),
    )
}

/// Single-option catalog for a direct link
fn direct_catalog(url: &str, content_type: Option<String>, size: Option<u64>) -> FormatCatalog {
    let ext = url_extension(url).unwrap_or_else(|| "bin".to_string());
    let kind = ContentKind::from_extension(&ext);

    let option = FormatOption {
        id: DIRECT_FORMAT_ID.to_string(),
        ext,
        height: None,
        has_video: kind == ContentKind::Video,
        has_audio: true,
        size,
        audio_bitrate: None,
        vcodec: None,
        acodec: None,
        note: content_type,
    };

    FormatCatalog::new(title_from_url(url), vec![option])
}

#[async_trait]
impl MetadataProbe for DirectProbe {
    async fn probe(&self, url: &str) -> Result<FormatCatalog> {
        let (content_type, size) = self.get_content_info(url).await?;
        Ok(direct_catalog(url, content_type, size))
    }

    fn supports_url(&self, url: &str) -> bool {
        is_media_url(url)
    }

    fn platform_name(&self) -> &'static str {
        "Direct URL"
    }
}

impl Default for DirectProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::DownloadSelector;

    #[test]
    fn test_is_media_url() {
        assert!(is_media_url("https://cdn.example.com/media/talk.mp4"));
        assert!(is_media_url("https://cdn.example.com/a/b/song.MP3?token=1"));
        assert!(!is_media_url("https://www.youtube.com/watch?v=abc"));
        assert!(!is_media_url("https://example.com/page.html"));
        assert!(!is_media_url("not a url.mp4"));
    }

    #[test]
    fn test_direct_catalog_resolves_both_selectors_for_video() {
        let catalog = direct_catalog(
            "https://cdn.example.com/My_Talk-2024.mp4",
            Some("video/mp4".into()),
            Some(42),
        );
        assert_eq!(catalog.title.as_deref(), Some("My Talk 2024"));

        let video = catalog.resolve(&DownloadSelector::BestVideo).unwrap();
        assert_eq!(video.id, DIRECT_FORMAT_ID);
        assert_eq!(video.size, Some(42));
        assert!(catalog.resolve(&DownloadSelector::BestAudio).is_ok());
    }

    #[test]
    fn test_direct_catalog_audio_file_has_no_video() {
        let catalog = direct_catalog("https://cdn.example.com/podcast%20ep1.m4a", None, None);
        assert_eq!(catalog.title.as_deref(), Some("podcast ep1"));
        assert!(catalog.resolve(&DownloadSelector::BestVideo).is_err());
    }
}
