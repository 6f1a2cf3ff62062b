use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod direct;
pub mod ytdlp;

use crate::formats::FormatCatalog;
use crate::{DownlyError, Result};

/// Trait for probing the available formats of a source
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    /// Fetch format metadata for a URL. Read-only.
    async fn probe(&self, url: &str) -> Result<FormatCatalog>;

    /// Check if this probe supports the given URL
    fn supports_url(&self, url: &str) -> bool;

    /// Get the name of this platform
    fn platform_name(&self) -> &'static str;
}

/// Stable front for the registered probes. Applies the probe timeout and
/// cancellation; never retries.
pub struct Extractor {
    probes: Vec<Arc<dyn MetadataProbe>>,
    timeout: Duration,
}

impl Extractor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            probes: Vec::new(),
            timeout,
        }
    }

    /// Extractor with the direct-link probe and yt-dlp registered
    pub fn with_defaults(timeout: Duration, yt_dlp_path: impl Into<String>) -> Self {
        let mut extractor = Self::new(timeout);
        extractor.register(Arc::new(direct::DirectProbe::new()));
        extractor.register(Arc::new(ytdlp::YtDlpProbe::new(yt_dlp_path)));
        extractor
    }

    /// Register a new probe; earlier registrations take precedence
    pub fn register(&mut self, probe: Arc<dyn MetadataProbe>) {
        self.probes.push(probe);
    }

    /// Find a probe that supports the given URL
    pub fn find_probe(&self, url: &str) -> Option<&dyn MetadataProbe> {
        self.probes
            .iter()
            .find(|probe| probe.supports_url(url))
            .map(|probe| probe.as_ref())
    }

    /// List all supported platforms
    pub fn list_platforms(&self) -> Vec<&'static str> {
        self.probes.iter().map(|probe| probe.platform_name()).collect()
    }

    pub async fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<FormatCatalog> {
        let probe = self
            .find_probe(url)
            .ok_or_else(|| DownlyError::InvalidUrl(format!("no extractor found for URL: {}", url)))?;

        tracing::info!(
            platform = probe.platform_name(),
            "Probing formats for {}",
            crate::utils::extract_domain(url).unwrap_or_else(|| url.to_string())
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownlyError::TranscodeCancelled),
            result = tokio::time::timeout(self.timeout, probe.probe(url)) => {
                result.unwrap_or(Err(DownlyError::ProbeTimeout(self.timeout)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::FormatOption;
    use mockall::predicate::eq;

    fn catalog() -> FormatCatalog {
        FormatCatalog::new(
            Some("clip".into()),
            vec![FormatOption {
                id: "18".into(),
                ext: "mp4".into(),
                height: Some(360),
                has_video: true,
                has_audio: true,
                size: Some(1024),
                audio_bitrate: None,
                vcodec: None,
                acodec: None,
                note: None,
            }],
        )
    }

    struct SlowProbe;

    #[async_trait]
    impl MetadataProbe for SlowProbe {
        async fn probe(&self, _url: &str) -> Result<FormatCatalog> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(FormatCatalog::default())
        }

        fn supports_url(&self, _url: &str) -> bool {
            true
        }

        fn platform_name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_probe_delegates_to_supporting_probe() {
        let mut unsupported = MockMetadataProbe::new();
        unsupported.expect_supports_url().return_const(false);
        unsupported.expect_probe().never();

        let mut supported = MockMetadataProbe::new();
        supported.expect_supports_url().return_const(true);
        supported.expect_platform_name().return_const("mock");
        supported
            .expect_probe()
            .with(eq("https://example.com/v/1"))
            .times(1)
            .returning(|_| Ok(catalog()));

        let mut extractor = Extractor::new(Duration::from_secs(5));
        extractor.register(Arc::new(unsupported));
        extractor.register(Arc::new(supported));

        let result = extractor
            .probe("https://example.com/v/1", &CancellationToken::new())
            .await;
        let catalog = tokio_test::assert_ok!(result);
        assert_eq!(catalog.title.as_deref(), Some("clip"));
    }

    #[tokio::test]
    async fn test_probe_errors_pass_through_without_retry() {
        let mut probe = MockMetadataProbe::new();
        probe.expect_supports_url().return_const(true);
        probe.expect_platform_name().return_const("mock");
        probe
            .expect_probe()
            .times(1)
            .returning(|_| Err(DownlyError::ProbeNetworkError("connection reset".into())));

        let mut extractor = Extractor::new(Duration::from_secs(5));
        extractor.register(Arc::new(probe));

        let err = extractor
            .probe("https://example.com/v/1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, DownlyError::ProbeNetworkError("connection reset".into()));
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let mut extractor = Extractor::new(Duration::from_millis(20));
        extractor.register(Arc::new(SlowProbe));

        let err = extractor
            .probe("https://example.com/v/1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownlyError::ProbeTimeout(_)));
    }

    #[tokio::test]
    async fn test_probe_observes_cancellation() {
        let mut extractor = Extractor::new(Duration::from_secs(60));
        extractor.register(Arc::new(SlowProbe));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = extractor.probe("https://example.com/v/1", &cancel).await.unwrap_err();
        assert_eq!(err, DownlyError::TranscodeCancelled);
    }

    #[tokio::test]
    async fn test_no_probe_for_url() {
        let extractor = Extractor::new(Duration::from_secs(1));
        let result = extractor.probe("https://example.com", &CancellationToken::new()).await;
        tokio_test::assert_err!(result);
    }
}
