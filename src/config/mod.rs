use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::transcode::AudioTarget;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// External tools
    pub providers: ProviderConfig,

    /// Worker pool and retry settings
    pub scheduler: SchedulerConfig,

    /// Time limits for provider calls
    pub timeouts: TimeoutConfig,

    /// Staging and artifact storage
    pub output: OutputConfig,

    /// Conversion target for audio downloads
    pub audio: AudioTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// yt-dlp executable
    pub yt_dlp_path: String,

    /// ffmpeg executable or directory, passed to yt-dlp
    pub ffmpeg_location: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,

    /// Attempts per stage for transient failures
    pub max_attempts: u32,

    /// First retry delay in milliseconds, doubled on every retry
    pub base_delay_ms: u64,

    /// Upper bound for the retry delay in milliseconds
    pub max_delay_ms: u64,

    /// Time a cancelled job gets to stop on its own before teardown
    pub cancel_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub probe_timeout_secs: u64,

    pub transcode_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Staging directory (defaults to a folder in the system temp dir)
    pub staging_dir: Option<PathBuf>,

    /// Artifact directory (defaults to a folder in the system temp dir)
    pub artifacts_dir: Option<PathBuf>,

    /// Seconds an unclaimed artifact is kept
    pub retention_secs: u64,

    /// Seconds a finished job record is kept
    pub record_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: ProviderConfig {
                yt_dlp_path: "yt-dlp".to_string(),
                ffmpeg_location: None,
            },
            scheduler: SchedulerConfig {
                max_concurrent_jobs: 3,
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 30_000,
                cancel_grace_secs: 10,
            },
            timeouts: TimeoutConfig {
                probe_timeout_secs: 60,
                transcode_timeout_secs: 1800,
            },
            output: OutputConfig {
                staging_dir: None,
                artifacts_dir: None,
                retention_secs: 3600,
                record_ttl_secs: 86_400,
            },
            audio: AudioTarget::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or create default
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = fs_err::read_to_string(&config_path)
                .context("Failed to read config file")?;

            let config = Self::from_yaml(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save().await?;
            Ok(config)
        }
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)
            .context("Failed to serialize config")?;

        fs_err::write(&config_path, content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    pub fn config_path() -> Result<PathBuf> {
        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?;

        Ok(config_dir.join("downly").join("config.yaml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.providers.yt_dlp_path.trim().is_empty() {
            anyhow::bail!("providers.yt_dlp_path must not be empty");
        }
        if self.scheduler.max_concurrent_jobs == 0 {
            anyhow::bail!("scheduler.max_concurrent_jobs must be at least 1");
        }
        if self.scheduler.max_attempts == 0 {
            anyhow::bail!("scheduler.max_attempts must be at least 1");
        }
        if self.timeouts.probe_timeout_secs == 0 || self.timeouts.transcode_timeout_secs == 0 {
            anyhow::bail!("timeouts must be greater than zero");
        }
        if self.audio.codec.trim().is_empty() || self.audio.bitrate_kbps == 0 {
            anyhow::bail!("audio target needs a codec and a bitrate");
        }
        if self.staging_dir() == self.artifacts_dir() {
            anyhow::bail!("output.staging_dir and output.artifacts_dir must differ");
        }

        Ok(())
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        println!("  yt-dlp: {}", self.providers.yt_dlp_path);
        if let Some(ffmpeg) = &self.providers.ffmpeg_location {
            println!("  ffmpeg: {}", ffmpeg.display());
        }
        println!("  Concurrent Jobs: {}", self.scheduler.max_concurrent_jobs);
        println!("  Attempts per Stage: {}", self.scheduler.max_attempts);
        println!("  Audio Target: {} @ {}kbps", self.audio.codec, self.audio.bitrate_kbps);
        println!("  Staging Dir: {}", self.staging_dir().display());
        println!("  Artifacts Dir: {}", self.artifacts_dir().display());
        println!("  Artifact Retention: {}s", self.output.retention_secs);
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.output
            .staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("downly").join("staging"))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.output
            .artifacts_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("downly").join("artifacts"))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.probe_timeout_secs)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.transcode_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.codec, "mp3");
        assert_eq!(config.audio.bitrate_kbps, 192);
        assert_eq!(config.scheduler.max_attempts, 3);
    }

    #[test]
    fn test_yaml_round_trip_keeps_overrides() {
        let mut config = Config::default();
        config.scheduler.max_concurrent_jobs = 8;
        config.audio.bitrate_kbps = 320;

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.scheduler.max_concurrent_jobs, 8);
        assert_eq!(parsed.audio.bitrate_kbps, 320);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.scheduler.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shared_output_dirs() {
        let mut config = Config::default();
        config.output.staging_dir = Some(PathBuf::from("/tmp/downly-shared"));
        config.output.artifacts_dir = Some(PathBuf::from("/tmp/downly-shared"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_yaml_is_an_error() {
        assert!(Config::from_yaml("scheduler: [not, a, map]").is_err());
    }
}
