use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

use crate::formats::DownloadSelector;

#[derive(Parser)]
#[command(
    name = "downly",
    about = "Downly - Download media from YouTube, Instagram and more, or extract MP3 audio",
    version,
    long_about = "A CLI tool for downloading videos from YouTube, Instagram, X and any other site yt-dlp supports, as well as direct media links. Audio downloads are converted to MP3 with ffmpeg."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download a video, or its audio track as MP3
    #[command(group(ArgGroup::new("selection").args(["audio", "video", "format"])))]
    Fetch {
        /// Media page or direct media URL
        #[arg(value_name = "URL")]
        url: String,

        /// Extract the best audio track and convert it to MP3
        #[arg(short, long)]
        audio: bool,

        /// Download the best video (default)
        #[arg(long)]
        video: bool,

        /// Download a specific format id (see `downly formats`)
        #[arg(short, long, value_name = "ID")]
        format: Option<String>,

        /// Directory the finished file is copied to
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        output: PathBuf,
    },

    /// List the formats available for a URL
    Formats {
        #[arg(value_name = "URL")]
        url: String,

        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,

        /// Only list formats carrying a video stream
        #[arg(long)]
        video_only: bool,
    },

    /// Show or reset the configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },

    /// Remove staging and artifact leftovers from earlier runs
    Sweep,

    /// List supported platforms
    Platforms,
}

impl Commands {
    /// Selector for a `fetch` invocation; video unless asked otherwise
    pub fn selector(audio: bool, format: Option<&str>) -> DownloadSelector {
        match (audio, format) {
            (_, Some(id)) => DownloadSelector::Explicit(id.to_string()),
            (true, None) => DownloadSelector::BestAudio,
            (false, None) => DownloadSelector::BestVideo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_audio_selector() {
        let cli = Cli::parse_from(["downly", "fetch", "https://youtu.be/abc", "--audio"]);
        match cli.command {
            Commands::Fetch { audio, format, .. } => {
                assert_eq!(
                    Commands::selector(audio, format.as_deref()),
                    DownloadSelector::BestAudio
                );
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_fetch_defaults_to_video() {
        let cli = Cli::parse_from(["downly", "fetch", "https://youtu.be/abc"]);
        match cli.command {
            Commands::Fetch { audio, format, output, .. } => {
                assert_eq!(
                    Commands::selector(audio, format.as_deref()),
                    DownloadSelector::BestVideo
                );
                assert_eq!(output, PathBuf::from("."));
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_selection_flags_conflict() {
        let result = Cli::try_parse_from([
            "downly",
            "fetch",
            "https://youtu.be/abc",
            "--audio",
            "--format",
            "22",
        ]);
        assert!(result.is_err());
    }
}
