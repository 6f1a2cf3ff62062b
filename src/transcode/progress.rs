use serde::Serialize;

/// Prefix of the progress lines requested from yt-dlp via `--progress-template`
pub const PROGRESS_PREFIX: &str = "downly-progress:";

/// yt-dlp progress template producing `downly-progress:<done>|<total>|<estimate>|<speed>|<eta>`
pub const PROGRESS_TEMPLATE: &str = "download:downly-progress:%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s";

/// Provider-reported progress of a running transcode
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    /// Completion in percent (0-100)
    pub percent: Option<f64>,

    pub downloaded_bytes: Option<u64>,

    pub total_bytes: Option<u64>,

    /// Bytes per second
    pub speed: Option<f64>,

    /// Seconds remaining
    pub eta_secs: Option<u64>,
}

impl Progress {
    pub fn percent(percent: f64) -> Self {
        Self {
            percent: Some(percent),
            ..Self::default()
        }
    }

    /// Progress computed from a byte count and an optional total
    pub fn bytes(downloaded: u64, total: Option<u64>) -> Self {
        Self {
            percent: total
                .filter(|t| *t > 0)
                .map(|t| (downloaded as f64 / t as f64 * 100.0).min(100.0)),
            downloaded_bytes: Some(downloaded),
            total_bytes: total,
            ..Self::default()
        }
    }
}

fn field(value: &str) -> Option<f64> {
    match value.trim() {
        "" | "NA" | "None" => None,
        v => v.parse::<f64>().ok().filter(|n| n.is_finite() && *n >= 0.0),
    }
}

/// Parse one line of yt-dlp output. Returns `None` for anything that is not a
/// progress line produced by [`PROGRESS_TEMPLATE`].
pub fn parse_progress_line(line: &str) -> Option<Progress> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let mut parts = rest.split('|');

    let downloaded = field(parts.next()?)?.round() as u64;
    let total = field(parts.next()?);
    let estimate = field(parts.next()?);
    let speed = field(parts.next().unwrap_or("NA"));
    let eta = field(parts.next().unwrap_or("NA"));

    let total = total.or(estimate).map(|t| t.round() as u64);

    Some(Progress {
        speed,
        eta_secs: eta.map(|e| e.round() as u64),
        ..Progress::bytes(downloaded, total)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_progress_line() {
        let progress = parse_progress_line("downly-progress:524288|1048576|NA|262144.5|2").unwrap();
        assert_eq!(progress.downloaded_bytes, Some(524288));
        assert_eq!(progress.total_bytes, Some(1048576));
        assert_eq!(progress.percent, Some(50.0));
        assert_eq!(progress.speed, Some(262144.5));
        assert_eq!(progress.eta_secs, Some(2));
    }

    #[test]
    fn test_parse_falls_back_to_estimate() {
        let progress = parse_progress_line("downly-progress:100|NA|400.0|NA|NA").unwrap();
        assert_eq!(progress.total_bytes, Some(400));
        assert_eq!(progress.percent, Some(25.0));
        assert_eq!(progress.speed, None);
    }

    #[test]
    fn test_parse_ignores_other_lines() {
        assert!(parse_progress_line("[youtube] abc: Downloading webpage").is_none());
        assert!(parse_progress_line("/tmp/staging/video.mp3").is_none());
        assert!(parse_progress_line("downly-progress:NA|NA|NA|NA|NA").is_none());
    }
}
