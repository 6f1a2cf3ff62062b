use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::{DownlyError, Result};

/// One concrete encoding/container choice for a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatOption {
    /// Provider format identifier (yt-dlp `format_id`)
    pub id: String,

    /// Container extension (mp4, webm, m4a, ...)
    pub ext: String,

    /// Vertical resolution in pixels, `None` for audio-only streams
    pub height: Option<u32>,

    pub has_video: bool,

    pub has_audio: bool,

    /// Approximate size in bytes if the provider reported one
    pub size: Option<u64>,

    /// Audio bitrate in kbps
    pub audio_bitrate: Option<f64>,

    pub vcodec: Option<String>,

    pub acodec: Option<String>,

    /// Free-text description from the provider
    pub note: Option<String>,
}

impl FormatOption {
    /// Human readable resolution class, e.g. `1080p` or `audio only`
    pub fn resolution_label(&self) -> String {
        match (self.height, self.has_video) {
            (Some(height), _) => format!("{}p", height),
            (None, true) => "?p".to_string(),
            (None, false) => "audio only".to_string(),
        }
    }

    fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }
}

/// Provider-reported format record. Every field is optional since the
/// extraction provider is free to omit any of them.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    height: Option<f64>,
    width: Option<f64>,
    resolution: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    abr: Option<f64>,
    tbr: Option<f64>,
    format_note: Option<String>,
}

impl RawFormat {
    fn into_option(self) -> Option<FormatOption> {
        let id = self.format_id.filter(|id| !id.trim().is_empty())?;

        let vcodec = self.vcodec.filter(|c| !c.is_empty());
        let acodec = self.acodec.filter(|c| !c.is_empty());
        let has_dimensions = self.height.is_some() || self.width.is_some();

        let (has_video, has_audio) = match (vcodec.as_deref(), acodec.as_deref()) {
            // Direct-link containers come without codec information
            (None, None) if !has_dimensions => {
                let audio_only = self
                    .resolution
                    .as_deref()
                    .map(|r| r.eq_ignore_ascii_case("audio only"))
                    .unwrap_or(false);
                (!audio_only, true)
            }
            (v, a) => (
                v.map(|c| c != "none").unwrap_or(has_dimensions),
                a.map(|c| c != "none").unwrap_or(false),
            ),
        };

        let height = self
            .height
            .filter(|h| *h > 0.0)
            .map(|h| h as u32)
            .or_else(|| self.resolution.as_deref().and_then(parse_resolution))
            .filter(|_| has_video);

        let size = self
            .filesize
            .or(self.filesize_approx)
            .filter(|s| *s > 0.0)
            .map(|s| s as u64);

        let audio_bitrate = self
            .abr
            .or(if has_video { None } else { self.tbr })
            .filter(|b| *b > 0.0 && has_audio);

        Some(FormatOption {
            id,
            ext: self.ext.unwrap_or_else(|| "unknown".to_string()),
            height,
            has_video,
            has_audio,
            size,
            audio_bitrate,
            vcodec: vcodec.filter(|c| c != "none"),
            acodec: acodec.filter(|c| c != "none"),
            note: self.format_note,
        })
    }
}

/// Parse resolution strings such as `1920x1080` or `720p`
fn parse_resolution(resolution: &str) -> Option<u32> {
    let resolution = resolution.trim().to_lowercase();
    if let Some((_, height)) = resolution.split_once('x') {
        return height.trim().parse().ok();
    }
    resolution.strip_suffix('p')?.parse().ok()
}

/// The caller's declared intent for which format to choose
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadSelector {
    BestAudio,
    BestVideo,
    Explicit(String),
}

impl DownloadSelector {
    /// Whether the request ends in an audio extraction
    pub fn wants_audio(&self) -> bool {
        matches!(self, DownloadSelector::BestAudio)
    }

    /// Stable textual form used for job identity
    pub fn canonical(&self) -> String {
        match self {
            DownloadSelector::BestAudio => "bestaudio".to_string(),
            DownloadSelector::BestVideo => "bestvideo".to_string(),
            DownloadSelector::Explicit(id) => format!("id:{}", id),
        }
    }
}

impl fmt::Display for DownloadSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadSelector::BestAudio => write!(f, "best audio"),
            DownloadSelector::BestVideo => write!(f, "best video"),
            DownloadSelector::Explicit(id) => write!(f, "format {}", id),
        }
    }
}

impl FromStr for DownloadSelector {
    type Err = DownlyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(DownlyError::NoMatchingFormat("empty format selector".to_string())),
            "audio" | "bestaudio" | "mp3" => Ok(DownloadSelector::BestAudio),
            "video" | "bestvideo" | "best" => Ok(DownloadSelector::BestVideo),
            other => Ok(DownloadSelector::Explicit(
                other.strip_prefix("id:").unwrap_or(other).to_string(),
            )),
        }
    }
}

/// Normalized set of format options reported for one source
#[derive(Debug, Clone, Default, Serialize)]
pub struct FormatCatalog {
    pub title: Option<String>,
    options: Vec<FormatOption>,
}

impl FormatCatalog {
    pub fn new(title: Option<String>, options: Vec<FormatOption>) -> Self {
        Self { title, options }
    }

    /// Build a catalog from raw provider records, dropping records without a
    /// format identifier and records that cannot be read at all
    pub fn from_raw(records: &[Value]) -> Self {
        let options = records
            .iter()
            .filter_map(|record| match serde_json::from_value::<RawFormat>(record.clone()) {
                Ok(raw) => raw.into_option(),
                Err(e) => {
                    tracing::debug!("Dropping malformed format record: {}", e);
                    None
                }
            })
            .collect();

        Self {
            title: None,
            options,
        }
    }

    /// Build a catalog from a full yt-dlp info document. Sources that expose a
    /// single format carry it at the top level instead of in `formats`.
    pub fn from_info_json(info: &Value) -> Result<Self> {
        let object = info
            .as_object()
            .ok_or_else(|| DownlyError::ProbeParseError("expected a JSON object".to_string()))?;

        let mut catalog = match object.get("formats") {
            Some(Value::Array(records)) => Self::from_raw(records),
            Some(Value::Null) | None => Self::from_raw(std::slice::from_ref(info)),
            Some(_) => {
                return Err(DownlyError::ProbeParseError(
                    "`formats` is not an array".to_string(),
                ))
            }
        };
        catalog.title = object
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(catalog)
    }

    pub fn options(&self) -> &[FormatOption] {
        &self.options
    }

    /// Every option carrying a video stream, for a custom format picker
    pub fn video_options(&self) -> impl Iterator<Item = &FormatOption> {
        self.options.iter().filter(|option| option.has_video)
    }

    pub fn get(&self, id: &str) -> Option<&FormatOption> {
        self.options.iter().find(|option| option.id == id)
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Resolve a selector into exactly one format option
    pub fn resolve(&self, selector: &DownloadSelector) -> Result<FormatOption> {
        if self.options.is_empty() {
            return Err(DownlyError::NoMatchingFormat(
                "the source reports no formats".to_string(),
            ));
        }

        let chosen = match selector {
            DownloadSelector::BestVideo => self
                .options
                .iter()
                .filter(|o| o.has_video && o.has_audio)
                .max_by(|a, b| compare_video(a, b)),
            DownloadSelector::BestAudio => self
                .options
                .iter()
                .filter(|o| o.has_audio)
                .max_by(|a, b| compare_audio(a, b)),
            DownloadSelector::Explicit(id) => self.get(id),
        };

        chosen
            .cloned()
            .ok_or_else(|| DownlyError::NoMatchingFormat(format!("nothing matches {}", selector)))
    }
}

/// Smaller known sizes rank higher, unknown sizes rank lowest
fn compare_size(a: Option<u64>, b: Option<u64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn compare_video(a: &FormatOption, b: &FormatOption) -> Ordering {
    a.height
        .cmp(&b.height)
        .then_with(|| compare_size(a.size, b.size))
        .then_with(|| b.id.cmp(&a.id))
}

fn compare_audio(a: &FormatOption, b: &FormatOption) -> Ordering {
    a.is_audio_only()
        .cmp(&b.is_audio_only())
        .then_with(|| {
            a.audio_bitrate
                .unwrap_or(0.0)
                .total_cmp(&b.audio_bitrate.unwrap_or(0.0))
        })
        .then_with(|| compare_size(a.size, b.size))
        .then_with(|| b.id.cmp(&a.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MB: u64 = 1024 * 1024;

    fn option(id: &str, ext: &str, height: Option<u32>, video: bool, audio: bool, size: u64) -> FormatOption {
        FormatOption {
            id: id.to_string(),
            ext: ext.to_string(),
            height,
            has_video: video,
            has_audio: audio,
            size: Some(size),
            audio_bitrate: None,
            vcodec: None,
            acodec: None,
            note: None,
        }
    }

    #[test]
    fn test_best_video_prefers_resolution_with_audio() {
        let catalog = FormatCatalog::new(
            None,
            vec![
                option("18", "mp4", Some(480), true, true, 5 * MB),
                option("22", "mp4", Some(1080), true, true, 20 * MB),
                option("251", "webm", Some(1080), false, true, 18 * MB),
            ],
        );

        let chosen = catalog.resolve(&DownloadSelector::BestVideo).unwrap();
        assert_eq!(chosen.id, "22");
        assert_eq!(chosen.ext, "mp4");

        let video: Vec<&str> = catalog.video_options().map(|o| o.id.as_str()).collect();
        assert_eq!(video, vec!["18", "22"]);
    }

    #[test]
    fn test_best_video_breaks_ties_on_size() {
        let catalog = FormatCatalog::new(
            None,
            vec![
                option("a", "mp4", Some(720), true, true, 30 * MB),
                option("b", "webm", Some(720), true, true, 12 * MB),
            ],
        );

        assert_eq!(catalog.resolve(&DownloadSelector::BestVideo).unwrap().id, "b");
    }

    #[test]
    fn test_explicit_missing_id_fails() {
        let catalog = FormatCatalog::new(None, vec![option("18", "mp4", Some(360), true, true, MB)]);

        let err = catalog
            .resolve(&DownloadSelector::Explicit("999".into()))
            .unwrap_err();
        assert!(matches!(err, DownlyError::NoMatchingFormat(_)));
    }

    #[test]
    fn test_empty_catalog_fails() {
        let catalog = FormatCatalog::default();
        assert!(matches!(
            catalog.resolve(&DownloadSelector::BestAudio),
            Err(DownlyError::NoMatchingFormat(_))
        ));
    }

    #[test]
    fn test_best_audio_prefers_audio_only_high_bitrate() {
        let mut low = option("139", "m4a", None, false, true, 2 * MB);
        low.audio_bitrate = Some(48.0);
        let mut high = option("251", "webm", None, false, true, 4 * MB);
        high.audio_bitrate = Some(160.0);
        let mut muxed = option("22", "mp4", Some(720), true, true, 20 * MB);
        muxed.audio_bitrate = Some(192.0);

        let catalog = FormatCatalog::new(None, vec![low, muxed, high]);
        assert_eq!(catalog.resolve(&DownloadSelector::BestAudio).unwrap().id, "251");
    }

    #[test]
    fn test_from_raw_drops_records_without_id() {
        let records = vec![
            json!({"format_id": "18", "ext": "mp4", "height": 360, "vcodec": "avc1", "acodec": "mp4a"}),
            json!({"ext": "webm", "height": 720}),
            json!({"format_id": "", "ext": "mp4"}),
            json!({"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5, "filesize": 3_500_000}),
            json!("not even an object"),
        ];

        let catalog = FormatCatalog::from_raw(&records);
        assert_eq!(catalog.len(), 2);

        let audio = catalog.get("140").unwrap();
        assert!(audio.has_audio && !audio.has_video);
        assert_eq!(audio.height, None);
        assert_eq!(audio.size, Some(3_500_000));
        assert_eq!(audio.audio_bitrate, Some(129.5));
    }

    #[test]
    fn test_from_raw_reads_resolution_string() {
        let records = vec![json!({"format_id": "hls-1", "ext": "mp4", "resolution": "1280x720", "vcodec": "avc1", "acodec": "mp4a", "filesize_approx": 1.5e7})];
        let catalog = FormatCatalog::from_raw(&records);
        let option = catalog.get("hls-1").unwrap();
        assert_eq!(option.height, Some(720));
        assert_eq!(option.size, Some(15_000_000));
        assert_eq!(option.resolution_label(), "720p");
    }

    #[test]
    fn test_from_info_json_single_format_source() {
        let info = json!({"title": "clip", "format_id": "0", "ext": "mp4", "url": "https://cdn/clip.mp4"});
        let catalog = FormatCatalog::from_info_json(&info).unwrap();
        assert_eq!(catalog.title.as_deref(), Some("clip"));
        assert_eq!(catalog.len(), 1);
        let option = catalog.get("0").unwrap();
        assert!(option.has_video && option.has_audio);
    }

    #[test]
    fn test_from_info_json_rejects_non_object() {
        assert!(matches!(
            FormatCatalog::from_info_json(&json!([1, 2])),
            Err(DownlyError::ProbeParseError(_))
        ));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let options = vec![
            option("b", "mp4", Some(720), true, true, 10 * MB),
            option("a", "mp4", Some(720), true, true, 10 * MB),
        ];
        let forward = FormatCatalog::new(None, options.clone());
        let reversed = FormatCatalog::new(None, options.into_iter().rev().collect());

        assert_eq!(
            forward.resolve(&DownloadSelector::BestVideo).unwrap(),
            reversed.resolve(&DownloadSelector::BestVideo).unwrap()
        );
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!("audio".parse::<DownloadSelector>().unwrap(), DownloadSelector::BestAudio);
        assert_eq!("bestvideo".parse::<DownloadSelector>().unwrap(), DownloadSelector::BestVideo);
        assert_eq!(
            "id:137".parse::<DownloadSelector>().unwrap(),
            DownloadSelector::Explicit("137".into())
        );
        assert_eq!(DownloadSelector::Explicit("137".into()).canonical(), "id:137");
    }
}
