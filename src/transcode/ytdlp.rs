use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use super::progress::{parse_progress_line, PROGRESS_TEMPLATE};
use super::{ProgressSink, TranscodeProvider, TranscodeRequest};
use crate::{DownlyError, Result};

/// Lines of stderr kept for the failure reason
const STDERR_TAIL: usize = 5;

/// Download and convert through yt-dlp and its ffmpeg post-processor
pub struct YtDlpTranscoder {
    yt_dlp_path: String,
}

impl YtDlpTranscoder {
    pub fn new(yt_dlp_path: impl Into<String>) -> Self {
        Self {
            yt_dlp_path: yt_dlp_path.into(),
        }
    }

    fn build_args(request: &TranscodeRequest) -> Vec<String> {
        let template = request
            .output_dir
            .join(format!("{}.%(ext)s", request.file_stem));

        let mut args: Vec<String> = vec![
            "--newline".into(),
            "--no-playlist".into(),
            "--no-warnings".into(),
            // --print implies --quiet; keep the progress lines
            "--progress".into(),
            "--progress-template".into(),
            PROGRESS_TEMPLATE.into(),
            "--print".into(),
            "after_move:filepath".into(),
            "--format".into(),
            request.format.id.clone(),
            "--output".into(),
            template.to_string_lossy().into_owned(),
        ];

        if let Some(ffmpeg) = &request.ffmpeg_location {
            args.push("--ffmpeg-location".into());
            args.push(ffmpeg.to_string_lossy().into_owned());
        }

        if let Some(audio) = &request.audio {
            args.extend([
                "--extract-audio".into(),
                "--audio-format".into(),
                audio.codec.clone(),
                "--audio-quality".into(),
                format!("{}K", audio.bitrate_kbps),
            ]);
        }

        args.push(request.url.clone());
        args
    }
}

#[async_trait]
impl TranscodeProvider for YtDlpTranscoder {
    async fn transcode(&self, request: &TranscodeRequest, progress: ProgressSink) -> Result<PathBuf> {
        let args = Self::build_args(request);
        tracing::debug!("Running {} {}", self.yt_dlp_path, args.join(" "));

        let mut child = Command::new(&self.yt_dlp_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DownlyError::transcode_failed(format!("failed to run yt-dlp: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownlyError::transcode_failed("yt-dlp stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownlyError::transcode_failed("yt-dlp stderr unavailable"))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL);
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let produced = read_output(stdout, &progress).await?;

        let status = child
            .wait()
            .await
            .map_err(|e| DownlyError::transcode_failed(format!("failed to wait for yt-dlp: {}", e)))?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let reason = if stderr.trim().is_empty() {
                format!("yt-dlp exited with {}", status)
            } else {
                stderr.trim().to_string()
            };
            return Err(DownlyError::TranscodeFailed { reason });
        }

        produced.ok_or_else(|| DownlyError::transcode_failed("yt-dlp did not report an output file"))
    }

    fn supports_url(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }

    fn provider_name(&self) -> &'static str {
        "yt-dlp"
    }
}

/// Follow yt-dlp's stdout: progress lines go to `progress`, anything else is
/// the path printed after the final move
async fn read_output(stdout: impl AsyncRead + Unpin, progress: &ProgressSink) -> Result<Option<PathBuf>> {
    let mut produced = None;
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| DownlyError::transcode_failed(format!("unreadable yt-dlp output: {}", e)))?
    {
        if let Some(update) = parse_progress_line(&line) {
            progress(update);
        } else if !line.trim().is_empty() {
            produced = Some(PathBuf::from(line.trim()));
        }
    }
    Ok(produced)
}
