//! Shared harness for scheduler integration tests.
//!
//! Provides scripted fakes for the probe and transcode seams and a
//! [`TestHarness`] wiring them into a [`JobScheduler`] rooted in a temp dir.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use downly::extractors::MetadataProbe;
use downly::scheduler::{RetryPolicy, SchedulerSettings};
use downly::transcode::{Progress, ProgressSink, TranscodeRequest};
use downly::{
    AudioTarget, DownlyError, Extractor, FormatCatalog, FormatOption, Job, JobHandle, JobScheduler,
    OutputManager, TranscodeProvider, TranscodeRunner,
};

pub const RUNNER_TIMEOUT: Duration = Duration::from_millis(200);

pub fn video_option(id: &str, height: u32, size: u64) -> FormatOption {
    FormatOption {
        id: id.to_string(),
        ext: "mp4".to_string(),
        height: Some(height),
        has_video: true,
        has_audio: true,
        size: Some(size),
        audio_bitrate: None,
        vcodec: Some("avc1".to_string()),
        acodec: Some("mp4a".to_string()),
        note: None,
    }
}

pub fn audio_option(id: &str, bitrate: f64) -> FormatOption {
    FormatOption {
        id: id.to_string(),
        ext: "m4a".to_string(),
        height: None,
        has_video: false,
        has_audio: true,
        size: Some(3_000_000),
        audio_bitrate: Some(bitrate),
        vcodec: None,
        acodec: Some("mp4a".to_string()),
        note: None,
    }
}

pub fn sample_catalog() -> FormatCatalog {
    FormatCatalog::new(
        Some("Sample Clip".to_string()),
        vec![
            video_option("18", 360, 5_000_000),
            video_option("22", 720, 20_000_000),
            audio_option("140", 128.0),
        ],
    )
}

/// Probe answering from a script, then with [`sample_catalog`]
#[derive(Default)]
pub struct FakeProbe {
    script: Mutex<VecDeque<downly::Result<FormatCatalog>>>,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn scripted(results: Vec<downly::Result<FormatCatalog>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataProbe for FakeProbe {
    async fn probe(&self, _url: &str) -> downly::Result<FormatCatalog> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(sample_catalog()))
    }

    fn supports_url(&self, _url: &str) -> bool {
        true
    }

    fn platform_name(&self) -> &'static str {
        "Fake"
    }
}

/// What one transcode call does
#[derive(Debug, Clone)]
pub enum Step {
    /// Write the output after a delay
    Produce(Duration),
    /// Write a partial file and never finish
    Hang,
    /// Like `Hang`, but first block the worker thread without yielding
    Block(Duration),
    Fail(DownlyError),
}

/// Transcoder following a script, then producing output after `default_delay`
pub struct FakeTranscoder {
    script: Mutex<VecDeque<Step>>,
    default_delay: Duration,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    order: Mutex<Vec<String>>,
    requests: Mutex<Vec<TranscodeRequest>>,
}

impl FakeTranscoder {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_delay,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted(steps: Vec<Step>) -> Self {
        let transcoder = Self::new(Duration::from_millis(5));
        *transcoder.script.lock().unwrap() = steps.into();
        transcoder
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of transcodes that ran at the same time
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// URLs in the order their transcodes started
    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<TranscodeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TranscodeProvider for FakeTranscoder {
    async fn transcode(&self, request: &TranscodeRequest, progress: ProgressSink) -> downly::Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(request.url.clone());
        self.requests.lock().unwrap().push(request.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _running = Running(&self.running);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Produce(self.default_delay));

        let ext = request
            .audio
            .as_ref()
            .map(|audio| audio.extension().to_string())
            .unwrap_or_else(|| request.format.ext.clone());
        let path = request.output_dir.join(format!("{}.{}", request.file_stem, ext));

        match step {
            Step::Produce(delay) => {
                progress(Progress::percent(50.0));
                tokio::time::sleep(delay).await;
                tokio::fs::write(&path, b"media bytes").await?;
                progress(Progress::percent(100.0));
                Ok(path)
            }
            Step::Hang => {
                let partial = request.output_dir.join(format!("{}.part", request.file_stem));
                tokio::fs::write(&partial, b"half").await?;
                progress(Progress::bytes(4, Some(8)));
                std::future::pending::<()>().await;
                Ok(path)
            }
            Step::Block(duration) => {
                let partial = request.output_dir.join(format!("{}.part", request.file_stem));
                tokio::fs::write(&partial, b"half").await?;
                progress(Progress::bytes(4, Some(8)));
                std::thread::sleep(duration);
                std::future::pending::<()>().await;
                Ok(path)
            }
            Step::Fail(e) => Err(e),
        }
    }

    fn supports_url(&self, _url: &str) -> bool {
        true
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}

pub struct TestHarness {
    pub scheduler: JobScheduler,
    pub probe: Arc<FakeProbe>,
    pub transcoder: Arc<FakeTranscoder>,
    pub root: Arc<TempDir>,
}

impl TestHarness {
    pub fn new(probe: FakeProbe, transcoder: FakeTranscoder) -> Self {
        Self::with_settings(probe, transcoder, settings())
    }

    pub fn with_settings(probe: FakeProbe, transcoder: FakeTranscoder, settings: SchedulerSettings) -> Self {
        let root = tempfile::tempdir().expect("failed to create temp root");
        Self::build(Arc::new(root), probe, transcoder, settings)
    }

    /// A second scheduler writing to the same staging and artifact roots,
    /// as another process would
    pub fn alongside(&self, probe: FakeProbe, transcoder: FakeTranscoder) -> Self {
        Self::build(Arc::clone(&self.root), probe, transcoder, settings())
    }

    fn build(root: Arc<TempDir>, probe: FakeProbe, transcoder: FakeTranscoder, settings: SchedulerSettings) -> Self {
        let output = OutputManager::new(root.path().join("staging"), root.path().join("artifacts"))
            .expect("failed to create output roots");

        let probe = Arc::new(probe);
        let transcoder = Arc::new(transcoder);

        let mut extractor = Extractor::new(Duration::from_secs(5));
        extractor.register(probe.clone());
        let mut runner = TranscodeRunner::new(RUNNER_TIMEOUT);
        runner.register(transcoder.clone());

        let scheduler = JobScheduler::new(settings, extractor, runner, output);

        Self {
            scheduler,
            probe,
            transcoder,
            root,
        }
    }

    /// Wait for the job to settle, failing the test after a few seconds
    pub async fn settle(&self, handle: &JobHandle) -> Job {
        tokio::time::timeout(Duration::from_secs(10), self.scheduler.wait(handle))
            .await
            .expect("job did not settle in time")
            .expect("job vanished")
    }

    /// Number of entries left in this scheduler's staging directory
    pub fn staging_entries(&self) -> usize {
        std::fs::read_dir(self.scheduler.output().staging_root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub fn settings() -> SchedulerSettings {
    SchedulerSettings {
        max_concurrent_jobs: 3,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
        cancel_grace: Duration::from_millis(500),
        retention: Duration::from_secs(3600),
        record_ttl: Duration::from_secs(86_400),
        audio: AudioTarget::default(),
        ffmpeg_location: None,
    }
}
