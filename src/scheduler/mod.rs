//! Job scheduler: deduplicated submission, a bounded worker pool, per-stage
//! retries, cooperative cancellation with forced teardown, and artifact
//! retention.

use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{watch, AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

pub mod retry;

pub use retry::RetryPolicy;

use crate::config::Config;
use crate::extractors::Extractor;
use crate::formats::DownloadSelector;
use crate::output::{Artifact, OutputManager, SweepReport};
use crate::store::{InvalidTransition, Job, JobKey, JobState, JobStore};
use crate::transcode::{AudioTarget, ProgressSink, TranscodeRequest, TranscodeRunner};
use crate::utils;
use crate::{DownlyError, Result};

/// Longest filename stem handed to providers
const MAX_STEM_LEN: usize = 120;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_jobs: usize,
    pub retry: RetryPolicy,
    /// Time a cancelled job gets to stop before its task is aborted
    pub cancel_grace: Duration,
    /// How long an unclaimed artifact is kept
    pub retention: Duration,
    /// How long finished job records are kept
    pub record_ttl: Duration,
    pub audio: AudioTarget,
    pub ffmpeg_location: Option<PathBuf>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_jobs: config.scheduler.max_concurrent_jobs,
            retry: RetryPolicy {
                max_attempts: config.scheduler.max_attempts,
                base_delay: Duration::from_millis(config.scheduler.base_delay_ms),
                max_delay: Duration::from_millis(config.scheduler.max_delay_ms),
            },
            cancel_grace: Duration::from_secs(config.scheduler.cancel_grace_secs),
            retention: Duration::from_secs(config.output.retention_secs),
            record_ttl: Duration::from_secs(config.output.record_ttl_secs),
            audio: config.audio.clone(),
            ffmpeg_location: config.providers.ffmpeg_location.clone(),
        }
    }
}

/// Caller's reference to a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    key: JobKey,
}

impl JobHandle {
    pub fn key(&self) -> &JobKey {
        &self.key
    }
}

impl From<JobKey> for JobHandle {
    fn from(key: JobKey) -> Self {
        Self { key }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key.fmt(f)
    }
}

/// Result of asking for a job's artifact
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Ready(Artifact),
    Pending(JobState),
    Failed(DownlyError),
}

/// A place in the worker pool queue
type SlotRequest =
    Pin<Box<dyn Future<Output = std::result::Result<OwnedSemaphorePermit, AcquireError>> + Send>>;

struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
    abort: Option<AbortHandle>,
}

struct Inner {
    store: JobStore,
    output: OutputManager,
    extractor: Extractor,
    runner: TranscodeRunner,
    settings: SchedulerSettings,
    slots: Arc<Semaphore>,
    active: DashMap<JobKey, ActiveRun>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    accepting: AtomicBool,
}

/// Entry point for callers: submit, observe, fetch, acknowledge, cancel
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(
        settings: SchedulerSettings,
        extractor: Extractor,
        runner: TranscodeRunner,
        output: OutputManager,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            inner: Arc::new(Inner {
                store: JobStore::new(),
                output,
                extractor,
                runner,
                settings,
                slots,
                active: DashMap::new(),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Scheduler wired with the yt-dlp and direct-link providers
    pub fn from_config(config: &Config) -> Result<Self> {
        let output = OutputManager::new(config.staging_dir(), config.artifacts_dir())?;
        let extractor = Extractor::with_defaults(config.probe_timeout(), &config.providers.yt_dlp_path);
        let runner = TranscodeRunner::with_defaults(config.transcode_timeout(), &config.providers.yt_dlp_path);

        Ok(Self::new(SchedulerSettings::from(config), extractor, runner, output))
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn output(&self) -> &OutputManager {
        &self.inner.output
    }

    pub fn extractor(&self) -> &Extractor {
        &self.inner.extractor
    }

    /// Remove leftovers of jobs that are no longer running
    pub async fn recover(&self) -> Result<SweepReport> {
        self.inner.output.recovery_sweep(&self.inner.store).await
    }

    /// Submit a request. A job with the same URL and selector that is still
    /// running, or ready with its artifact available, is returned as is.
    pub fn submit(&self, url: &str, selector: DownloadSelector) -> Result<JobHandle> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(DownlyError::ShuttingDown);
        }
        let url = utils::validate_and_normalize_url(url)?;

        let output = &self.inner.output;
        let (job, created) = self.inner.store.insert_unless(Job::new(url, selector), |existing| {
            existing.state.is_active()
                || (existing.state == JobState::Ready
                    && existing
                        .artifact
                        .as_ref()
                        .map(|artifact| output.is_available(artifact))
                        .unwrap_or(false))
        });

        if created {
            tracing::info!(job = %job.key.short(), selector = %job.selector, "Submitted {}", job.url);
            self.spawn_pipeline(job.key.clone());
        } else {
            tracing::debug!(job = %job.key.short(), state = %job.state, "Reusing existing job");
        }

        Ok(JobHandle::from(job.key))
    }

    pub fn job(&self, handle: &JobHandle) -> Result<Job> {
        self.inner
            .store
            .get(handle.key())
            .ok_or_else(|| DownlyError::JobNotFound(handle.to_string()))
    }

    pub fn status(&self, handle: &JobHandle) -> Result<JobState> {
        self.job(handle).map(|job| job.state)
    }

    /// Receiver notified on every change of the job
    pub fn watch(&self, handle: &JobHandle) -> Result<watch::Receiver<Job>> {
        self.inner
            .store
            .subscribe(handle.key())
            .ok_or_else(|| DownlyError::JobNotFound(handle.to_string()))
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self, handle: &JobHandle) -> Result<Job> {
        let mut rx = self.watch(handle)?;
        let job = rx
            .wait_for(|job| job.state.is_terminal())
            .await
            .map_err(|_| DownlyError::JobNotFound(handle.to_string()))?
            .clone();
        Ok(job)
    }

    pub fn fetch_artifact(&self, handle: &JobHandle) -> Result<FetchOutcome> {
        let job = self.job(handle)?;

        let outcome = match job.state {
            JobState::Ready => match job.artifact {
                Some(artifact) if self.inner.output.is_available(&artifact) => FetchOutcome::Ready(artifact),
                Some(artifact) => FetchOutcome::Failed(DownlyError::ArtifactExpired(
                    artifact.path.display().to_string(),
                )),
                None => FetchOutcome::Failed(DownlyError::ArtifactExpired(handle.to_string())),
            },
            JobState::Acknowledged => {
                FetchOutcome::Failed(DownlyError::ArtifactAlreadyConsumed(handle.to_string()))
            }
            JobState::Failed | JobState::Cancelled => FetchOutcome::Failed(
                job.error
                    .unwrap_or_else(|| DownlyError::transcode_failed("no reason recorded")),
            ),
            state => FetchOutcome::Pending(state),
        };

        Ok(outcome)
    }

    /// Confirm receipt of the artifact. The file is deleted and the job moves
    /// to `Acknowledged`; a second call fails.
    pub async fn acknowledge(&self, handle: &JobHandle) -> Result<()> {
        let job = self.job(handle)?;
        match (job.state, job.artifact) {
            (JobState::Ready, Some(artifact)) => {
                self.inner.output.acknowledge(&artifact).await?;
                if let Some(Err(e)) = self.inner.store.transition(handle.key(), JobState::Acknowledged) {
                    tracing::warn!(job = %handle.key().short(), "{}", e);
                }
                Ok(())
            }
            (JobState::Acknowledged, _) => Err(DownlyError::ArtifactAlreadyConsumed(handle.to_string())),
            (state, _) => Err(DownlyError::JobNotReady(state.to_string())),
        }
    }

    /// Cancel a job. No-op for terminal jobs. In-flight work is signalled
    /// through its token and torn down if it does not stop within the grace
    /// period.
    pub fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let key = handle.key();
        let state = self
            .inner
            .store
            .state(key)
            .ok_or_else(|| DownlyError::JobNotFound(handle.to_string()))?;
        if state.is_terminal() {
            return Ok(());
        }

        let run = self
            .inner
            .active
            .get(key)
            .map(|run| (run.run_id, run.cancel.clone()));

        match run {
            Some((run_id, token)) => {
                tracing::info!(job = %key.short(), state = %state, "Cancelling job");
                token.cancel();
                let this = self.clone();
                let key = key.clone();
                self.inner
                    .tasks
                    .spawn(async move { this.teardown_after_grace(key, run_id).await });
            }
            None => {
                let _ = self.inner.store.cancel(key);
            }
        }

        Ok(())
    }

    /// Start the background task evicting expired artifacts and pruning old
    /// job records
    pub fn start_reaper(&self) {
        let this = self.clone();
        let retention = self.inner.settings.retention;
        let period = (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));

        self.inner.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        this.reap().await;
                    }
                }
            }
        });
    }

    /// Evict artifacts past the retention window and prune old records.
    /// Returns the number of evicted artifacts.
    pub async fn reap(&self) -> usize {
        let expired = self.inner.output.expired(self.inner.settings.retention);
        for artifact in &expired {
            tracing::info!(job = %artifact.job.short(), "Artifact retention elapsed, evicting");
            self.inner.output.evict(artifact).await;
        }

        let cutoff = chrono::Duration::from_std(self.inner.settings.record_ttl)
            .ok()
            .and_then(|ttl| chrono::Utc::now().checked_sub_signed(ttl));
        if let Some(cutoff) = cutoff {
            let output = &self.inner.output;
            let pruned = self.inner.store.prune(cutoff, |job| {
                job.artifact
                    .as_ref()
                    .map(|artifact| output.is_available(artifact))
                    .unwrap_or(false)
            });
            for key in &pruned {
                output.forget(key);
            }
            if !pruned.is_empty() {
                tracing::debug!("Pruned {} finished job records", pruned.len());
            }
        }

        expired.len()
    }

    /// Stop accepting jobs, cancel everything in flight and wait for the
    /// workers to drain
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        tracing::info!("Shutting down, {} jobs in flight", self.inner.active.len());

        self.inner.shutdown.cancel();
        self.inner.tasks.close();

        let grace = self.inner.settings.cancel_grace;
        if tokio::time::timeout(grace, self.inner.tasks.wait()).await.is_err() {
            let runs: Vec<(JobKey, Uuid)> = self
                .inner
                .active
                .iter()
                .map(|run| (run.key().clone(), run.run_id))
                .collect();
            for (key, run_id) in runs {
                self.force_teardown(&key, run_id);
            }
            self.inner.tasks.wait().await;
        }

        tracing::info!("Scheduler stopped");
    }

    /// Join the worker pool queue now, so jobs start in submission order
    /// whichever task the runtime polls first
    fn request_slot(&self) -> SlotRequest {
        let mut request: SlotRequest = Box::pin(Arc::clone(&self.inner.slots).acquire_owned());
        // The first poll registers the waiter with the fair semaphore
        let mut cx = Context::from_waker(futures_util::task::noop_waker_ref());
        match request.as_mut().poll(&mut cx) {
            Poll::Ready(result) => Box::pin(std::future::ready(result)),
            Poll::Pending => request,
        }
    }

    fn spawn_pipeline(&self, key: JobKey) {
        let slot = self.request_slot();
        let run_id = Uuid::new_v4();
        let cancel = self.inner.shutdown.child_token();
        self.inner.active.insert(
            key.clone(),
            ActiveRun {
                run_id,
                cancel: cancel.clone(),
                abort: None,
            },
        );

        let this = self.clone();
        let task_key = key.clone();
        let handle = self
            .inner
            .tasks
            .spawn(async move { this.drive(task_key, run_id, cancel, slot).await });

        if let Some(mut run) = self.inner.active.get_mut(&key) {
            if run.run_id == run_id {
                run.abort = Some(handle.abort_handle());
            }
        }
    }

    async fn drive(self, key: JobKey, run_id: Uuid, cancel: CancellationToken, slot: SlotRequest) {
        let result = self.execute(&key, &cancel, slot).await;
        let store = &self.inner.store;

        match result {
            Ok(()) => {}
            Err(e) if cancel.is_cancelled() || e == DownlyError::TranscodeCancelled => {
                if let Some(Ok(_)) = store.cancel(&key) {
                    tracing::info!(job = %key.short(), "Job cancelled");
                }
            }
            Err(e) => {
                tracing::error!(job = %key.short(), error = %e, "Job failed");
                let _ = store.fail(&key, e);
            }
        }

        self.inner.active.remove_if(&key, |_, run| run.run_id == run_id);
    }

    async fn execute(&self, key: &JobKey, cancel: &CancellationToken, slot: SlotRequest) -> Result<()> {
        let inner = &*self.inner;
        let job = inner
            .store
            .get(key)
            .ok_or_else(|| DownlyError::JobNotFound(key.to_string()))?;

        // Jobs past capacity wait here, queued in submission order
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownlyError::TranscodeCancelled),
            permit = slot => permit.map_err(|_| DownlyError::ShuttingDown)?,
        };

        self.step(key, |job| job.apply(JobState::Probing))?;
        let catalog = self
            .with_retry(key, cancel, "probe", || inner.extractor.probe(&job.url, cancel))
            .await?;

        let format = catalog.resolve(&job.selector)?;
        tracing::info!(
            job = %key.short(),
            "Selected format {} ({}, {})",
            format.id,
            format.ext,
            format.resolution_label()
        );
        self.step(key, |job| {
            job.apply(JobState::FormatSelected)?;
            job.title = catalog.title.clone();
            job.format = Some(format.clone());
            Ok(())
        })?;

        self.step(key, |job| job.apply(JobState::Transcoding))?;
        let request = TranscodeRequest {
            url: job.url.clone(),
            format,
            audio: job
                .selector
                .wants_audio()
                .then(|| inner.settings.audio.clone()),
            output_dir: PathBuf::new(),
            file_stem: file_stem(catalog.title.as_deref(), key),
            ffmpeg_location: inner.settings.ffmpeg_location.clone(),
        };
        let sink = self.progress_sink(key);

        let (staging, raw_path) = self
            .with_retry(key, cancel, "transcode", move || {
                let mut request = request.clone();
                let sink = Arc::clone(&sink);
                async move {
                    let staging = inner.output.stage(key)?;
                    request.output_dir = staging.path().to_path_buf();
                    let raw_path = inner.runner.run(key, request, sink, cancel).await?;
                    Ok((staging, raw_path))
                }
            })
            .await?;

        self.step(key, |job| job.apply(JobState::Materializing))?;
        if cancel.is_cancelled() {
            return Err(DownlyError::TranscodeCancelled);
        }
        let artifact = inner.output.materialize(key, &raw_path).await?;
        if let Err(e) = staging.close() {
            tracing::warn!(job = %key.short(), "Failed to remove staging directory: {}", e);
        }

        if cancel.is_cancelled() {
            inner.output.evict(&artifact).await;
            return Err(DownlyError::TranscodeCancelled);
        }
        match inner.store.complete(key, artifact.clone()) {
            Some(Ok(_)) => {
                tracing::info!(job = %key.short(), size = artifact.size, "Job ready");
                Ok(())
            }
            _ => {
                inner.output.evict(&artifact).await;
                Err(DownlyError::TranscodeCancelled)
            }
        }
    }

    /// Run one stage, retrying transient failures with backoff. The job's
    /// visible state does not change between attempts.
    async fn with_retry<T, F, Fut>(
        &self,
        key: &JobKey,
        cancel: &CancellationToken,
        stage: &'static str,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.inner.settings.retry;
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DownlyError::TranscodeCancelled);
            }
            attempts += 1;
            let _ = self.inner.store.modify(key, |job| {
                job.attempts += 1;
                Ok::<(), ()>(())
            });

            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && policy.allows_retry(attempts) => {
                    let delay = policy.delay_for(attempts);
                    tracing::warn!(
                        job = %key.short(),
                        stage,
                        attempt = attempts,
                        "Transient failure, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DownlyError::TranscodeCancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply a forward state change. A rejected change means the job was torn
    /// down underneath this run.
    fn step(
        &self,
        key: &JobKey,
        f: impl FnOnce(&mut Job) -> std::result::Result<(), InvalidTransition>,
    ) -> Result<Job> {
        match self.inner.store.modify(key, f) {
            Some(Ok(job)) => Ok(job),
            Some(Err(e)) => {
                tracing::debug!(job = %key.short(), "Stopping run: {}", e);
                Err(DownlyError::TranscodeCancelled)
            }
            None => Err(DownlyError::JobNotFound(key.to_string())),
        }
    }

    fn progress_sink(&self, key: &JobKey) -> ProgressSink {
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        Arc::new(move |progress| inner.store.record_progress(&key, progress))
    }

    async fn teardown_after_grace(&self, key: JobKey, run_id: Uuid) {
        let Some(mut rx) = self.inner.store.subscribe(&key) else {
            return;
        };
        let grace = self.inner.settings.cancel_grace;
        if tokio::time::timeout(grace, rx.wait_for(|job| job.state.is_terminal()))
            .await
            .is_err()
        {
            self.force_teardown(&key, run_id);
        }
    }

    fn force_teardown(&self, key: &JobKey, run_id: Uuid) {
        if let Some((_, run)) = self.inner.active.remove_if(key, |_, run| run.run_id == run_id) {
            tracing::warn!(job = %key.short(), "Job did not stop in time, aborting");
            if let Some(abort) = run.abort {
                abort.abort();
            }
        }
        let _ = self.inner.store.cancel(key);
    }
}

/// Filename stem from the source title, falling back to the job key
fn file_stem(title: Option<&str>, key: &JobKey) -> String {
    let stem: String = title
        .map(utils::sanitize_filename)
        .unwrap_or_default()
        .chars()
        .take(MAX_STEM_LEN)
        .collect();
    let stem = stem.trim().trim_start_matches('.').to_string();

    if stem.is_empty() {
        format!("download-{}", key.short())
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_sanitizes_title() {
        let key = JobKey::derive("https://example.com/a", &DownloadSelector::BestAudio);
        assert_eq!(file_stem(Some("Song: Live/Remastered?"), &key), "Song_ Live_Remastered_");
        assert_eq!(file_stem(None, &key), format!("download-{}", key.short()));
        assert_eq!(file_stem(Some("..."), &key), format!("download-{}", key.short()));
        assert_eq!(file_stem(Some(&"x".repeat(500)), &key).len(), MAX_STEM_LEN);
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = Config::default();
        config.scheduler.max_attempts = 5;
        config.audio.bitrate_kbps = 320;

        let settings = SchedulerSettings::from(&config);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.audio.bitrate_kbps, 320);
        assert_eq!(settings.max_concurrent_jobs, 3);
    }
}
