//! Authoritative record of every submitted job.
//!
//! Each job lives in its own `watch` channel: the sender's internal lock gives
//! per-job mutual exclusion, and every mutation is published to subscribers in
//! the order it was applied. Unrelated jobs never contend on the same lock.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::formats::{DownloadSelector, FormatOption};
use crate::output::Artifact;
use crate::transcode::Progress;
use crate::DownlyError;

/// Job identity: hash of the source URL and the requested selector
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobKey(String);

impl JobKey {
    pub fn derive(url: &str, selector: &DownloadSelector) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(selector.canonical().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Parse a key from its textual form (64 lowercase hex characters)
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines and staging names
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobState {
    Pending,
    Probing,
    FormatSelected,
    Transcoding,
    Materializing,
    Ready,
    Acknowledged,
    Failed,
    Cancelled,
}

impl JobState {
    /// The pipeline state that directly follows this one
    fn successor(self) -> Option<JobState> {
        match self {
            JobState::Pending => Some(JobState::Probing),
            JobState::Probing => Some(JobState::FormatSelected),
            JobState::FormatSelected => Some(JobState::Transcoding),
            JobState::Transcoding => Some(JobState::Materializing),
            JobState::Materializing => Some(JobState::Ready),
            JobState::Ready => Some(JobState::Acknowledged),
            JobState::Acknowledged | JobState::Failed | JobState::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Ready | JobState::Acknowledged | JobState::Failed | JobState::Cancelled
        )
    }

    /// Work is still in flight for this job
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        match next {
            JobState::Failed | JobState::Cancelled => self.is_active(),
            _ => self.successor() == Some(next),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Probing => "probing",
            JobState::FormatSelected => "format selected",
            JobState::Transcoding => "transcoding",
            JobState::Materializing => "materializing",
            JobState::Ready => "ready",
            JobState::Acknowledged => "acknowledged",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A rejected state change
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// One requested download/transcode
#[derive(Debug, Clone)]
pub struct Job {
    pub key: JobKey,
    pub url: String,
    pub selector: DownloadSelector,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Provider executions started so far, across all stages
    pub attempts: u32,
    pub title: Option<String>,
    pub format: Option<FormatOption>,
    pub progress: Option<Progress>,
    pub artifact: Option<Artifact>,
    pub error: Option<DownlyError>,
    pub history: Vec<StateChange>,
}

impl Job {
    pub fn new(url: impl Into<String>, selector: DownloadSelector) -> Self {
        let url = url.into();
        let now = Utc::now();
        Self {
            key: JobKey::derive(&url, &selector),
            url,
            selector,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            attempts: 0,
            title: None,
            format: None,
            progress: None,
            artifact: None,
            error: None,
            history: vec![StateChange {
                state: JobState::Pending,
                at: now,
            }],
        }
    }

    /// Move to `next`, rejecting anything that is not a forward step
    pub(crate) fn apply(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        self.state = next;
        self.updated_at = now;
        self.history.push(StateChange { state: next, at: now });
        Ok(())
    }
}

type JobCell = Arc<watch::Sender<Job>>;

/// Single source of truth for job state
#[derive(Default)]
pub struct JobStore {
    jobs: DashMap<JobKey, JobCell>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `job` unless a record under the same key should be kept, as
    /// decided by `keep`. Returns the stored job and whether it was created.
    /// The check and the insert happen under the key's map entry lock, so two
    /// racing submissions cannot both create a job.
    pub fn insert_unless(&self, job: Job, keep: impl Fn(&Job) -> bool) -> (Job, bool) {
        match self.jobs.entry(job.key.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get().borrow().clone();
                if keep(&existing) {
                    return (existing, false);
                }
                entry.insert(Arc::new(watch::channel(job.clone()).0));
                (job, true)
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(watch::channel(job.clone()).0));
                (job, true)
            }
        }
    }

    fn cell(&self, key: &JobKey) -> Option<JobCell> {
        self.jobs.get(key).map(|cell| Arc::clone(cell.value()))
    }

    pub fn get(&self, key: &JobKey) -> Option<Job> {
        self.cell(key).map(|cell| cell.borrow().clone())
    }

    pub fn state(&self, key: &JobKey) -> Option<JobState> {
        self.cell(key).map(|cell| cell.borrow().state)
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.jobs.contains_key(key)
    }

    /// Receiver notified on every change of the job record
    pub fn subscribe(&self, key: &JobKey) -> Option<watch::Receiver<Job>> {
        self.cell(key).map(|cell| cell.subscribe())
    }

    /// Move a job to `next`, rejecting anything that is not a forward step
    pub fn transition(&self, key: &JobKey, next: JobState) -> Option<Result<Job, InvalidTransition>> {
        self.modify(key, |job| job.apply(next))
    }

    /// Record `error` and move the job to `Failed`
    pub fn fail(&self, key: &JobKey, error: DownlyError) -> Option<Result<Job, InvalidTransition>> {
        self.modify(key, |job| {
            job.apply(JobState::Failed)?;
            job.error = Some(error);
            Ok(())
        })
    }

    /// Record the cancellation and move the job to `Cancelled`
    pub fn cancel(&self, key: &JobKey) -> Option<Result<Job, InvalidTransition>> {
        self.modify(key, |job| {
            job.apply(JobState::Cancelled)?;
            job.error = Some(DownlyError::TranscodeCancelled);
            job.progress = None;
            Ok(())
        })
    }

    /// Attach the artifact and move the job to `Ready` in one step
    pub fn complete(&self, key: &JobKey, artifact: Artifact) -> Option<Result<Job, InvalidTransition>> {
        self.modify(key, |job| {
            job.apply(JobState::Ready)?;
            job.artifact = Some(artifact);
            job.progress = None;
            Ok(())
        })
    }

    /// Apply a fallible mutation under the job's lock. Subscribers are only
    /// notified when the mutation succeeds.
    pub fn modify<E>(
        &self,
        key: &JobKey,
        f: impl FnOnce(&mut Job) -> Result<(), E>,
    ) -> Option<Result<Job, E>> {
        let cell = self.cell(key)?;
        let mut outcome = None;
        cell.send_if_modified(|job| {
            let mut draft = job.clone();
            match f(&mut draft) {
                Ok(()) => {
                    draft.updated_at = Utc::now();
                    *job = draft;
                    outcome = Some(Ok(job.clone()));
                    true
                }
                Err(e) => {
                    outcome = Some(Err(e));
                    false
                }
            }
        });
        outcome
    }

    /// Update in-flight progress; ignored unless the job is transcoding
    pub fn record_progress(&self, key: &JobKey, progress: Progress) {
        let _ = self.modify(key, |job| {
            if job.state != JobState::Transcoding {
                return Err(());
            }
            job.progress = Some(progress);
            Ok(())
        });
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drop terminal records last updated before `cutoff` and return their
    /// keys. `Ready` records are kept while `deliverable` holds for them.
    pub fn prune(&self, cutoff: DateTime<Utc>, deliverable: impl Fn(&Job) -> bool) -> Vec<JobKey> {
        // Snapshot first: `deliverable` may take other locks
        let candidates: Vec<Job> = self
            .jobs
            .iter()
            .filter_map(|cell| {
                let job = cell.borrow();
                if job.state.is_terminal() && job.updated_at < cutoff {
                    Some(job.clone())
                } else {
                    None
                }
            })
            .collect();

        let mut pruned = Vec::new();
        for job in candidates {
            if job.state == JobState::Ready && deliverable(&job) {
                continue;
            }
            let removed = self.jobs.remove_if(&job.key, |_, cell| {
                let current = cell.borrow();
                current.state == job.state && current.updated_at == job.updated_at
            });
            if removed.is_some() {
                pruned.push(job.key);
            }
        }
        pruned
    }
}
