//! Staging and artifact lifecycle.
//!
//! Each manager claims a namespace `<id>` under both roots, held by an
//! exclusive lock on `<staging root>/<id>.lock` for as long as the manager
//! lives. Every transcode attempt writes into its own staging directory named
//! `<job key>.<random>` inside the namespace. The directory is removed when
//! its [`StagingDir`] guard drops, whatever the exit path. A finished file is
//! moved into `<artifacts root>/<id>/<job key>/` and tracked until it is
//! acknowledged, evicted, or expires.
//!
//! A recovery sweep only touches its own namespace and namespaces whose lock
//! is no longer held, so several processes can share the same roots.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fs2::FileExt;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use crate::store::{JobKey, JobState, JobStore};
use crate::{DownlyError, Result};

/// Kind of content held by an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentKind {
    Audio,
    Video,
    Other,
}

impl ContentKind {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "mp3" | "m4a" | "aac" | "opus" | "ogg" | "oga" | "wav" | "flac" => ContentKind::Audio,
            "mp4" | "m4v" | "mkv" | "webm" | "mov" | "avi" => ContentKind::Video,
            _ => ContentKind::Other,
        }
    }
}

/// Get MIME type for a file extension
pub fn mime_type(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "mp3" => "audio/mpeg",
        "m4a" | "aac" => "audio/mp4",
        "opus" | "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

/// The delivery-ready output file of a completed job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub job: JobKey,
    pub path: PathBuf,
    pub size: u64,
    pub kind: ContentKind,
    pub mime_type: &'static str,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|ext| ext.to_str())
    }
}

const LOCK_SUFFIX: &str = ".lock";
const CLAIM_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Available,
    Consumed,
}

#[derive(Debug, Clone)]
struct Tracked {
    artifact: Artifact,
    delivery: Delivery,
}

/// Per-attempt staging directory, removed on drop
#[derive(Debug)]
pub struct StagingDir {
    job: JobKey,
    dir: TempDir,
}

impl StagingDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn job(&self) -> &JobKey {
        &self.job
    }

    /// Remove the directory now, reporting failures
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// Outcome of a recovery sweep
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
}

/// Exclusive claim on a namespace under the shared roots
#[derive(Debug)]
struct OwnerLock {
    id: String,
    path: PathBuf,
    _file: File,
}

impl OwnerLock {
    fn claim(staging_base: &Path) -> Result<Self> {
        for _ in 0..CLAIM_ATTEMPTS {
            let id = Uuid::new_v4().simple().to_string();
            let path = staging_base.join(format!("{}{}", id, LOCK_SUFFIX));
            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(DownlyError::StagingIOError(format!(
                        "failed to create {}: {}",
                        path.display(),
                        e
                    )))
                }
            };
            if file.try_lock_exclusive().is_err() {
                continue;
            }
            // Another process may have swept the file before it was locked
            if path.exists() {
                return Ok(Self { id, path, _file: file });
            }
        }

        Err(DownlyError::StagingIOError(format!(
            "could not claim a namespace under {}",
            staging_base.display()
        )))
    }
}

pub struct OutputManager {
    staging_base: PathBuf,
    artifacts_base: PathBuf,
    staging_root: PathBuf,
    artifacts_root: PathBuf,
    owner: OwnerLock,
    artifacts: DashMap<JobKey, Tracked>,
}

impl OutputManager {
    /// Create the manager and claim a namespace under both roots, creating
    /// them if needed
    pub fn new(staging_root: impl Into<PathBuf>, artifacts_root: impl Into<PathBuf>) -> Result<Self> {
        let staging_base = staging_root.into();
        let artifacts_base = artifacts_root.into();
        fs_err::create_dir_all(&staging_base)?;
        fs_err::create_dir_all(&artifacts_base)?;

        let owner = OwnerLock::claim(&staging_base)?;
        let staging_root = staging_base.join(&owner.id);
        let artifacts_root = artifacts_base.join(&owner.id);
        fs_err::create_dir_all(&staging_root)?;
        fs_err::create_dir_all(&artifacts_root)?;
        tracing::debug!("Claimed output namespace {}", owner.id);

        Ok(Self {
            staging_base,
            artifacts_base,
            staging_root,
            artifacts_root,
            owner,
            artifacts: DashMap::new(),
        })
    }

    /// Identifier of the namespace this manager writes into
    pub fn owner_id(&self) -> &str {
        &self.owner.id
    }

    /// This manager's staging directory
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// This manager's artifact directory
    pub fn artifacts_root(&self) -> &Path {
        &self.artifacts_root
    }

    /// Acquire a fresh staging directory for one attempt of `job`
    pub fn stage(&self, job: &JobKey) -> Result<StagingDir> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}.", job))
            .tempdir_in(&self.staging_root)
            .map_err(|e| DownlyError::StagingIOError(format!("failed to create staging dir: {}", e)))?;

        tracing::debug!(job = %job.short(), "Staging in {}", dir.path().display());
        Ok(StagingDir {
            job: job.clone(),
            dir,
        })
    }

    /// Move a produced file into the job's final location
    pub async fn materialize(&self, job: &JobKey, raw_path: &Path) -> Result<Artifact> {
        let metadata = tokio::fs::metadata(raw_path).await.map_err(|e| {
            DownlyError::StagingIOError(format!("output file {}: {}", raw_path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(DownlyError::StagingIOError(format!(
                "output is not a file: {}",
                raw_path.display()
            )));
        }
        if metadata.len() == 0 {
            return Err(DownlyError::StagingIOError(format!(
                "output file is empty: {}",
                raw_path.display()
            )));
        }

        let file_name = raw_path
            .file_name()
            .ok_or_else(|| DownlyError::StagingIOError("output has no file name".to_string()))?;

        let final_dir = self.artifacts_root.join(job.as_str());
        remove_dir_if_exists(&final_dir).await?;
        tokio::fs::create_dir_all(&final_dir).await?;
        let dest = final_dir.join(file_name);

        // Try rename first (same filesystem), fall back to copy under a
        // temporary name and rename into place.
        if let Err(rename_err) = tokio::fs::rename(raw_path, &dest).await {
            tracing::debug!("Rename failed ({}), copying instead", rename_err);
            let partial = final_dir.join(format!(".{}.partial", uuid::Uuid::new_v4()));
            tokio::fs::copy(raw_path, &partial).await?;
            tokio::fs::rename(&partial, &dest).await?;
            let _ = tokio::fs::remove_file(raw_path).await;
        }

        let ext = dest
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        let artifact = Artifact {
            job: job.clone(),
            path: dest,
            size: metadata.len(),
            kind: ContentKind::from_extension(&ext),
            mime_type: mime_type(&ext),
            created_at: Utc::now(),
        };

        self.artifacts.insert(
            job.clone(),
            Tracked {
                artifact: artifact.clone(),
                delivery: Delivery::Available,
            },
        );
        tracing::info!(job = %job.short(), "Artifact ready at {}", artifact.path.display());

        Ok(artifact)
    }

    /// Whether the artifact can still be retrieved
    pub fn is_available(&self, artifact: &Artifact) -> bool {
        self.artifacts
            .get(&artifact.job)
            .map(|tracked| tracked.artifact.path == artifact.path && tracked.delivery == Delivery::Available)
            .unwrap_or(false)
    }

    /// Mark the artifact as received and delete it. Only the first call for a
    /// given artifact succeeds.
    pub async fn acknowledge(&self, artifact: &Artifact) -> Result<()> {
        {
            let Entry::Occupied(mut entry) = self.artifacts.entry(artifact.job.clone()) else {
                return Err(DownlyError::ArtifactExpired(artifact.path.display().to_string()));
            };
            let tracked = entry.get_mut();
            if tracked.artifact.path != artifact.path {
                return Err(DownlyError::ArtifactExpired(artifact.path.display().to_string()));
            }
            match tracked.delivery {
                Delivery::Available => tracked.delivery = Delivery::Consumed,
                Delivery::Consumed => {
                    return Err(DownlyError::ArtifactAlreadyConsumed(
                        artifact.path.display().to_string(),
                    ))
                }
            }
        }

        self.delete_files(artifact).await;
        tracing::info!(job = %artifact.job.short(), "Artifact acknowledged");
        Ok(())
    }

    /// Stop tracking the artifact and delete its files. Idempotent.
    pub async fn evict(&self, artifact: &Artifact) {
        self.artifacts.remove_if(&artifact.job, |_, tracked| {
            tracked.artifact.path == artifact.path && tracked.delivery == Delivery::Available
        });
        self.delete_files(artifact).await;
    }

    /// Drop the consumed marker kept for `job` once its record is gone
    pub fn forget(&self, job: &JobKey) {
        self.artifacts
            .remove_if(job, |_, tracked| tracked.delivery == Delivery::Consumed);
    }

    /// Number of artifacts the manager still tracks, consumed ones included
    pub fn tracked_count(&self) -> usize {
        self.artifacts.len()
    }

    async fn delete_files(&self, artifact: &Artifact) {
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to delete {}: {}", artifact.path.display(), e),
        }
        if let Some(dir) = artifact.path.parent() {
            // Only removes the job directory once it is empty
            let _ = tokio::fs::remove_dir(dir).await;
        }
    }

    /// Available artifacts created more than `retention` ago
    pub fn expired(&self, retention: Duration) -> Vec<Artifact> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Vec::new();
        };
        self.artifacts
            .iter()
            .filter(|tracked| tracked.delivery == Delivery::Available && tracked.artifact.created_at <= cutoff)
            .map(|tracked| tracked.artifact.clone())
            .collect()
    }

    /// Remove staging and artifact directories left behind by jobs that are
    /// neither running nor holding a deliverable artifact, and the namespaces
    /// of managers that no longer hold their lock
    pub async fn recovery_sweep(&self, store: &JobStore) -> Result<SweepReport> {
        let retained = |key: Option<JobKey>| {
            key.and_then(|key| store.state(&key))
                .map(|state| state.is_active() || state == JobState::Ready)
                .unwrap_or(false)
        };

        let mut report = SweepReport::default();
        // Staging entries are `<key>.<random>`
        sweep_root(&self.staging_root, &mut report, |name| {
            retained(name.split('.').next().and_then(JobKey::parse))
        })
        .await?;
        sweep_root(&self.artifacts_root, &mut report, |name| {
            retained(JobKey::parse(name))
        })
        .await?;
        self.sweep_abandoned(&mut report).await?;

        // Collect first: store locks are never taken while holding artifact locks
        let tracked: Vec<JobKey> = self.artifacts.iter().map(|entry| entry.key().clone()).collect();
        for key in tracked {
            if !retained(Some(key.clone())) {
                self.artifacts.remove(&key);
            }
        }

        if !report.removed.is_empty() {
            tracing::info!("Recovery sweep removed {} entries", report.removed.len());
        }
        Ok(report)
    }

    async fn sweep_abandoned(&self, report: &mut SweepReport) -> Result<()> {
        let mut owners = BTreeSet::new();
        for base in [&self.staging_base, &self.artifacts_base] {
            for name in entry_names(base).await? {
                let owner = name.strip_suffix(LOCK_SUFFIX).unwrap_or(&name).to_string();
                if owner != self.owner.id {
                    owners.insert(owner);
                }
            }
        }

        for owner in owners {
            let lock_path = self.staging_base.join(format!("{}{}", owner, LOCK_SUFFIX));
            // Held for the duration of the removal
            let _held = match OpenOptions::new().write(true).open(&lock_path) {
                Ok(file) => {
                    if file.try_lock_exclusive().is_err() {
                        tracing::debug!("Namespace {} is in use, skipping", owner);
                        report.kept += 1;
                        continue;
                    }
                    Some(file)
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };

            for base in [&self.staging_base, &self.artifacts_base] {
                let path = base.join(&owner);
                if remove_entry(&path).await? {
                    tracing::debug!("Swept {}", path.display());
                    report.removed.push(path);
                }
            }
            remove_entry(&lock_path).await?;
        }

        Ok(())
    }
}

impl Drop for OutputManager {
    fn drop(&mut self) {
        // Only succeeds for empty directories; leftovers go to the next sweep
        let _ = std::fs::remove_dir(&self.staging_root);
        let _ = std::fs::remove_dir(&self.artifacts_root);
        if !self.staging_root.exists() && !self.artifacts_root.exists() {
            let _ = std::fs::remove_file(&self.owner.path);
        }
    }
}

async fn entry_names(root: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    Ok(names)
}

/// Remove a file or directory tree. Returns whether anything was there.
async fn remove_entry(path: &Path) -> io::Result<bool> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(true)
}

async fn sweep_root(
    root: &Path,
    report: &mut SweepReport,
    keep: impl Fn(&str) -> bool,
) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if keep(&name) {
            report.kept += 1;
            continue;
        }

        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        tracing::debug!("Swept {}", path.display());
        report.removed.push(path);
    }

    Ok(())
}

async fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
