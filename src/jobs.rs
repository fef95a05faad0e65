#![forbid(unsafe_code)]

//! In-memory job store.
//!
//! Each job sits behind its own lock so the worker that owns it can publish
//! progress without blocking pollers of other jobs. The map lock is only held
//! long enough to insert, look up or evict an entry.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Byte counters reported while a download is running.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Transfer {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed: f64,
    pub eta: u64,
}

/// Progress record returned by `GET /progress/{id}`.
///
/// Status only moves forward (queued, downloading, then completed or error);
/// every mutator returns `false` and leaves the job untouched when asked for
/// a transition the current status does not allow.
#[derive(Clone, Debug, Serialize)]
pub struct Job {
    status: JobStatus,
    progress: f64,
    downloaded_bytes: u64,
    total_bytes: u64,
    speed: f64,
    eta: u64,
    #[serde(serialize_with = "serialize_path")]
    filepath: Option<PathBuf>,
    error: Option<String>,
    #[serde(skip)]
    work_dir: Option<PathBuf>,
    #[serde(skip)]
    finished_at: Option<Instant>,
}

impl Job {
    fn queued() -> Self {
        Self {
            status: JobStatus::Queued,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed: 0.0,
            eta: 0,
            filepath: None,
            error: None,
            work_dir: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn filepath(&self) -> Option<&Path> {
        self.filepath.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn start(&mut self, work_dir: PathBuf) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        self.status = JobStatus::Downloading;
        self.work_dir = Some(work_dir);
        true
    }

    pub fn record_transfer(&mut self, transfer: Transfer) -> bool {
        if self.status != JobStatus::Downloading {
            return false;
        }
        self.progress = percent_of(transfer.downloaded_bytes, transfer.total_bytes);
        self.downloaded_bytes = transfer.downloaded_bytes;
        self.total_bytes = transfer.total_bytes;
        self.speed = transfer.speed;
        self.eta = transfer.eta;
        true
    }

    /// One stream finished transferring. Merging may still follow, so the job
    /// stays in `downloading`.
    pub fn mark_transferred(&mut self) -> bool {
        if self.status != JobStatus::Downloading {
            return false;
        }
        self.progress = 100.0;
        true
    }

    pub fn complete(&mut self, filepath: Option<PathBuf>) -> bool {
        if self.status != JobStatus::Downloading {
            return false;
        }
        self.status = JobStatus::Completed;
        self.progress = 100.0;
        self.filepath = filepath;
        self.finished_at = Some(Instant::now());
        true
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Error;
        self.error = Some(message.into());
        self.finished_at = Some(Instant::now());
        true
    }

    /// Time spent in a terminal state, `None` while still active.
    pub fn finished_for(&self, now: Instant) -> Option<Duration> {
        self.finished_at
            .map(|finished| now.saturating_duration_since(finished))
    }
}

/// Percentage rounded to one decimal. Unknown totals report 0.
pub fn percent_of(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let percent = (downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
    (percent * 10.0).round() / 10.0
}

fn serialize_path<S: Serializer>(path: &Option<PathBuf>, serializer: S) -> Result<S::Ok, S::Error> {
    match path {
        Some(path) => serializer.serialize_some(&path.to_string_lossy()),
        None => serializer.serialize_none(),
    }
}

pub type JobHandle = Arc<RwLock<Job>>;

#[derive(Clone, Default)]
pub struct JobStore {
    jobs: Arc<RwLock<HashMap<String, JobHandle>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new queued job under a fresh random id.
    pub fn create(&self) -> (String, JobHandle) {
        let id = Uuid::new_v4().to_string();
        let handle = Arc::new(RwLock::new(Job::queued()));
        self.jobs.write().insert(id.clone(), handle.clone());
        (id, handle)
    }

    pub fn handle(&self, id: &str) -> Option<JobHandle> {
        self.jobs.read().get(id).cloned()
    }

    pub fn snapshot(&self, id: &str) -> Option<Job> {
        let handle = self.handle(id)?;
        let job = handle.read().clone();
        Some(job)
    }

    pub fn remove(&self, id: &str) -> Option<Job> {
        let handle = self.jobs.write().remove(id)?;
        let job = handle.read().clone();
        Some(job)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every job that has been terminal for at least `ttl` and returns
    /// them so the caller can clean up their files.
    pub fn evict_finished(&self, ttl: Duration, now: Instant) -> Vec<(String, Job)> {
        let mut jobs = self.jobs.write();
        let expired: Vec<String> = jobs
            .iter()
            .filter(|(_, handle)| {
                handle
                    .read()
                    .finished_for(now)
                    .is_some_and(|elapsed| elapsed >= ttl)
            })
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                let handle = jobs.remove(&id)?;
                let job = handle.read().clone();
                Some((id, job))
            })
            .collect()
    }
}
