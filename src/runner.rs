#![forbid(unsafe_code)]

//! Background download execution.
//!
//! A fixed number of workers drain a bounded task queue. Each task owns one
//! job and a private output directory, and runs the extractor on the
//! blocking pool while progress events are folded into the job record.
//! When a TTL is configured a sweep task also evicts finished jobs together
//! with their files.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc, mpsc::error::TrySendError},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    extractor::{
        DownloadRequest, ExtractorError, MediaExtractor, ProgressEvent, ProgressStatus,
    },
    jobs::{JobHandle, JobStore, Transfer},
    platform::Platform,
};

/// Extensions accepted when yt-dlp did not tell us where the file ended up.
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "m4a"];
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub work_dir: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    pub job_ttl: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("download queue is full, try again later")]
    QueueFull,
    #[error("download workers are not running")]
    Closed,
}

struct DownloadTask {
    job_id: String,
    job: JobHandle,
    url: String,
    format: Option<String>,
}

#[derive(Clone)]
pub struct JobRunner {
    store: JobStore,
    queue: mpsc::Sender<DownloadTask>,
}

impl JobRunner {
    /// Spawns the worker pool, plus the eviction sweep when a TTL is set, on
    /// the current tokio runtime.
    pub fn start(
        extractor: Arc<dyn MediaExtractor>,
        store: JobStore,
        settings: RunnerSettings,
    ) -> Self {
        let workers = settings.workers.max(1);
        let queue_capacity = settings.queue_capacity.max(1);
        let (queue, receiver) = mpsc::channel(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let work_dir = Arc::new(settings.work_dir);

        for worker in 0..workers {
            tokio::spawn(worker_loop(
                worker,
                receiver.clone(),
                extractor.clone(),
                work_dir.clone(),
            ));
        }
        if let Some(ttl) = settings.job_ttl {
            tokio::spawn(sweep_loop(store.clone(), ttl));
        }
        info!(workers, queue_capacity, "download workers started");

        Self { store, queue }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Creates a queued job and hands it to the pool. Returns as soon as the
    /// task is enqueued; a full queue forgets the job again.
    pub fn submit(&self, url: String, format: Option<String>) -> Result<String, SubmitError> {
        let (job_id, job) = self.store.create();
        let task = DownloadTask {
            job_id: job_id.clone(),
            job,
            url,
            format,
        };

        match self.queue.try_send(task) {
            Ok(()) => {
                info!(%job_id, "download queued");
                Ok(job_id)
            }
            Err(err) => {
                self.store.remove(&job_id);
                Err(match err {
                    TrySendError::Full(_) => SubmitError::QueueFull,
                    TrySendError::Closed(_) => SubmitError::Closed,
                })
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<DownloadTask>>>,
    extractor: Arc<dyn MediaExtractor>,
    work_dir: Arc<PathBuf>,
) {
    loop {
        // Only one idle worker waits on the channel at a time.
        let next = receiver.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };
        run_task(task, extractor.clone(), &work_dir).await;
    }
    debug!(worker, "download worker stopped");
}

async fn run_task(task: DownloadTask, extractor: Arc<dyn MediaExtractor>, work_dir: &Path) {
    let DownloadTask {
        job_id,
        job,
        url,
        format,
    } = task;

    let job_dir = work_dir.join(&job_id);
    if let Err(err) = tokio::fs::create_dir_all(&job_dir).await {
        warn!(%job_id, %err, "could not prepare job directory");
        job.write()
            .fail(format!("could not create {}: {err}", job_dir.display()));
        return;
    }
    job.write().start(job_dir.clone());

    let platform = Platform::detect(&url);
    info!(%job_id, platform = platform.as_str(), "download started");
    let request = build_request(url, format, job_dir, platform);

    let job_for_run = job.clone();
    let outcome =
        tokio::task::spawn_blocking(move || execute(extractor.as_ref(), &request, &job_for_run))
            .await;

    match outcome {
        Ok(Ok(Some(path))) => {
            info!(%job_id, path = %path.display(), "download completed");
            job.write().complete(Some(path));
        }
        Ok(Ok(None)) => {
            warn!(%job_id, "download finished but no media file was found");
            job.write().complete(None);
        }
        Ok(Err(err)) => {
            warn!(%job_id, error = %err, "download failed");
            job.write().fail(err.to_string());
        }
        Err(err) => {
            warn!(%job_id, error = %err, "download task aborted");
            job.write().fail(format!("download task aborted: {err}"));
        }
    }
}

fn build_request(
    url: String,
    format: Option<String>,
    output_dir: PathBuf,
    platform: Platform,
) -> DownloadRequest {
    let format = format
        .map(|format| format.trim().to_string())
        .filter(|format| !format.is_empty())
        .unwrap_or_else(|| platform.default_format().to_string());
    DownloadRequest {
        url,
        format,
        output_dir,
        output_template: platform.output_template().to_string(),
        restrict_filenames: platform.uses_id_filenames(),
    }
}

/// Runs the download and settles on the output file: the path yt-dlp
/// reported after post-processing, else the last finished stream, else the
/// first media file in the job directory.
fn execute(
    extractor: &dyn MediaExtractor,
    request: &DownloadRequest,
    job: &JobHandle,
) -> Result<Option<PathBuf>, ExtractorError> {
    let mut finished_file = None;
    let reported = extractor.download(request, &mut |event| {
        if let Some(path) = apply_event(job, &event) {
            finished_file = Some(path);
        }
    })?;

    Ok(reported
        .filter(|path| path.is_file())
        .or_else(|| finished_file.filter(|path| path.is_file()))
        .or_else(|| find_media_file(&request.output_dir)))
}

/// Folds one progress event into the job. Returns the file name carried by a
/// `finished` event.
fn apply_event(job: &JobHandle, event: &ProgressEvent) -> Option<PathBuf> {
    match event.status {
        ProgressStatus::Downloading => {
            let total_bytes = event
                .total_bytes
                .filter(|total| *total > 0.0)
                .or(event.total_bytes_estimate)
                .map(whole)
                .unwrap_or(0);
            job.write().record_transfer(Transfer {
                downloaded_bytes: event.downloaded_bytes.map(whole).unwrap_or(0),
                total_bytes,
                speed: event
                    .speed
                    .filter(|speed| speed.is_finite() && *speed > 0.0)
                    .unwrap_or(0.0),
                eta: event.eta.map(whole).unwrap_or(0),
            });
            None
        }
        ProgressStatus::Finished => {
            job.write().mark_transferred();
            event.filename.as_deref().map(PathBuf::from)
        }
        ProgressStatus::Error | ProgressStatus::Other => None,
    }
}

fn whole(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

fn find_media_file(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .find(|path| has_media_extension(path))
}

fn has_media_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            MEDIA_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

async fn sweep_loop(store: JobStore, ttl: Duration) {
    let period = ttl.clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let evicted = sweep_expired(&store, ttl, Instant::now()).await;
        if evicted > 0 {
            info!(evicted, remaining = store.len(), "evicted finished jobs");
        }
    }
}

async fn sweep_expired(store: &JobStore, ttl: Duration, now: Instant) -> usize {
    let evicted = store.evict_finished(ttl, now);
    for (job_id, job) in &evicted {
        let Some(dir) = job.work_dir() else {
            continue;
        };
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(%job_id, dir = %dir.display(), "removed job directory"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(%job_id, %err, "could not remove job directory"),
        }
    }
    evicted.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobStatus};
    use std::fs;
    use std::sync::{Condvar, Mutex as StdMutex};

    /// Blocks fake downloads until opened; gives up after a few seconds so a
    /// failing test cannot hang the blocking pool.
    #[derive(Default)]
    struct Gate {
        open: StdMutex<bool>,
        signal: Condvar,
    }

    impl Gate {
        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.signal.notify_all();
        }

        fn wait(&self) {
            let guard = self.open.lock().unwrap();
            let _ = self
                .signal
                .wait_timeout_while(guard, Duration::from_secs(5), |open| !*open)
                .unwrap();
        }
    }

    #[derive(Default)]
    struct FakeExtractor {
        gate: Option<Arc<Gate>>,
        fail_with: Option<String>,
        report_final_path: bool,
        emit_finished: bool,
        file_name: Option<String>,
        requests: StdMutex<Vec<DownloadRequest>>,
    }

    impl MediaExtractor for FakeExtractor {
        fn extract_info(&self, _url: &str) -> Result<crate::extractor::MediaInfo, ExtractorError> {
            Err(ExtractorError::Failed("not used".into()))
        }

        fn download(
            &self,
            request: &DownloadRequest,
            on_progress: &mut dyn FnMut(ProgressEvent),
        ) -> Result<Option<PathBuf>, ExtractorError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(gate) = &self.gate {
                gate.wait();
            }
            if let Some(message) = &self.fail_with {
                return Err(ExtractorError::Failed(message.clone()));
            }

            on_progress(ProgressEvent::downloading(512, Some(1024)));
            let Some(name) = &self.file_name else {
                return Ok(None);
            };
            let path = request.output_dir.join(name);
            fs::write(&path, b"video")?;
            if self.emit_finished {
                on_progress(ProgressEvent::finished(path.to_string_lossy()));
            }
            Ok(self.report_final_path.then_some(path))
        }
    }

    fn start_runner(
        extractor: Arc<FakeExtractor>,
        work_dir: &Path,
        workers: usize,
        queue_capacity: usize,
    ) -> JobRunner {
        JobRunner::start(
            extractor,
            JobStore::new(),
            RunnerSettings {
                work_dir: work_dir.to_path_buf(),
                workers,
                queue_capacity,
                job_ttl: None,
            },
        )
    }

    async fn wait_for(store: &JobStore, id: &str, predicate: impl Fn(&Job) -> bool) -> Job {
        for _ in 0..500 {
            if let Some(job) = store.snapshot(id)
                && predicate(&job)
            {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached the expected state");
    }

    #[tokio::test]
    async fn completed_download_reports_file_and_full_progress() {
        let temp = tempfile::tempdir().unwrap();
        let extractor = Arc::new(FakeExtractor {
            report_final_path: true,
            emit_finished: true,
            file_name: Some("clip.mp4".into()),
            ..FakeExtractor::default()
        });
        let runner = start_runner(extractor.clone(), temp.path(), 2, 4);

        let id = runner
            .submit("https://www.youtube.com/watch?v=abc".into(), None)
            .unwrap();
        let job = wait_for(runner.store(), &id, |job| job.status().is_terminal()).await;

        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100.0);
        let expected = temp.path().join(&id).join("clip.mp4");
        assert_eq!(job.filepath(), Some(expected.as_path()));

        let requests = extractor.requests.lock().unwrap();
        assert_eq!(requests[0].format, "bestvideo+bestaudio/best");
        assert_eq!(requests[0].output_template, "%(title)s.%(ext)s");
        assert!(!requests[0].restrict_filenames);
    }

    #[tokio::test]
    async fn explicit_format_is_passed_through() {
        let temp = tempfile::tempdir().unwrap();
        let extractor = Arc::new(FakeExtractor {
            report_final_path: true,
            file_name: Some("abc.mp4".into()),
            ..FakeExtractor::default()
        });
        let runner = start_runner(extractor.clone(), temp.path(), 1, 4);

        let id = runner
            .submit("https://www.instagram.com/reel/abc/".into(), Some("dash-720".into()))
            .unwrap();
        wait_for(runner.store(), &id, |job| job.status().is_terminal()).await;

        let requests = extractor.requests.lock().unwrap();
        assert_eq!(requests[0].format, "dash-720");
        assert_eq!(requests[0].output_template, "%(id)s.%(ext)s");
        assert!(requests[0].restrict_filenames);
    }

    #[tokio::test]
    async fn falls_back_to_finished_event_then_directory_scan() {
        let temp = tempfile::tempdir().unwrap();
        let from_event = Arc::new(FakeExtractor {
            emit_finished: true,
            file_name: Some("from-event.mkv".into()),
            ..FakeExtractor::default()
        });
        let runner = start_runner(from_event, temp.path(), 1, 4);
        let id = runner
            .submit("https://www.tiktok.com/@a/video/1".into(), None)
            .unwrap();
        let job = wait_for(runner.store(), &id, |job| job.status().is_terminal()).await;
        assert_eq!(
            job.filepath(),
            Some(temp.path().join(&id).join("from-event.mkv").as_path())
        );

        let scanned = Arc::new(FakeExtractor {
            file_name: Some("scanned.webm".into()),
            ..FakeExtractor::default()
        });
        let runner = start_runner(scanned, temp.path(), 1, 4);
        let id = runner
            .submit("https://fb.watch/xyz/".into(), None)
            .unwrap();
        let job = wait_for(runner.store(), &id, |job| job.status().is_terminal()).await;
        assert_eq!(
            job.filepath(),
            Some(temp.path().join(&id).join("scanned.webm").as_path())
        );
    }

    #[tokio::test]
    async fn extractor_failure_marks_job_errored() {
        let temp = tempfile::tempdir().unwrap();
        let extractor = Arc::new(FakeExtractor {
            fail_with: Some("ERROR: [youtube] abc: Video unavailable".into()),
            ..FakeExtractor::default()
        });
        let runner = start_runner(extractor, temp.path(), 1, 4);

        let id = runner
            .submit("https://youtu.be/abc".into(), None)
            .unwrap();
        let job = wait_for(runner.store(), &id, |job| job.status().is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Error);
        assert_eq!(job.error(), Some("ERROR: [youtube] abc: Video unavailable"));
        assert!(job.filepath().is_none());
    }

    #[tokio::test]
    async fn busy_pool_keeps_jobs_queued_and_rejects_overflow() {
        let temp = tempfile::tempdir().unwrap();
        let gate = Arc::new(Gate::default());
        let extractor = Arc::new(FakeExtractor {
            gate: Some(gate.clone()),
            report_final_path: true,
            file_name: Some("clip.mp4".into()),
            ..FakeExtractor::default()
        });
        let runner = start_runner(extractor, temp.path(), 1, 1);

        let first = runner.submit("https://youtu.be/1".into(), None).unwrap();
        let running = wait_for(runner.store(), &first, |job| {
            job.status() == JobStatus::Downloading
        })
        .await;
        assert!(running.progress() <= 100.0);

        let second = runner.submit("https://youtu.be/2".into(), None).unwrap();
        assert_eq!(
            runner.store().snapshot(&second).unwrap().status(),
            JobStatus::Queued
        );

        let overflow = runner.submit("https://youtu.be/3".into(), None);
        assert!(matches!(overflow, Err(SubmitError::QueueFull)));
        assert_eq!(runner.store().len(), 2);

        gate.open();
        for id in [&first, &second] {
            let job = wait_for(runner.store(), id, |job| job.status().is_terminal()).await;
            assert_eq!(job.status(), JobStatus::Completed);
            assert_eq!(job.progress(), 100.0);
        }
    }

    #[test]
    fn progress_events_update_the_job() {
        let store = JobStore::new();
        let (_, handle) = store.create();
        handle.write().start(PathBuf::from("/tmp/job"));

        let mut event = ProgressEvent::downloading(250, None);
        event.total_bytes_estimate = Some(1000.4);
        event.speed = Some(f64::NAN);
        event.eta = Some(3.6);
        assert!(apply_event(&handle, &event).is_none());
        {
            let job = handle.read();
            assert_eq!(job.progress(), 25.0);
            let value = serde_json::to_value(&*job).unwrap();
            assert_eq!(value["total_bytes"], 1000);
            assert_eq!(value["speed"], 0.0);
            assert_eq!(value["eta"], 4);
        }

        assert!(apply_event(&handle, &ProgressEvent::downloading(10, None)).is_none());
        assert_eq!(handle.read().progress(), 0.0);

        let path = apply_event(&handle, &ProgressEvent::finished("/tmp/job/a.f137.mp4"));
        assert_eq!(path, Some(PathBuf::from("/tmp/job/a.f137.mp4")));
        assert_eq!(handle.read().progress(), 100.0);
        assert_eq!(handle.read().status(), JobStatus::Downloading);
    }

    #[test]
    fn media_scan_ignores_other_files() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("a.part"), b"").unwrap();
        fs::write(temp.path().join("b.info.json"), b"{}").unwrap();
        assert!(find_media_file(temp.path()).is_none());

        fs::write(temp.path().join("c.M4A"), b"audio").unwrap();
        fs::write(temp.path().join("d.mp4"), b"video").unwrap();
        assert_eq!(find_media_file(temp.path()), Some(temp.path().join("c.M4A")));
    }

    #[tokio::test]
    async fn sweep_removes_expired_jobs_and_their_files() {
        let temp = tempfile::tempdir().unwrap();
        let store = JobStore::new();
        let (done, handle) = store.create();
        let (pending, _) = store.create();
        let dir = temp.path().join(&done);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("clip.mp4"), b"video").unwrap();
        {
            let mut job = handle.write();
            job.start(dir.clone());
            job.complete(Some(dir.join("clip.mp4")));
        }

        let ttl = Duration::from_secs(30);
        assert_eq!(sweep_expired(&store, ttl, Instant::now()).await, 0);
        assert!(dir.exists());

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(sweep_expired(&store, ttl, later).await, 1);
        assert!(!dir.exists());
        assert!(store.snapshot(&done).is_none());
        assert!(store.snapshot(&pending).is_some());
    }
}
