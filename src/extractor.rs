#![forbid(unsafe_code)]

//! The media extractor seam.
//!
//! Everything that actually talks to YouTube, TikTok, Instagram or Facebook
//! lives in yt-dlp. This module builds its command lines and turns the
//! machine-readable progress lines back into [`ProgressEvent`]s. The
//! [`MediaExtractor`] trait keeps the rest of the service testable without
//! the real binary.

use std::{
    collections::VecDeque,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{config::CookieFiles, platform::Platform};

// Prefixes injected through `--progress-template` and `--print` so our lines
// can be told apart from whatever else yt-dlp writes to stdout.
const PROGRESS_MARKER: &str = "[bluema:progress]";
const FILEPATH_MARKER: &str = "[bluema:filepath]";

const SOCKET_TIMEOUT_SECS: &str = "30";
const RETRIES: &str = "3";
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Failed(String),
    #[error("unexpected extractor output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("extractor i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Subset of yt-dlp's info dict that the resolver reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub uploader_id: Option<String>,
    /// Direct media URL, present when the extractor resolved a single stream.
    pub url: Option<String>,
    pub filesize: Option<f64>,
    pub formats: Option<Vec<FormatInfo>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatInfo {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Downloading,
    Finished,
    Error,
    #[serde(other)]
    Other,
}

/// One progress hook invocation as reported by yt-dlp.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    pub downloaded_bytes: Option<f64>,
    pub total_bytes: Option<f64>,
    pub total_bytes_estimate: Option<f64>,
    pub speed: Option<f64>,
    pub eta: Option<f64>,
    pub filename: Option<String>,
}

impl ProgressEvent {
    pub fn downloading(downloaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        Self {
            status: ProgressStatus::Downloading,
            downloaded_bytes: Some(downloaded_bytes as f64),
            total_bytes: total_bytes.map(|total| total as f64),
            total_bytes_estimate: None,
            speed: None,
            eta: None,
            filename: None,
        }
    }

    pub fn finished(filename: impl Into<String>) -> Self {
        Self {
            status: ProgressStatus::Finished,
            downloaded_bytes: None,
            total_bytes: None,
            total_bytes_estimate: None,
            speed: None,
            eta: None,
            filename: Some(filename.into()),
        }
    }
}

/// Everything the extractor needs to run a single download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format: String,
    pub output_dir: PathBuf,
    /// yt-dlp output template relative to `output_dir`, e.g. `%(id)s.%(ext)s`.
    pub output_template: String,
    pub restrict_filenames: bool,
}

/// Metadata lookup plus download with progress callbacks. Both calls block,
/// so async callers run them through `spawn_blocking`.
pub trait MediaExtractor: Send + Sync {
    fn extract_info(&self, url: &str) -> Result<MediaInfo, ExtractorError>;

    /// Runs the download and returns the final file path when the extractor
    /// reports one.
    fn download(
        &self,
        request: &DownloadRequest,
        on_progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<Option<PathBuf>, ExtractorError>;
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    cookies: CookieFiles,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>, cookies: CookieFiles) -> Self {
        Self {
            binary: binary.into(),
            cookies,
        }
    }

    /// Base command with the options shared by metadata and download calls.
    fn command(&self, url: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--no-warnings")
            .arg("--socket-timeout")
            .arg(SOCKET_TIMEOUT_SECS)
            .arg("--retries")
            .arg(RETRIES)
            .arg("--fragment-retries")
            .arg(RETRIES);

        let options = Platform::detect(url).request_options(&self.cookies);
        for (name, value) in options.headers {
            command.arg("--add-header").arg(format!("{name}:{value}"));
        }
        if let Some(cookies) = options.cookies_file {
            command.arg("--cookies").arg(cookies);
        }
        command.stdin(Stdio::null());
        command
    }

    fn spawn_error(&self, source: std::io::Error) -> ExtractorError {
        ExtractorError::Spawn {
            program: self.binary.display().to_string(),
            source,
        }
    }
}

impl MediaExtractor for YtDlp {
    fn extract_info(&self, url: &str) -> Result<MediaInfo, ExtractorError> {
        let mut command = self.command(url);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-progress")
            .arg("--")
            .arg(url);
        debug!(?command, "fetching media metadata");

        let output = command.output().map_err(|err| self.spawn_error(err))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractorError::Failed(failure_message(
                &stderr,
                output.status,
            )));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn download(
        &self,
        request: &DownloadRequest,
        on_progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<Option<PathBuf>, ExtractorError> {
        let mut command = self.command(&request.url);
        command
            .arg("--newline")
            .arg("--progress")
            .arg("--no-simulate")
            .arg("--no-playlist")
            .arg("--progress-template")
            .arg(format!("download:{PROGRESS_MARKER}%(progress)j"))
            .arg("--print")
            .arg(format!("after_move:{FILEPATH_MARKER}%(filepath)s"))
            .arg("--format")
            .arg(&request.format)
            .arg("--output")
            .arg(request.output_dir.join(&request.output_template));
        if request.restrict_filenames {
            command.arg("--restrict-filenames");
        }
        command
            .arg("--")
            .arg(&request.url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(?command, "starting media download");

        let mut child = command.spawn().map_err(|err| self.spawn_error(err))?;
        let stderr = child.stderr.take();
        let stderr_tail =
            thread::spawn(move || stderr.map(|stream| read_tail(stream)).unwrap_or_default());

        let mut final_path = None;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(err.into());
                    }
                };
                match parse_output_line(&line) {
                    Some(OutputLine::Progress(event)) => on_progress(event),
                    Some(OutputLine::FinalPath(path)) => final_path = Some(path),
                    None => {}
                }
            }
        }

        let status = child.wait()?;
        let stderr = stderr_tail.join().unwrap_or_default();
        if !status.success() {
            return Err(ExtractorError::Failed(failure_message(&stderr, status)));
        }
        Ok(final_path)
    }
}

#[derive(Debug, PartialEq)]
enum OutputLine {
    Progress(ProgressEvent),
    FinalPath(PathBuf),
}

fn parse_output_line(line: &str) -> Option<OutputLine> {
    let line = line.trim_end();
    if let Some(payload) = line.strip_prefix(PROGRESS_MARKER) {
        return match serde_json::from_str(payload) {
            Ok(event) => Some(OutputLine::Progress(event)),
            Err(err) => {
                debug!(%err, "skipping unreadable progress line");
                None
            }
        };
    }
    line.strip_prefix(FILEPATH_MARKER)
        .map(str::trim)
        .filter(|path| !path.is_empty() && *path != "NA")
        .map(|path| OutputLine::FinalPath(Path::new(path).to_path_buf()))
}

fn read_tail(stream: impl Read) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    for line in BufReader::new(stream).lines().map_while(Result::ok) {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

/// Picks the most useful line out of yt-dlp's stderr: the last `ERROR:` line,
/// else the last non-empty line, else the exit status.
fn failure_message(stderr: &str, status: ExitStatus) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|line| line.to_string())
        .unwrap_or_else(|| format!("yt-dlp exited with {status}"))
}
