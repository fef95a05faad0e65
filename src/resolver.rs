#![forbid(unsafe_code)]

//! `POST /resolve`: metadata lookup and format list normalization.

use std::{collections::HashSet, sync::Arc};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::extractor::{FormatInfo, MediaExtractor, MediaInfo};

const DEFAULT_EXT: &str = "mp4";
const DEFAULT_TITLE: &str = "Video";
const UNKNOWN_RESOLUTION: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaFormat {
    pub format_id: Option<String>,
    pub ext: String,
    pub resolution: String,
    pub filesize: Option<u64>,
    pub has_video: bool,
    pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedMedia {
    pub title: String,
    pub thumbnail: Option<String>,
    /// Whole seconds.
    pub duration: Option<u64>,
    pub uploader: Option<String>,
    pub formats: Vec<MediaFormat>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("URL is required")]
    MissingUrl,
    #[error("{0}")]
    Extraction(String),
}

#[derive(Clone)]
pub struct Resolver {
    extractor: Arc<dyn MediaExtractor>,
}

impl Resolver {
    pub fn new(extractor: Arc<dyn MediaExtractor>) -> Self {
        Self { extractor }
    }

    pub async fn resolve(&self, url: &str) -> Result<ResolvedMedia, ResolveError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ResolveError::MissingUrl);
        }

        let extractor = self.extractor.clone();
        let target = url.to_string();
        let info = tokio::task::spawn_blocking(move || extractor.extract_info(&target))
            .await
            .map_err(|err| ResolveError::Extraction(format!("metadata lookup aborted: {err}")))?
            .map_err(|err| ResolveError::Extraction(err.to_string()))?;

        let media = summarize(info);
        debug!(%url, formats = media.formats.len(), "resolved media");
        Ok(media)
    }
}

pub fn summarize(info: MediaInfo) -> ResolvedMedia {
    let formats = normalize_formats(&info);
    ResolvedMedia {
        title: non_empty(info.title)
            .or_else(|| non_empty(info.id))
            .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        thumbnail: info.thumbnail,
        duration: info
            .duration
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| secs.round() as u64),
        uploader: non_empty(info.uploader).or_else(|| non_empty(info.uploader_id)),
        formats,
    }
}

/// One entry per (resolution, extension) pair, first occurrence wins. Sites
/// that only expose a direct URL get a synthetic `best` entry.
pub fn normalize_formats(info: &MediaInfo) -> Vec<MediaFormat> {
    let mut seen = HashSet::new();
    let mut formats: Vec<MediaFormat> = info
        .formats
        .iter()
        .flatten()
        .filter_map(|format| {
            let ext = format
                .ext
                .clone()
                .filter(|ext| !ext.is_empty())
                .unwrap_or_else(|| DEFAULT_EXT.to_string());
            let resolution = resolution_label(format);
            if !seen.insert((resolution.clone(), ext.clone())) {
                return None;
            }
            Some(MediaFormat {
                format_id: format.format_id.clone(),
                ext,
                resolution,
                filesize: byte_count(format.filesize)
                    .or_else(|| byte_count(format.filesize_approx)),
                has_video: has_codec(format.vcodec.as_deref()),
                has_audio: has_codec(format.acodec.as_deref()),
            })
        })
        .collect();

    if formats.is_empty() && info.url.as_deref().is_some_and(|url| !url.is_empty()) {
        formats.push(MediaFormat {
            format_id: Some("best".to_string()),
            ext: DEFAULT_EXT.to_string(),
            resolution: "best".to_string(),
            filesize: byte_count(info.filesize),
            has_video: true,
            has_audio: true,
        });
    }
    formats
}

fn resolution_label(format: &FormatInfo) -> String {
    if let Some(resolution) = format.resolution.as_deref().filter(|value| !value.is_empty()) {
        return resolution.to_string();
    }
    match (byte_count(format.width), byte_count(format.height)) {
        (Some(width), Some(height)) => format!("{width}x{height}"),
        (None, Some(height)) => format!("{height}p"),
        _ => UNKNOWN_RESOLUTION.to_string(),
    }
}

fn byte_count(value: Option<f64>) -> Option<u64> {
    value
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(|value| value.round() as u64)
}

fn has_codec(codec: Option<&str>) -> bool {
    codec.is_some_and(|codec| !codec.is_empty() && codec != "none")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
