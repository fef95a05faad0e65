#![forbid(unsafe_code)]

//! Download orchestration service built around yt-dlp. Downloads run on a
//! bounded worker pool; clients poll progress and fetch the finished file
//! over HTTP.

pub mod api;
pub mod config;
pub mod extractor;
pub mod jobs;
pub mod logging;
pub mod platform;
pub mod resolver;
pub mod runner;
