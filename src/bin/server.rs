#![forbid(unsafe_code)]

//! HTTP server backing the mobile downloader.
//!
//! Resolves configuration, starts the download workers and serves the JSON
//! API until Ctrl+C.

use std::{fs, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use bluema_server::{
    api::{AppState, router},
    config::{ConfigOverrides, resolve_config},
    extractor::YtDlp,
    jobs::JobStore,
    logging::init_logging,
    resolver::Resolver,
    runner::{JobRunner, RunnerSettings},
};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "bluema-server")]
#[command(about = "Resolve and download videos for the Bluema app", long_about = None)]
struct ServerArgs {
    /// Dotenv file consulted after the process environment.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
    /// Address to listen on.
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Directory holding one sub-directory per download.
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,
    /// Number of downloads running at once.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
    /// Downloads allowed to wait for a worker before new ones are refused.
    #[arg(long, value_name = "N")]
    queue_capacity: Option<usize>,
    /// Forget finished downloads after this many seconds (0 keeps them).
    #[arg(long, value_name = "SECS")]
    job_ttl_secs: Option<u64>,
    /// Path to the yt-dlp executable.
    #[arg(long, value_name = "PATH")]
    ytdlp: Option<PathBuf>,
}

impl ServerArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            env_path: self.env_file,
            host: self.host,
            port: self.port,
            work_dir: self.work_dir,
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            job_ttl_secs: self.job_ttl_secs,
            ytdlp_bin: self.ytdlp,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    init_logging()?;

    let config = resolve_config(args.into_overrides())?;
    fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("creating {}", config.work_dir.display()))?;

    let extractor = Arc::new(YtDlp::new(&config.ytdlp_bin, config.cookies.clone()));
    let runner = JobRunner::start(
        extractor.clone(),
        JobStore::new(),
        RunnerSettings {
            work_dir: config.work_dir.clone(),
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            job_ttl: config.job_ttl,
        },
    );
    let state = AppState {
        resolver: Arc::new(Resolver::new(extractor)),
        runner,
    };

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        work_dir = %config.work_dir.display(),
        ytdlp = %config.ytdlp_bin.display(),
        "server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}
