#![forbid(unsafe_code)]

//! Runtime configuration. Every key is resolved with the same precedence:
//! CLI override, then process environment, then the `.env` file, then the
//! built-in default.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
const DEFAULT_WORK_DIR_NAME: &str = "bluema-downloads";

/// Cookie jars handed to yt-dlp for sites that gate content behind a login.
/// Both fall back to the shared `COOKIES_FILE`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieFiles {
    pub instagram: Option<PathBuf>,
    pub facebook: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub work_dir: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    /// `None` keeps finished jobs for the whole process lifetime.
    pub job_ttl: Option<Duration>,
    pub ytdlp_bin: PathBuf,
    pub cookies: CookieFiles,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub env_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub work_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub job_ttl_secs: Option<u64>,
    pub ytdlp_bin: Option<PathBuf>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<ServerConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_config(&file_vars, env_var_string, overrides)
}

fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<ServerConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let host_raw = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("BLUEMA_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let host = host_raw.parse::<IpAddr>().with_context(|| {
        format!("expected a valid IPv4 or IPv6 address for --host/BLUEMA_HOST, got {host_raw:?}")
    })?;

    let port = overrides
        .port
        .or_else(|| parse_value(lookup("BLUEMA_PORT")))
        .unwrap_or(DEFAULT_PORT);
    let work_dir = overrides
        .work_dir
        .or_else(|| lookup("BLUEMA_WORK_DIR").map(PathBuf::from))
        .unwrap_or_else(|| env::temp_dir().join(DEFAULT_WORK_DIR_NAME));
    let workers = overrides
        .workers
        .or_else(|| parse_value(lookup("BLUEMA_WORKERS")))
        .unwrap_or(DEFAULT_WORKERS)
        .max(1);
    let queue_capacity = overrides
        .queue_capacity
        .or_else(|| parse_value(lookup("BLUEMA_QUEUE_CAPACITY")))
        .unwrap_or(DEFAULT_QUEUE_CAPACITY)
        .max(1);
    let job_ttl_secs: u64 = overrides
        .job_ttl_secs
        .or_else(|| parse_value(lookup("BLUEMA_JOB_TTL_SECS")))
        .unwrap_or(0);
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup("BLUEMA_YTDLP_BIN").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));

    let shared_cookies = lookup("COOKIES_FILE");
    let cookies = CookieFiles {
        instagram: lookup("INSTAGRAM_COOKIES")
            .or_else(|| shared_cookies.clone())
            .map(PathBuf::from),
        facebook: lookup("FACEBOOK_COOKIES")
            .or(shared_cookies)
            .map(PathBuf::from),
    };

    Ok(ServerConfig {
        host,
        port,
        work_dir,
        workers,
        queue_capacity,
        job_ttl: (job_ttl_secs > 0).then(|| Duration::from_secs(job_ttl_secs)),
        ytdlp_bin,
        cookies,
    })
}

fn parse_value<T: FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|value| value.parse().ok())
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Parses a dotenv-style file. A missing file is not an error.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(raw_value.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| {
            value
                .strip_prefix(*quote)
                .and_then(|inner| inner.strip_suffix(*quote))
        })
        .unwrap_or(value)
}
