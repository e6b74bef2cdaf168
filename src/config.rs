#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::cache::{DEFAULT_CAPACITY, DEFAULT_TTL};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_YTDLP: &str = "yt-dlp";
pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const DEFAULT_MAX_DOWNLOADS: usize = 3;

const KEY_HOST: &str = "TUBEFETCH_HOST";
const KEY_PORT: &str = "TUBEFETCH_PORT";
const KEY_YTDLP: &str = "TUBEFETCH_YTDLP";
const KEY_FFMPEG: &str = "TUBEFETCH_FFMPEG";
const KEY_WORKSPACE: &str = "TUBEFETCH_WORKSPACE";
const KEY_CACHE_TTL: &str = "TUBEFETCH_CACHE_TTL_SECS";
const KEY_CACHE_CAPACITY: &str = "TUBEFETCH_CACHE_CAPACITY";
const KEY_MAX_DOWNLOADS: &str = "TUBEFETCH_MAX_DOWNLOADS";

/// Fully resolved settings the server starts with.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    pub ytdlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub workspace_root: PathBuf,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub max_downloads: usize,
}

/// Values given on the command line; they beat every other source.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workspace_root: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_config(&file_vars, env_var_string, overrides))
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let parsed = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup(KEY_HOST))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup(KEY_PORT).and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let workspace_root = overrides
        .workspace_root
        .or_else(|| lookup(KEY_WORKSPACE).map(PathBuf::from))
        .unwrap_or_else(env::temp_dir);
    let cache_ttl = parsed(KEY_CACHE_TTL)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TTL);
    let cache_capacity = parsed(KEY_CACHE_CAPACITY)
        .filter(|cap| *cap > 0)
        .map(|cap| cap as usize)
        .unwrap_or(DEFAULT_CAPACITY);
    let max_downloads = parsed(KEY_MAX_DOWNLOADS)
        .filter(|max| *max > 0)
        .map(|max| max as usize)
        .unwrap_or(DEFAULT_MAX_DOWNLOADS);

    RuntimeConfig {
        host,
        port,
        ytdlp: PathBuf::from(lookup(KEY_YTDLP).unwrap_or_else(|| DEFAULT_YTDLP.to_string())),
        ffmpeg: PathBuf::from(lookup(KEY_FFMPEG).unwrap_or_else(|| DEFAULT_FFMPEG.to_string())),
        workspace_root,
        cache_ttl,
        cache_capacity,
        max_downloads,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses a dotenv-style file. A missing file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
