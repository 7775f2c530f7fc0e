#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_STREAMGRAB_PORT: u16 = 8080;
pub const DEFAULT_STREAMGRAB_HOST: &str = "127.0.0.1";
pub const DEFAULT_FETCHER: &str = "yt-dlp";
pub const DEFAULT_WWW_ROOT: &str = "www";
pub const DEFAULT_WATCH_URL: &str = "https://www.youtube.com/watch?v=";

/// Everything the server needs to know at startup. Built once and never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub host: String,
    pub port: u16,
    pub fetcher: PathBuf,
    pub www_root: PathBuf,
    pub scratch_root: Option<PathBuf>,
    pub watch_url: String,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub fetcher: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub scratch_root: Option<PathBuf>,
    pub workers: Option<usize>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeSettings {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup_value("STREAMGRAB_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_STREAMGRAB_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("STREAMGRAB_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_STREAMGRAB_PORT);
    let fetcher = overrides
        .fetcher
        .or_else(|| lookup_value("STREAMGRAB_FETCHER", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FETCHER));
    let www_root = overrides
        .www_root
        .or_else(|| lookup_value("STREAMGRAB_WWW_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));
    let scratch_root = overrides.scratch_root.or_else(|| {
        lookup_value("STREAMGRAB_SCRATCH_ROOT", file_vars, &env_lookup).map(PathBuf::from)
    });
    let watch_url = lookup_value("STREAMGRAB_WATCH_URL", file_vars, &env_lookup)
        .unwrap_or_else(|| DEFAULT_WATCH_URL.to_string());
    // tokio rejects a zero-sized worker pool.
    let workers = overrides
        .workers
        .or_else(|| {
            lookup_value("STREAMGRAB_WORKERS", file_vars, &env_lookup)
                .and_then(|value| value.parse::<usize>().ok())
        })
        .filter(|count| *count > 0);

    RuntimeSettings {
        host,
        port,
        fetcher,
        www_root,
        scratch_root,
        watch_url,
        workers,
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .and_then(non_blank)
}

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
