use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use client_core::config::{
    BridgeConfig, DEFAULT_GRACE_PERIOD, DEFAULT_SERVER_READY_MARKER, DEFAULT_SETTLE_DELAY,
};
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_FILE: &str = "airchat.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub worker_dir: Option<PathBuf>,
    pub server_binary: String,
    pub client_binary: String,
    pub settle_delay_ms: u64,
    pub grace_period_ms: u64,
    /// Empty disables marker detection; readiness then relies on the settle delay alone.
    pub server_ready_marker: String,
    pub avatar_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_dir: None,
            server_binary: "server".into(),
            client_binary: "client".into(),
            settle_delay_ms: DEFAULT_SETTLE_DELAY.as_millis() as u64,
            grace_period_ms: DEFAULT_GRACE_PERIOD.as_millis() as u64,
            server_ready_marker: DEFAULT_SERVER_READY_MARKER.into(),
            avatar_dir: None,
        }
    }
}

pub fn load_settings(config_path: Option<&Path>) -> Settings {
    let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let raw = match fs::read_to_string(path) {
        Ok(raw) => Some(raw),
        Err(err) => {
            if config_path.is_some() {
                warn!(path = %path.display(), %err, "config file not readable; using defaults");
            }
            None
        }
    };
    load_settings_from(raw.as_deref(), |key| std::env::var(key).ok())
}

/// File values override defaults; `AIRCHAT_*` then `APP__*` env vars override both.
pub fn load_settings_from(
    raw_file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut values = HashMap::new();
    if let Some(raw) = raw_file {
        match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    values.insert(key, value);
                }
            }
            Err(err) => warn!(%err, "ignoring malformed config file"),
        }
    }

    for key in [
        "worker_dir",
        "server_binary",
        "client_binary",
        "settle_delay_ms",
        "grace_period_ms",
        "server_ready_marker",
        "avatar_dir",
    ] {
        let upper = key.to_ascii_uppercase();
        if let Some(v) = env(&format!("AIRCHAT_{upper}")) {
            values.insert(key.to_string(), v);
        }
        if let Some(v) = env(&format!("APP__{upper}")) {
            values.insert(key.to_string(), v);
        }
    }

    let mut settings = Settings::default();
    if let Some(v) = values.remove("worker_dir") {
        settings.worker_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = values.remove("server_binary") {
        settings.server_binary = v;
    }
    if let Some(v) = values.remove("client_binary") {
        settings.client_binary = v;
    }
    if let Some(v) = values.remove("settle_delay_ms") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.settle_delay_ms = parsed,
            Err(_) => warn!(value = %v, "settle_delay_ms is not a number; keeping default"),
        }
    }
    if let Some(v) = values.remove("grace_period_ms") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.grace_period_ms = parsed,
            Err(_) => warn!(value = %v, "grace_period_ms is not a number; keeping default"),
        }
    }
    if let Some(v) = values.remove("server_ready_marker") {
        settings.server_ready_marker = v;
    }
    if let Some(v) = values.remove("avatar_dir") {
        settings.avatar_dir = Some(PathBuf::from(v));
    }
    for key in values.keys() {
        debug!(key, "unknown config key ignored");
    }

    settings
}

impl Settings {
    pub fn to_bridge_config(&self) -> BridgeConfig {
        let search_dirs = worker_search_dirs(self.worker_dir.as_deref());
        BridgeConfig {
            server_program: resolve_worker_binary(&self.server_binary, &search_dirs),
            client_program: resolve_worker_binary(&self.client_binary, &search_dirs),
            server_ready_marker: Some(self.server_ready_marker.trim())
                .filter(|marker| !marker.is_empty())
                .map(str::to_string),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            grace_period: Duration::from_millis(self.grace_period_ms),
        }
    }

    pub fn avatar_dir(&self) -> Option<PathBuf> {
        self.avatar_dir.clone().or_else(|| {
            dirs::data_local_dir().map(|base| base.join("airchat").join("avatars"))
        })
    }
}

/// Configured directory first, then `<exe dir>/bin`, then `./bin`.
pub fn worker_search_dirs(worker_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = worker_dir {
        dirs.push(dir.to_path_buf());
    }
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir.join("bin"));
    }
    dirs.push(PathBuf::from("bin"));
    dirs
}

/// First existing candidate, or the bare name left to `PATH` lookup.
pub fn resolve_worker_binary(name: &str, search_dirs: &[PathBuf]) -> PathBuf {
    let file_name = with_exe_suffix(name);
    if Path::new(name).is_absolute() {
        return PathBuf::from(file_name);
    }
    for dir in search_dirs {
        let candidate = dir.join(&file_name);
        debug!(candidate = %candidate.display(), "checking worker binary");
        if candidate.is_file() {
            return candidate;
        }
    }
    warn!(name, "worker binary not found in search dirs; relying on PATH");
    PathBuf::from(file_name)
}

fn with_exe_suffix(name: &str) -> String {
    let suffix = std::env::consts::EXE_SUFFIX;
    if suffix.is_empty() || name.ends_with(suffix) {
        name.to_string()
    } else {
        format!("{name}{suffix}")
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
