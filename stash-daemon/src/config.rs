//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration. File: ~/.config/remotestash/config.toml or /etc/remotestash/config.toml.
/// Env overrides: REMOTESTASH_NAME, REMOTESTASH_PORT, REMOTESTASH_DISCOVERY_PORT,
/// REMOTESTASH_RESOLVE_TIMEOUT_MS, REMOTESTASH_REQUEST_TIMEOUT_MS, REMOTESTASH_IDENTITY_FILE.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Advertised instance name (default "<user> remote stash").
    #[serde(default = "default_name")]
    pub name: String,
    /// Transfer TCP port; 0 picks a free one (default 0).
    #[serde(default)]
    pub port: u16,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// How long a found peer may take to resolve (default 5000).
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    /// Per-request timeout for the client role (default 10000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_query_interval_secs")]
    pub query_interval_secs: u64,
    /// Browsed peers not re-announced within this are removed (default 16).
    #[serde(default = "default_peer_ttl_secs")]
    pub peer_ttl_secs: u64,
    /// Where the device UUID lives (default ~/.config/remotestash/device-id).
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_name() -> String {
    match std::env::var("USER") {
        Ok(user) if !user.is_empty() => format!("{} remote stash", user),
        _ => "remote stash".to_string(),
    }
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_resolve_timeout_ms() -> u64 {
    5000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_query_interval_secs() -> u64 {
    4
}
fn default_peer_ttl_secs() -> u64 {
    16
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            port: 0,
            discovery_port: default_discovery_port(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            query_interval_secs: default_query_interval_secs(),
            peer_ttl_secs: default_peer_ttl_secs(),
            identity_file: None,
        }
    }
}

impl Config {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_secs(self.query_interval_secs.max(1))
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_secs)
    }

    pub fn identity_path(&self) -> PathBuf {
        match &self.identity_file {
            Some(p) => p.clone(),
            None => config_dir().join("device-id"),
        }
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = lookup("REMOTESTASH_NAME") {
            if !s.trim().is_empty() {
                self.name = s;
            }
        }
        override_parsed(&lookup, "REMOTESTASH_PORT", &mut self.port);
        override_parsed(&lookup, "REMOTESTASH_DISCOVERY_PORT", &mut self.discovery_port);
        override_parsed(
            &lookup,
            "REMOTESTASH_RESOLVE_TIMEOUT_MS",
            &mut self.resolve_timeout_ms,
        );
        override_parsed(
            &lookup,
            "REMOTESTASH_REQUEST_TIMEOUT_MS",
            &mut self.request_timeout_ms,
        );
        if let Some(s) = lookup("REMOTESTASH_IDENTITY_FILE") {
            self.identity_file = Some(PathBuf::from(s));
        }
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(s) = lookup(key) {
        match s.trim().parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %s, "ignoring unparsable override"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

/// Load an explicit config file, then env vars. Unlike [`load`], a bad file is an error.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let mut c = parse_file(path)?;
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/remotestash")
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if std::env::var_os("HOME").is_some() {
        out.push(config_dir().join("config.toml"));
    }
    out.push(PathBuf::from("/etc/remotestash/config.toml"));
    out
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&path) {
        Ok(c) => {
            tracing::debug!(path = %path.display(), "loaded config");
            Some(c)
        }
        Err(e) => {
            tracing::warn!("{}; using defaults", e);
            None
        }
    }
}
