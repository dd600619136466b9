//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use ruisseau_core::{StallPolicy, WireDialect, DEFAULT_TOPIC};
use serde::Deserialize;

/// Daemon configuration. File: `--config`, ~/.config/ruisseau/config.toml or
/// /etc/ruisseau/config.toml. Env overrides: RUISSEAU_PEER_NAME, RUISSEAU_DOWNLOAD_DIR,
/// RUISSEAU_BUS_PORT, RUISSEAU_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Our name on the bus (default `User_<random 100..999>`).
    #[serde(default = "default_peer_name")]
    pub peer_name: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Multicast group carrying the bus (default 239.255.60.61).
    #[serde(default = "default_multicast_group")]
    pub multicast_group: String,
    /// UDP port of the bus (default 45680).
    #[serde(default = "default_bus_port")]
    pub bus_port: u16,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Seconds between re-announcing and re-requesting catalogs.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    /// Seconds without a new chunk before a download is requested again. 0 waits forever.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_max_rerequests")]
    pub max_rerequests: u32,
    /// Send `mediaRequest`/`mediaChunk` instead of the legacy overloaded actions.
    #[serde(default)]
    pub explicit_media_actions: bool,
    /// Log filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub library: Vec<LibraryEntry>,
}

/// One local file offered to other peers.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LibraryEntry {
    pub path: PathBuf,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub year: u32,
    #[serde(default)]
    pub duration_seconds: u64,
    #[serde(default)]
    pub featuring: Vec<String>,
}

fn default_peer_name() -> String {
    format!("User_{}", rand::thread_rng().gen_range(100..1000))
}
fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}
fn default_multicast_group() -> String {
    "239.255.60.61".to_string()
}
fn default_bus_port() -> u16 {
    45680
}
fn default_download_dir() -> PathBuf {
    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("Music").join("BitTorrentMusic_Downloads")
}
fn default_refresh_secs() -> u64 {
    30
}
fn default_chunk_delay_ms() -> u64 {
    10
}
fn default_stall_timeout_secs() -> u64 {
    30
}
fn default_max_rerequests() -> u32 {
    2
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_name: default_peer_name(),
            topic: default_topic(),
            multicast_group: default_multicast_group(),
            bus_port: default_bus_port(),
            download_dir: default_download_dir(),
            refresh_secs: default_refresh_secs(),
            chunk_delay_ms: default_chunk_delay_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            max_rerequests: default_max_rerequests(),
            explicit_media_actions: false,
            log_level: default_log_level(),
            library: Vec::new(),
        }
    }
}

impl Config {
    pub fn dialect(&self) -> WireDialect {
        if self.explicit_media_actions {
            WireDialect::Explicit
        } else {
            WireDialect::Legacy
        }
    }

    /// Stall policy in engine ticks, one tick per second.
    pub fn stall_policy(&self) -> StallPolicy {
        StallPolicy {
            timeout_ticks: self.stall_timeout_secs,
            max_rerequests: self.max_rerequests,
        }
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs.max(1))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("RUISSEAU_PEER_NAME").filter(|s| !s.trim().is_empty()) {
            self.peer_name = s.trim().to_string();
        }
        if let Some(s) = var("RUISSEAU_DOWNLOAD_DIR").filter(|s| !s.is_empty()) {
            self.download_dir = PathBuf::from(s);
        }
        if let Some(s) = var("RUISSEAU_BUS_PORT") {
            if let Ok(p) = s.parse::<u16>() {
                self.bus_port = p;
            }
        }
        if let Some(s) = var("RUISSEAU_LOG").filter(|s| !s.is_empty()) {
            self.log_level = s;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: default, then the first config file found, then env vars. An explicit
/// `--config` path must exist and parse.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => load_file().unwrap_or_default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ruisseau/config.toml"));
    }
    out.push(PathBuf::from("/etc/ruisseau/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            // Logging is not up yet.
            eprintln!("ruisseau: {e}; using defaults");
            None
        }
    }
}
