//! Configuration file support for ft8mon.
//!
//! Loads settings from `~/.config/ft8mon/config.toml` on Linux
//! (or platform-appropriate location on other OSes). Command-line flags
//! override whatever the file sets.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::delivery::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SEND_INTERVAL, OverflowPolicy, parse_report_url,
};
use crate::monitor;
use crate::server;
use crate::telegram::DEFAULT_CLIENT_ID;

/// Settings for `ft8mon monitor`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Address the UDP listener binds.
    pub address: String,

    /// UDP port WSJT-X sends to.
    pub port: u16,

    /// Client id announced in heartbeats.
    pub client_id: String,

    /// Only serve the WSJT-X instance announcing this client id.
    pub peer_client_id: Option<String>,

    /// Path to the cty.dat country file.
    pub cty_file: PathBuf,

    /// Report endpoint, e.g. `http://host/report?id=station&band=14.074`.
    pub report_url: Option<String>,

    /// Seconds between report batches.
    pub send_interval: u64,

    /// Messages buffered between the listener and the reporter.
    pub queue_capacity: usize,

    /// Behaviour when the queue is full.
    pub overflow: OverflowPolicy,

    /// Print statistics every N seconds (0 disables).
    pub stats_interval: u64,

    /// Port for a standalone Prometheus endpoint.
    pub metrics_port: Option<u16>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            address: monitor::DEFAULT_ADDRESS.to_string(),
            port: monitor::DEFAULT_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            peer_client_id: None,
            cty_file: PathBuf::from("cty.dat"),
            report_url: None,
            send_interval: DEFAULT_SEND_INTERVAL.as_secs(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
            stats_interval: 300,
            metrics_port: None,
        }
    }
}

impl MonitorSettings {
    /// Check the settings a monitor cannot start without.
    pub fn validate(&self) -> Result<()> {
        let Some(url) = self.report_url.as_deref() else {
            bail!("no report URL configured (use --report-url or [monitor] report_url)");
        };
        parse_report_url(url)?;
        if self.send_interval == 0 {
            bail!("send_interval must be at least 1 second");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        Ok(())
    }
}

/// Settings for `ft8mon serve`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the HTTP API binds.
    pub address: String,

    /// HTTP port.
    pub port: u16,

    /// Print statistics every N seconds (0 disables).
    pub stats_interval: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: server::DEFAULT_ADDRESS.to_string(),
            port: server::DEFAULT_PORT,
            stats_interval: 0,
        }
    }
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorSettings,
    pub server: ServerSettings,
}

impl Config {
    /// Load configuration from the default config file location.
    ///
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but is malformed.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Config::default()),
        }
    }

    /// Load configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in config file: {}", path.display()))
    }

    /// Returns the path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ft8mon/config.toml"))
    }
}
