use crate::discovery::{DiscoveryConfig, ServiceAnnouncement};
use crate::offline::OfflineConfig;
use crate::state::ProcessorConfig;
use crate::worker::WorkerConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Config file read when `DEVGATE_CONFIG` is not set
pub const DEFAULT_CONFIG_PATH: &str = "devgate.toml";

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub offline: OfflineSettings,
    #[serde(default)]
    pub commands: CommandSettings,
    #[serde(default)]
    pub families: FamilySettings,
}

/// Device database location
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_database() -> String {
    "devgate.db".to_string()
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

/// Queue depth warnings, shared by every queue worker
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: usize,
    #[serde(default = "default_warn_cooldown")]
    pub warn_cooldown_secs: u64,
}

fn default_warn_threshold() -> usize {
    100
}

fn default_warn_cooldown() -> u64 {
    60
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            warn_threshold: default_warn_threshold(),
            warn_cooldown_secs: default_warn_cooldown(),
        }
    }
}

impl WorkerSettings {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            warn_threshold: self.warn_threshold,
            warn_cooldown: Duration::from_secs(self.warn_cooldown_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_search_interval")]
    pub search_interval_secs: u64,
    #[serde(default = "default_min_search_interval")]
    pub min_search_interval_secs: u64,
    #[serde(default = "default_search_window")]
    pub search_window_secs: u64,
    /// Announcements replayed by the static searcher
    #[serde(default)]
    pub static_devices: Vec<StaticDevice>,
}

fn default_search_interval() -> u64 {
    300
}

fn default_min_search_interval() -> u64 {
    60
}

fn default_search_window() -> u64 {
    10
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            search_interval_secs: default_search_interval(),
            min_search_interval_secs: default_min_search_interval(),
            search_window_secs: default_search_window(),
            static_devices: Vec::new(),
        }
    }
}

impl DiscoverySettings {
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            search_interval: Duration::from_secs(self.search_interval_secs),
            min_search_interval: Duration::from_secs(self.min_search_interval_secs),
            search_window: Duration::from_secs(self.search_window_secs),
        }
    }

    pub fn static_announcements(&self) -> Vec<ServiceAnnouncement> {
        self.static_devices.iter().cloned().map(Into::into).collect()
    }
}

/// A device announced from config rather than from the network
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StaticDevice {
    pub serial_number: String,
    pub service_type: String,
    pub location: String,
    pub remote_address: String,
}

impl From<StaticDevice> for ServiceAnnouncement {
    fn from(device: StaticDevice) -> Self {
        ServiceAnnouncement {
            serial_number: device.serial_number,
            service_type: device.service_type,
            location: device.location,
            remote_address: device.remote_address,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OfflineSettings {
    #[serde(default = "default_offline_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_offline_period")]
    pub period_secs: u64,
}

fn default_offline_initial_delay() -> u64 {
    60
}

fn default_offline_period() -> u64 {
    30
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_offline_initial_delay(),
            period_secs: default_offline_period(),
        }
    }
}

impl OfflineSettings {
    pub fn offline_config(&self) -> OfflineConfig {
        OfflineConfig {
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            period: Duration::from_secs(self.period_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSettings {
    /// How long automatic commands wait for a result
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    30
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_command_timeout(),
        }
    }
}

impl CommandSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-family tuning
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FamilySettings {
    #[serde(default)]
    pub generic: GenericFamilySettings,
    #[serde(default)]
    pub plug: PlugFamilySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenericFamilySettings {
    /// Generic devices are only heard from during discovery, so this must
    /// outlast the search interval
    #[serde(default = "default_generic_offline_delay")]
    pub offline_delay_secs: u64,
}

fn default_generic_offline_delay() -> u64 {
    900
}

impl Default for GenericFamilySettings {
    fn default() -> Self {
        Self {
            offline_delay_secs: default_generic_offline_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlugFamilySettings {
    #[serde(default = "default_plug_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_plug_offline_delay")]
    pub offline_delay_secs: u64,
    #[serde(default = "default_plug_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_plug_poll_interval() -> u64 {
    10
}

fn default_plug_offline_delay() -> u64 {
    60
}

fn default_plug_request_timeout() -> u64 {
    5
}

impl Default for PlugFamilySettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_plug_poll_interval(),
            offline_delay_secs: default_plug_offline_delay(),
            request_timeout_secs: default_plug_request_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            worker: self.worker.worker_config(),
            command_timeout: self.commands.timeout(),
        }
    }

    /// Loads configuration using `DEVGATE_CONFIG` and `DEVGATE_DB`.
    ///
    /// Without `DEVGATE_CONFIG`, [`DEFAULT_CONFIG_PATH`] is read if it exists
    /// and defaults are used otherwise.
    pub fn from_env() -> Result<Self> {
        Self::resolve(
            std::env::var("DEVGATE_CONFIG").ok(),
            std::env::var("DEVGATE_DB").ok(),
        )
    }

    fn resolve(config_path: Option<String>, database: Option<String>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => load_config(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => load_config(DEFAULT_CONFIG_PATH)?,
            None => {
                info!("No config file found, using defaults");
                GatewayConfig::default()
            }
        };

        if let Some(database) = database {
            config.storage.database = database;
        }
        Ok(config)
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<GatewayConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: GatewayConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}
