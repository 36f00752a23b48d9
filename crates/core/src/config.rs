//! Lab configuration loaded from TOML.
//!
//! ```toml
//! [general]
//! name = "demo_lab"
//! sim_mode = true
//!
//! [[devices]]
//! name = "furnace_1"
//! type = "furnace"
//! methods = ["heat", "status"]
//!
//! [[devices.positions]]
//! name = "tray"
//! slots = 4
//!
//! [[positions]]
//! name = "rack"
//! slots = 8
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "LABMAN_CONFIG";

/// Config file used when neither a path nor the environment names one.
pub const DEFAULT_CONFIG_FILE: &str = "lab.toml";

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// Config path
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantically invalid
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level lab configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabConfig {
    /// Lab identity and mode
    #[serde(default)]
    pub general: GeneralConfig,

    /// Declared devices
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Standalone positions
    #[serde(default)]
    pub positions: Vec<PositionConfig>,

    /// Scheduling loop settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Device RPC settings
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Document store settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[general]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Lab name, used to name the device channel
    pub name: String,
    /// Run against simulated devices
    #[serde(default)]
    pub sim_mode: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { name: "lab".to_string(), sim_mode: false }
    }
}

/// `[[devices]]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device name
    pub name: String,
    /// Device type tag
    #[serde(rename = "type")]
    pub device_type: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Callable methods
    #[serde(default)]
    pub methods: Vec<String>,
    /// Hosted positions
    #[serde(default)]
    pub positions: Vec<PositionConfig>,
}

/// A named group of slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    /// Position name
    pub name: String,
    /// Number of slots
    #[serde(default = "default_slots")]
    pub slots: u32,
    /// Description
    #[serde(default)]
    pub description: String,
}

fn default_slots() -> u32 {
    1
}

/// `[scheduler]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between scheduling passes
    pub tick_ms: u64,
    /// Blocked passes before a requesting task gains priority
    pub aging_ticks: u32,
    /// How long shutdown waits for running tasks to stop
    pub shutdown_grace_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_ms: 500, aging_ticks: 20, shutdown_grace_ms: 5_000 }
    }
}

/// `[rpc]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Timeout applied by device proxies
    pub default_timeout_ms: u64,
    /// Pending calls not updated for this long fail as stale
    pub stale_after_ms: u64,
    /// How often the stale sweeper runs
    pub sweep_interval_ms: u64,
    /// Per-device request queue capacity
    pub channel_capacity: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            stale_after_ms: 600_000,
            sweep_interval_ms: 1_000,
            channel_capacity: 64,
        }
    }
}

/// `[storage]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON store directory; records are kept in memory when unset
    pub root: Option<PathBuf>,
}

impl LabConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: LabConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, else `$LABMAN_CONFIG`, else `./lab.toml`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = Self::resolve_path(path);
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        Self::from_toml(&text)
    }

    /// Which file [`LabConfig::load`] reads.
    pub fn resolve_path(path: Option<&Path>) -> PathBuf {
        match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE)),
        }
    }

    /// Name of the device request channel.
    pub fn channel_name(&self) -> String {
        if self.general.sim_mode {
            format!("{}_sim.device_rpc", self.general.name)
        } else {
            format!("{}.device_rpc", self.general.name)
        }
    }

    /// Reject duplicate names, empty slot groups and illegal names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut devices = HashSet::new();
        for device in &self.devices {
            check_name("device", &device.name)?;
            if device.name.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "device name {} must not contain '/'",
                    device.name
                )));
            }
            if !devices.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate device {}", device.name)));
            }
            let mut names = HashSet::new();
            for pos in &device.positions {
                check_position(pos)?;
                if !names.insert(pos.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate position {} on {}",
                        pos.name, device.name
                    )));
                }
            }
        }

        let mut standalone = HashSet::new();
        for pos in &self.positions {
            check_position(pos)?;
            if !standalone.insert(pos.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate position {}", pos.name)));
            }
            if devices.iter().any(|d| pos.name == *d || pos.name.starts_with(&format!("{}/", d))) {
                return Err(ConfigError::Invalid(format!(
                    "standalone position {} collides with a device name",
                    pos.name
                )));
            }
        }
        Ok(())
    }
}

fn check_name(kind: &str, name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("empty {} name", kind)));
    }
    if name.contains('.') || name.contains('$') {
        return Err(ConfigError::Invalid(format!(
            "{} name {} must not contain '.' or '$'",
            kind, name
        )));
    }
    Ok(())
}

fn check_position(pos: &PositionConfig) -> Result<(), ConfigError> {
    check_name("position", &pos.name)?;
    if pos.slots == 0 {
        return Err(ConfigError::Invalid(format!("position {} has no slots", pos.name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [general]
        name = "demo"
        sim_mode = true

        [[devices]]
        name = "furnace_1"
        type = "furnace"
        methods = ["heat"]

        [[devices.positions]]
        name = "tray"
        slots = 4

        [[positions]]
        name = "rack"
        slots = 8

        [scheduler]
        tick_ms = 50
    "#;

    #[test]
    fn test_parse() {
        let config = LabConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.devices[0].positions[0].slots, 4);
        assert_eq!(config.positions[0].name, "rack");
        assert_eq!(config.scheduler.tick_ms, 50);
        assert_eq!(config.scheduler.aging_ticks, 20);
        assert_eq!(config.rpc.default_timeout_ms, 30_000);
        assert_eq!(config.channel_name(), "demo_sim.device_rpc");
    }

    #[test]
    fn test_rejects_duplicate_device() {
        let text = r#"
            [[devices]]
            name = "d"
            type = "t"
            [[devices]]
            name = "d"
            type = "t"
        "#;
        assert!(matches!(LabConfig::from_toml(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_position_name() {
        let text = r#"
            [[positions]]
            name = "rack.1"
        "#;
        assert!(matches!(LabConfig::from_toml(text), Err(ConfigError::Invalid(_))));

        let text = r#"
            [[positions]]
            name = "rack"
            slots = 0
        "#;
        assert!(matches!(LabConfig::from_toml(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = LabConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
