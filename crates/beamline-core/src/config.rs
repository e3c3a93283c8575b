//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/beamline.toml` by default)
//! 2. environment variables prefixed with `BEAMLINE_`, nested keys separated
//!    by `__` (e.g. `BEAMLINE_EXECUTOR__CAPACITY=4`)
//!
//! Every section has defaults, so a missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use beamline_core::config::BeamlineConfig;
//!
//! let config = BeamlineConfig::load()?;
//! config.validate()?;
//! println!("pool capacity: {}", config.executor.capacity);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default config file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/beamline.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamlineConfig {
    pub application: ApplicationConfig,
    pub executor: ExecutorConfig,
    pub bus: BusConfig,
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// trace, debug, info, warn or error
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "beamline".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of tasks running at once.
    pub capacity: usize,
    pub mode: ExecutionMode,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            mode: ExecutionMode::Pooled,
        }
    }
}

/// Whether wrapped calls run on the pool or on the caller's thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Pooled,
    /// Run each submission synchronously and hand back a finished handle.
    Inline,
}

/// Notification bus settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub delivery: Delivery,
}

/// When subscriber callbacks run relative to `send`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Queued and delivered on the dispatcher thread.
    #[default]
    Threaded,
    /// Delivered inside `send` on the caller's thread.
    Immediate,
}

/// Device definition in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier
    pub id: String,
    /// Driver type (e.g. "motor", "camera")
    pub r#type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific settings
    #[serde(default = "empty_table")]
    pub settings: toml::Value,
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl BeamlineConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// Provider chain: defaults, then file, then environment.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(BeamlineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEAMLINE_").split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.executor.capacity == 0 {
            return Err("Invalid executor capacity 0. Must be at least 1".to_string());
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(&device.id) {
                return Err(format!("Duplicate device ID: {}", device.id));
            }
        }

        Ok(())
    }

    /// Devices with `enabled = true`, in file order.
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.devices.iter().filter(|d| d.enabled)
    }
}
