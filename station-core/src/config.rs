//! Persisted station configuration.
//!
//! The record lives in a single JSON file. Every write replaces the whole file
//! through a temp file in the same directory, so an interrupted write leaves
//! the previous version intact.

use crate::error::ConfigError;
use crate::models::CommLink;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tempfile::NamedTempFile;

pub const DEFAULT_FIRMWARE: &str = "/home/pi/FR1_FACTORY.bin";
pub const DEFAULT_BAUD: u32 = 1_152_000;
/// ROM bootloader speed every ESP32 answers on after reset.
pub const ROM_BAUD: u32 = 115_200;
pub const DEFAULT_COUNTER: &str = "/home/pi/flash_count.txt";
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub firmware_path: PathBuf,
    pub baud: u32,
    pub fallback_baud: u32,
    pub counter_path: PathBuf,
    pub success_sound: Option<PathBuf>,
    pub error_sound: Option<PathBuf>,
    pub last_port: Option<String>,
    pub chip: String,
    pub tool_program: String,
    pub tool_args: Vec<String>,
    pub flash_address: String,
    pub probe_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            firmware_path: PathBuf::from(DEFAULT_FIRMWARE),
            baud: DEFAULT_BAUD,
            fallback_baud: ROM_BAUD,
            counter_path: PathBuf::from(DEFAULT_COUNTER),
            success_sound: Some(PathBuf::from("/home/pi/success.wav")),
            error_sound: Some(PathBuf::from("/home/pi/error.wav")),
            last_port: None,
            chip: "esp32".to_string(),
            tool_program: "python3".to_string(),
            tool_args: vec!["-m".to_string(), "esptool".to_string()],
            flash_address: "0x0".to_string(),
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
        }
    }
}

impl DeviceConfig {
    /// Flash offset the image is written to.
    pub fn flash_offset(&self) -> Result<u32, ConfigError> {
        parse_address(&self.flash_address).map_err(|reason| ConfigError::InvalidValue {
            key: ConfigKey::FlashAddress.to_string(),
            value: self.flash_address.clone(),
            reason,
        })
    }

    /// Never below one second; a hand-edited zero would fail every probe.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}

fn parse_address(raw: &str) -> Result<u32, String> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => trimmed.parse::<u32>(),
    };
    parsed.map_err(|e| e.to_string())
}

/// Editable fields of [`DeviceConfig`], named as in the JSON file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    FirmwarePath,
    Baud,
    FallbackBaud,
    CounterPath,
    SuccessSound,
    ErrorSound,
    LastPort,
    Chip,
    ToolProgram,
    ToolArgs,
    FlashAddress,
    ProbeTimeoutSecs,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 12] = [
        ConfigKey::FirmwarePath,
        ConfigKey::Baud,
        ConfigKey::FallbackBaud,
        ConfigKey::CounterPath,
        ConfigKey::SuccessSound,
        ConfigKey::ErrorSound,
        ConfigKey::LastPort,
        ConfigKey::Chip,
        ConfigKey::ToolProgram,
        ConfigKey::ToolArgs,
        ConfigKey::FlashAddress,
        ConfigKey::ProbeTimeoutSecs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::FirmwarePath => "firmware_path",
            ConfigKey::Baud => "baud",
            ConfigKey::FallbackBaud => "fallback_baud",
            ConfigKey::CounterPath => "counter_path",
            ConfigKey::SuccessSound => "success_sound",
            ConfigKey::ErrorSound => "error_sound",
            ConfigKey::LastPort => "last_port",
            ConfigKey::Chip => "chip",
            ConfigKey::ToolProgram => "tool_program",
            ConfigKey::ToolArgs => "tool_args",
            ConfigKey::FlashAddress => "flash_address",
            ConfigKey::ProbeTimeoutSecs => "probe_timeout_secs",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.name() == s)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

/// Empty string or `none` clears an optional field.
fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(value.to_string())
    }
}

fn apply(config: &mut DeviceConfig, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    };
    let positive_u32 = |raw: &str| -> Result<u32, ConfigError> {
        match raw.trim().parse::<u32>() {
            Ok(0) => Err(invalid("must be greater than zero".to_string())),
            Ok(n) => Ok(n),
            Err(e) => Err(invalid(e.to_string())),
        }
    };

    match key {
        ConfigKey::FirmwarePath => config.firmware_path = PathBuf::from(value.trim()),
        ConfigKey::Baud => config.baud = positive_u32(value)?,
        ConfigKey::FallbackBaud => config.fallback_baud = positive_u32(value)?,
        ConfigKey::CounterPath => config.counter_path = PathBuf::from(value.trim()),
        ConfigKey::SuccessSound => config.success_sound = optional(value).map(PathBuf::from),
        ConfigKey::ErrorSound => config.error_sound = optional(value).map(PathBuf::from),
        ConfigKey::LastPort => config.last_port = optional(value),
        ConfigKey::Chip => {
            let chip = value.trim();
            if chip.is_empty() {
                return Err(invalid("chip name is empty".to_string()));
            }
            config.chip = chip.to_string();
        }
        ConfigKey::ToolProgram => {
            let program = value.trim();
            if program.is_empty() {
                return Err(invalid("program is empty".to_string()));
            }
            config.tool_program = program.to_string();
        }
        ConfigKey::ToolArgs => {
            config.tool_args = value.split_whitespace().map(str::to_string).collect()
        }
        ConfigKey::FlashAddress => {
            parse_address(value).map_err(invalid)?;
            config.flash_address = value.trim().to_string();
        }
        ConfigKey::ProbeTimeoutSecs => {
            config.probe_timeout_secs = u64::from(positive_u32(value)?);
        }
    }
    Ok(())
}

/// Replace `path` with `contents` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ConfigStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the record, falling back to defaults when the file is missing
    /// or unreadable. A broken config must not stop the line.
    pub fn load(&self) -> DeviceConfig {
        match self.try_load() {
            Ok(config) => config,
            Err(e) => {
                warn!("{}; using default configuration", e);
                DeviceConfig::default()
            }
        }
    }

    pub fn try_load(&self) -> Result<DeviceConfig, ConfigError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", self.path.display());
                return Ok(DeviceConfig::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save(&self, config: &DeviceConfig) -> Result<(), ConfigError> {
        let mut encoded = serde_json::to_vec_pretty(config)?;
        encoded.push(b'\n');
        write_atomic(&self.path, &encoded).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Read-modify-write of a single field.
    pub fn update(&self, key: ConfigKey, value: &str) -> Result<DeviceConfig, ConfigError> {
        let mut config = self.try_load()?;
        apply(&mut config, key, value)?;
        self.save(&config)?;
        info!("Config {} set to {:?}", key, value);
        Ok(config)
    }

    /// Stores a negotiated link as the new starting point. Returns whether
    /// anything changed.
    pub fn record_link(&self, link: &CommLink) -> Result<bool, ConfigError> {
        let mut config = self.try_load()?;
        if config.baud == link.baud && config.last_port.as_deref() == Some(link.port.as_str()) {
            return Ok(false);
        }
        config.baud = link.baud;
        config.last_port = Some(link.port.clone());
        self.save(&config)?;
        info!("Saved working link {}", link);
        Ok(true)
    }
}
