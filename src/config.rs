//! TOML configuration file
//!
//! Holds the options a board integration sets once:
//!
//! ```toml
//! bus = "linux-i2c:dev=/dev/i2c-1,addr=0x20,irq=gpiochip0:17"
//! fw_update_startup = true
//! fw_img = "/lib/firmware/synaptics.img"
//! fw_img_id = 0x23CACE
//! force = false
//! ```
//!
//! Command line arguments take precedence over file values.

use rmi4_core::device::DeviceConfig;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML or has wrong types
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Options loaded from the config file
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Bus selection string
    pub bus: Option<String>,
    /// Update the firmware when the device is initialized
    #[serde(default)]
    pub fw_update_startup: bool,
    /// Firmware image path
    pub fw_img: Option<PathBuf>,
    /// Firmware id of the image
    #[serde(default, deserialize_with = "deserialize_hex_u32")]
    pub fw_img_id: Option<u32>,
    /// Program regardless of ids
    #[serde(default)]
    pub force: bool,
}

/// Deserialize a u32 that can be hex (0x...) or decimal
fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Int(u32),
        Str(String),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(Some(n)),
        HexOrInt::Str(s) => parse_number(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex: {}", e))
    } else {
        s.parse().map_err(|e| format!("invalid number: {}", e))
    }
}

impl FileConfig {
    /// Load a config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config = Self::from_toml_str(&content)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse a config from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Device configuration for the startup update options
    pub fn device_config(&self) -> DeviceConfig {
        let mut config = DeviceConfig::default().with_force(self.force);
        if let Some(id) = self.fw_img_id {
            config = config.with_firmware_id(id);
        }
        match (&self.fw_img, self.fw_update_startup) {
            (Some(path), true) => config.with_startup_update(path),
            (None, true) => {
                log::warn!("fw_update_startup is set without fw_img, ignoring");
                config
            }
            (path, false) => {
                config.image_path = path.clone();
                config
            }
        }
    }
}
