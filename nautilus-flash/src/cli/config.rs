//! Command-line interface configuration
//!
//! The [Config] type handles loading and saving of the `nautilus-flash.toml`
//! configuration file, which is looked up in the current directory, its
//! parent, and finally the user's configuration directory.

use std::{
    fs::{create_dir_all, read_to_string, write},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::github::DEFAULT_API_URL,
    manifest::DEFAULT_FIRMWARE_DIR,
    relay::DEFAULT_RELAY,
    rom::FlashSize,
    transport::UsbIds,
};

const CONFIG_FILE: &str = "nautilus-flash.toml";

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
    /// Baud rate of the serial port
    pub baudrate: Option<u32>,
}

/// A configured, known USB device
#[derive(Debug, Deserialize, Serialize, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub vid: u16,
    /// USB Product ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub pid: u16,
}

fn deserialize_hex_to_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hex = String::deserialize(deserializer)?.to_lowercase();
    let hex = hex.trim_start_matches("0x");

    u16::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
}

fn serialize_u16_to_hex<S>(decimal: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{decimal:04x}"))
}

impl UsbDevice {
    /// Check if the given USB identifiers match this device
    pub fn matches(&self, ids: &UsbIds) -> bool {
        self.vid == ids.vid && self.pid == ids.pid
    }
}

/// Where local firmware images are read from
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Firmware {
    pub directory: PathBuf,
}

impl Default for Firmware {
    fn default() -> Self {
        Firmware {
            directory: PathBuf::from(DEFAULT_FIRMWARE_DIR),
        }
    }
}

/// Where releases are listed and downloaded from
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Releases {
    /// Repository publishing the releases, as `owner/repo`
    pub repository: Option<String>,
    pub api_url: String,
    /// Relay release assets are downloaded through
    pub relay: String,
}

impl Default for Releases {
    fn default() -> Self {
        Releases {
            repository: None,
            api_url: DEFAULT_API_URL.to_string(),
            relay: DEFAULT_RELAY.to_string(),
        }
    }
}

/// Flash chip settings
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Flash {
    /// Size of the flash, which bounds a full chip erase
    pub size: FlashSize,
}

/// Application configuration
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// Preferred serial port connection information
    #[serde(default)]
    pub connection: Connection,
    /// Preferred USB devices
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
    #[serde(default)]
    pub firmware: Firmware,
    #[serde(default)]
    pub releases: Releases,
    #[serde(default)]
    pub flash: Flash,
    /// Path of the file to save the configuration to
    #[serde(skip)]
    save_path: PathBuf,
}

impl Config {
    /// Load configuration from the configuration file
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::find_config_path()?)
    }

    /// Load configuration from `path`, defaulting everything if it's missing
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = match read_to_string(path) {
            Ok(data) => toml::from_str::<Config>(&data)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to parse {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => Config::default(),
            Err(err) => {
                return Err(err)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("Failed to read {}", path.display()))
            }
        };
        config.save_path = path.to_path_buf();

        debug!("Config: {:#?}", &config);

        Ok(config)
    }

    /// Path the configuration is saved to
    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Save a modified copy of the configuration to the configuration file
    pub fn save_with<F: Fn(&mut Self)>(&self, modify_fn: F) -> Result<()> {
        let mut copy = self.clone();
        modify_fn(&mut copy);

        let serialized = toml::to_string(&copy)
            .into_diagnostic()
            .wrap_err("Failed to serialize config")?;

        if let Some(parent) = self.save_path.parent() {
            create_dir_all(parent)
                .into_diagnostic()
                .wrap_err("Failed to create config directory")?;
        }

        write(&self.save_path, serialized)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write config to {}", self.save_path.display()))
    }

    fn find_config_path() -> Result<PathBuf> {
        let current_dir = std::env::current_dir().into_diagnostic()?;

        let local_config = current_dir.join(CONFIG_FILE);
        if local_config.exists() {
            return Ok(local_config);
        }
        if let Some(parent_folder) = current_dir.parent() {
            let workspace_config = parent_folder.join(CONFIG_FILE);
            if workspace_config.exists() {
                return Ok(workspace_config);
            }
        }

        match ProjectDirs::from("net", "h-i-r", "nautilus-flash") {
            Some(project_dirs) => Ok(project_dirs.config_dir().join(CONFIG_FILE)),
            None => Ok(local_config),
        }
    }
}
