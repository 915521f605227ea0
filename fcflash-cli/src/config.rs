//! Configuration file support for fcflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (FCFLASH_*)
//! 3. Local config file (./fcflash.toml)
//! 4. Global config file (e.g. ~/.config/fcflash/config.toml)
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyACM0"
//! baud = 256000
//! reboot_baud = 115200
//!
//! [flash]
//! erase_chip = false
//! no_reboot = false
//! custom_defaults = "defaults.txt"
//!
//! [dfu]
//! device = "0483:df11"
//! ```

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "fcflash.toml";

/// Serial bootloader settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Bootloader baud rate.
    pub baud: Option<u32>,
    /// Baud rate of the running firmware, used for the reboot request.
    pub reboot_baud: Option<u32>,
}

/// Flash behaviour shared by both transports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Erase the whole chip by default.
    #[serde(default)]
    pub erase_chip: bool,
    /// Assume the board already sits in the bootloader.
    #[serde(default)]
    pub no_reboot: bool,
    /// Custom defaults file inserted into every image.
    pub custom_defaults: Option<PathBuf>,
}

/// USB DFU settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DfuConfig {
    /// Device selector, `VID:PID[@serial]`.
    pub device: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serial configuration.
    #[serde(default)]
    pub serial: SerialConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// DFU configuration.
    #[serde(default)]
    pub dfu: DfuConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Invalid TOML in config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "fcflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.serial.port.is_some() {
            self.serial.port = other.serial.port;
        }
        if other.serial.baud.is_some() {
            self.serial.baud = other.serial.baud;
        }
        if other.serial.reboot_baud.is_some() {
            self.serial.reboot_baud = other.serial.reboot_baud;
        }

        if other.flash.erase_chip {
            self.flash.erase_chip = true;
        }
        if other.flash.no_reboot {
            self.flash.no_reboot = true;
        }
        if other.flash.custom_defaults.is_some() {
            self.flash.custom_defaults = other.flash.custom_defaults;
        }

        if other.dfu.device.is_some() {
            self.dfu.device = other.dfu.device;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.serial.port.is_none());
        assert!(config.serial.baud.is_none());
        assert!(!config.flash.erase_chip);
        assert!(!config.flash.no_reboot);
        assert!(config.dfu.device.is_none());
    }

    #[test]
    fn test_config_merge_overrides_set_values() {
        let mut base = Config::default();
        base.serial.port = Some("/dev/ttyACM0".to_string());
        base.serial.baud = Some(115200);

        let mut other = Config::default();
        other.serial.baud = Some(256000);
        other.dfu.device = Some("0483:df11".to_string());

        base.merge(other);

        assert_eq!(base.serial.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.serial.baud, Some(256000));
        assert_eq!(base.dfu.device.as_deref(), Some("0483:df11"));
    }

    #[test]
    fn test_config_merge_ors_flags() {
        let mut base = Config::default();
        base.flash.erase_chip = true;

        let mut other = Config::default();
        other.flash.no_reboot = true;

        base.merge(other);
        assert!(base.flash.erase_chip);
        assert!(base.flash.no_reboot);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[serial]
port = "COM3"
baud = 256000
reboot_baud = 115200

[flash]
erase_chip = true
custom_defaults = "defaults.txt"

[dfu]
device = "0483:df11@3276385A3436"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.serial.port.as_deref(), Some("COM3"));
        assert_eq!(config.serial.baud, Some(256000));
        assert_eq!(config.serial.reboot_baud, Some(115200));
        assert!(config.flash.erase_chip);
        assert!(!config.flash.no_reboot);
        assert_eq!(
            config.flash.custom_defaults.as_deref(),
            Some(Path::new("defaults.txt"))
        );
        assert_eq!(config.dfu.device.as_deref(), Some("0483:df11@3276385A3436"));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.serial.port.is_none());
        assert!(config.flash.custom_defaults.is_none());
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[serial]\nport = \"/dev/ttyUSB1\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn test_load_from_path_invalid_toml_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.serial.port.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.serial.port.is_none());
    }

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_string_lossy().contains("fcflash"));
            assert!(p.to_string_lossy().ends_with("config.toml"));
        }
    }
}
