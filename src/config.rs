//! Configuration management for the podlink service.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices and connection parameters.

use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PodLinkError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   #[serde(default = "default_health_interval")]
   pub health_interval_sec: u64,

   #[serde(default = "default_retry_count")]
   pub connection_retry_count: u32,

   #[serde(default = "default_reconnect_delay")]
   pub reconnect_delay_sec: u64,

   /// Whether to watch standard GATT Battery Service characteristics on
   /// connected devices in addition to the enhanced protocol.
   #[serde(default = "default_gatt_battery")]
   pub gatt_battery: bool,
}

/// A device the user has connected before.
#[derive(Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_health_interval() -> u64 {
   5
}

const fn default_retry_count() -> u32 {
   10
}

const fn default_reconnect_delay() -> u64 {
   10
}

const fn default_gatt_battery() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         health_interval_sec: default_health_interval(),
         connection_retry_count: default_retry_count(),
         reconnect_delay_sec: default_reconnect_delay(),
         gatt_battery: default_gatt_battery(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(podlink_home) = env::var("PODLINK_HOME") {
         PathBuf::from(podlink_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(PodLinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("podlinkd").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address == address)
         .map(|d| d.name.as_str())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn defaults_fill_missing_fields() {
      let config: Config = toml::from_str("").unwrap();
      assert_eq!(config.health_interval_sec, 5);
      assert_eq!(config.connection_retry_count, 10);
      assert!(config.gatt_battery);
      assert!(config.known_devices.is_empty());
   }

   #[test]
   fn round_trips_through_disk() {
      let dir = tempfile::tempdir().unwrap();
      unsafe {
         env::set_var("PODLINK_HOME", dir.path());
      }

      let mut config = Config::default();
      config.known_devices.push(KnownDevice {
         address: "AA:BB:CC:DD:EE:FF".into(),
         name: "My Buds".into(),
      });
      config.gatt_battery = false;
      config.save().unwrap();

      let loaded = Config::load().unwrap();
      assert_eq!(loaded.known_devices.len(), 1);
      assert_eq!(loaded.is_known_device("AA:BB:CC:DD:EE:FF"), Some("My Buds"));
      assert!(!loaded.gatt_battery);
   }
}
