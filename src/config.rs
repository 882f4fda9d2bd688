//! Configuration management for the TWS service.
//!
//! Loads and saves the service configuration from disk. Timing knobs that
//! are tuned per product (guard intervals, duplicate window, power-off
//! timeouts) all live here.

use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};

use bluer::Address;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
   error::{Result, TwsError},
   poweroff::PowerOffTimeouts,
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// Address of the other earbud of the pair, if known.
   #[serde(default)]
   pub tws_peer: Option<String>,

   /// Adapter to drive, defaults to the system default adapter.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_max_connections")]
   pub max_connections: usize,

   /// Let a higher-priority media device take the foreground on its own.
   #[serde(default = "default_app_auto_switch")]
   pub app_auto_switch: bool,

   #[serde(default = "default_guard_interval")]
   pub guard_interval_ms: u32,

   #[serde(default = "default_volume_guard_interval")]
   pub volume_guard_interval_ms: u32,

   #[serde(default = "default_dedup_window")]
   pub dedup_window_ms: u32,

   #[serde(default = "default_ack_timeout")]
   pub ack_timeout_ms: u64,

   #[serde(default = "default_periodic_sync_interval")]
   pub periodic_sync_interval_ms: u64,

   #[serde(default = "default_poweroff_connecting_timeout")]
   pub poweroff_connecting_timeout_ms: u64,

   #[serde(default = "default_poweroff_handshake_timeout")]
   pub poweroff_handshake_timeout_ms: u64,

   #[serde(default = "default_poweroff_wait_timeout")]
   pub poweroff_wait_timeout_ms: u64,

   #[serde(default = "default_poweroff_settle")]
   pub poweroff_settle_ms: u64,

   #[serde(default = "default_poweroff_settle_rounds")]
   pub poweroff_settle_rounds: u32,

   #[serde(default = "default_adv_interval")]
   pub adv_interval_ms: u64,

   #[serde(default = "default_adv_tws_wait")]
   pub adv_tws_wait_ms: u64,

   #[serde(default = "default_volume")]
   pub default_music_volume: u8,

   #[serde(default = "default_volume")]
   pub default_call_volume: u8,
}

const fn default_max_connections() -> usize {
   8
}

const fn default_app_auto_switch() -> bool {
   true
}

const fn default_guard_interval() -> u32 {
   100
}

const fn default_volume_guard_interval() -> u32 {
   40
}

const fn default_dedup_window() -> u32 {
   500
}

const fn default_ack_timeout() -> u64 {
   1000
}

const fn default_periodic_sync_interval() -> u64 {
   2000
}

const fn default_poweroff_connecting_timeout() -> u64 {
   1000
}

const fn default_poweroff_handshake_timeout() -> u64 {
   1000
}

const fn default_poweroff_wait_timeout() -> u64 {
   3000
}

const fn default_poweroff_settle() -> u64 {
   50
}

const fn default_poweroff_settle_rounds() -> u32 {
   2
}

const fn default_adv_interval() -> u64 {
   2000
}

const fn default_adv_tws_wait() -> u64 {
   5000
}

const fn default_volume() -> u8 {
   12
}

impl Default for Config {
   fn default() -> Self {
      Self {
         tws_peer: None,
         adapter: None,
         max_connections: default_max_connections(),
         app_auto_switch: default_app_auto_switch(),
         guard_interval_ms: default_guard_interval(),
         volume_guard_interval_ms: default_volume_guard_interval(),
         dedup_window_ms: default_dedup_window(),
         ack_timeout_ms: default_ack_timeout(),
         periodic_sync_interval_ms: default_periodic_sync_interval(),
         poweroff_connecting_timeout_ms: default_poweroff_connecting_timeout(),
         poweroff_handshake_timeout_ms: default_poweroff_handshake_timeout(),
         poweroff_wait_timeout_ms: default_poweroff_wait_timeout(),
         poweroff_settle_ms: default_poweroff_settle(),
         poweroff_settle_rounds: default_poweroff_settle_rounds(),
         adv_interval_ms: default_adv_interval(),
         adv_tws_wait_ms: default_adv_tws_wait(),
         default_music_volume: default_volume(),
         default_call_volume: default_volume(),
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
      let config_dir = if let Ok(home) = env::var("TWSD_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(TwsError::ConfigDirNotFound);
      };

      Ok(config_dir.join("twsd").join("config.toml"))
   }

   /// Parsed address of the other earbud, ignoring malformed entries.
   pub fn tws_peer_address(&self) -> Option<Address> {
      let raw = self.tws_peer.as_deref()?;
      match Address::from_str(raw) {
         Ok(addr) => Some(addr),
         Err(e) => {
            warn!("Ignoring malformed tws_peer {raw:?}: {e}");
            None
         },
      }
   }

   pub fn ack_timeout(&self) -> Duration {
      Duration::from_millis(self.ack_timeout_ms)
   }

   pub fn periodic_sync_interval(&self) -> Duration {
      Duration::from_millis(self.periodic_sync_interval_ms)
   }

   pub fn adv_interval(&self) -> Duration {
      Duration::from_millis(self.adv_interval_ms)
   }

   pub fn adv_tws_wait(&self) -> Duration {
      Duration::from_millis(self.adv_tws_wait_ms)
   }

   pub fn poweroff_timeouts(&self) -> PowerOffTimeouts {
      PowerOffTimeouts {
         connecting: Duration::from_millis(self.poweroff_connecting_timeout_ms),
         handshake: Duration::from_millis(self.poweroff_handshake_timeout_ms),
         phones: Duration::from_millis(self.poweroff_wait_timeout_ms),
         settle: Duration::from_millis(self.poweroff_settle_ms),
         settle_rounds: self.poweroff_settle_rounds,
      }
   }
}
