//! Error types for the TWS coordination service.
//!
//! Stale handles and expired waits are mostly handled where they are
//! detected; the variants here are what crosses module boundaries.

use bluer::Address;
use thiserror::Error;

use crate::tws::message::WireError;

/// Main error type for the service.
#[derive(Error, Debug)]
pub enum TwsError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Storage error: {0}")]
   Storage(#[from] heed::Error),

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Malformed sync frame: {0}")]
   Malformed(#[from] WireError),

   #[error("Connection handle is stale")]
   StaleHandle,

   #[error("Connection registry is full")]
   RegistryFull,

   #[error("No room for another channel on this connection")]
   ChannelsExhausted,

   #[error("Peer {0} already has a connection")]
   DuplicateAddress(Address),

   #[error("Rejected by policy: {0}")]
   PolicyRejected(&'static str),

   #[error("Arbitration already in progress")]
   Reentrant,

   #[error("Inter-node link is down")]
   LinkDown,

   #[error("Payload too long: {len} bytes (max {max})")]
   PayloadTooLong { len: usize, max: usize },

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Node has been shut down")]
   NodeShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("Could not find local data directory")]
   DataDirNotFound,
}

/// Convenience type alias for Results with `TwsError`.
pub type Result<T> = std::result::Result<T, TwsError>;
