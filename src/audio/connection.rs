//! Connection and channel records tracked by the registry.
//!
//! A connection is one link to a peer (phone, dongle or the other earbud).
//! Each connection owns a small set of audio channels whose lifecycle and
//! context bits drive the connection's arbitration priority.

use std::{cmp::Ordering, fmt};

use bluer::Address;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Result, TwsError};

/// Link-layer connection handle assigned by the audio service.
pub type Handle = u16;

/// Maximum number of audio channels per connection.
pub const MAX_CHANNELS: usize = 4;

/// Which radio transport carries the connection.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum Transport {
   #[strum(serialize = "classic", serialize = "br")]
   Classic = 0,
   #[strum(serialize = "le")]
   LowEnergy = 1,
}

/// Local link-layer role on a connection.
///
/// Phones are the central of the link, so an eligible audio connection is
/// one where this node is the peripheral (`Slave`).
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum LinkRole {
   #[strum(serialize = "master")]
   Master = 0,
   #[strum(serialize = "slave")]
   Slave = 1,
}

/// Arbitration priority of a connection.
///
/// The raw value is a bitmask; ordering follows the raw value, so an
/// unclassified call ranks above media but below a real call.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Priority(u8);

impl Priority {
   pub const NONE: Self = Self(0);
   pub const MEDIA_PAUSED: Self = Self(1 << 0);
   pub const MEDIA_ACTIVE: Self = Self(1 << 1);
   /// Call traffic on a channel whose context was never classified.
   pub const CALL_UNCLASSIFIED: Self = Self(1 << 2);
   pub const CALL: Self = Self(1 << 3);

   pub const fn bits(self) -> u8 {
      self.0
   }

   /// Carries the `call` bit. An unclassified call does not.
   pub const fn has_call(self) -> bool {
      self.0 & Self::CALL.0 != 0
   }

   pub const fn is_none(self) -> bool {
      self.0 == 0
   }

   pub const fn to_str(self) -> &'static str {
      match self.0 {
         0 => "none",
         1 => "media_paused",
         2 => "media_active",
         4 => "call_unclassified",
         8 => "call",
         _ => "mixed",
      }
   }
}

impl PartialOrd for Priority {
   fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
      Some(self.cmp(other))
   }
}

impl Ord for Priority {
   fn cmp(&self, other: &Self) -> Ordering {
      self.0.cmp(&other.0)
   }
}

impl fmt::Debug for Priority {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "Priority({})", self.to_str())
   }
}

impl fmt::Display for Priority {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.to_str())
   }
}

/// Audio context bitset carried by a channel.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AudioContexts(u8);

impl AudioContexts {
   pub const EMPTY: Self = Self(0);
   pub const UNSPECIFIED: Self = Self(1 << 0);
   pub const CALL: Self = Self(1 << 1);
   pub const MEDIA: Self = Self(1 << 2);

   pub const fn from_bits(bits: u8) -> Self {
      Self(bits & (Self::UNSPECIFIED.0 | Self::CALL.0 | Self::MEDIA.0))
   }

   pub const fn bits(self) -> u8 {
      self.0
   }

   pub const fn contains(self, other: Self) -> bool {
      self.0 & other.0 == other.0 && other.0 != 0
   }

   pub const fn is_empty(self) -> bool {
      self.0 == 0
   }
}

/// Audio flow direction, seen from this node.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum Direction {
   /// Audio rendered locally.
   #[strum(serialize = "sink")]
   Sink = 0,
   /// Audio captured locally, e.g. the microphone uplink.
   #[strum(serialize = "source")]
   Source = 1,
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum ChannelState {
   #[strum(serialize = "configured")]
   Configured = 0,
   #[strum(serialize = "enabled")]
   Enabled = 1,
   #[strum(serialize = "streaming")]
   Streaming = 2,
   #[strum(serialize = "stopped")]
   Stopped = 3,
   #[strum(serialize = "disabled")]
   Disabled = 4,
}

impl ChannelState {
   /// Whether the channel's contexts count toward the connection priority.
   pub const fn is_live(self) -> bool {
      matches!(self, Self::Enabled | Self::Streaming)
   }
}

/// Codec and timing parameters negotiated for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
   pub codec: u8,
   pub sample_rate: u32,
   pub interval_us: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
   pub id: u8,
   pub direction: Direction,
   pub config: ChannelConfig,
   pub contexts: AudioContexts,
   pub state: ChannelState,
}

/// Lifecycle notifications for one audio channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
   Configure {
      id: u8,
      direction: Direction,
      config: ChannelConfig,
   },
   Enable {
      id: u8,
      contexts: AudioContexts,
   },
   Update {
      id: u8,
      contexts: AudioContexts,
   },
   Start {
      id: u8,
   },
   Stop {
      id: u8,
   },
   Disable {
      id: u8,
   },
   Release {
      id: u8,
   },
}

impl ChannelEvent {
   pub const fn channel_id(&self) -> u8 {
      match *self {
         Self::Configure { id, .. }
         | Self::Enable { id, .. }
         | Self::Update { id, .. }
         | Self::Start { id }
         | Self::Stop { id }
         | Self::Disable { id }
         | Self::Release { id } => id,
      }
   }
}

/// One link to a peer device.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
   pub handle: Handle,
   pub addr: Address,
   pub transport: Transport,
   pub role: LinkRole,
   /// Link to the other earbud of the pair; never eligible for arbitration.
   pub is_tws: bool,
   pub priority: Priority,
   pub media_playing: bool,
   /// Call state reported by the telephony profile before any audio
   /// channel exists, e.g. a ringing call.
   pub call_active: bool,
   pub music_volume: u8,
   pub call_volume: u8,
   pub channels: SmallVec<[Channel; MAX_CHANNELS]>,
}

impl Connection {
   pub fn new(
      handle: Handle,
      addr: Address,
      transport: Transport,
      role: LinkRole,
      is_tws: bool,
   ) -> Self {
      Self {
         handle,
         addr,
         transport,
         role,
         is_tws,
         priority: Priority::NONE,
         media_playing: false,
         call_active: false,
         music_volume: 0,
         call_volume: 0,
         channels: SmallVec::new(),
      }
   }

   /// Only phone-side links where this node is the peripheral compete for
   /// the foreground.
   pub fn is_eligible(&self) -> bool {
      !self.is_tws && self.role == LinkRole::Slave
   }

   #[cfg(test)]
   pub fn channel(&self, id: u8) -> Option<&Channel> {
      self.channels.iter().find(|c| c.id == id)
   }

   /// Applies a channel lifecycle event.
   ///
   /// Events for a channel that was never configured (or already released)
   /// return `StaleHandle`.
   pub fn apply_channel_event(&mut self, event: ChannelEvent) -> Result<ChannelState> {
      let id = event.channel_id();
      if let ChannelEvent::Configure {
         direction, config, ..
      } = event
      {
         if let Some(chan) = self.channels.iter_mut().find(|c| c.id == id) {
            chan.direction = direction;
            chan.config = config;
            chan.state = ChannelState::Configured;
            return Ok(chan.state);
         }
         if self.channels.len() >= MAX_CHANNELS {
            return Err(TwsError::ChannelsExhausted);
         }
         self.channels.push(Channel {
            id,
            direction,
            config,
            contexts: AudioContexts::EMPTY,
            state: ChannelState::Configured,
         });
         return Ok(ChannelState::Configured);
      }

      let Some(pos) = self.channels.iter().position(|c| c.id == id) else {
         return Err(TwsError::StaleHandle);
      };

      if matches!(event, ChannelEvent::Release { .. }) {
         self.channels.remove(pos);
         return Ok(ChannelState::Disabled);
      }

      let chan = &mut self.channels[pos];
      match event {
         ChannelEvent::Enable { contexts, .. } => {
            chan.contexts = contexts;
            chan.state = ChannelState::Enabled;
         },
         ChannelEvent::Update { contexts, .. } => chan.contexts = contexts,
         ChannelEvent::Start { .. } => chan.state = ChannelState::Streaming,
         ChannelEvent::Stop { .. } => chan.state = ChannelState::Stopped,
         ChannelEvent::Disable { .. } => chan.state = ChannelState::Disabled,
         ChannelEvent::Configure { .. } | ChannelEvent::Release { .. } => unreachable!(),
      }
      Ok(chan.state)
   }

   /// Derives the priority from call state and live channel contexts.
   pub fn derive_priority(&self) -> Priority {
      if self.call_active {
         return Priority::CALL;
      }

      let live = || self.channels.iter().filter(|c| c.state.is_live());

      if live().any(|c| c.contexts.contains(AudioContexts::CALL)) {
         return Priority::CALL;
      }
      if live().any(|c| c.direction == Direction::Source && c.contexts == AudioContexts::UNSPECIFIED)
      {
         return Priority::CALL_UNCLASSIFIED;
      }
      if live().any(|c| !c.contexts.is_empty()) {
         return if self.media_playing {
            Priority::MEDIA_ACTIVE
         } else {
            Priority::MEDIA_PAUSED
         };
      }
      Priority::NONE
   }

   pub fn to_json(&self) -> serde_json::Value {
      serde_json::json!({
         "address": self.addr.to_string(),
         "handle": self.handle,
         "transport": <&str>::from(self.transport),
         "role": <&str>::from(self.role),
         "tws": self.is_tws,
         "priority": self.priority.to_str(),
         "media_playing": self.media_playing,
         "call_active": self.call_active,
         "music_volume": self.music_volume,
         "call_volume": self.call_volume,
         "channels": self.channels.iter().map(|c| serde_json::json!({
            "id": c.id,
            "direction": <&str>::from(c.direction),
            "state": <&str>::from(c.state),
            "contexts": c.contexts.bits(),
         })).collect::<Vec<_>>(),
      })
   }
}
