//! Audio connections and foreground arbitration.

pub mod arbitration;
pub mod connection;
pub mod context;
pub mod registry;
pub mod service;

use bluer::Address;

use crate::{
   adv::{AdvKind, BeaconState},
   audio::connection::{ChannelEvent, Handle, LinkRole, Transport},
   volume::VolumeStream,
};

/// Reports delivered by the audio service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioEvent {
   Connected {
      handle: Handle,
      addr: Address,
      transport: Transport,
      role: LinkRole,
      is_tws: bool,
   },
   Disconnected {
      handle: Handle,
   },
   Channel {
      handle: Handle,
      event: ChannelEvent,
   },
   Media {
      handle: Handle,
      playing: bool,
   },
   Call {
      handle: Handle,
      active: bool,
   },
   Volume {
      handle: Handle,
      stream: VolumeStream,
      volume: u8,
      /// The phone changed it, as opposed to a button on the earbud.
      from_phone: bool,
   },
   /// A connection attempt started or ended.
   Connecting(bool),
   Advertising(AdvKind, BeaconState),
}
