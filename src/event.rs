//! Event notifications for the rest of the system.
//!
//! The node emits these whenever something a UI or application cares about
//! changes: connections, the audio foreground, streams, volume and the
//! power-down outcome.

use std::sync::Arc;

use bluer::Address;

use crate::{
   adv::AdvKind,
   audio::{
      connection::{ChannelState, Transport},
      context::AppContext,
   },
   poweroff::PowerOffResult,
   tws::TwsRole,
   volume::VolumeStream,
};

/// Events that can be emitted by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwsEvent {
   ConnectionAdded {
      addr: Address,
      transport: Transport,
   },
   ConnectionRemoved {
      addr: Address,
   },
   ActiveDeviceChanged {
      active: Option<Address>,
      interrupted: Option<Address>,
   },
   AppContextSwitched {
      from: AppContext,
      to: AppContext,
      /// The application for `to` has to be started.
      launch: bool,
   },
   StreamChanged {
      addr: Address,
      channel: u8,
      state: ChannelState,
   },
   VolumeChanged {
      addr: Address,
      stream: VolumeStream,
      volume: u8,
   },
   MediaStateChanged {
      addr: Address,
      playing: bool,
   },
   CallStateChanged {
      addr: Address,
      active: bool,
   },
   PowerOffResult(PowerOffResult),
   PairModeEntered,
   PairedListCleared,
   /// Application event executed at the shared tick.
   UserEvent {
      cmd: u8,
      payload: Vec<u8>,
   },
   AdvertisingChanged {
      from: AdvKind,
      to: AdvKind,
   },
   TwsLinkChanged {
      role: TwsRole,
      up: bool,
   },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: TwsEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
