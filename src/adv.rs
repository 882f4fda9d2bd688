//! Discovery beacon arbitration.
//!
//! Two beacon kinds compete for the advertiser. The audio service reports
//! which ones it wants on; this module decides which one is actually
//! broadcast and when to rotate.

use log::{debug, info};
use tokio::time::Instant;

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum AdvKind {
   #[default]
   #[strum(serialize = "none")]
   None = 0,
   /// Plain BLE beacon (fast pair style discovery).
   #[strum(serialize = "ble")]
   Ble = 1,
   #[strum(serialize = "le_audio")]
   LeAudio = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BeaconState {
   pub enabled: bool,
   /// Payload changed; the beacon must be restarted to pick it up.
   pub update_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvSwitch {
   pub from: AdvKind,
   pub to: AdvKind,
}

pub struct AdvArbiter {
   current: AdvKind,
   ble: BeaconState,
   le_audio: BeaconState,
   /// Hold evaluation until the pair link is up or this passes.
   wait_for_tws: Option<Instant>,
}

impl AdvArbiter {
   pub const fn new(wait_for_tws: Option<Instant>) -> Self {
      Self {
         current: AdvKind::None,
         ble: BeaconState {
            enabled: false,
            update_pending: false,
         },
         le_audio: BeaconState {
            enabled: false,
            update_pending: false,
         },
         wait_for_tws,
      }
   }

   pub fn report(&mut self, kind: AdvKind, state: BeaconState) {
      match kind {
         AdvKind::Ble => self.ble = state,
         AdvKind::LeAudio => self.le_audio = state,
         AdvKind::None => {},
      }
   }

   const fn state(&self, kind: AdvKind) -> BeaconState {
      match kind {
         AdvKind::Ble => self.ble,
         AdvKind::LeAudio => self.le_audio,
         AdvKind::None => BeaconState {
            enabled: false,
            update_pending: false,
         },
      }
   }

   const fn clear_update(&mut self, kind: AdvKind) {
      match kind {
         AdvKind::Ble => self.ble.update_pending = false,
         AdvKind::LeAudio => self.le_audio.update_pending = false,
         AdvKind::None => {},
      }
   }

   /// Picks the beacon to broadcast. Returns a switch when the advertiser
   /// has to be reprogrammed.
   pub fn evaluate(&mut self, now: Instant, tws_linked: bool, powering_off: bool) -> Option<AdvSwitch> {
      if let Some(until) = self.wait_for_tws {
         if !tws_linked && now < until {
            debug!("Holding advertising until the pair link is up");
            return None;
         }
         self.wait_for_tws = None;
      }

      let ble = self.ble.enabled && !powering_off;
      let le_audio = self.le_audio.enabled && !powering_off;

      let next = match (self.current, ble, le_audio) {
         (_, false, false) => AdvKind::None,
         (AdvKind::None, _, true) => AdvKind::LeAudio,
         (AdvKind::None, true, false) => AdvKind::Ble,
         // Alternate while both are wanted.
         (AdvKind::Ble, _, true) => AdvKind::LeAudio,
         (AdvKind::LeAudio, true, _) => AdvKind::Ble,
         (_, true, false) => AdvKind::Ble,
         (_, false, true) => AdvKind::LeAudio,
      };

      let from = self.current;
      if next == from && !self.state(next).update_pending {
         return None;
      }
      self.clear_update(next);
      self.current = next;
      info!("Advertising: {from} -> {next}");
      Some(AdvSwitch { from, to: next })
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use super::*;

   const ON: BeaconState = BeaconState {
      enabled: true,
      update_pending: false,
   };

   #[test]
   fn test_nothing_enabled_stays_off() {
      let mut adv = AdvArbiter::new(None);
      assert_eq!(adv.evaluate(Instant::now(), false, false), None);
      assert_eq!(adv.evaluate(Instant::now(), true, false), None);
   }

   #[test]
   fn test_prefers_le_audio_then_alternates() {
      let mut adv = AdvArbiter::new(None);
      let now = Instant::now();
      adv.report(AdvKind::Ble, ON);
      adv.report(AdvKind::LeAudio, ON);

      let first = adv.evaluate(now, true, false).unwrap();
      assert_eq!(first.to, AdvKind::LeAudio);
      assert_eq!(adv.evaluate(now, true, false).unwrap().to, AdvKind::Ble);
      assert_eq!(adv.evaluate(now, true, false).unwrap().to, AdvKind::LeAudio);
   }

   #[test]
   fn test_update_pending_restarts_same_kind() {
      let mut adv = AdvArbiter::new(None);
      let now = Instant::now();
      adv.report(AdvKind::Ble, ON);
      adv.evaluate(now, true, false);
      assert_eq!(adv.evaluate(now, true, false), None);

      adv.report(
         AdvKind::Ble,
         BeaconState {
            enabled: true,
            update_pending: true,
         },
      );
      assert_eq!(
         adv.evaluate(now, true, false),
         Some(AdvSwitch {
            from: AdvKind::Ble,
            to: AdvKind::Ble
         })
      );
      assert_eq!(adv.evaluate(now, true, false), None);
   }

   #[test]
   fn test_power_off_disables_all() {
      let mut adv = AdvArbiter::new(None);
      let now = Instant::now();
      adv.report(AdvKind::LeAudio, ON);
      adv.evaluate(now, true, false);
      assert_eq!(
         adv.evaluate(now, true, true),
         Some(AdvSwitch {
            from: AdvKind::LeAudio,
            to: AdvKind::None
         })
      );
   }

   #[test]
   fn test_waits_for_pair_link() {
      let now = Instant::now();
      let mut adv = AdvArbiter::new(Some(now + Duration::from_secs(5)));
      adv.report(AdvKind::Ble, ON);

      assert_eq!(adv.evaluate(now, false, false), None);
      assert_eq!(
         adv.evaluate(now + Duration::from_secs(5), false, false).map(|s| s.to),
         Some(AdvKind::Ble)
      );
   }

   #[test]
   fn test_link_up_ends_wait_early() {
      let now = Instant::now();
      let mut adv = AdvArbiter::new(Some(now + Duration::from_secs(5)));
      adv.report(AdvKind::LeAudio, ON);
      assert!(adv.evaluate(now, true, false).is_some());
   }
}
