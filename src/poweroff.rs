//! Coordinated power-down.
//!
//! A polled state machine: every phase handler decides the next phase and
//! how long to wait before running it, and every wait has a timeout, so a
//! session always reaches `Finish` even when the peer or the phones never
//! answer. The coordinator itself never touches the radio; side effects go
//! through [`PowerOffEnv`].

use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

/// Delay used between phases that have nothing to wait for.
const STEP_DELAY: Duration = Duration::from_millis(1);

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum PowerOffPhase {
   #[strum(serialize = "none")]
   None = 0,
   #[strum(serialize = "start")]
   Start = 1,
   #[strum(serialize = "tws-handshake")]
   TwsHandshake = 2,
   #[strum(serialize = "disconnect-phones")]
   DisconnectPhones = 3,
   #[strum(serialize = "wait-phones-disconnected")]
   WaitPhonesDisconnected = 4,
   #[strum(serialize = "phones-disconnected")]
   PhonesDisconnected = 5,
   #[strum(serialize = "finish")]
   Finish = 6,
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum PowerOffResult {
   #[strum(serialize = "ok")]
   Ok = 0,
   #[strum(serialize = "timed_out")]
   TimedOut = 1,
   /// Peer-driven session completed.
   #[strum(serialize = "remote_ok")]
   RemoteOk = 2,
   #[strum(serialize = "remote_timed_out")]
   RemoteTimedOut = 3,
}

impl PowerOffResult {
   pub const fn is_timed_out(self) -> bool {
      matches!(self, Self::TimedOut | Self::RemoteTimedOut)
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerOffTimeouts {
   /// Wait for an in-flight connection attempt.
   pub connecting: Duration,
   /// Wait for the peer's acknowledgement.
   pub handshake: Duration,
   /// Wait for phones to drop after being told to disconnect.
   pub phones: Duration,
   pub settle: Duration,
   pub settle_rounds: u32,
}

impl PowerOffTimeouts {
   /// Upper bound on one session from `Start` to `Finish`.
   pub fn budget(&self) -> Duration {
      self.settle * self.settle_rounds + self.connecting + self.handshake + self.phones + STEP_DELAY * 8
   }
}

/// Side effects the state machine needs from the rest of the node.
pub trait PowerOffEnv {
   /// Stop being discoverable and connectable, no auto-reconnect.
   fn enter_power_off_mode(&mut self);
   fn is_connecting(&self) -> bool;
   fn connected_phones(&self) -> usize;
   fn disconnect_phones(&mut self);
   fn peer_linked(&self) -> bool;
   /// Tells the peer this node powers down; with `single` unset the peer
   /// goes down too. Returns whether the request left.
   fn request_peer_power_off(&mut self, single: bool) -> bool;
   fn release_tws_link(&mut self);
   fn reconnect_phones(&mut self);
   fn report(&mut self, session: u64, result: PowerOffResult);
}

/// Outcome of a power-off request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requested {
   /// A new session started; its result will be reported under this id.
   Started(u64),
   /// A session was already running; another one will follow it under
   /// this id.
   Merged(u64),
}

impl Requested {
   pub const fn session(self) -> u64 {
      match self {
         Self::Started(id) | Self::Merged(id) => id,
      }
   }
}

#[derive(Debug)]
struct Session {
   id: u64,
   phase: PowerOffPhase,
   local: bool,
   peer: bool,
   single: bool,
   pending_another: bool,
   pre_done: bool,
   settle_left: u32,
   handshake_sent: bool,
   peer_acked: bool,
   timed_out: bool,
   deadline: Instant,
}

impl Session {
   fn new(id: u64, local: bool, single: bool, now: Instant) -> Self {
      Self {
         id,
         phase: PowerOffPhase::Start,
         local,
         peer: !local,
         single,
         pending_another: false,
         pre_done: false,
         settle_left: 0,
         handshake_sent: false,
         peer_acked: false,
         timed_out: false,
         deadline: now,
      }
   }

   /// Whether this node itself shuts down at the end of the session.
   const fn drives_shutdown(&self) -> bool {
      self.local || (self.peer && !self.single)
   }
}

pub struct PowerDownCoordinator {
   session: Option<Session>,
   timeouts: PowerOffTimeouts,
   next_id: u64,
}

impl PowerDownCoordinator {
   pub const fn new(timeouts: PowerOffTimeouts) -> Self {
      Self {
         session: None,
         timeouts,
         next_id: 1,
      }
   }

   pub const fn is_active(&self) -> bool {
      self.session.is_some()
   }

   pub fn phase(&self) -> PowerOffPhase {
      self.session.as_ref().map_or(PowerOffPhase::None, |s| s.phase)
   }

   /// When the current phase handler is due.
   pub fn deadline(&self) -> Option<Instant> {
      self.session.as_ref().map(|s| s.deadline)
   }

   fn allocate_id(&mut self) -> u64 {
      let id = self.next_id;
      self.next_id += 1;
      id
   }

   /// Local power-off request.
   pub fn request(&mut self, single: bool, now: Instant) -> Requested {
      if let Some(session) = &mut self.session {
         session.pending_another = true;
         info!("Power-off already in {}, queueing another", session.phase);
         return Requested::Merged(session.id + 1);
      }
      let id = self.allocate_id();
      info!("Power-off requested (single: {single})");
      self.session = Some(Session::new(id, true, single, now));
      Requested::Started(id)
   }

   /// Power-off request received from the peer.
   pub fn peer_request(&mut self, single: bool, now: Instant) -> Requested {
      if let Some(session) = &mut self.session {
         // Both sides asked at once; treat the request as the handshake.
         session.peer = true;
         if session.phase == PowerOffPhase::TwsHandshake && session.handshake_sent {
            session.peer_acked = true;
            session.deadline = now + STEP_DELAY;
         }
         return Requested::Merged(session.id);
      }
      let id = self.allocate_id();
      info!("Power-off requested by peer (single: {single})");
      self.session = Some(Session::new(id, false, single, now));
      Requested::Started(id)
   }

   pub fn peer_ack(&mut self, now: Instant) {
      let Some(session) = &mut self.session else {
         return;
      };
      if session.phase == PowerOffPhase::TwsHandshake && session.handshake_sent {
         debug!("Peer acknowledged power-off");
         session.peer_acked = true;
         session.deadline = now + STEP_DELAY;
      }
   }

   /// A phone dropped; `remaining` phones are still connected.
   pub fn phone_disconnected(&mut self, remaining: usize, now: Instant) {
      let Some(session) = &mut self.session else {
         return;
      };
      if session.phase == PowerOffPhase::WaitPhonesDisconnected && remaining == 0 {
         session.phase = PowerOffPhase::PhonesDisconnected;
         session.deadline = now + STEP_DELAY;
      }
   }

   /// Runs the handler for the current phase. Returns the next deadline,
   /// or `None` once the session is over.
   pub fn step(&mut self, env: &mut dyn PowerOffEnv, now: Instant) -> Option<Instant> {
      let timeouts = self.timeouts;
      let session = self.session.as_mut()?;
      let from = session.phase;

      let (next, delay) = match session.phase {
         PowerOffPhase::None => (PowerOffPhase::Start, STEP_DELAY),
         PowerOffPhase::Start => Self::start(session, env, &timeouts),
         PowerOffPhase::TwsHandshake => Self::handshake(session, env, &timeouts),
         PowerOffPhase::DisconnectPhones => {
            if session.drives_shutdown() && env.connected_phones() > 0 {
               env.disconnect_phones();
               (PowerOffPhase::WaitPhonesDisconnected, timeouts.phones)
            } else {
               (PowerOffPhase::Finish, STEP_DELAY)
            }
         },
         PowerOffPhase::WaitPhonesDisconnected => {
            warn!("Phones still connected after {:?}", timeouts.phones);
            session.timed_out = true;
            (PowerOffPhase::Finish, STEP_DELAY)
         },
         PowerOffPhase::PhonesDisconnected => (PowerOffPhase::Finish, STEP_DELAY),
         PowerOffPhase::Finish => return self.finish(env, now),
      };

      if next != from {
         info!("Power-off: {from} -> {next}");
      }
      session.phase = next;
      session.deadline = now + delay;
      Some(session.deadline)
   }

   fn start(
      session: &mut Session,
      env: &mut dyn PowerOffEnv,
      timeouts: &PowerOffTimeouts,
   ) -> (PowerOffPhase, Duration) {
      if !session.drives_shutdown() {
         return (PowerOffPhase::TwsHandshake, STEP_DELAY);
      }
      if !session.pre_done {
         env.enter_power_off_mode();
         session.pre_done = true;
         session.settle_left = timeouts.settle_rounds;
      }
      if env.is_connecting() {
         debug!("Connection attempt in flight, waiting it out");
         session.settle_left = 0;
         return (PowerOffPhase::TwsHandshake, timeouts.connecting);
      }
      if session.settle_left > 0 {
         session.settle_left -= 1;
         return (PowerOffPhase::Start, timeouts.settle);
      }
      (PowerOffPhase::TwsHandshake, STEP_DELAY)
   }

   fn handshake(
      session: &mut Session,
      env: &mut dyn PowerOffEnv,
      timeouts: &PowerOffTimeouts,
   ) -> (PowerOffPhase, Duration) {
      if !env.peer_linked() {
         return (PowerOffPhase::DisconnectPhones, STEP_DELAY);
      }
      if session.peer {
         env.release_tws_link();
         return (PowerOffPhase::DisconnectPhones, STEP_DELAY);
      }
      if session.single {
         // Tell the peer, but do not wait for it.
         env.request_peer_power_off(true);
         env.release_tws_link();
         return (PowerOffPhase::DisconnectPhones, STEP_DELAY);
      }
      if !session.handshake_sent {
         if env.request_peer_power_off(false) {
            session.handshake_sent = true;
            return (PowerOffPhase::TwsHandshake, timeouts.handshake);
         }
         return (PowerOffPhase::DisconnectPhones, STEP_DELAY);
      }
      if !session.peer_acked {
         warn!("Peer did not acknowledge power-off within {:?}", timeouts.handshake);
         session.timed_out = true;
      }
      env.release_tws_link();
      (PowerOffPhase::DisconnectPhones, STEP_DELAY)
   }

   fn finish(&mut self, env: &mut dyn PowerOffEnv, now: Instant) -> Option<Instant> {
      let session = self.session.take()?;
      let result = if session.local {
         Some(if session.timed_out {
            PowerOffResult::TimedOut
         } else {
            PowerOffResult::Ok
         })
      } else if !session.single {
         Some(if session.timed_out {
            PowerOffResult::RemoteTimedOut
         } else {
            PowerOffResult::RemoteOk
         })
      } else {
         if env.connected_phones() == 0 {
            info!("Peer powered off alone, reconnecting phones");
            env.reconnect_phones();
         }
         None
      };

      if let Some(result) = result {
         info!("Power-off finished: {result}");
         env.report(session.id, result);
      }

      if session.pending_another {
         let id = self.allocate_id();
         debug_assert_eq!(id, session.id + 1);
         info!("Restarting power-off for queued request");
         let mut next = Session::new(id, true, true, now);
         next.deadline = now + STEP_DELAY;
         self.session = Some(next);
         return Some(now + STEP_DELAY);
      }
      None
   }
}
