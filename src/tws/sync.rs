//! Cross-node sync protocol.
//!
//! Two services on top of the link: plain propagation, where the receiver
//! applies the message on arrival, and clock-scheduled execution, where
//! both nodes run the same message once their clocks reach a shared tick.
//! A small reply channel covers the commands that must not diverge.

use std::{collections::HashMap, sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::{
   error::{Result, TwsError},
   tws::{
      clock::{ActionKey, DedupWindow, RadioClock, Scheduler, Tick, tick_reached},
      link::LinkSender,
      message::{ManagerCommand, Reply, ReplyCode, SyncMessage},
   },
};

/// Result of a command that waits for the peer's acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum SyncOutcome {
   #[strum(serialize = "acked")]
   Acked,
   #[strum(serialize = "rejected")]
   Rejected,
   #[strum(serialize = "timed_out")]
   TimedOut,
   /// No peer linked; executed on this node only.
   #[strum(serialize = "local")]
   Local,
}

impl From<ReplyCode> for SyncOutcome {
   fn from(code: ReplyCode) -> Self {
      match code {
         ReplyCode::Ack => Self::Acked,
         ReplyCode::Nack => Self::Rejected,
      }
   }
}

/// What to do with a frame that just arrived.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
   /// Execute now.
   Apply(SyncMessage),
   /// Parked until its tick; comes back out of [`SyncProtocol::drain_due`].
   Scheduled(Tick),
   /// Retransmission of an action that is already scheduled or done.
   Duplicate,
   /// Resolved a pending acknowledgement.
   Replied,
}

/// Pending acknowledgement for one request.
pub struct AckWaiter {
   pub seq: u8,
   pub rx: oneshot::Receiver<ReplyCode>,
}

pub struct SyncProtocol {
   clock: Arc<dyn RadioClock>,
   link: Option<LinkSender>,
   scheduler: Scheduler<SyncMessage>,
   dedup: DedupWindow,
   /// One outstanding request per command, tagged with its sequence byte.
   pending_replies: HashMap<ManagerCommand, (u8, oneshot::Sender<ReplyCode>)>,
   next_seq: u8,
   guard_interval: u32,
}

impl SyncProtocol {
   pub fn new(clock: Arc<dyn RadioClock>, guard_interval_ms: u32, dedup_window_ms: u32) -> Self {
      Self {
         clock,
         link: None,
         scheduler: Scheduler::new(),
         dedup: DedupWindow::new(dedup_window_ms),
         pending_replies: HashMap::new(),
         next_seq: 0,
         guard_interval: guard_interval_ms,
      }
   }

   pub fn attach(&mut self, link: LinkSender) {
      self.link = Some(link);
   }

   /// Drops the link. Anyone waiting for a reply sees the wait fail.
   pub fn detach(&mut self) {
      self.link = None;
      self.pending_replies.clear();
   }

   pub fn is_linked(&self) -> bool {
      self.link.as_ref().is_some_and(LinkSender::is_connected)
   }

   pub fn now(&self) -> Tick {
      self.clock.now()
   }

   fn send(&self, msg: &SyncMessage) -> bool {
      let frame = match msg.encode() {
         Ok(frame) => frame,
         Err(e) => {
            warn!("Cannot encode {} command 0x{:02x}: {e}", msg.subsystem, msg.command);
            return false;
         },
      };
      let Some(link) = &self.link else {
         debug!("No peer link, dropping {} command 0x{:02x}", msg.subsystem, msg.command);
         return false;
      };
      match link.send(frame) {
         Ok(()) => true,
         Err(e) => {
            debug!("Dropping {} command 0x{:02x}: {e}", msg.subsystem, msg.command);
            false
         },
      }
   }

   /// Sends a message for immediate application on the peer. Returns
   /// whether it left this node.
   pub fn propagate(&mut self, msg: SyncMessage) -> bool {
      self.send(&msg.at(0))
   }

   /// Schedules `msg` on both nodes at `now + guard`. The local copy is
   /// scheduled even when the peer is unreachable.
   pub fn schedule(&mut self, msg: SyncMessage, guard_ms: Option<u32>) -> Tick {
      let guard = guard_ms.unwrap_or(self.guard_interval);
      let mut target = self.clock.now().wrapping_add(guard);
      if target == 0 {
         target = 1;
      }
      let msg = msg.at(target);
      info!(
         "Scheduling {} command 0x{:02x} at tick {target}",
         msg.subsystem, msg.command
      );
      self.send(&msg);
      self.scheduler.schedule(target, msg);
      target
   }

   /// Handles one frame from the peer.
   pub fn receive(&mut self, frame: &[u8]) -> Result<Inbound> {
      let msg = SyncMessage::decode(frame)?;

      if msg.manager_command() == Some(ManagerCommand::Reply) {
         let reply = Reply::parse(&msg.payload)?;
         let matches = self
            .pending_replies
            .get(&reply.command)
            .is_some_and(|(seq, _)| *seq == reply.seq);
         if !matches {
            debug!("Stale or unsolicited reply for {} #{}", reply.command, reply.seq);
            return Ok(Inbound::Duplicate);
         }
         if let Some((_, waiter)) = self.pending_replies.remove(&reply.command) {
            let _ = waiter.send(reply.code);
         }
         return Ok(Inbound::Replied);
      }

      if !msg.is_scheduled() {
         return Ok(Inbound::Apply(msg));
      }

      let now = self.clock.now();
      let key = ActionKey {
         subsystem: msg.subsystem as u8,
         command: msg.command,
         target: msg.target,
      };
      if !self.dedup.admit(key, now) {
         debug!("Duplicate scheduled command 0x{:02x} @ {}", msg.command, msg.target);
         return Ok(Inbound::Duplicate);
      }
      if tick_reached(now, msg.target) {
         debug!(
            "Tick {} already passed (now {now}), running command 0x{:02x} immediately",
            msg.target, msg.command
         );
         return Ok(Inbound::Apply(msg));
      }

      let target = msg.target;
      self.scheduler.schedule(target, msg);
      Ok(Inbound::Scheduled(target))
   }

   /// Messages whose tick has been reached.
   pub fn drain_due(&mut self) -> Vec<SyncMessage> {
      self.scheduler.drain_due(self.clock.now())
   }

   pub fn next_wake(&self) -> Option<Duration> {
      self.scheduler.next_delay(self.clock.now())
   }

   /// Sends `command` and registers a waiter for the peer's reply. A
   /// newer request for the same command replaces the older waiter.
   pub fn request_ack(&mut self, command: ManagerCommand) -> Result<AckWaiter> {
      if !self.is_linked() {
         return Err(TwsError::LinkDown);
      }
      let seq = self.next_seq;
      self.next_seq = seq.wrapping_add(1);
      let (tx, rx) = oneshot::channel();
      self.pending_replies.insert(command, (seq, tx));
      if !self.propagate(SyncMessage::manager(command, &[seq])) {
         self.pending_replies.remove(&command);
         return Err(TwsError::LinkDown);
      }
      Ok(AckWaiter { seq, rx })
   }

   /// Drops the waiter for request `seq` if it is still outstanding, so a
   /// late reply to it is ignored.
   pub fn forget_ack(&mut self, command: ManagerCommand, seq: u8) {
      if self
         .pending_replies
         .get(&command)
         .is_some_and(|(pending, _)| *pending == seq)
      {
         self.pending_replies.remove(&command);
      }
   }

   pub fn reply(&mut self, command: ManagerCommand, seq: u8, code: ReplyCode) -> bool {
      let reply = Reply { code, command, seq };
      self.propagate(SyncMessage::manager(
         ManagerCommand::Reply,
         &reply.to_payload(),
      ))
   }

   /// Commands parked until their tick.
   pub fn pending(&self) -> usize {
      self.scheduler.pending()
   }
}
