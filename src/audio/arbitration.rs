//! Active-device arbitration.
//!
//! Decides which phone connection owns the audio foreground, remembers the
//! connection a call pushed aside so it can be resumed, and walks the
//! application context through the transition table. All state sits behind
//! one short-lived lock; callers read snapshots and never hold references
//! into the registry across an await point.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use bluer::Address;
use log::{debug, info};
use parking_lot::Mutex;

use crate::{
   audio::{
      connection::{Connection, Handle, LinkRole, Priority, Transport},
      context::{AppContext, Transition},
      registry::{ConnectionId, Registry},
   },
   error::{Result, TwsError},
   tws::TwsRole,
};

/// Arbitration state shared between the node actor and readers.
pub struct AudioState {
   pub registry: Registry,
   active: Option<ConnectionId>,
   interrupted: Option<ConnectionId>,
   local_context: AppContext,
   remote_context: AppContext,
   forced_context: AppContext,
   /// Pointers received from the master before the matching connection was
   /// known locally; bound as soon as the connection shows up.
   stashed_active: Option<Address>,
   stashed_interrupted: Option<Address>,
}

impl AudioState {
   pub fn new(capacity: usize) -> Self {
      Self {
         registry: Registry::new(capacity),
         active: None,
         interrupted: None,
         local_context: AppContext::Idle,
         remote_context: AppContext::Idle,
         forced_context: AppContext::Idle,
         stashed_active: None,
         stashed_interrupted: None,
      }
   }

   pub fn active(&self) -> Option<ConnectionId> {
      self.active.filter(|id| self.registry.contains(*id))
   }

   pub fn interrupted(&self) -> Option<ConnectionId> {
      self.interrupted.filter(|id| self.registry.contains(*id))
   }

   pub fn active_addr(&self) -> Option<Address> {
      self.active().and_then(|id| self.registry.get(id)).map(|c| c.addr)
   }

   pub fn interrupted_addr(&self) -> Option<Address> {
      self
         .interrupted()
         .and_then(|id| self.registry.get(id))
         .map(|c| c.addr)
   }

   pub const fn app_context(&self) -> AppContext {
      self.local_context
   }

   pub const fn remote_context(&self) -> AppContext {
      self.remote_context
   }

   pub const fn forced_context(&self) -> AppContext {
      self.forced_context
   }

   fn pointers(&self) -> (Option<Address>, Option<Address>) {
      (self.active_addr(), self.interrupted_addr())
   }
}

#[derive(Debug, Clone, Copy)]
pub struct ArbitrationPolicy {
   /// Allow media devices to take the foreground without user action.
   pub app_auto_switch: bool,
}

/// Node-level facts that gate arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeView {
   pub tws_role: TwsRole,
   pub powering_off: bool,
}

impl NodeView {
   #[cfg(test)]
   pub const fn standalone() -> Self {
      Self {
         tws_role: TwsRole::None,
         powering_off: false,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSwitch {
   pub from: AppContext,
   pub to: AppContext,
   /// The application serving `to` has to be started.
   pub launch: bool,
}

/// Result of one arbitration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
   pub active: Option<Address>,
   pub interrupted: Option<Address>,
   pub pointers_changed: bool,
   pub switch: Option<ContextSwitch>,
}

impl Outcome {
   pub const fn is_noop(&self) -> bool {
      !self.pointers_changed && self.switch.is_none()
   }
}

/// Pointers and contexts pushed from the master to the slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteActive {
   pub context: AppContext,
   pub forced: AppContext,
   pub active: Option<Address>,
   pub interrupted: Option<Address>,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
   fn drop(&mut self) {
      self.0.store(false, Ordering::Release);
   }
}

pub struct Arbiter {
   state: Arc<Mutex<AudioState>>,
   policy: ArbitrationPolicy,
   running: AtomicBool,
   retry: AtomicBool,
}

impl Arbiter {
   pub fn new(state: Arc<Mutex<AudioState>>, policy: ArbitrationPolicy) -> Self {
      Self {
         state,
         policy,
         running: AtomicBool::new(false),
         retry: AtomicBool::new(false),
      }
   }

   pub const fn state(&self) -> &Arc<Mutex<AudioState>> {
      &self.state
   }

   fn enter(&self) -> Result<RunGuard<'_>> {
      if self.running.swap(true, Ordering::AcqRel) {
         self.retry.store(true, Ordering::Release);
         return Err(TwsError::Reentrant);
      }
      Ok(RunGuard(&self.running))
   }

   /// Whether a pass was refused while another one was running.
   pub fn take_retry(&self) -> bool {
      self.retry.swap(false, Ordering::AcqRel)
   }

   pub fn snapshot(&self) -> RemoteActive {
      let st = self.state.lock();
      RemoteActive {
         context: st.local_context,
         forced: st.forced_context,
         active: st.active_addr(),
         interrupted: st.interrupted_addr(),
      }
   }

   /// Registers a connection and binds any pointer stashed for its address.
   pub fn add_connection(
      &self,
      handle: Handle,
      addr: Address,
      transport: Transport,
      role: LinkRole,
      is_tws: bool,
      view: NodeView,
   ) -> Result<(ConnectionId, Outcome)> {
      let _guard = self.enter()?;
      let mut st = self.state.lock();
      let before = st.pointers();
      let id = st.registry.add(handle, addr, transport, role, is_tws)?;

      let mut bound = false;
      if st.stashed_active == Some(addr) {
         st.stashed_active = None;
         st.active = Some(id);
         bound = true;
      }
      if st.stashed_interrupted == Some(addr) {
         st.stashed_interrupted = None;
         st.interrupted = Some(id);
         bound = true;
      }
      let switch = if bound {
         debug!("Bound stashed pointer to {addr}");
         self.switch_context(&mut st, view)
      } else {
         None
      };
      Ok((id, Self::finish(&st, before, switch)))
   }

   /// Removes a connection, re-arbitrating if it held the foreground or was
   /// waiting to resume. Removing an unknown id is a silent no-op.
   pub fn remove_connection(
      &self,
      id: ConnectionId,
      view: NodeView,
   ) -> Result<Option<(Connection, Outcome)>> {
      let _guard = self.enter()?;
      let mut st = self.state.lock();
      let before = st.pointers();
      let was_active = st.active == Some(id);
      let was_interrupted = st.interrupted == Some(id);

      let Some(conn) = st.registry.remove(id) else {
         return Ok(None);
      };
      if was_interrupted {
         st.interrupted = None;
      }
      if was_active {
         st.active = None;
      }

      let switch = if was_active || was_interrupted {
         self.arbitrate(&mut st, view)
      } else {
         None
      };
      Ok(Some((conn, Self::finish(&st, before, switch))))
   }

   /// Re-derives the priority of `id`, re-arbitrating when it changed or
   /// when the foreground connection dropped to no priority.
   pub fn update_priority(&self, id: ConnectionId, view: NodeView) -> Result<Option<Outcome>> {
      let _guard = self.enter()?;
      let mut st = self.state.lock();
      let is_active = st.active() == Some(id);
      let Some(conn) = st.registry.get_mut(id) else {
         return Err(TwsError::StaleHandle);
      };

      let old = conn.priority;
      let new = conn.derive_priority();
      conn.priority = new;
      if old == new && !(new.is_none() && is_active) {
         return Ok(None);
      }
      debug!("{}: priority {old} -> {new}", conn.addr);

      let before = st.pointers();
      let switch = self.arbitrate(&mut st, view);
      Ok(Some(Self::finish(&st, before, switch)))
   }

   /// Full re-evaluation without any triggering change.
   pub fn recompute(&self, view: NodeView) -> Result<Outcome> {
      let _guard = self.enter()?;
      let mut st = self.state.lock();
      let before = st.pointers();
      let switch = self.arbitrate(&mut st, view);
      Ok(Self::finish(&st, before, switch))
   }

   /// Pins the foreground to `ctx` until released with `Idle`.
   pub fn force_context(&self, ctx: AppContext, view: NodeView) -> Result<Outcome> {
      if ctx.is_call() {
         return Err(TwsError::PolicyRejected("call context follows the call state"));
      }
      let _guard = self.enter()?;
      let mut st = self.state.lock();
      let before = st.pointers();
      st.forced_context = ctx;
      let switch = self.arbitrate(&mut st, view);
      Ok(Self::finish(&st, before, switch))
   }

   /// Adopts the master's view of the foreground.
   pub fn apply_remote(&self, remote: RemoteActive, view: NodeView) -> Result<Outcome> {
      let _guard = self.enter()?;
      let mut st = self.state.lock();
      let before = st.pointers();
      st.remote_context = remote.context;
      st.forced_context = remote.forced;

      let resolve = |st: &AudioState, addr: Option<Address>| {
         addr.map(|a| (a, st.registry.find_by_addr(a)))
      };
      match resolve(&st, remote.active) {
         Some((_, Some(id))) => {
            st.active = Some(id);
            st.stashed_active = None;
         },
         Some((addr, None)) => {
            debug!("Active {addr} not connected yet, stashing");
            st.active = None;
            st.stashed_active = Some(addr);
         },
         None => {
            st.active = None;
            st.stashed_active = None;
         },
      }
      match resolve(&st, remote.interrupted) {
         Some((_, Some(id))) => {
            st.interrupted = Some(id);
            st.stashed_interrupted = None;
         },
         Some((addr, None)) => {
            st.interrupted = None;
            st.stashed_interrupted = Some(addr);
         },
         None => {
            st.interrupted = None;
            st.stashed_interrupted = None;
         },
      }
      if st.interrupted.is_some() && st.interrupted == st.active {
         st.interrupted = None;
      }

      let switch = self.switch_context(&mut st, view);
      Ok(Self::finish(&st, before, switch))
   }

   fn finish(
      st: &AudioState,
      before: (Option<Address>, Option<Address>),
      switch: Option<ContextSwitch>,
   ) -> Outcome {
      let (active, interrupted) = st.pointers();
      Outcome {
         active,
         interrupted,
         pointers_changed: (active, interrupted) != before,
         switch,
      }
   }

   fn arbitrate(&self, st: &mut AudioState, view: NodeView) -> Option<ContextSwitch> {
      let winner = self.select(st, view);
      let current = st.active();
      if winner != current {
         self.move_foreground(st, current, winner);
      }
      self.switch_context(st, view)
   }

   /// Picks the connection that should own the foreground.
   ///
   /// The incumbent wins ties; otherwise the earliest-inserted connection
   /// does, except on a slave node where the master's context breaks ties
   /// so both earbuds land on the same transport.
   fn select(&self, st: &AudioState, view: NodeView) -> Option<ConnectionId> {
      let mut best = st
         .active()
         .and_then(|id| st.registry.get(id).map(|c| (id, c)));

      for (id, conn) in st.registry.iter() {
         if !conn.is_eligible() {
            continue;
         }
         let Some((best_id, best_conn)) = best else {
            best = Some((id, conn));
            continue;
         };
         if id == best_id {
            continue;
         }
         if conn.priority > best_conn.priority
            || (conn.priority == best_conn.priority
               && view.tws_role == TwsRole::Slave
               && Self::follows_master(st.remote_context, best_conn, conn))
         {
            best = Some((id, conn));
         }
      }

      let (winner, prio) = match best {
         Some((id, conn)) => (id, conn.priority),
         None => return None,
      };

      if !prio.has_call()
         && let Some(int_id) = st.interrupted()
         && int_id != winner
         && let Some(int_conn) = st.registry.get(int_id)
         && !(self.policy.app_auto_switch && prio > int_conn.priority)
      {
         debug!("Resuming interrupted {}", int_conn.addr);
         return Some(int_id);
      }
      Some(winner)
   }

   fn follows_master(remote: AppContext, best: &Connection, candidate: &Connection) -> bool {
      match remote {
         AppContext::LowEnergyAudio => {
            candidate.transport == Transport::LowEnergy && !candidate.priority.is_none()
         },
         AppContext::ClassicMusic => {
            best.transport == Transport::LowEnergy
               && candidate.transport == Transport::Classic
               && candidate.priority == Priority::MEDIA_ACTIVE
         },
         _ => false,
      }
   }

   /// Whether `prio` pushes the current foreground aside for later resume.
   /// Unclassified call traffic only does so when media may switch freely.
   fn preempts(&self, prio: Priority) -> bool {
      prio.has_call() || (prio == Priority::CALL_UNCLASSIFIED && self.policy.app_auto_switch)
   }

   fn may_activate(&self, st: &AudioState, conn: &Connection) -> bool {
      self.policy.app_auto_switch
         || conn.priority.has_call()
         || st.forced_context.matches_transport(conn.transport)
   }

   fn move_foreground(
      &self,
      st: &mut AudioState,
      current: Option<ConnectionId>,
      winner: Option<ConnectionId>,
   ) {
      let Some(winner_id) = winner else {
         st.active = None;
         st.interrupted = None;
         return;
      };
      let Some(conn) = st.registry.get(winner_id) else {
         return;
      };
      let addr = conn.addr;
      let prio = conn.priority;
      let allowed = self.may_activate(st, conn);

      match current {
         Some(cur) if self.preempts(prio) => {
            if st.interrupted().is_none() {
               st.interrupted = Some(cur);
            }
            st.active = Some(winner_id);
         },
         Some(_) if st.interrupted == Some(winner_id) => {
            st.interrupted = None;
            st.active = Some(winner_id);
         },
         _ if allowed => st.active = Some(winner_id),
         _ => {
            debug!("{addr} may not take the foreground automatically");
            return;
         },
      }
      if st.interrupted == st.active {
         st.interrupted = None;
      }
      info!("Active device: {addr} ({prio})");
   }

   fn switch_context(&self, st: &mut AudioState, view: NodeView) -> Option<ContextSwitch> {
      let active = st.active().and_then(|id| st.registry.get(id));
      let in_call = active.is_some_and(|c| c.priority.has_call());
      let target = if !in_call && st.forced_context != AppContext::Idle {
         st.forced_context
      } else {
         AppContext::for_connection(active)
      };

      if view.powering_off {
         debug!("Powering off, holding context {}", st.local_context);
         return None;
      }
      if view.tws_role == TwsRole::Slave && st.remote_context != target {
         debug!(
            "Waiting for master to switch to {target} (master is in {})",
            st.remote_context
         );
         return None;
      }

      let from = st.local_context;
      let step = AppContext::transition(from, target)?;
      st.local_context = target;
      info!("App context: {from} -> {target} ({step:?})");
      Some(ContextSwitch {
         from,
         to: target,
         launch: step == Transition::Launch,
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::audio::connection::{AudioContexts, ChannelConfig, ChannelEvent, Direction};

   const PHONE_A: Address = Address([0xA0, 0, 0, 0, 0, 0x01]);
   const PHONE_B: Address = Address([0xB0, 0, 0, 0, 0, 0x02]);
   const PHONE_C: Address = Address([0xC0, 0, 0, 0, 0, 0x03]);
   const PEER: Address = Address([0xEE, 0, 0, 0, 0, 0xEE]);

   fn arbiter(auto_switch: bool) -> Arbiter {
      Arbiter::new(
         Arc::new(Mutex::new(AudioState::new(8))),
         ArbitrationPolicy {
            app_auto_switch: auto_switch,
         },
      )
   }

   fn connect(arb: &Arbiter, handle: Handle, addr: Address, transport: Transport) -> ConnectionId {
      arb.add_connection(handle, addr, transport, LinkRole::Slave, false, NodeView::standalone())
         .unwrap()
         .0
   }

   fn enable_channel(conn: &mut Connection, id: u8, direction: Direction, contexts: AudioContexts) {
      if conn.channel(id).is_none() {
         conn
            .apply_channel_event(ChannelEvent::Configure {
               id,
               direction,
               config: ChannelConfig::default(),
            })
            .unwrap();
      }
      conn
         .apply_channel_event(ChannelEvent::Enable { id, contexts })
         .unwrap();
   }

   fn set_media(arb: &Arbiter, id: ConnectionId, playing: bool) -> Option<Outcome> {
      {
         let mut st = arb.state().lock();
         let conn = st.registry.get_mut(id).unwrap();
         enable_channel(conn, 1, Direction::Sink, AudioContexts::MEDIA);
         conn.media_playing = playing;
      }
      arb.update_priority(id, NodeView::standalone()).unwrap()
   }

   /// Opens a source channel whose context the phone left unspecified.
   fn open_unclassified(arb: &Arbiter, id: ConnectionId) -> Option<Outcome> {
      {
         let mut st = arb.state().lock();
         let conn = st.registry.get_mut(id).unwrap();
         enable_channel(conn, 2, Direction::Source, AudioContexts::UNSPECIFIED);
      }
      arb.update_priority(id, NodeView::standalone()).unwrap()
   }

   fn set_call(arb: &Arbiter, id: ConnectionId, active: bool, view: NodeView) -> Option<Outcome> {
      arb.state().lock().registry.get_mut(id).unwrap().call_active = active;
      arb.update_priority(id, view).unwrap()
   }

   fn switches(outcomes: &[Option<Outcome>]) -> Vec<(AppContext, AppContext)> {
      outcomes
         .iter()
         .flatten()
         .filter_map(|o| o.switch)
         .map(|s| (s.from, s.to))
         .collect()
   }

   #[test]
   fn test_empty_registry_is_idle() {
      let arb = arbiter(true);
      let outcome = arb.recompute(NodeView::standalone()).unwrap();
      assert_eq!(outcome.active, None);
      assert!(outcome.is_noop());
      assert_eq!(arb.state().lock().app_context(), AppContext::Idle);
   }

   #[test]
   fn test_call_preempts_and_media_resumes() {
      let arb = arbiter(true);
      let a = connect(&arb, 1, PHONE_A, Transport::LowEnergy);
      let b = connect(&arb, 2, PHONE_B, Transport::Classic);

      let o1 = set_media(&arb, a, true);
      assert_eq!(o1.unwrap().active, Some(PHONE_A));

      let o2 = set_call(&arb, b, true, NodeView::standalone());
      let o2v = o2.unwrap();
      assert_eq!(o2v.active, Some(PHONE_B));
      assert_eq!(o2v.interrupted, Some(PHONE_A));

      let o3 = set_call(&arb, b, false, NodeView::standalone());
      let o3v = o3.unwrap();
      assert_eq!(o3v.active, Some(PHONE_A));
      assert_eq!(o3v.interrupted, None);

      assert_eq!(
         switches(&[o1, o2, o3]),
         vec![
            (AppContext::Idle, AppContext::LowEnergyAudio),
            (AppContext::LowEnergyAudio, AppContext::ClassicCall),
            (AppContext::ClassicCall, AppContext::LowEnergyAudio),
         ]
      );
   }

   #[test]
   fn test_equal_priority_keeps_incumbent() {
      let arb = arbiter(true);
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      let b = connect(&arb, 2, PHONE_B, Transport::Classic);
      set_media(&arb, a, true);
      let outcome = set_media(&arb, b, true).unwrap();
      assert_eq!(outcome.active, Some(PHONE_A));
      assert!(outcome.is_noop());
   }

   #[test]
   fn test_higher_media_priority_switches_with_auto_switch() {
      let arb = arbiter(true);
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      let b = connect(&arb, 2, PHONE_B, Transport::Classic);
      set_media(&arb, a, false);
      let outcome = set_media(&arb, b, true).unwrap();
      assert_eq!(outcome.active, Some(PHONE_B));
      assert_eq!(outcome.interrupted, None);
   }

   #[test]
   fn test_auto_switch_off_only_calls_take_foreground() {
      let arb = arbiter(false);
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      let b = connect(&arb, 2, PHONE_B, Transport::Classic);

      let outcome = set_media(&arb, a, true).unwrap();
      assert_eq!(outcome.active, None);

      let outcome = set_call(&arb, b, true, NodeView::standalone()).unwrap();
      assert_eq!(outcome.active, Some(PHONE_B));
      assert_eq!(
         outcome.switch,
         Some(ContextSwitch {
            from: AppContext::Idle,
            to: AppContext::ClassicCall,
            launch: true,
         })
      );
   }

   #[test]
   fn test_unclassified_call_respects_auto_switch_off() {
      let arb = arbiter(false);
      arb.force_context(AppContext::ClassicMusic, NodeView::standalone())
         .unwrap();
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      let b = connect(&arb, 2, PHONE_B, Transport::LowEnergy);
      assert_eq!(set_media(&arb, a, true).unwrap().active, Some(PHONE_A));

      let outcome = open_unclassified(&arb, b).unwrap();
      assert_eq!(outcome.active, Some(PHONE_A));
      assert_eq!(outcome.interrupted, None);
      assert!(outcome.is_noop());
      assert_eq!(arb.state().lock().app_context(), AppContext::ClassicMusic);
   }

   #[test]
   fn test_unclassified_call_preempts_with_auto_switch() {
      let arb = arbiter(true);
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      let b = connect(&arb, 2, PHONE_B, Transport::LowEnergy);
      set_media(&arb, a, true);

      let outcome = open_unclassified(&arb, b).unwrap();
      assert_eq!(outcome.active, Some(PHONE_B));
      assert_eq!(outcome.interrupted, Some(PHONE_A));
      assert_eq!(arb.state().lock().app_context(), AppContext::LowEnergyAudio);
   }

   #[test]
   fn test_media_without_stream_does_not_take_foreground() {
      let arb = arbiter(true);
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      arb.state().lock().registry.get_mut(a).unwrap().media_playing = true;
      assert_eq!(arb.update_priority(a, NodeView::standalone()).unwrap(), None);
      assert_eq!(arb.state().lock().active_addr(), None);
   }

   #[test]
   fn test_forced_context_admits_matching_transport() {
      let arb = arbiter(false);
      let a = connect(&arb, 1, PHONE_A, Transport::LowEnergy);
      set_media(&arb, a, true);
      assert_eq!(arb.state().lock().active_addr(), None);

      let outcome = arb
         .force_context(AppContext::LowEnergyAudio, NodeView::standalone())
         .unwrap();
      assert_eq!(outcome.active, Some(PHONE_A));
      assert_eq!(arb.state().lock().app_context(), AppContext::LowEnergyAudio);

      assert!(matches!(
         arb.force_context(AppContext::ClassicCall, NodeView::standalone()),
         Err(TwsError::PolicyRejected(_))
      ));
   }

   #[test]
   fn test_removing_active_promotes_next() {
      let arb = arbiter(true);
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      let b = connect(&arb, 2, PHONE_B, Transport::Classic);
      set_media(&arb, a, true);
      set_media(&arb, b, false);

      let (conn, outcome) = arb
         .remove_connection(a, NodeView::standalone())
         .unwrap()
         .unwrap();
      assert_eq!(conn.addr, PHONE_A);
      assert_eq!(outcome.active, Some(PHONE_B));
      assert!(outcome.pointers_changed);

      assert!(arb.remove_connection(a, NodeView::standalone()).unwrap().is_none());
   }

   #[test]
   fn test_removing_last_connection_goes_idle() {
      let arb = arbiter(true);
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      set_media(&arb, a, true);

      let (_, outcome) = arb
         .remove_connection(a, NodeView::standalone())
         .unwrap()
         .unwrap();
      assert_eq!(outcome.active, None);
      assert_eq!(
         outcome.switch,
         Some(ContextSwitch {
            from: AppContext::ClassicMusic,
            to: AppContext::Idle,
            launch: false,
         })
      );
   }

   #[test]
   fn test_removing_interrupted_clears_resume() {
      let arb = arbiter(true);
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      let b = connect(&arb, 2, PHONE_B, Transport::Classic);
      set_media(&arb, a, true);
      set_call(&arb, b, true, NodeView::standalone());

      let (_, outcome) = arb
         .remove_connection(a, NodeView::standalone())
         .unwrap()
         .unwrap();
      assert_eq!(outcome.active, Some(PHONE_B));
      assert_eq!(outcome.interrupted, None);
   }

   #[test]
   fn test_tws_link_never_active() {
      let arb = arbiter(true);
      let (peer, _) = arb
         .add_connection(9, PEER, Transport::Classic, LinkRole::Slave, true, NodeView::standalone())
         .unwrap();
      arb.state().lock().registry.get_mut(peer).unwrap().call_active = true;
      let outcome = arb.update_priority(peer, NodeView::standalone()).unwrap().unwrap();
      assert_eq!(outcome.active, None);
   }

   #[test]
   fn test_powering_off_suppresses_context_switch() {
      let arb = arbiter(true);
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      let view = NodeView {
         tws_role: TwsRole::None,
         powering_off: true,
      };
      let outcome = set_call(&arb, a, true, view).unwrap();
      assert_eq!(outcome.active, Some(PHONE_A));
      assert_eq!(outcome.switch, None);
   }

   #[test]
   fn test_slave_waits_for_master_context() {
      let arb = arbiter(true);
      let slave = NodeView {
         tws_role: TwsRole::Slave,
         powering_off: false,
      };
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      let outcome = set_call(&arb, a, true, slave).unwrap();
      assert_eq!(outcome.active, Some(PHONE_A));
      assert_eq!(outcome.switch, None);

      let outcome = arb
         .apply_remote(
            RemoteActive {
               context: AppContext::ClassicCall,
               forced: AppContext::Idle,
               active: Some(PHONE_A),
               interrupted: None,
            },
            slave,
         )
         .unwrap();
      assert_eq!(
         outcome.switch,
         Some(ContextSwitch {
            from: AppContext::Idle,
            to: AppContext::ClassicCall,
            launch: true,
         })
      );
   }

   #[test]
   fn test_slave_tie_break_follows_master_le() {
      let arb = arbiter(true);
      let slave = NodeView {
         tws_role: TwsRole::Slave,
         powering_off: false,
      };
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      let b = connect(&arb, 2, PHONE_B, Transport::LowEnergy);
      arb.state().lock().remote_context = AppContext::LowEnergyAudio;

      for id in [a, b] {
         let mut st = arb.state().lock();
         let conn = st.registry.get_mut(id).unwrap();
         enable_channel(conn, 1, Direction::Sink, AudioContexts::MEDIA);
         conn.media_playing = true;
         conn.priority = conn.derive_priority();
         assert_eq!(conn.priority, Priority::MEDIA_ACTIVE);
      }
      let outcome = arb.recompute(slave).unwrap();
      assert_eq!(outcome.active, Some(PHONE_B));
   }

   #[test]
   fn test_remote_pointer_stashed_until_connected() {
      let arb = arbiter(true);
      let slave = NodeView {
         tws_role: TwsRole::Slave,
         powering_off: false,
      };
      let outcome = arb
         .apply_remote(
            RemoteActive {
               context: AppContext::ClassicMusic,
               forced: AppContext::Idle,
               active: Some(PHONE_C),
               interrupted: None,
            },
            slave,
         )
         .unwrap();
      assert_eq!(outcome.active, None);

      let (_, outcome) = arb
         .add_connection(3, PHONE_C, Transport::Classic, LinkRole::Slave, false, slave)
         .unwrap();
      assert_eq!(outcome.active, Some(PHONE_C));
      assert_eq!(
         outcome.switch,
         Some(ContextSwitch {
            from: AppContext::Idle,
            to: AppContext::ClassicMusic,
            launch: true,
         })
      );
   }

   #[test]
   fn test_reentrant_pass_is_refused_and_flagged() {
      let arb = arbiter(true);
      let guard = arb.enter().unwrap();
      assert!(matches!(
         arb.recompute(NodeView::standalone()),
         Err(TwsError::Reentrant)
      ));
      drop(guard);
      assert!(arb.take_retry());
      assert!(!arb.take_retry());
      assert!(arb.recompute(NodeView::standalone()).is_ok());
   }

   #[test]
   fn test_stale_id_rejected() {
      let arb = arbiter(true);
      let a = connect(&arb, 1, PHONE_A, Transport::Classic);
      arb.remove_connection(a, NodeView::standalone()).unwrap();
      assert!(matches!(
         arb.update_priority(a, NodeView::standalone()),
         Err(TwsError::StaleHandle)
      ));
   }
}
