//! Per-node coordinator.
//!
//! One actor task owns every mutation. Registry updates, arbitration, the
//! sync protocol and the power-down machine all run on it, in the order
//! their triggers arrive, so a registry change is always followed by its
//! recompute and context switch before anything else is looked at. The
//! [`Node`] handle is what the D-Bus layer talks to.

use std::{
   mem,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use futures::future;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::{JoinHandle, JoinSet},
   time::{self, Instant, MissedTickBehavior},
};

use crate::{
   adv::{AdvArbiter, AdvKind},
   audio::{
      AudioEvent,
      arbitration::{Arbiter, ArbitrationPolicy, AudioState, NodeView, Outcome, RemoteActive},
      connection::{Connection, Handle, Priority, Transport},
      context::AppContext,
      registry::ConnectionId,
      service::AudioService,
   },
   config::Config,
   error::{Result, TwsError},
   event::{EventSender, TwsEvent},
   poweroff::{PowerDownCoordinator, PowerOffEnv, PowerOffResult},
   tws::{
      TwsRole,
      clock::{SystemClock, Tick},
      link::{self, LinkReceiver, LinkSender, Packet},
      message::{
         self, ActiveDeviceInfo, MAX_SHORT_PAYLOAD, ManagerCommand, PowerOffInfo, PowerOffSignal,
         ReplyCode, Subsystem, SyncMessage, VolumeInfo,
      },
      sync::{Inbound, SyncOutcome, SyncProtocol},
   },
   volume::{VolumeStore, VolumeStream, Volumes},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;
/// Time given to the link sender to flush before the socket is closed.
const LINK_DRAIN: Duration = Duration::from_millis(200);

// === Commands ===

enum NodeCommand {
   // Reports and requests
   Audio(AudioEvent),
   ForceAppContext(AppContext, oneshot::Sender<Result<()>>),
   RequestPowerOff(bool, oneshot::Sender<PowerOffResult>),
   AckCommand(ManagerCommand, oneshot::Sender<SyncOutcome>),
   SyncUserEvent(u8, Vec<u8>, oneshot::Sender<Tick>),
   SetTwsRole(TwsRole, Option<Address>),

   // Loopback
   LinkUp(LinkReceiver, LinkSender, JoinSet<()>),
   LinkFailed,
   AckResolved(ManagerCommand, u8, SyncOutcome, oneshot::Sender<SyncOutcome>),
}

// === Handle ===

/// Handle to the node actor.
///
/// Queries that only need a snapshot of the audio state read it directly
/// under a short lock; everything else goes through the actor.
#[derive(Clone)]
pub struct Node {
   inbox: mpsc::Sender<NodeCommand>,
   state: Arc<Mutex<AudioState>>,
   powering_off: Arc<AtomicBool>,
   clock: Arc<SystemClock>,
   power_off_budget: Duration,
}

impl Node {
   pub fn spawn(
      config: &Config,
      audio: Arc<dyn AudioService>,
      volumes: Option<VolumeStore>,
      event_tx: EventSender,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let state = Arc::new(Mutex::new(AudioState::new(config.max_connections)));
      let powering_off = Arc::new(AtomicBool::new(false));
      let clock = Arc::new(SystemClock::new());

      let actor = NodeActor::new(
         config,
         audio,
         volumes,
         event_tx,
         command_rx,
         state.clone(),
         powering_off.clone(),
         clock.clone(),
      );
      tokio::spawn(actor.run());

      Self {
         inbox: command_tx,
         state,
         powering_off,
         clock,
         power_off_budget: config.poweroff_timeouts().budget(),
      }
   }

   async fn send(&self, cmd: NodeCommand) -> Result<()> {
      self.inbox.send(cmd).await.map_err(|_| TwsError::NodeShutdown)
   }

   async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self.send(make(tx)).await?;
      rx.await.map_err(|_| TwsError::NodeShutdown)
   }

   /// Foreground pointers and the contexts behind them.
   pub fn foreground_json(&self) -> serde_json::Value {
      let st = self.state.lock();
      serde_json::json!({
         "active": st.active_addr().map(|a| a.to_string()),
         "interrupted": st.interrupted_addr().map(|a| a.to_string()),
         "context": st.app_context().to_str(),
         "remote_context": st.remote_context().to_str(),
         "forced_context": st.forced_context().to_str(),
      })
   }

   pub fn active_device(&self) -> Option<Address> {
      self.state.lock().active_addr()
   }

   pub fn interrupted_device(&self) -> Option<Address> {
      self.state.lock().interrupted_addr()
   }

   pub fn app_context(&self) -> AppContext {
      self.state.lock().app_context()
   }

   /// First connection on `transport` that is in a call.
   pub fn call_device(&self, transport: Transport) -> Option<Address> {
      let st = self.state.lock();
      st.registry
         .find_by_priority(transport, Priority::CALL)
         .and_then(|id| st.registry.get(id))
         .map(|c| c.addr)
   }

   pub fn connections_json(&self) -> serde_json::Value {
      let st = self.state.lock();
      st.registry.iter().map(|(_, c)| c.to_json()).collect()
   }

   /// Pins the foreground to `ctx`; `Idle` releases the pin.
   pub async fn force_app_context(&self, ctx: AppContext) -> Result<()> {
      self
         .request(|tx| NodeCommand::ForceAppContext(ctx, tx))
         .await?
   }

   /// Powers down this node, and the peer too unless `single`. Resolves
   /// once the session reaches its end.
   pub async fn request_power_off(&self, single: bool) -> Result<PowerOffResult> {
      // A queued second request runs after the current one.
      let limit = self.power_off_budget * 2;
      time::timeout(limit, self.request(|tx| NodeCommand::RequestPowerOff(single, tx)))
         .await
         .map_err(|_| TwsError::RequestTimeout)?
   }

   pub fn is_power_off_in_progress(&self) -> bool {
      self.powering_off.load(Ordering::Acquire)
   }

   pub async fn enter_pair_mode(&self) -> Result<SyncOutcome> {
      self
         .request(|tx| NodeCommand::AckCommand(ManagerCommand::EnterPairMode, tx))
         .await
   }

   pub async fn clear_paired_list(&self) -> Result<SyncOutcome> {
      self
         .request(|tx| NodeCommand::AckCommand(ManagerCommand::ClearPairedList, tx))
         .await
   }

   /// Runs an application event on both earbuds at the same clock tick.
   pub async fn sync_user_event(&self, cmd: u8, payload: Vec<u8>) -> Result<Tick> {
      if payload.len() > MAX_SHORT_PAYLOAD {
         return Err(TwsError::PayloadTooLong {
            len: payload.len(),
            max: MAX_SHORT_PAYLOAD,
         });
      }
      self
         .request(|tx| NodeCommand::SyncUserEvent(cmd, payload, tx))
         .await
   }

   pub async fn report(&self, event: AudioEvent) -> Result<()> {
      self.send(NodeCommand::Audio(event)).await
   }

   pub async fn set_tws_role(&self, role: TwsRole, peer: Option<Address>) -> Result<()> {
      self.send(NodeCommand::SetTwsRole(role, peer)).await
   }

   /// Re-aligns the local clock estimate with the radio clock.
   pub fn set_clock_offset(&self, offset: u32) {
      self.clock.set_offset(offset);
   }

   #[cfg(test)]
   async fn attach_link(&self, rx: LinkReceiver, tx: LinkSender) {
      self
         .send(NodeCommand::LinkUp(rx, tx, JoinSet::new()))
         .await
         .unwrap();
   }
}

// === Actor ===

struct NodeActor {
   config: Config,
   audio: Arc<dyn AudioService>,
   volumes: Option<VolumeStore>,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<NodeCommand>,
   loopback_rx: mpsc::Receiver<NodeCommand>,
   loopback_tx: mpsc::Sender<NodeCommand>,

   arbiter: Arbiter,
   sync: SyncProtocol,
   poweroff: PowerDownCoordinator,
   adv: AdvArbiter,
   powering_off: Arc<AtomicBool>,
   power_waiters: Vec<(u64, oneshot::Sender<PowerOffResult>)>,
   /// Set once a session shut this node down.
   shut_down: bool,
   connecting: bool,

   // Pair link
   role: TwsRole,
   peer: Option<Address>,
   link_rx: Option<LinkReceiver>,
   link_io: Option<JoinSet<()>>,
   link_task: Option<JoinHandle<()>>,
   link_retries: u32,
}

impl NodeActor {
   #[allow(clippy::too_many_arguments)]
   fn new(
      config: &Config,
      audio: Arc<dyn AudioService>,
      volumes: Option<VolumeStore>,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<NodeCommand>,
      state: Arc<Mutex<AudioState>>,
      powering_off: Arc<AtomicBool>,
      clock: Arc<SystemClock>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let peer = config.tws_peer_address();
      let wait_for_tws = peer.map(|_| Instant::now() + config.adv_tws_wait());

      Self {
         config: config.clone(),
         audio,
         volumes,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         arbiter: Arbiter::new(state, ArbitrationPolicy {
            app_auto_switch: config.app_auto_switch,
         }),
         sync: SyncProtocol::new(clock, config.guard_interval_ms, config.dedup_window_ms),
         poweroff: PowerDownCoordinator::new(config.poweroff_timeouts()),
         adv: AdvArbiter::new(wait_for_tws),
         powering_off,
         power_waiters: Vec::new(),
         shut_down: false,
         connecting: false,
         role: TwsRole::None,
         peer,
         link_rx: None,
         link_io: None,
         link_task: None,
         link_retries: 0,
      }
   }

   async fn run(mut self) {
      info!("Node starting up");

      let mut sync_interval = time::interval(self.config.periodic_sync_interval());
      sync_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut adv_interval = time::interval(self.config.adv_interval());
      adv_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         let sync_wake = self.sync.next_wake();
         let poweroff_deadline = self.poweroff.deadline();

         select! {
             () = sleep_for(sync_wake) => {
                 for msg in self.sync.drain_due() {
                     self.execute(msg);
                 }
             }
             () = sleep_until(poweroff_deadline) => {
                 self.step_power_off();
             }
             _ = sync_interval.tick() => {
                 self.periodic_sync();
             }
             _ = adv_interval.tick() => {
                 self.evaluate_advertising();
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Node shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd);
             }
             frame = next_frame(&mut self.link_rx) => {
                 match frame {
                     Some(frame) => self.handle_frame(&frame),
                     None => self.link_lost(),
                 }
             }
         }

         if self.arbiter.take_retry() {
            self.recompute();
         }
      }

      self.drop_link();
   }

   fn view(&self) -> NodeView {
      NodeView {
         tws_role: self.role,
         powering_off: self.shut_down || self.poweroff.is_active(),
      }
   }

   fn handle_command(&mut self, cmd: NodeCommand) {
      match cmd {
         NodeCommand::Audio(event) => self.handle_audio(event),
         NodeCommand::ForceAppContext(ctx, reply) => {
            let result = self.arbiter.force_context(ctx, self.view());
            let _ = reply.send(result.map(|outcome| self.publish(outcome)));
         },
         NodeCommand::RequestPowerOff(single, reply) => {
            let requested = self.poweroff.request(single, Instant::now());
            self.power_waiters.push((requested.session(), reply));
            self.powering_off.store(true, Ordering::Release);
            self.evaluate_advertising();
         },
         NodeCommand::AckCommand(cmd, reply) => self.start_ack_command(cmd, reply),
         NodeCommand::SyncUserEvent(cmd, payload, reply) => {
            let msg = SyncMessage::new(Subsystem::UserApp, cmd, &payload);
            let _ = reply.send(self.sync.schedule(msg, None));
         },
         NodeCommand::SetTwsRole(role, peer) => self.set_tws_role(role, peer),
         NodeCommand::LinkUp(rx, tx, io) => self.link_up(rx, tx, io),
         NodeCommand::LinkFailed => {
            self.link_task = None;
            self.link_retries += 1;
            self.spawn_link();
         },
         NodeCommand::AckResolved(cmd, seq, outcome, reply) => {
            self.sync.forget_ack(cmd, seq);
            if outcome == SyncOutcome::Acked {
               self.run_ack_command(cmd);
            } else {
               warn!("{cmd} not carried out: peer {outcome}");
            }
            let _ = reply.send(outcome);
         },
      }
   }

   // === Audio reports ===

   fn handle_audio(&mut self, event: AudioEvent) {
      match event {
         AudioEvent::Connected {
            handle,
            addr,
            transport,
            role,
            is_tws,
         } => {
            let result = self
               .arbiter
               .add_connection(handle, addr, transport, role, is_tws, self.view());
            let Some((id, outcome)) = checked("connection", result) else {
               return;
            };
            info!("Connected: {addr} ({transport}, {role}, handle {handle:#06x})");
            if !is_tws {
               self.restore_volumes(id, addr);
            }
            self.event_tx.emit(TwsEvent::ConnectionAdded { addr, transport });
            self.publish(outcome);
            if !is_tws {
               self.send_phone_info(addr);
            }
         },
         AudioEvent::Disconnected { handle } => {
            let Some((id, ())) = self.with_connection(handle, |_| ()) else {
               return;
            };
            let result = self.arbiter.remove_connection(id, self.view());
            let Some((conn, outcome)) = checked("disconnection", result).flatten() else {
               return;
            };
            info!("Disconnected: {}", conn.addr);
            self.event_tx.emit(TwsEvent::ConnectionRemoved { addr: conn.addr });
            self.publish(outcome);

            let remaining = self.arbiter.state().lock().registry.phone_count();
            self.poweroff.phone_disconnected(remaining, Instant::now());
         },
         AudioEvent::Channel { handle, event } => {
            let Some((id, (addr, result))) =
               self.with_connection(handle, |c| (c.addr, c.apply_channel_event(event)))
            else {
               return;
            };
            match result {
               Ok(state) => {
                  debug!("{addr}: channel {} {state}", event.channel_id());
                  self.event_tx.emit(TwsEvent::StreamChanged {
                     addr,
                     channel: event.channel_id(),
                     state,
                  });
                  self.update_priority(id);
               },
               Err(e) => debug!("{addr}: dropping channel event: {e}"),
            }
         },
         AudioEvent::Media { handle, playing } => {
            let Some((id, addr)) = self.with_connection(handle, |c| {
               c.media_playing = playing;
               c.addr
            }) else {
               return;
            };
            self
               .event_tx
               .emit(TwsEvent::MediaStateChanged { addr, playing });
            self.update_priority(id);
            self.send_phone_info(addr);
         },
         AudioEvent::Call { handle, active } => {
            let Some((id, addr)) = self.with_connection(handle, |c| {
               c.call_active = active;
               c.addr
            }) else {
               return;
            };
            self.event_tx.emit(TwsEvent::CallStateChanged { addr, active });
            self.update_priority(id);
         },
         AudioEvent::Volume {
            handle,
            stream,
            volume,
            from_phone,
         } => {
            let Some((_, addr)) = self.with_connection(handle, |c| c.addr) else {
               return;
            };
            let info = VolumeInfo {
               addr: Some(addr),
               volume,
               from_phone,
            };
            let msg = SyncMessage::manager(ManagerCommand::volume(stream), &info.to_payload());
            if from_phone {
               // Applied on both earbuds at the same tick.
               self
                  .sync
                  .schedule(msg, Some(self.config.volume_guard_interval_ms));
            } else {
               self.apply_volume(addr, stream, volume);
               self.sync.propagate(msg);
            }
         },
         AudioEvent::Connecting(connecting) => self.connecting = connecting,
         AudioEvent::Advertising(kind, state) => {
            self.adv.report(kind, state);
            self.evaluate_advertising();
         },
      }
   }

   /// Runs `f` on the connection behind `handle`. Unknown handles are a
   /// routine race with link loss.
   fn with_connection<T>(
      &self,
      handle: Handle,
      f: impl FnOnce(&mut Connection) -> T,
   ) -> Option<(ConnectionId, T)> {
      let mut st = self.arbiter.state().lock();
      let Some(id) = st.registry.find_by_handle(handle) else {
         debug!("Ignoring report for stale handle {handle:#06x}");
         return None;
      };
      let conn = st.registry.get_mut(id)?;
      Some((id, f(conn)))
   }

   fn update_priority(&mut self, id: ConnectionId) {
      let result = self.arbiter.update_priority(id, self.view());
      if let Some(outcome) = checked("priority update", result).flatten() {
         self.publish(outcome);
      }
   }

   fn recompute(&mut self) {
      let result = self.arbiter.recompute(self.view());
      if let Some(outcome) = checked("recompute", result) {
         self.publish(outcome);
      }
   }

   /// Announces the result of an arbitration pass.
   fn publish(&mut self, outcome: Outcome) {
      if outcome.pointers_changed {
         self.event_tx.emit(TwsEvent::ActiveDeviceChanged {
            active: outcome.active,
            interrupted: outcome.interrupted,
         });
      }
      if let Some(switch) = outcome.switch {
         self.event_tx.emit(TwsEvent::AppContextSwitched {
            from: switch.from,
            to: switch.to,
            launch: switch.launch,
         });
         self.evaluate_advertising();
      }
      if !outcome.is_noop() {
         self.send_active_device();
      }
   }

   // === Volume ===

   fn saved_volumes(&self, addr: Address) -> Volumes {
      let defaults = Volumes::new(
         self.config.default_music_volume,
         self.config.default_call_volume,
      );
      let Some(store) = &self.volumes else {
         return defaults;
      };
      store.volumes(addr).unwrap_or_else(|e| {
         warn!("Failed to read saved volume for {addr}: {e}");
         defaults
      })
   }

   fn restore_volumes(&self, id: ConnectionId, addr: Address) {
      let volumes = self.saved_volumes(addr);
      if let Some(conn) = self.arbiter.state().lock().registry.get_mut(id) {
         conn.music_volume = volumes.get(VolumeStream::Music);
         conn.call_volume = volumes.get(VolumeStream::Call);
      }
   }

   fn apply_volume(&mut self, addr: Address, stream: VolumeStream, volume: u8) {
      if let Some(store) = &self.volumes
         && let Err(e) = store.save(addr, stream, volume)
      {
         warn!("Failed to save volume for {addr}: {e}");
      }

      let audible = {
         let mut st = self.arbiter.state().lock();
         if let Some(id) = st.registry.find_by_addr(addr)
            && let Some(conn) = st.registry.get_mut(id)
         {
            match stream {
               VolumeStream::Call => conn.call_volume = volume,
               VolumeStream::Music | VolumeStream::LeAudio => conn.music_volume = volume,
            }
         }
         st.active_addr() == Some(addr) && stream_matches(stream, st.app_context())
      };

      if audible {
         info!("{addr}: {stream} volume {volume}");
         self.event_tx.emit(TwsEvent::VolumeChanged {
            addr,
            stream,
            volume,
         });
      } else {
         debug!("{addr}: {stream} volume {volume} stored");
      }
   }

   // === Sync ===

   fn handle_frame(&mut self, frame: &[u8]) {
      match self.sync.receive(frame) {
         Ok(Inbound::Apply(msg)) => self.execute(msg),
         Ok(Inbound::Scheduled(tick)) => debug!("Peer command parked until tick {tick}"),
         Ok(Inbound::Duplicate | Inbound::Replied) => {},
         Err(e) => warn!("Dropping frame from peer: {e}"),
      }
   }

   /// Executes a message that arrived from the peer or whose tick came up.
   fn execute(&mut self, msg: SyncMessage) {
      let cmd = match msg.subsystem {
         Subsystem::UserApp => {
            info!("User event 0x{:02x} at tick {}", msg.command, self.sync.now());
            self.event_tx.emit(TwsEvent::UserEvent {
               cmd: msg.command,
               payload: msg.payload,
            });
            return;
         },
         Subsystem::Manager => match msg.manager_command() {
            Some(cmd) => cmd,
            None => {
               warn!("Unknown manager command 0x{:02x}", msg.command);
               return;
            },
         },
      };
      if let Err(e) = self.execute_manager(cmd, &msg.payload) {
         warn!("Failed to apply {cmd}: {e}");
      }
   }

   fn execute_manager(&mut self, cmd: ManagerCommand, payload: &[u8]) -> Result<()> {
      match cmd {
         // Consumed by the sync layer.
         ManagerCommand::Reply => {},
         ManagerCommand::EnterPairMode | ManagerCommand::ClearPairedList => {
            let code = if self.view().powering_off {
               ReplyCode::Nack
            } else {
               self.run_ack_command(cmd);
               ReplyCode::Ack
            };
            // Requests carry their sequence byte first.
            let seq = payload.first().copied().unwrap_or(0);
            self.sync.reply(cmd, seq, code);
         },
         ManagerCommand::PowerOff => {
            let info = PowerOffInfo::parse(payload)?;
            match info.signal {
               PowerOffSignal::Request => {
                  self.poweroff.peer_request(info.single, Instant::now());
                  self.powering_off.store(true, Ordering::Release);
                  let ack = PowerOffInfo {
                     signal: PowerOffSignal::Ack,
                     single: info.single,
                  };
                  self
                     .sync
                     .propagate(SyncMessage::manager(ManagerCommand::PowerOff, &ack.to_payload()));
                  self.evaluate_advertising();
               },
               PowerOffSignal::Ack => self.poweroff.peer_ack(Instant::now()),
            }
         },
         ManagerCommand::MusicVolume
         | ManagerCommand::CallVolume
         | ManagerCommand::LeAudioVolume => {
            let info = VolumeInfo::parse(payload)?;
            if let (Some(stream), Some(addr)) = (cmd.volume_stream(), info.addr) {
               self.apply_volume(addr, stream, info.volume);
            }
         },
         ManagerCommand::PhoneInfo => {
            if self.role != TwsRole::Master {
               self.apply_phone_info(message::PhoneInfo::parse(payload)?);
            }
         },
         ManagerCommand::ActiveDevice => {
            if self.role == TwsRole::Master {
               debug!("Ignoring active device from peer, this node is master");
               return Ok(());
            }
            let info = ActiveDeviceInfo::parse(payload)?;
            let remote = RemoteActive {
               context: info.context,
               forced: info.forced,
               active: info.active,
               interrupted: info.interrupted,
            };
            let result = self.arbiter.apply_remote(remote, self.view());
            if let Some(outcome) = checked("remote active device", result) {
               self.publish(outcome);
            }
         },
      }
      Ok(())
   }

   fn apply_phone_info(&mut self, info: message::PhoneInfo) {
      let updated = {
         let mut st = self.arbiter.state().lock();
         let Some(id) = st.registry.find_by_addr(info.addr) else {
            debug!("Phone info for unknown {}", info.addr);
            return;
         };
         st.registry.get_mut(id).map(|c| {
            let changed = c.media_playing != info.playing;
            c.media_playing = info.playing;
            c.music_volume = info.music_volume;
            c.call_volume = info.call_volume;
            (id, changed)
         })
      };
      if let Some((id, true)) = updated {
         self.event_tx.emit(TwsEvent::MediaStateChanged {
            addr: info.addr,
            playing: info.playing,
         });
         self.update_priority(id);
      }
   }

   fn send_active_device(&mut self) {
      if self.role != TwsRole::Master {
         return;
      }
      let snap = self.arbiter.snapshot();
      let info = ActiveDeviceInfo {
         context: snap.context,
         forced: snap.forced,
         active: snap.active,
         interrupted: snap.interrupted,
      };
      self.sync.propagate(SyncMessage::manager(
         ManagerCommand::ActiveDevice,
         &info.to_payload(),
      ));
   }

   fn send_phone_info(&mut self, addr: Address) {
      if self.role != TwsRole::Master {
         return;
      }
      let info = {
         let st = self.arbiter.state().lock();
         st.registry
            .find_by_addr(addr)
            .and_then(|id| st.registry.get(id))
            .filter(|c| !c.is_tws)
            .map(|c| message::PhoneInfo {
               addr: c.addr,
               playing: c.media_playing,
               music_volume: c.music_volume,
               call_volume: c.call_volume,
            })
      };
      if let Some(info) = info {
         self.sync.propagate(SyncMessage::manager(
            ManagerCommand::PhoneInfo,
            &info.to_payload(),
         ));
      }
   }

   /// Master re-sends shared state so a lost frame heals itself.
   fn periodic_sync(&mut self) {
      if self.role != TwsRole::Master || !self.sync.is_linked() {
         return;
      }
      debug!("Periodic resync ({} commands scheduled)", self.sync.pending());
      self.send_active_device();
      let phones: SmallVec<[Address; 8]> = {
         let st = self.arbiter.state().lock();
         st.registry
            .iter()
            .filter(|(_, c)| !c.is_tws)
            .map(|(_, c)| c.addr)
            .collect()
      };
      for addr in phones {
         self.send_phone_info(addr);
      }
   }

   // === Acknowledged commands ===

   fn start_ack_command(&mut self, cmd: ManagerCommand, reply: oneshot::Sender<SyncOutcome>) {
      if self.view().powering_off {
         let _ = reply.send(SyncOutcome::Rejected);
         return;
      }
      let waiter = match self.sync.request_ack(cmd) {
         Ok(waiter) => waiter,
         Err(e) => {
            debug!("{cmd}: {e}, running on this node only");
            self.run_ack_command(cmd);
            let _ = reply.send(SyncOutcome::Local);
            return;
         },
      };

      let loopback = self.loopback_tx.clone();
      let timeout = self.config.ack_timeout();
      let seq = waiter.seq;
      tokio::spawn(async move {
         let outcome = match time::timeout(timeout, waiter.rx).await {
            Ok(Ok(code)) => SyncOutcome::from(code),
            Ok(Err(_)) => {
               warn!("Link dropped before {cmd} was acknowledged");
               SyncOutcome::TimedOut
            },
            Err(_) => {
               warn!("{cmd} not acknowledged within {timeout:?}");
               SyncOutcome::TimedOut
            },
         };
         let _ = loopback
            .send(NodeCommand::AckResolved(cmd, seq, outcome, reply))
            .await;
      });
   }

   fn run_ack_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::EnterPairMode => {
            info!("Entering pair mode");
            self.audio.enter_pair_mode();
            self.event_tx.emit(TwsEvent::PairModeEntered);
         },
         ManagerCommand::ClearPairedList => {
            info!("Clearing paired list");
            self.audio.clear_paired_list();
            self.event_tx.emit(TwsEvent::PairedListCleared);
         },
         _ => {},
      }
   }

   // === Power-down ===

   fn step_power_off(&mut self) {
      debug!("Power-off step in {}", self.poweroff.phase());
      let mut results = SmallVec::<[(u64, PowerOffResult); 2]>::new();
      let mut released = false;
      {
         let mut env = PowerOffContext {
            audio: &*self.audio,
            state: self.arbiter.state(),
            sync: &mut self.sync,
            connecting: self.connecting,
            released: &mut released,
            results: &mut results,
         };
         self.poweroff.step(&mut env, Instant::now());
      }

      if released {
         self.drop_link();
      }
      for (session, result) in results {
         self.shut_down = true;
         self.event_tx.emit(TwsEvent::PowerOffResult(result));
         let (done, pending) = mem::take(&mut self.power_waiters)
            .into_iter()
            .partition(|(id, _)| *id == session);
         self.power_waiters = pending;
         for (_, waiter) in done {
            let _ = waiter.send(result);
         }
      }

      if !self.poweroff.is_active() {
         self.powering_off.store(false, Ordering::Release);
         if !self.shut_down {
            // Only the peer went down; carry on.
            self.evaluate_advertising();
            self.spawn_link();
         }
      }
   }

   // === Advertising ===

   fn evaluate_advertising(&mut self) {
      let powering_off = self.view().powering_off;
      let Some(switch) = self
         .adv
         .evaluate(Instant::now(), self.sync.is_linked(), powering_off)
      else {
         return;
      };
      if switch.from != AdvKind::None {
         self.audio.set_advertising(switch.from, false);
      }
      if switch.to != AdvKind::None {
         self.audio.set_advertising(switch.to, true);
      }
      self.event_tx.emit(TwsEvent::AdvertisingChanged {
         from: switch.from,
         to: switch.to,
      });
   }

   // === Pair link ===

   fn set_tws_role(&mut self, role: TwsRole, peer: Option<Address>) {
      let peer_changed = peer.is_some() && peer != self.peer;
      if role == self.role && !peer_changed {
         return;
      }
      info!("TWS role: {} -> {role}", self.role);
      self.role = role;
      if peer_changed {
         self.peer = peer;
      }
      self.drop_link();
      self.link_retries = 0;
      self.spawn_link();
      self.recompute();
   }

   fn spawn_link(&mut self) {
      let Some(peer) = self.peer else {
         return;
      };
      if !self.role.is_paired()
         || self.link_task.is_some()
         || self.link_rx.is_some()
         || self.view().powering_off
      {
         return;
      }

      let role = self.role;
      let loopback = self.loopback_tx.clone();
      let delay = (self.link_retries > 0).then(|| link::retry_delay(self.link_retries));

      self.link_task = Some(tokio::spawn(async move {
         if let Some(delay) = delay {
            debug!("Retrying link to {peer} in {delay:?}");
            time::sleep(delay).await;
         }
         let mut io = JoinSet::new();
         let result = if role == TwsRole::Master {
            link::connect(&mut io, peer).await
         } else {
            link::accept(&mut io, peer).await
         };
         let cmd = match result {
            Ok((rx, tx)) => NodeCommand::LinkUp(rx, tx, io),
            Err(e) => {
               warn!("Link to {peer} failed: {e}");
               NodeCommand::LinkFailed
            },
         };
         let _ = loopback.send(cmd).await;
      }));
   }

   fn link_up(&mut self, rx: LinkReceiver, tx: LinkSender, io: JoinSet<()>) {
      self.link_task = None;
      if self.view().powering_off {
         debug!("Link came up while powering off, dropping it");
         return;
      }
      self.link_retries = 0;
      self.sync.attach(tx);
      self.link_rx = Some(rx);
      self.link_io = Some(io);

      info!("TWS link up ({})", self.role);
      self.event_tx.emit(TwsEvent::TwsLinkChanged {
         role: self.role,
         up: true,
      });
      self.periodic_sync();
      self.evaluate_advertising();
   }

   fn link_lost(&mut self) {
      warn!("TWS link lost");
      self.drop_link();
      self.link_retries += 1;
      self.spawn_link();
   }

   fn drop_link(&mut self) {
      self.sync.detach();
      if let Some(task) = self.link_task.take() {
         task.abort();
      }
      if let Some(mut io) = self.link_io.take() {
         // Let queued frames go out before the socket closes.
         tokio::spawn(async move {
            let _ = time::timeout(LINK_DRAIN, io.join_next()).await;
         });
      }
      if self.link_rx.take().is_some() {
         self.event_tx.emit(TwsEvent::TwsLinkChanged {
            role: self.role,
            up: false,
         });
      }
   }
}

/// Side effects of the power-down machine, borrowed from the actor for one
/// step.
struct PowerOffContext<'a> {
   audio: &'a dyn AudioService,
   state: &'a Mutex<AudioState>,
   sync: &'a mut SyncProtocol,
   connecting: bool,
   released: &'a mut bool,
   results: &'a mut SmallVec<[(u64, PowerOffResult); 2]>,
}

impl PowerOffEnv for PowerOffContext<'_> {
   fn enter_power_off_mode(&mut self) {
      self.audio.enter_power_off_mode();
   }

   fn is_connecting(&self) -> bool {
      self.connecting
   }

   fn connected_phones(&self) -> usize {
      self.state.lock().registry.phone_count()
   }

   fn disconnect_phones(&mut self) {
      let phones: SmallVec<[Address; 8]> = self
         .state
         .lock()
         .registry
         .iter()
         .filter(|(_, c)| !c.is_tws)
         .map(|(_, c)| c.addr)
         .collect();
      for addr in phones {
         info!("Disconnecting {addr}");
         self.audio.disconnect(addr);
      }
   }

   fn peer_linked(&self) -> bool {
      self.sync.is_linked()
   }

   fn request_peer_power_off(&mut self, single: bool) -> bool {
      let info = PowerOffInfo {
         signal: PowerOffSignal::Request,
         single,
      };
      self
         .sync
         .propagate(SyncMessage::manager(ManagerCommand::PowerOff, &info.to_payload()))
   }

   fn release_tws_link(&mut self) {
      self.sync.detach();
      *self.released = true;
   }

   fn reconnect_phones(&mut self) {
      self.audio.reconnect_phones();
   }

   fn report(&mut self, session: u64, result: PowerOffResult) {
      self.results.push((session, result));
   }
}

/// Unwraps an arbitration result. Stale handles and refused re-entry are
/// routine; the latter is retried after the current command.
fn checked<T>(what: &str, result: Result<T>) -> Option<T> {
   match result {
      Ok(value) => Some(value),
      Err(e @ (TwsError::StaleHandle | TwsError::Reentrant)) => {
         debug!("{what}: {e}");
         None
      },
      Err(e) => {
         warn!("{what}: {e}");
         None
      },
   }
}

const fn stream_matches(stream: VolumeStream, ctx: AppContext) -> bool {
   match stream {
      VolumeStream::Music => matches!(ctx, AppContext::ClassicMusic),
      VolumeStream::Call => ctx.is_call(),
      VolumeStream::LeAudio => matches!(ctx, AppContext::LowEnergyAudio),
   }
}

async fn sleep_for(delay: Option<Duration>) {
   match delay {
      Some(delay) => time::sleep(delay).await,
      None => future::pending().await,
   }
}

async fn sleep_until(deadline: Option<Instant>) {
   match deadline {
      Some(deadline) => time::sleep_until(deadline).await,
      None => future::pending().await,
   }
}

async fn next_frame(rx: &mut Option<LinkReceiver>) -> Option<Packet> {
   match rx {
      Some(rx) => rx.recv().await,
      None => future::pending().await,
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      audio::connection::{
         AudioContexts, ChannelConfig, ChannelEvent, Direction, LinkRole, Transport,
      },
      event::testing::Recorder,
   };

   const PHONE_A: Address = Address([0xA0, 0, 0, 0, 0, 0x01]);
   const PHONE_B: Address = Address([0xB0, 0, 0, 0, 0, 0x02]);

   #[derive(Default)]
   struct FakeAudio(Mutex<Vec<String>>);

   impl FakeAudio {
      fn calls(&self) -> Vec<String> {
         self.0.lock().clone()
      }

      fn called(&self, what: &str) -> bool {
         self.0.lock().iter().any(|c| c == what)
      }

      fn record(&self, what: String) {
         self.0.lock().push(what);
      }
   }

   impl AudioService for FakeAudio {
      fn disconnect(&self, addr: Address) {
         self.record(format!("disconnect {addr}"));
      }

      fn enter_power_off_mode(&self) {
         self.record("power_off_mode".into());
      }

      fn reconnect_phones(&self) {
         self.record("reconnect".into());
      }

      fn enter_pair_mode(&self) {
         self.record("pair_mode".into());
      }

      fn clear_paired_list(&self) {
         self.record("clear_paired_list".into());
      }

      fn set_advertising(&self, kind: AdvKind, enable: bool) {
         self.record(format!("adv {kind} {enable}"));
      }
   }

   struct Harness {
      node: Node,
      audio: Arc<FakeAudio>,
      events: Arc<Recorder>,
   }

   fn spawn_node() -> Harness {
      let audio = Arc::new(FakeAudio::default());
      let events = Arc::new(Recorder::default());
      let node = Node::spawn(&Config::default(), audio.clone(), None, events.clone());
      Harness {
         node,
         audio,
         events,
      }
   }

   async fn linked_pair() -> (Harness, Harness) {
      let master = spawn_node();
      let slave = spawn_node();
      master
         .node
         .set_tws_role(TwsRole::Master, None)
         .await
         .unwrap();
      slave.node.set_tws_role(TwsRole::Slave, None).await.unwrap();

      let ((m_rx, m_tx), (s_rx, s_tx)) = link::pair();
      master.node.attach_link(m_rx, m_tx).await;
      slave.node.attach_link(s_rx, s_tx).await;
      settle().await;
      (master, slave)
   }

   /// Lets the actors drain their queues.
   async fn settle() {
      time::sleep(Duration::from_millis(5)).await;
   }

   async fn connect(node: &Node, handle: Handle, addr: Address, transport: Transport) {
      node
         .report(AudioEvent::Connected {
            handle,
            addr,
            transport,
            role: LinkRole::Slave,
            is_tws: false,
         })
         .await
         .unwrap();
   }

   /// Reports playback on `handle` together with a live media sink channel.
   async fn stream_media(node: &Node, handle: Handle) {
      let events = [
         AudioEvent::Media {
            handle,
            playing: true,
         },
         AudioEvent::Channel {
            handle,
            event: ChannelEvent::Configure {
               id: 1,
               direction: Direction::Sink,
               config: ChannelConfig::default(),
            },
         },
         AudioEvent::Channel {
            handle,
            event: ChannelEvent::Enable {
               id: 1,
               contexts: AudioContexts::MEDIA,
            },
         },
      ];
      for event in events {
         node.report(event).await.unwrap();
      }
   }

   fn switches(events: &[TwsEvent]) -> Vec<(AppContext, AppContext)> {
      events
         .iter()
         .filter_map(|e| match e {
            TwsEvent::AppContextSwitched { from, to, .. } => Some((*from, *to)),
            _ => None,
         })
         .collect()
   }

   #[tokio::test(start_paused = true)]
   async fn test_call_preempts_and_media_resumes() {
      let h = spawn_node();
      connect(&h.node, 1, PHONE_A, Transport::Classic).await;
      stream_media(&h.node, 1).await;
      settle().await;
      assert_eq!(h.node.active_device(), Some(PHONE_A));

      connect(&h.node, 2, PHONE_B, Transport::LowEnergy).await;
      h.node
         .report(AudioEvent::Call {
            handle: 2,
            active: true,
         })
         .await
         .unwrap();
      settle().await;
      assert_eq!(h.node.active_device(), Some(PHONE_B));
      assert_eq!(h.node.interrupted_device(), Some(PHONE_A));
      assert_eq!(h.node.call_device(Transport::LowEnergy), Some(PHONE_B));

      h.node
         .report(AudioEvent::Call {
            handle: 2,
            active: false,
         })
         .await
         .unwrap();
      settle().await;
      assert_eq!(h.node.active_device(), Some(PHONE_A));
      assert_eq!(h.node.interrupted_device(), None);

      assert_eq!(
         switches(&h.events.take()),
         vec![
            (AppContext::Idle, AppContext::ClassicMusic),
            (AppContext::ClassicMusic, AppContext::LowEnergyAudio),
            (AppContext::LowEnergyAudio, AppContext::ClassicMusic),
         ]
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_disconnect_of_active_returns_to_idle() {
      let h = spawn_node();
      connect(&h.node, 1, PHONE_A, Transport::Classic).await;
      stream_media(&h.node, 1).await;
      // Stale handle is ignored.
      h.node
         .report(AudioEvent::Media {
            handle: 0x99,
            playing: true,
         })
         .await
         .unwrap();
      h.node
         .report(AudioEvent::Disconnected { handle: 1 })
         .await
         .unwrap();
      settle().await;

      assert_eq!(h.node.active_device(), None);
      assert_eq!(h.node.app_context(), AppContext::Idle);
      let events = h.events.take();
      assert!(events.contains(&TwsEvent::ConnectionRemoved { addr: PHONE_A }));
      assert_eq!(
         switches(&events).last(),
         Some(&(AppContext::ClassicMusic, AppContext::Idle))
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_force_app_context() {
      let h = spawn_node();
      assert!(matches!(
         h.node.force_app_context(AppContext::ClassicCall).await,
         Err(TwsError::PolicyRejected(_))
      ));
      h.node
         .force_app_context(AppContext::Auxiliary)
         .await
         .unwrap();
      assert_eq!(h.node.app_context(), AppContext::Auxiliary);
   }

   #[tokio::test(start_paused = true)]
   async fn test_user_event_runs_on_both_nodes() {
      let (master, slave) = linked_pair().await;
      master
         .node
         .sync_user_event(7, vec![1, 2])
         .await
         .unwrap();
      time::sleep(Duration::from_millis(200)).await;

      let expected = TwsEvent::UserEvent {
         cmd: 7,
         payload: vec![1, 2],
      };
      assert!(master.events.take().contains(&expected));
      assert!(slave.events.take().contains(&expected));
   }

   #[tokio::test(start_paused = true)]
   async fn test_user_event_payload_limit() {
      let h = spawn_node();
      assert!(matches!(
         h.node.sync_user_event(1, vec![0; 25]).await,
         Err(TwsError::PayloadTooLong { len: 25, max: 24 })
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_pair_mode_acked_by_peer() {
      let (master, slave) = linked_pair().await;
      assert_eq!(master.node.enter_pair_mode().await.unwrap(), SyncOutcome::Acked);
      settle().await;

      assert!(master.audio.called("pair_mode"));
      assert!(slave.audio.called("pair_mode"));
      assert!(slave.events.take().contains(&TwsEvent::PairModeEntered));
   }

   #[tokio::test(start_paused = true)]
   async fn test_pair_mode_without_peer_is_local() {
      let h = spawn_node();
      assert_eq!(h.node.enter_pair_mode().await.unwrap(), SyncOutcome::Local);
      assert!(h.audio.called("pair_mode"));
   }

   #[tokio::test(start_paused = true)]
   async fn test_unanswered_clear_list_keeps_state() {
      let h = spawn_node();
      h.node.set_tws_role(TwsRole::Master, None).await.unwrap();
      let ((rx, tx), _silent_peer) = link::pair();
      h.node.attach_link(rx, tx).await;

      assert_eq!(
         h.node.clear_paired_list().await.unwrap(),
         SyncOutcome::TimedOut
      );
      assert!(!h.audio.called("clear_paired_list"));
   }

   #[tokio::test(start_paused = true)]
   async fn test_slave_binds_stashed_active_device() {
      let (master, slave) = linked_pair().await;
      connect(&master.node, 1, PHONE_A, Transport::Classic).await;
      stream_media(&master.node, 1).await;
      settle().await;
      assert_eq!(slave.node.active_device(), None);
      assert_eq!(slave.node.app_context(), AppContext::Idle);

      connect(&slave.node, 7, PHONE_A, Transport::Classic).await;
      settle().await;
      assert_eq!(slave.node.active_device(), Some(PHONE_A));
      assert_eq!(slave.node.app_context(), AppContext::ClassicMusic);
   }

   #[tokio::test(start_paused = true)]
   async fn test_phone_volume_applies_on_both_nodes() {
      let (master, slave) = linked_pair().await;
      connect(&slave.node, 3, PHONE_A, Transport::Classic).await;
      connect(&master.node, 1, PHONE_A, Transport::Classic).await;
      stream_media(&master.node, 1).await;
      settle().await;
      assert_eq!(slave.node.app_context(), AppContext::ClassicMusic);

      master
         .node
         .report(AudioEvent::Volume {
            handle: 1,
            stream: VolumeStream::Music,
            volume: 5,
            from_phone: true,
         })
         .await
         .unwrap();
      time::sleep(Duration::from_millis(100)).await;

      let expected = TwsEvent::VolumeChanged {
         addr: PHONE_A,
         stream: VolumeStream::Music,
         volume: 5,
      };
      assert!(master.events.take().contains(&expected));
      assert!(slave.events.take().contains(&expected));
   }

   #[tokio::test(start_paused = true)]
   async fn test_synchronized_power_off() {
      let (master, slave) = linked_pair().await;
      assert_eq!(
         master.node.request_power_off(false).await.unwrap(),
         PowerOffResult::Ok
      );
      time::sleep(Duration::from_millis(500)).await;

      assert!(master.audio.called("power_off_mode"));
      assert!(slave.audio.called("power_off_mode"));
      assert!(
         slave
            .events
            .take()
            .contains(&TwsEvent::PowerOffResult(PowerOffResult::RemoteOk))
      );
      assert!(!slave.node.is_power_off_in_progress());
      assert!(!master.node.is_power_off_in_progress());
   }

   #[tokio::test(start_paused = true)]
   async fn test_single_power_off_leaves_peer_running() {
      let (master, slave) = linked_pair().await;
      assert_eq!(
         master.node.request_power_off(true).await.unwrap(),
         PowerOffResult::Ok
      );
      time::sleep(Duration::from_millis(500)).await;

      assert!(slave.audio.called("reconnect"), "{:?}", slave.audio.calls());
      assert!(!slave.audio.called("power_off_mode"));
      assert!(
         !slave
            .events
            .take()
            .iter()
            .any(|e| matches!(e, TwsEvent::PowerOffResult(_)))
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_power_off_disconnects_phones() {
      let h = spawn_node();
      connect(&h.node, 1, PHONE_A, Transport::Classic).await;
      let node = h.node.clone();
      let result = tokio::spawn(async move { node.request_power_off(false).await });
      settle().await;
      assert!(h.node.is_power_off_in_progress());

      time::sleep(Duration::from_millis(150)).await;
      assert!(h.audio.called(&format!("disconnect {PHONE_A}")));
      h.node
         .report(AudioEvent::Disconnected { handle: 1 })
         .await
         .unwrap();

      assert_eq!(result.await.unwrap().unwrap(), PowerOffResult::Ok);
   }
}
