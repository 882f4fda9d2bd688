//! TWS earbud coordination daemon
//!
//! Tracks the audio connections of one earbud, decides which phone owns
//! the foreground, and keeps that decision, volumes and power-down in
//! lockstep with the other earbud of the pair. Exposed on the session bus
//! as `org.twsd`.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use audio::service::BluezAudioService;
use dbus::NodeService;
use event::{EventBus, TwsEvent};
use node::Node;
use volume::{VolumeStore, Volumes};

mod adv;
mod audio;
mod config;
mod dbus;
mod error;
mod event;
mod node;
mod poweroff;
mod tws;
mod volume;

use crate::{dbus::NodeServiceSignals, error::Result};

const OBJECT_PATH: &str = "/org/twsd/node";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting twsd...");

   let config = config::Config::load()?;
   let peer = config.tws_peer_address();
   info!(
      "Loaded configuration (peer: {})",
      peer.map_or_else(|| "none".to_string(), |p| p.to_string())
   );

   let defaults = Volumes::new(config.default_music_volume, config.default_call_volume);
   let volumes = match VolumeStore::open(defaults) {
      Ok(store) => Some(store),
      Err(e) => {
         warn!("Volume store unavailable, volumes will not persist: {e}");
         None
      },
   };

   let session = bluer::Session::new().await?;
   let audio = BluezAudioService::new(&session, config.adapter.as_deref(), peer).await?;

   let event_bus = EventProcessor::new();
   let node = Node::spawn(&config, Arc::new(audio), volumes.clone(), event_bus.clone());

   let service = NodeService::new(node, volumes);
   let connection = connection::Builder::session()?
      .name("org.twsd")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("twsd started at org.twsd");

   event_bus.spawn_dispatcher(connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down twsd...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<TwsEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<TwsEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<NodeService>, event: TwsEvent) -> Result<()> {
      let or_empty = |a: Option<bluer::Address>| a.map(|a| a.to_string()).unwrap_or_default();
      match event {
         TwsEvent::ConnectionAdded { addr, transport } => {
            iface
               .connection_added(&addr.to_string(), transport.into())
               .await?;
         },
         TwsEvent::ConnectionRemoved { addr } => {
            iface.connection_removed(&addr.to_string()).await?;
         },
         TwsEvent::ActiveDeviceChanged {
            active,
            interrupted,
         } => {
            iface
               .active_device_changed(&or_empty(active), &or_empty(interrupted))
               .await?;
            let service = iface.get().await;
            service.active_address_changed(iface.signal_emitter()).await?;
            service
               .interrupted_address_changed(iface.signal_emitter())
               .await?;
         },
         TwsEvent::AppContextSwitched { from, to, launch } => {
            iface
               .app_context_switched(from.to_str(), to.to_str(), launch)
               .await?;
            iface
               .get()
               .await
               .app_context_changed(iface.signal_emitter())
               .await?;
         },
         TwsEvent::StreamChanged {
            addr,
            channel,
            state,
         } => {
            iface
               .stream_changed(&addr.to_string(), channel, state.into())
               .await?;
         },
         TwsEvent::VolumeChanged {
            addr,
            stream,
            volume,
         } => {
            iface
               .volume_changed(&addr.to_string(), stream.into(), volume)
               .await?;
         },
         TwsEvent::MediaStateChanged { addr, playing } => {
            iface
               .media_state_changed(&addr.to_string(), playing)
               .await?;
         },
         TwsEvent::CallStateChanged { addr, active } => {
            iface.call_state_changed(&addr.to_string(), active).await?;
         },
         TwsEvent::PowerOffResult(result) => {
            iface.power_off_result(result.into()).await?;
            iface
               .get()
               .await
               .power_off_in_progress_changed(iface.signal_emitter())
               .await?;
         },
         TwsEvent::PairModeEntered => {
            iface.pair_mode_entered().await?;
         },
         TwsEvent::PairedListCleared => {
            iface.paired_list_cleared().await?;
         },
         TwsEvent::UserEvent { cmd, payload } => {
            iface.user_event(cmd, &hex::encode(payload)).await?;
         },
         TwsEvent::AdvertisingChanged { from, to } => {
            iface.advertising_changed(from.into(), to.into()).await?;
         },
         TwsEvent::TwsLinkChanged { role, up } => {
            iface.tws_link_changed(role.into(), up).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, NodeService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: TwsEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
