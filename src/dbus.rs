use std::{collections::HashMap, fmt::Display, str::FromStr};

use bluer::Address;
use log::{info, warn};
use zbus::{interface, object_server::SignalEmitter, zvariant};

use crate::{
   adv::{AdvKind, BeaconState},
   audio::{
      AudioEvent,
      connection::{AudioContexts, ChannelConfig, ChannelEvent, Direction, LinkRole, Transport},
      context::AppContext,
   },
   node::Node,
   tws::TwsRole,
   volume::{VolumeStore, VolumeStream},
};

pub struct NodeService {
   node: Node,
   volumes: Option<VolumeStore>,
}

impl NodeService {
   pub const fn new(node: Node, volumes: Option<VolumeStore>) -> Self {
      Self { node, volumes }
   }

   async fn report(&self, event: AudioEvent) -> zbus::fdo::Result<bool> {
      self.node.report(event).await.map_err(failed)?;
      Ok(true)
   }
}

fn failed(e: impl Display) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn parse<T>(what: &str, value: &str) -> zbus::fdo::Result<T>
where
   T: FromStr,
   T::Err: Display,
{
   T::from_str(value)
      .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("Invalid {what} {value:?}: {e}")))
}

fn param<'a: 'v, 'v, T>(
   params: &'a HashMap<String, zvariant::Value<'v>>,
   key: &str,
) -> zbus::fdo::Result<T>
where
   T: TryFrom<&'a zvariant::Value<'v>>,
   <T as TryFrom<&'a zvariant::Value<'v>>>::Error: Into<zvariant::Error>,
{
   params
      .get(key)
      .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Missing '{key}' parameter")))?
      .downcast_ref::<T>()
      .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("Invalid '{key}' parameter: {e}")))
}

fn addr_str(addr: Option<Address>) -> String {
   addr.map(|a| a.to_string()).unwrap_or_default()
}

#[interface(name = "org.twsd.Node")]
impl NodeService {
   async fn get_active_device(&self) -> String {
      self.node.foreground_json().to_string()
   }

   async fn get_app_context(&self) -> String {
      self.node.app_context().to_string()
   }

   async fn get_connections(&self) -> String {
      self.node.connections_json().to_string()
   }

   /// Phone currently in a call on `transport`, or an empty string.
   async fn get_call_device(&self, transport: String) -> zbus::fdo::Result<String> {
      let transport: Transport = parse("transport", &transport)?;
      Ok(addr_str(self.node.call_device(transport)))
   }

   async fn get_saved_volumes(&self) -> zbus::fdo::Result<String> {
      let Some(store) = &self.volumes else {
         return Ok("[]".into());
      };
      let mut saved = Vec::new();
      for addr in store.phones().map_err(failed)? {
         let volumes = store.volumes(addr).map_err(failed)?;
         saved.push(serde_json::json!({
            "address": addr.to_string(),
            "volumes": volumes,
         }));
      }
      Ok(serde_json::Value::Array(saved).to_string())
   }

   async fn force_app_context(&self, context: String) -> zbus::fdo::Result<bool> {
      let ctx: AppContext = parse("application context", &context)?;
      self.node.force_app_context(ctx).await.map_err(failed)?;
      info!("Forced application context: {ctx}");
      Ok(true)
   }

   async fn request_power_off(&self, single: bool) -> zbus::fdo::Result<String> {
      let result = self.node.request_power_off(single).await.map_err(failed)?;
      if result.is_timed_out() {
         warn!("Power-off completed with a timeout: {result}");
      }
      Ok(result.to_string())
   }

   async fn is_power_off_in_progress(&self) -> bool {
      self.node.is_power_off_in_progress()
   }

   async fn enter_pair_mode(&self) -> zbus::fdo::Result<String> {
      let outcome = self.node.enter_pair_mode().await.map_err(failed)?;
      Ok(outcome.to_string())
   }

   async fn clear_paired_list(&self) -> zbus::fdo::Result<String> {
      let outcome = self.node.clear_paired_list().await.map_err(failed)?;
      Ok(outcome.to_string())
   }

   /// Schedules an application event on both earbuds. Returns the tick.
   async fn sync_user_event(&self, cmd: u8, payload: String) -> zbus::fdo::Result<u32> {
      let payload =
         hex::decode(payload).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      self
         .node
         .sync_user_event(cmd, payload)
         .await
         .map_err(failed)
   }

   // Reports from the audio service

   async fn report_connection(
      &self,
      handle: u16,
      address: String,
      transport: String,
      role: String,
      tws: bool,
   ) -> zbus::fdo::Result<bool> {
      let event = AudioEvent::Connected {
         handle,
         addr: parse_address(&address)?,
         transport: parse("transport", &transport)?,
         role: parse::<LinkRole>("link role", &role)?,
         is_tws: tws,
      };
      self.report(event).await
   }

   async fn report_disconnection(&self, handle: u16) -> zbus::fdo::Result<bool> {
      self.report(AudioEvent::Disconnected { handle }).await
   }

   async fn report_channel(
      &self,
      handle: u16,
      channel: u8,
      action: String,
      params: HashMap<String, zvariant::Value<'_>>,
   ) -> zbus::fdo::Result<bool> {
      let id = channel;
      let event = match action.as_str() {
         "configure" => {
            let direction: String = param(&params, "direction")?;
            ChannelEvent::Configure {
               id,
               direction: parse::<Direction>("direction", &direction)?,
               config: ChannelConfig {
                  codec: param(&params, "codec")?,
                  sample_rate: param(&params, "sample_rate")?,
                  interval_us: param(&params, "interval_us")?,
               },
            }
         },
         "enable" => ChannelEvent::Enable {
            id,
            contexts: AudioContexts::from_bits(param(&params, "contexts")?),
         },
         "update" => ChannelEvent::Update {
            id,
            contexts: AudioContexts::from_bits(param(&params, "contexts")?),
         },
         "start" => ChannelEvent::Start { id },
         "stop" => ChannelEvent::Stop { id },
         "disable" => ChannelEvent::Disable { id },
         "release" => ChannelEvent::Release { id },
         _ => {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
               "Unknown channel action: {action}"
            )));
         },
      };
      self.report(AudioEvent::Channel { handle, event }).await
   }

   async fn report_media_state(&self, handle: u16, playing: bool) -> zbus::fdo::Result<bool> {
      self.report(AudioEvent::Media { handle, playing }).await
   }

   async fn report_call_state(&self, handle: u16, active: bool) -> zbus::fdo::Result<bool> {
      self.report(AudioEvent::Call { handle, active }).await
   }

   async fn report_volume(
      &self,
      handle: u16,
      stream: String,
      volume: u8,
      from_phone: bool,
   ) -> zbus::fdo::Result<bool> {
      let stream: VolumeStream = parse("volume stream", &stream)?;
      self
         .report(AudioEvent::Volume {
            handle,
            stream,
            volume,
            from_phone,
         })
         .await
   }

   async fn report_connecting(&self, connecting: bool) -> zbus::fdo::Result<bool> {
      self.report(AudioEvent::Connecting(connecting)).await
   }

   async fn report_advertising(
      &self,
      kind: String,
      enabled: bool,
      update_pending: bool,
   ) -> zbus::fdo::Result<bool> {
      let kind: AdvKind = parse("beacon kind", &kind)?;
      let state = BeaconState {
         enabled,
         update_pending,
      };
      self.report(AudioEvent::Advertising(kind, state)).await
   }

   /// An empty `peer` keeps the configured peer address.
   async fn set_tws_role(&self, role: String, peer: String) -> zbus::fdo::Result<bool> {
      let role: TwsRole = parse("role", &role)?;
      let peer = if peer.is_empty() {
         None
      } else {
         Some(parse_address(&peer)?)
      };
      self.node.set_tws_role(role, peer).await.map_err(failed)?;
      Ok(true)
   }

   async fn set_clock_offset(&self, offset: u32) -> bool {
      self.node.set_clock_offset(offset);
      true
   }

   // Signals
   #[zbus(signal)]
   pub async fn connection_added(
      emitter: &SignalEmitter<'_>,
      address: &str,
      transport: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_removed(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn active_device_changed(
      emitter: &SignalEmitter<'_>,
      active: &str,
      interrupted: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn app_context_switched(
      emitter: &SignalEmitter<'_>,
      from: &str,
      to: &str,
      launch: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn stream_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      channel: u8,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn volume_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      stream: &str,
      volume: u8,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn media_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      playing: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn call_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      active: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn power_off_result(emitter: &SignalEmitter<'_>, result: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn pair_mode_entered(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn paired_list_cleared(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn user_event(emitter: &SignalEmitter<'_>, cmd: u8, payload: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn advertising_changed(
      emitter: &SignalEmitter<'_>,
      from: &str,
      to: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn tws_link_changed(
      emitter: &SignalEmitter<'_>,
      role: &str,
      up: bool,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn active_address(&self) -> String {
      addr_str(self.node.active_device())
   }

   #[zbus(property)]
   async fn interrupted_address(&self) -> String {
      addr_str(self.node.interrupted_device())
   }

   #[zbus(property)]
   async fn app_context(&self) -> String {
      self.node.app_context().to_string()
   }

   #[zbus(property)]
   async fn power_off_in_progress(&self) -> bool {
      self.node.is_power_off_in_progress()
   }
}
