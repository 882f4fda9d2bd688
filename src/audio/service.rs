//! Outbound boundary to the Bluetooth stack.
//!
//! The node never blocks on the radio. Every call here is a request that
//! the implementation carries out in the background; results come back as
//! [`AudioEvent`](crate::audio::AudioEvent) reports.

use std::{collections::BTreeSet, sync::Arc};

use bluer::{
   Adapter, Address,
   adv::{Advertisement, AdvertisementHandle, Type},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{adv::AdvKind, error::Result};

/// Published Audio Capabilities service, announced by LE audio sinks.
const PACS_UUID: Uuid = Uuid::from_u128(0x0000_1850_0000_1000_8000_0080_5f9b_34fb);
/// Fast pair service used by the plain BLE beacon.
const FAST_PAIR_UUID: Uuid = Uuid::from_u128(0x0000_fe2c_0000_1000_8000_0080_5f9b_34fb);

pub trait AudioService: Send + Sync {
   fn disconnect(&self, addr: Address);
   /// Non-discoverable, non-connectable, no automatic reconnect.
   fn enter_power_off_mode(&self);
   /// Reconnect the most recent phones after the peer went away alone.
   fn reconnect_phones(&self);
   fn enter_pair_mode(&self);
   fn clear_paired_list(&self);
   fn set_advertising(&self, kind: AdvKind, enable: bool);
}

struct Inner {
   adapter: Adapter,
   name: SmolStr,
   /// Name put in beacons.
   alias: SmolStr,
   tws_peer: Option<Address>,
   beacon: Mutex<Option<(AdvKind, AdvertisementHandle)>>,
}

/// [`AudioService`] backed by BlueZ.
#[derive(Clone)]
pub struct BluezAudioService {
   inner: Arc<Inner>,
}

impl BluezAudioService {
   pub async fn new(session: &bluer::Session, adapter: Option<&str>, tws_peer: Option<Address>) -> Result<Self> {
      let adapter = match adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      let name = SmolStr::new(adapter.name());

      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {name}");
      }
      let alias = SmolStr::new(adapter.alias().await?);
      info!("Using adapter {name} ({alias}, {})", adapter.address().await?);

      Ok(Self {
         inner: Arc::new(Inner {
            adapter,
            name,
            alias,
            tws_peer,
            beacon: Mutex::new(None),
         }),
      })
   }

   /// Paired devices other than the earbud peer.
   async fn paired_phones(inner: &Inner) -> Result<Vec<Address>> {
      let mut phones = Vec::new();
      for addr in inner.adapter.device_addresses().await? {
         if Some(addr) == inner.tws_peer {
            continue;
         }
         if inner.adapter.device(addr)?.is_paired().await? {
            phones.push(addr);
         }
      }
      Ok(phones)
   }

   fn spawn<F>(&self, what: &'static str, f: impl FnOnce(Arc<Inner>) -> F)
   where
      F: Future<Output = Result<()>> + Send + 'static,
   {
      let fut = f(self.inner.clone());
      let name = self.inner.name.clone();
      tokio::spawn(async move {
         if let Err(e) = fut.await {
            warn!("{name}: {what} failed: {e}");
         }
      });
   }
}

impl AudioService for BluezAudioService {
   fn disconnect(&self, addr: Address) {
      self.spawn("disconnect", move |inner| async move {
         debug!("Disconnecting {addr}");
         inner.adapter.device(addr)?.disconnect().await?;
         Ok(())
      });
   }

   fn enter_power_off_mode(&self) {
      self.inner.beacon.lock().take();
      self.spawn("power-off mode", |inner| async move {
         inner.adapter.set_discoverable(false).await?;
         inner.adapter.set_pairable(false).await?;
         Ok(())
      });
   }

   fn reconnect_phones(&self) {
      self.spawn("reconnect", |inner| async move {
         for addr in Self::paired_phones(&inner).await? {
            let device = inner.adapter.device(addr)?;
            if device.is_connected().await? {
               continue;
            }
            info!("Reconnecting {addr}");
            if let Err(e) = device.connect().await {
               debug!("Reconnect to {addr} failed: {e}");
            }
         }
         Ok(())
      });
   }

   fn enter_pair_mode(&self) {
      self.spawn("pair mode", |inner| async move {
         inner.adapter.set_pairable(true).await?;
         inner.adapter.set_discoverable(true).await?;
         info!("{}: discoverable for pairing", inner.name);
         Ok(())
      });
   }

   fn clear_paired_list(&self) {
      self.spawn("clear paired list", |inner| async move {
         for addr in Self::paired_phones(&inner).await? {
            info!("Forgetting {addr}");
            inner.adapter.remove_device(addr).await?;
         }
         Ok(())
      });
   }

   fn set_advertising(&self, kind: AdvKind, enable: bool) {
      if !enable {
         let mut beacon = self.inner.beacon.lock();
         if beacon.as_ref().is_some_and(|(k, _)| *k == kind) {
            // Dropping the handle unregisters the advertisement.
            beacon.take();
         }
         return;
      }
      let uuid = match kind {
         AdvKind::None => return,
         AdvKind::Ble => FAST_PAIR_UUID,
         AdvKind::LeAudio => PACS_UUID,
      };
      self.spawn("advertise", move |inner| async move {
         let adv = Advertisement {
            advertisement_type: Type::Peripheral,
            service_uuids: BTreeSet::from([uuid]),
            discoverable: Some(true),
            local_name: Some(inner.alias.to_string()),
            ..Default::default()
         };
         let handle = inner.adapter.advertise(adv).await?;
         debug!("Advertising {kind} beacon");
         *inner.beacon.lock() = Some((kind, handle));
         Ok(())
      });
   }
}
