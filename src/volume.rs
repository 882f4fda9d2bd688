//! Persisted per-phone volume levels using heed (LMDB).
//!
//! Only the last few phones are remembered. A phone that is not in the
//! table yet takes the tail slot, shifting the oldest entry out.

use std::{path::PathBuf, sync::Arc};

use bluer::Address;
use heed::{
   Database, Env, EnvOpenOptions,
   types::{SerdeBincode, Str},
};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TwsError};

/// Number of phones whose volume is remembered.
pub const MAX_SAVED_PHONES: usize = 3;

const TABLE_KEY: &str = "phones";

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum VolumeStream {
   #[strum(serialize = "music")]
   Music = 0,
   #[strum(serialize = "call")]
   Call = 1,
   #[strum(serialize = "le_audio")]
   LeAudio = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volumes {
   pub music: u8,
   pub call: u8,
   pub le_audio: u8,
}

impl Volumes {
   pub const fn new(music: u8, call: u8) -> Self {
      Self {
         music,
         call,
         le_audio: music,
      }
   }

   pub const fn get(&self, stream: VolumeStream) -> u8 {
      match stream {
         VolumeStream::Music => self.music,
         VolumeStream::Call => self.call,
         VolumeStream::LeAudio => self.le_audio,
      }
   }

   pub const fn set(&mut self, stream: VolumeStream, volume: u8) {
      match stream {
         VolumeStream::Music => self.music = volume,
         VolumeStream::Call => self.call = volume,
         VolumeStream::LeAudio => self.le_audio = volume,
      }
   }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
   addr: [u8; 6],
   volumes: Volumes,
}

#[derive(Debug)]
struct Db {
   env: Env,
   /// Single row holding the ordered table, oldest first.
   table: Database<Str, SerdeBincode<Vec<Entry>>>,
}

/// Thread-safe handle to the volume table.
#[derive(Clone, Debug)]
pub struct VolumeStore {
   db: Arc<Db>,
   defaults: Volumes,
}

impl VolumeStore {
   /// Opens or creates the store at its default location.
   pub fn open(defaults: Volumes) -> Result<Self> {
      Self::open_at(Self::db_path()?, defaults)
   }

   pub fn open_at(path: PathBuf, defaults: Volumes) -> Result<Self> {
      std::fs::create_dir_all(&path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(1024 * 1024)
            .max_dbs(1)
            .open(&path)?
      };

      let mut wtxn = env.write_txn()?;
      let table = env.create_database(&mut wtxn, Some("volumes"))?;
      wtxn.commit()?;

      Ok(Self {
         db: Arc::new(Db { env, table }),
         defaults,
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("TWSD_VOLUME_DB") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/twsd/volumes.db
      let base = dirs::data_local_dir().ok_or(TwsError::DataDirNotFound)?;
      Ok(base.join("twsd").join("volumes.db"))
   }

   fn load(&self) -> Result<Vec<Entry>> {
      let rtxn = self.db.env.read_txn()?;
      Ok(self.db.table.get(&rtxn, TABLE_KEY)?.unwrap_or_default())
   }

   /// Saved volumes for `addr`, or the configured defaults.
   pub fn volumes(&self, addr: Address) -> Result<Volumes> {
      Ok(self
         .load()?
         .into_iter()
         .find(|e| e.addr == addr.0)
         .map_or(self.defaults, |e| e.volumes))
   }

   /// Stores a volume, returning whether anything changed.
   pub fn save(&self, addr: Address, stream: VolumeStream, volume: u8) -> Result<bool> {
      let mut wtxn = self.db.env.write_txn()?;
      let mut entries = self.db.table.get(&wtxn, TABLE_KEY)?.unwrap_or_default();

      if let Some(entry) = entries.iter_mut().find(|e| e.addr == addr.0) {
         if entry.volumes.get(stream) == volume {
            return Ok(false);
         }
         entry.volumes.set(stream, volume);
      } else {
         if entries.len() >= MAX_SAVED_PHONES {
            let evicted = entries.remove(0);
            debug!("Forgetting volume of {}", Address(evicted.addr));
         }
         let mut volumes = self.defaults;
         volumes.set(stream, volume);
         entries.push(Entry {
            addr: addr.0,
            volumes,
         });
      }

      self.db.table.put(&mut wtxn, TABLE_KEY, &entries)?;
      wtxn.commit()?;
      debug!("Saved {stream} volume {volume} for {addr}");
      Ok(true)
   }

   /// Remembered phones, oldest first.
   pub fn phones(&self) -> Result<Vec<Address>> {
      Ok(self.load()?.into_iter().map(|e| Address(e.addr)).collect())
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;

   const PHONES: [Address; 4] = [
      Address([0xAA, 0, 0, 0, 0, 1]),
      Address([0xAA, 0, 0, 0, 0, 2]),
      Address([0xAA, 0, 0, 0, 0, 3]),
      Address([0xAA, 0, 0, 0, 0, 4]),
   ];

   fn create_test_store() -> Result<(VolumeStore, TempDir)> {
      let temp_dir = TempDir::new().unwrap();
      let store = VolumeStore::open_at(temp_dir.path().join("volumes.db"), Volumes::new(12, 10))?;
      Ok((store, temp_dir))
   }

   #[test]
   fn test_unknown_phone_gets_defaults() -> Result<()> {
      let (store, _dir) = create_test_store()?;
      assert_eq!(store.volumes(PHONES[0])?, Volumes::new(12, 10));
      Ok(())
   }

   #[test]
   fn test_save_and_read_back() -> Result<()> {
      let (store, _dir) = create_test_store()?;
      assert!(store.save(PHONES[0], VolumeStream::Call, 5)?);
      assert!(!store.save(PHONES[0], VolumeStream::Call, 5)?);

      let volumes = store.volumes(PHONES[0])?;
      assert_eq!(volumes.call, 5);
      assert_eq!(volumes.music, 12);
      Ok(())
   }

   #[test]
   fn test_oldest_phone_is_evicted() -> Result<()> {
      let (store, _dir) = create_test_store()?;
      for (i, phone) in PHONES.iter().enumerate() {
         store.save(*phone, VolumeStream::Music, i as u8)?;
      }

      assert_eq!(store.phones()?, PHONES[1..].to_vec());
      assert_eq!(store.volumes(PHONES[0])?, Volumes::new(12, 10));
      assert_eq!(store.volumes(PHONES[3])?.music, 3);
      Ok(())
   }

   #[test]
   fn test_survives_reopen() -> Result<()> {
      let temp_dir = TempDir::new().unwrap();
      let path = temp_dir.path().join("volumes.db");
      {
         let store = VolumeStore::open_at(path.clone(), Volumes::new(12, 12))?;
         store.save(PHONES[2], VolumeStream::LeAudio, 7)?;
      }
      let store = VolumeStore::open_at(path, Volumes::new(12, 12))?;
      assert_eq!(store.volumes(PHONES[2])?.le_audio, 7);
      Ok(())
   }
}
