//! Sync message framing and typed payloads.
//!
//! Short frame: `[subsystem][command][len][tick:u32 LE][payload ≤ 24]`.
//! Long frame: `[subsystem | 0x80][command][len:u16 LE][payload]`, always
//! immediate. A tick of zero means "apply on arrival".

use bluer::Address;
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
   audio::context::AppContext,
   tws::{clock::Tick, link::Packet},
   volume::VolumeStream,
};

pub const SHORT_HEADER_LEN: usize = 7;
pub const LONG_HEADER_LEN: usize = 4;
/// Largest payload that fits a short frame.
pub const MAX_SHORT_PAYLOAD: usize = 24;
pub const MAX_LONG_PAYLOAD: usize = u16::MAX as usize;

const LONG_FLAG: u8 = 0x80;
const NO_ADDRESS: Address = Address([0; 6]);

pub type Payload = SmallVec<[u8; MAX_SHORT_PAYLOAD]>;

/// Error type for sync frame decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
   #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
   TooShort { expected: usize, actual: usize },

   #[error("Frame length mismatch: header says {expected} payload bytes, got {actual}")]
   LengthMismatch { expected: usize, actual: usize },

   #[error("Unknown subsystem: 0x{0:02x}")]
   UnknownSubsystem(u8),

   #[error("Payload too long: {len} bytes (max {max})")]
   PayloadTooLong { len: usize, max: usize },

   #[error("Long frames cannot carry a target tick")]
   ScheduledLong,

   #[error("Invalid {field}: 0x{value:02x}")]
   InvalidField { field: &'static str, value: u8 },
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
pub enum Subsystem {
   /// Connection manager state and control.
   Manager = 0x01,
   /// Opaque application events.
   UserApp = 0x02,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
pub enum ManagerCommand {
   Reply = 0x01,
   EnterPairMode = 0x02,
   ClearPairedList = 0x03,
   PowerOff = 0x04,
   MusicVolume = 0x05,
   CallVolume = 0x06,
   LeAudioVolume = 0x07,
   PhoneInfo = 0x08,
   ActiveDevice = 0x09,
}

impl ManagerCommand {
   pub const fn volume(stream: VolumeStream) -> Self {
      match stream {
         VolumeStream::Music => Self::MusicVolume,
         VolumeStream::Call => Self::CallVolume,
         VolumeStream::LeAudio => Self::LeAudioVolume,
      }
   }

   pub const fn volume_stream(self) -> Option<VolumeStream> {
      match self {
         Self::MusicVolume => Some(VolumeStream::Music),
         Self::CallVolume => Some(VolumeStream::Call),
         Self::LeAudioVolume => Some(VolumeStream::LeAudio),
         _ => None,
      }
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
   pub subsystem: Subsystem,
   pub command: u8,
   /// Radio clock tick to execute at; zero for immediate.
   pub target: Tick,
   pub payload: Vec<u8>,
}

impl SyncMessage {
   pub fn new(subsystem: Subsystem, command: u8, payload: &[u8]) -> Self {
      Self {
         subsystem,
         command,
         target: 0,
         payload: payload.to_vec(),
      }
   }

   pub fn manager(command: ManagerCommand, payload: &[u8]) -> Self {
      Self::new(Subsystem::Manager, command as u8, payload)
   }

   #[must_use]
   pub const fn at(mut self, target: Tick) -> Self {
      self.target = target;
      self
   }

   pub const fn is_scheduled(&self) -> bool {
      self.target != 0
   }

   pub fn manager_command(&self) -> Option<ManagerCommand> {
      match self.subsystem {
         Subsystem::Manager => ManagerCommand::from_repr(self.command),
         Subsystem::UserApp => None,
      }
   }

   pub fn encode(&self) -> Result<Packet, WireError> {
      let len = self.payload.len();
      let mut out = Packet::new();
      if len <= MAX_SHORT_PAYLOAD {
         out.push(self.subsystem as u8);
         out.push(self.command);
         out.push(len as u8);
         out.extend_from_slice(&self.target.to_le_bytes());
      } else {
         if len > MAX_LONG_PAYLOAD {
            return Err(WireError::PayloadTooLong {
               len,
               max: MAX_LONG_PAYLOAD,
            });
         }
         if self.is_scheduled() {
            return Err(WireError::ScheduledLong);
         }
         out.push(self.subsystem as u8 | LONG_FLAG);
         out.push(self.command);
         out.extend_from_slice(&(len as u16).to_le_bytes());
      }
      out.extend_from_slice(&self.payload);
      Ok(out)
   }

   pub fn decode(data: &[u8]) -> Result<Self, WireError> {
      let Some(&tag) = data.first() else {
         return Err(WireError::TooShort {
            expected: LONG_HEADER_LEN,
            actual: 0,
         });
      };
      let long = tag & LONG_FLAG != 0;
      let subsystem =
         Subsystem::from_repr(tag & !LONG_FLAG).ok_or(WireError::UnknownSubsystem(tag))?;

      let header = if long {
         LONG_HEADER_LEN
      } else {
         SHORT_HEADER_LEN
      };
      if data.len() < header {
         return Err(WireError::TooShort {
            expected: header,
            actual: data.len(),
         });
      }

      let command = data[1];
      let (len, target) = if long {
         (usize::from(u16::from_le_bytes([data[2], data[3]])), 0)
      } else {
         (
            usize::from(data[2]),
            u32::from_le_bytes([data[3], data[4], data[5], data[6]]),
         )
      };
      if !long && len > MAX_SHORT_PAYLOAD {
         return Err(WireError::PayloadTooLong {
            len,
            max: MAX_SHORT_PAYLOAD,
         });
      }

      let payload = &data[header..];
      if payload.len() != len {
         return Err(WireError::LengthMismatch {
            expected: len,
            actual: payload.len(),
         });
      }

      Ok(Self {
         subsystem,
         command,
         target,
         payload: payload.to_vec(),
      })
   }
}

fn ensure_len(data: &[u8], expected: usize) -> Result<(), WireError> {
   if data.len() < expected {
      return Err(WireError::TooShort {
         expected,
         actual: data.len(),
      });
   }
   Ok(())
}

fn read_addr(bytes: &[u8]) -> Option<Address> {
   let mut raw = [0u8; 6];
   raw.copy_from_slice(&bytes[..6]);
   let addr = Address(raw);
   (addr != NO_ADDRESS).then_some(addr)
}

fn read_context(field: &'static str, value: u8) -> Result<AppContext, WireError> {
   AppContext::from_repr(value).ok_or(WireError::InvalidField { field, value })
}

/// Foreground pointers as seen by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveDeviceInfo {
   pub context: AppContext,
   pub forced: AppContext,
   pub active: Option<Address>,
   pub interrupted: Option<Address>,
}

impl ActiveDeviceInfo {
   const LEN: usize = 14;

   pub fn to_payload(&self) -> Payload {
      let mut out = Payload::new();
      out.push(self.context as u8);
      out.push(self.forced as u8);
      out.extend_from_slice(&self.active.unwrap_or(NO_ADDRESS).0);
      out.extend_from_slice(&self.interrupted.unwrap_or(NO_ADDRESS).0);
      out
   }

   pub fn parse(data: &[u8]) -> Result<Self, WireError> {
      ensure_len(data, Self::LEN)?;
      Ok(Self {
         context: read_context("context", data[0])?,
         forced: read_context("forced context", data[1])?,
         active: read_addr(&data[2..8]),
         interrupted: read_addr(&data[8..14]),
      })
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
   pub addr: Option<Address>,
   pub volume: u8,
   /// Set when the phone itself changed the volume.
   pub from_phone: bool,
}

impl VolumeInfo {
   const LEN: usize = 8;

   pub fn to_payload(&self) -> Payload {
      let mut out = Payload::new();
      out.extend_from_slice(&self.addr.unwrap_or(NO_ADDRESS).0);
      out.push(self.volume);
      out.push(u8::from(self.from_phone));
      out
   }

   pub fn parse(data: &[u8]) -> Result<Self, WireError> {
      ensure_len(data, Self::LEN)?;
      Ok(Self {
         addr: read_addr(&data[0..6]),
         volume: data[6],
         from_phone: data[7] != 0,
      })
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhoneInfo {
   pub addr: Address,
   pub playing: bool,
   pub music_volume: u8,
   pub call_volume: u8,
}

impl PhoneInfo {
   const LEN: usize = 9;

   pub fn to_payload(&self) -> Payload {
      let mut out = Payload::new();
      out.extend_from_slice(&self.addr.0);
      out.push(u8::from(self.playing));
      out.push(self.music_volume);
      out.push(self.call_volume);
      out
   }

   pub fn parse(data: &[u8]) -> Result<Self, WireError> {
      ensure_len(data, Self::LEN)?;
      let mut raw = [0u8; 6];
      raw.copy_from_slice(&data[0..6]);
      Ok(Self {
         addr: Address(raw),
         playing: data[6] != 0,
         music_volume: data[7],
         call_volume: data[8],
      })
   }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum PowerOffSignal {
   Request = 0x01,
   Ack = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerOffInfo {
   pub signal: PowerOffSignal,
   pub single: bool,
}

impl PowerOffInfo {
   pub fn to_payload(&self) -> Payload {
      SmallVec::from_slice(&[self.signal as u8, u8::from(self.single)])
   }

   pub fn parse(data: &[u8]) -> Result<Self, WireError> {
      ensure_len(data, 2)?;
      Ok(Self {
         signal: PowerOffSignal::from_repr(data[0]).ok_or(WireError::InvalidField {
            field: "power-off signal",
            value: data[0],
         })?,
         single: data[1] != 0,
      })
   }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum ReplyCode {
   Ack = 0x00,
   Nack = 0x01,
}

/// Answer to a command that expects acknowledgement. `seq` echoes the
/// first payload byte of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
   pub code: ReplyCode,
   pub command: ManagerCommand,
   pub seq: u8,
}

impl Reply {
   pub fn to_payload(&self) -> Payload {
      SmallVec::from_slice(&[self.code as u8, self.command as u8, self.seq])
   }

   pub fn parse(data: &[u8]) -> Result<Self, WireError> {
      ensure_len(data, 3)?;
      Ok(Self {
         code: ReplyCode::from_repr(data[0]).ok_or(WireError::InvalidField {
            field: "reply code",
            value: data[0],
         })?,
         command: ManagerCommand::from_repr(data[1]).ok_or(WireError::InvalidField {
            field: "replied command",
            value: data[1],
         })?,
         seq: data[2],
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const PHONE: Address = Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

   #[test]
   fn test_short_frame_layout() {
      let msg = SyncMessage::new(Subsystem::UserApp, 0x42, &[0xAA, 0xBB]).at(0x0102_0304);
      let frame = msg.encode().unwrap();
      assert_eq!(
         frame.as_slice(),
         &[0x02, 0x42, 0x02, 0x04, 0x03, 0x02, 0x01, 0xAA, 0xBB]
      );
      assert_eq!(SyncMessage::decode(&frame).unwrap(), msg);
   }

   #[test]
   fn test_long_frame_layout() {
      let payload = vec![7u8; 40];
      let msg = SyncMessage::new(Subsystem::UserApp, 0x10, &payload);
      let frame = msg.encode().unwrap();
      assert_eq!(&frame[..4], &[0x82, 0x10, 40, 0]);
      assert_eq!(frame.len(), LONG_HEADER_LEN + 40);

      let decoded = SyncMessage::decode(&frame).unwrap();
      assert_eq!(decoded.payload, payload);
      assert!(!decoded.is_scheduled());
   }

   #[test]
   fn test_long_frame_cannot_be_scheduled() {
      let msg = SyncMessage::new(Subsystem::UserApp, 1, &[0u8; 30]).at(500);
      assert_eq!(msg.encode(), Err(WireError::ScheduledLong));
   }

   #[test]
   fn test_decode_rejects_garbage() {
      assert!(matches!(
         SyncMessage::decode(&[]),
         Err(WireError::TooShort { .. })
      ));
      assert_eq!(
         SyncMessage::decode(&[0x09, 0, 0, 0, 0, 0, 0]),
         Err(WireError::UnknownSubsystem(0x09))
      );
      assert_eq!(
         SyncMessage::decode(&[0x01, 0x02, 3, 0, 0, 0, 0, 1]),
         Err(WireError::LengthMismatch {
            expected: 3,
            actual: 1
         })
      );
      assert!(matches!(
         SyncMessage::decode(&[0x01, 0x02, 30, 0, 0, 0, 0]),
         Err(WireError::PayloadTooLong { len: 30, .. })
      ));
   }

   #[test]
   fn test_active_device_payload() {
      let info = ActiveDeviceInfo {
         context: AppContext::ClassicCall,
         forced: AppContext::Idle,
         active: Some(PHONE),
         interrupted: None,
      };
      let bytes = info.to_payload();
      assert_eq!(bytes.len(), 14);
      assert_eq!(bytes[0], AppContext::ClassicCall as u8);
      assert_eq!(&bytes[8..], &[0; 6]);
      assert_eq!(ActiveDeviceInfo::parse(&bytes).unwrap(), info);

      let mut bad = bytes.clone();
      bad[0] = 0x77;
      assert!(matches!(
         ActiveDeviceInfo::parse(&bad),
         Err(WireError::InvalidField { field: "context", .. })
      ));
   }

   #[test]
   fn test_payload_parsers_check_length() {
      assert!(VolumeInfo::parse(&[0; 7]).is_err());
      assert!(PhoneInfo::parse(&[0; 8]).is_err());
      assert!(Reply::parse(&[0, 2]).is_err());
      assert!(PowerOffInfo::parse(&[3, 0]).is_err());
   }

   #[test]
   fn test_volume_command_mapping() {
      for stream in [VolumeStream::Music, VolumeStream::Call, VolumeStream::LeAudio] {
         assert_eq!(ManagerCommand::volume(stream).volume_stream(), Some(stream));
      }
      assert_eq!(ManagerCommand::PhoneInfo.volume_stream(), None);
   }
}
