//! Application contexts and the transition table between them.

use serde::{Deserialize, Serialize};

use crate::audio::connection::{Connection, Transport};

/// Which audio application owns the foreground.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum AppContext {
   #[default]
   #[strum(serialize = "idle")]
   Idle = 0,
   #[strum(serialize = "classic_call")]
   ClassicCall = 1,
   #[strum(serialize = "classic_music")]
   ClassicMusic = 2,
   #[strum(serialize = "le_audio")]
   LowEnergyAudio = 3,
   #[strum(serialize = "auxiliary")]
   Auxiliary = 4,
}

const CONTEXT_COUNT: usize = 5;

use AppContext::{Auxiliary, ClassicCall, ClassicMusic, Idle, LowEnergyAudio};

/// What a context change does to the foreground application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
   /// Start the application serving the new context.
   Launch,
   /// Record the new context and leave the running application in place.
   Keep,
}

use Transition::{Keep, Launch};

/// Transition table indexed by `[from][to]`; `None` is a no-op.
///
/// Dropping back to `Idle` never tears the current application down, it
/// only stops claiming the foreground for it.
const TRANSITIONS: [[Option<Transition>; CONTEXT_COUNT]; CONTEXT_COUNT] = [
   // from Idle
   [None, Some(Launch), Some(Launch), Some(Launch), Some(Launch)],
   // from ClassicCall
   [Some(Keep), None, Some(Launch), Some(Launch), Some(Launch)],
   // from ClassicMusic
   [Some(Keep), Some(Launch), None, Some(Launch), Some(Launch)],
   // from LowEnergyAudio
   [Some(Keep), Some(Launch), Some(Launch), None, Some(Launch)],
   // from Auxiliary
   [Some(Keep), Some(Launch), Some(Launch), Some(Launch), None],
];

impl AppContext {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   pub const fn is_call(self) -> bool {
      matches!(self, Self::ClassicCall)
   }

   /// Looks up the `from -> to` transition. `None` means nothing to do.
   pub const fn transition(from: Self, to: Self) -> Option<Transition> {
      TRANSITIONS[from as usize][to as usize]
   }

   /// Context implied by the foreground connection.
   pub fn for_connection(conn: Option<&Connection>) -> Self {
      let Some(conn) = conn else {
         return Self::Idle;
      };
      match conn.transport {
         Transport::Classic if conn.priority.has_call() => Self::ClassicCall,
         Transport::Classic => Self::ClassicMusic,
         Transport::LowEnergy => Self::LowEnergyAudio,
      }
   }

   /// Whether a connection on `transport` serves this context.
   pub const fn matches_transport(self, transport: Transport) -> bool {
      matches!(
         (self, transport),
         (Self::ClassicMusic | Self::ClassicCall, Transport::Classic)
            | (Self::LowEnergyAudio, Transport::LowEnergy)
      )
   }
}
