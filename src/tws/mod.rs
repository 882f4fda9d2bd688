//! Inter-node plumbing between the two earbuds of a pair.

pub mod clock;
pub mod link;
pub mod message;
pub mod sync;

use serde::{Deserialize, Serialize};

/// This node's place in the earbud pair.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum TwsRole {
   /// Not paired with another earbud.
   #[default]
   #[strum(serialize = "none")]
   None = 0,
   /// Talks to the phones and drives shared decisions.
   #[strum(serialize = "master")]
   Master = 1,
   /// Follows the master.
   #[strum(serialize = "slave")]
   Slave = 2,
}

impl TwsRole {
   pub const fn is_paired(self) -> bool {
      !matches!(self, Self::None)
   }
}
