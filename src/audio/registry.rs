//! Connection registry.
//!
//! Connections live in a generational slot arena so that an id captured
//! before a removal can never alias a newer connection that reused the
//! slot. Iteration follows insertion order, which is the tie-break order
//! arbitration relies on.

use bluer::Address;

use crate::{
   audio::connection::{Connection, Handle, LinkRole, Priority, Transport},
   error::{Result, TwsError},
};

/// Stable reference to a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
   index: u16,
   generation: u32,
}

struct Slot {
   generation: u32,
   entry: Option<Connection>,
}

pub struct Registry {
   slots: Vec<Slot>,
   order: Vec<ConnectionId>,
   capacity: usize,
}

impl Registry {
   pub fn new(capacity: usize) -> Self {
      Self {
         slots: Vec::with_capacity(capacity),
         order: Vec::with_capacity(capacity),
         capacity,
      }
   }

   pub fn add(
      &mut self,
      handle: Handle,
      addr: Address,
      transport: Transport,
      role: LinkRole,
      is_tws: bool,
   ) -> Result<ConnectionId> {
      if self.find_by_addr(addr).is_some() {
         return Err(TwsError::DuplicateAddress(addr));
      }
      if self.order.len() >= self.capacity {
         return Err(TwsError::RegistryFull);
      }

      let conn = Connection::new(handle, addr, transport, role, is_tws);
      let id = if let Some(index) = self.slots.iter().position(|s| s.entry.is_none()) {
         let slot = &mut self.slots[index];
         slot.generation = slot.generation.wrapping_add(1);
         slot.entry = Some(conn);
         ConnectionId {
            index: index as u16,
            generation: slot.generation,
         }
      } else {
         self.slots.push(Slot {
            generation: 0,
            entry: Some(conn),
         });
         ConnectionId {
            index: (self.slots.len() - 1) as u16,
            generation: 0,
         }
      };
      self.order.push(id);
      Ok(id)
   }

   /// Removes a connection. Removing an id that is already gone is a no-op.
   pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
      let slot = self.slots.get_mut(id.index as usize)?;
      if slot.generation != id.generation {
         return None;
      }
      let conn = slot.entry.take()?;
      self.order.retain(|o| *o != id);
      Some(conn)
   }

   pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
      let slot = self.slots.get(id.index as usize)?;
      if slot.generation != id.generation {
         return None;
      }
      slot.entry.as_ref()
   }

   pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
      let slot = self.slots.get_mut(id.index as usize)?;
      if slot.generation != id.generation {
         return None;
      }
      slot.entry.as_mut()
   }

   pub fn contains(&self, id: ConnectionId) -> bool {
      self.get(id).is_some()
   }

   pub fn find_by_handle(&self, handle: Handle) -> Option<ConnectionId> {
      self.iter().find(|(_, c)| c.handle == handle).map(|(id, _)| id)
   }

   pub fn find_by_addr(&self, addr: Address) -> Option<ConnectionId> {
      self.iter().find(|(_, c)| c.addr == addr).map(|(id, _)| id)
   }

   /// First connection on `transport` whose priority is at least `min`.
   pub fn find_by_priority(&self, transport: Transport, min: Priority) -> Option<ConnectionId> {
      self
         .iter()
         .find(|(_, c)| c.transport == transport && c.priority >= min)
         .map(|(id, _)| id)
   }

   /// Iterates live connections in insertion order.
   pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &Connection)> + '_ {
      self
         .order
         .iter()
         .filter_map(|&id| self.get(id).map(|c| (id, c)))
   }

   /// Number of phone-side connections (everything but the earbud link).
   pub fn phone_count(&self) -> usize {
      self.iter().filter(|(_, c)| !c.is_tws).count()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const PHONE_A: Address = Address([0xA0, 0, 0, 0, 0, 0x01]);
   const PHONE_B: Address = Address([0xB0, 0, 0, 0, 0, 0x02]);
   const PHONE_C: Address = Address([0xC0, 0, 0, 0, 0, 0x03]);

   fn add(reg: &mut Registry, handle: Handle, addr: Address) -> Result<ConnectionId> {
      reg.add(handle, addr, Transport::Classic, LinkRole::Slave, false)
   }

   #[test]
   fn test_add_lookup_remove() {
      let mut reg = Registry::new(4);
      let a = add(&mut reg, 1, PHONE_A).unwrap();
      let b = add(&mut reg, 2, PHONE_B).unwrap();

      assert_eq!(reg.find_by_handle(2), Some(b));
      assert_eq!(reg.find_by_addr(PHONE_A), Some(a));
      assert_eq!(reg.iter().count(), 2);

      assert_eq!(reg.remove(a).map(|c| c.addr), Some(PHONE_A));
      assert!(reg.remove(a).is_none());
      assert!(reg.get(a).is_none());
      assert_eq!(reg.find_by_handle(1), None);
   }

   #[test]
   fn test_duplicate_address_rejected() {
      let mut reg = Registry::new(4);
      add(&mut reg, 1, PHONE_A).unwrap();
      assert!(matches!(
         add(&mut reg, 2, PHONE_A),
         Err(TwsError::DuplicateAddress(addr)) if addr == PHONE_A
      ));
   }

   #[test]
   fn test_capacity() {
      let mut reg = Registry::new(2);
      add(&mut reg, 1, PHONE_A).unwrap();
      add(&mut reg, 2, PHONE_B).unwrap();
      assert!(matches!(add(&mut reg, 3, PHONE_C), Err(TwsError::RegistryFull)));
   }

   #[test]
   fn test_reused_slot_does_not_alias() {
      let mut reg = Registry::new(4);
      let a = add(&mut reg, 1, PHONE_A).unwrap();
      reg.remove(a);
      let b = add(&mut reg, 2, PHONE_B).unwrap();

      assert_ne!(a, b);
      assert!(reg.get(a).is_none());
      assert_eq!(reg.get(b).map(|c| c.addr), Some(PHONE_B));
   }

   #[test]
   fn test_insertion_order_survives_slot_reuse() {
      let mut reg = Registry::new(4);
      let a = add(&mut reg, 1, PHONE_A).unwrap();
      add(&mut reg, 2, PHONE_B).unwrap();
      reg.remove(a);
      add(&mut reg, 3, PHONE_C).unwrap();

      let order: Vec<_> = reg.iter().map(|(_, c)| c.addr).collect();
      assert_eq!(order, vec![PHONE_B, PHONE_C]);
   }

   #[test]
   fn test_find_by_priority() {
      let mut reg = Registry::new(4);
      let a = reg
         .add(1, PHONE_A, Transport::LowEnergy, LinkRole::Slave, false)
         .unwrap();
      let b = reg
         .add(2, PHONE_B, Transport::LowEnergy, LinkRole::Slave, false)
         .unwrap();
      reg.get_mut(a).unwrap().priority = Priority::MEDIA_PAUSED;
      reg.get_mut(b).unwrap().priority = Priority::CALL;

      assert_eq!(reg.find_by_priority(Transport::LowEnergy, Priority::MEDIA_PAUSED), Some(a));
      assert_eq!(reg.find_by_priority(Transport::LowEnergy, Priority::CALL), Some(b));
      assert_eq!(reg.find_by_priority(Transport::Classic, Priority::NONE), None);
   }
}
