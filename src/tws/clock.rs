//! Shared radio clock estimate and tick-scheduled work.
//!
//! Ticks are milliseconds of the radio clock the two earbuds share. The
//! counter is 32 bits wide and wraps, so every comparison goes through
//! [`tick_reached`] instead of plain ordering.

use std::{
   sync::atomic::{AtomicU32, Ordering},
   time::Duration,
};

use tokio::time::Instant;

/// Radio clock tick in milliseconds.
pub type Tick = u32;

/// Source of the local estimate of the shared radio clock.
pub trait RadioClock: Send + Sync {
   fn now(&self) -> Tick;
}

/// Whether `now` has reached `target`, tolerating wrap-around.
pub const fn tick_reached(now: Tick, target: Tick) -> bool {
   (now.wrapping_sub(target) as i32) >= 0
}

/// Time left until `target`, zero once it has passed.
pub const fn ticks_until(now: Tick, target: Tick) -> u32 {
   if tick_reached(now, target) {
      0
   } else {
      target.wrapping_sub(now)
   }
}

/// Clock estimate built from the local monotonic clock plus an offset
/// reported by the radio whenever it re-aligns with the peer.
pub struct SystemClock {
   base: Instant,
   offset: AtomicU32,
}

impl SystemClock {
   pub fn new() -> Self {
      Self {
         base: Instant::now(),
         offset: AtomicU32::new(0),
      }
   }

   pub fn set_offset(&self, offset: u32) {
      self.offset.store(offset, Ordering::Release);
   }
}

impl Default for SystemClock {
   fn default() -> Self {
      Self::new()
   }
}

impl RadioClock for SystemClock {
   fn now(&self) -> Tick {
      let elapsed = self.base.elapsed().as_millis() as u32;
      elapsed.wrapping_add(self.offset.load(Ordering::Acquire))
   }
}

struct Entry<T> {
   target: Tick,
   seq: u64,
   item: T,
}

/// Work items waiting for a tick.
///
/// Only a handful of entries are ever pending, so a flat list scanned on
/// each wake keeps wrap-around handling simple.
pub struct Scheduler<T> {
   entries: Vec<Entry<T>>,
   seq: u64,
}

impl<T> Scheduler<T> {
   pub const fn new() -> Self {
      Self {
         entries: Vec::new(),
         seq: 0,
      }
   }

   /// Number of items still waiting for their tick.
   pub fn pending(&self) -> usize {
      self.entries.len()
   }

   pub fn schedule(&mut self, target: Tick, item: T) {
      self.seq += 1;
      self.entries.push(Entry {
         target,
         seq: self.seq,
         item,
      });
   }

   /// Removes and returns every item whose tick has been reached, oldest
   /// target first.
   pub fn drain_due(&mut self, now: Tick) -> Vec<T> {
      let mut due = Vec::new();
      let mut i = 0;
      while i < self.entries.len() {
         if tick_reached(now, self.entries[i].target) {
            due.push(self.entries.swap_remove(i));
         } else {
            i += 1;
         }
      }
      due.sort_by(|a, b| {
         let late_a = now.wrapping_sub(a.target);
         let late_b = now.wrapping_sub(b.target);
         late_b.cmp(&late_a).then(a.seq.cmp(&b.seq))
      });
      due.into_iter().map(|e| e.item).collect()
   }

   /// Delay until the earliest pending tick.
   pub fn next_delay(&self, now: Tick) -> Option<Duration> {
      self
         .entries
         .iter()
         .map(|e| ticks_until(now, e.target))
         .min()
         .map(|ms| Duration::from_millis(u64::from(ms)))
   }
}

impl<T> Default for Scheduler<T> {
   fn default() -> Self {
      Self::new()
   }
}

/// Key identifying one clock-scheduled action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionKey {
   pub subsystem: u8,
   pub command: u8,
   pub target: Tick,
}

const DEDUP_CAPACITY: usize = 16;

/// Suppresses retransmitted scheduled messages.
pub struct DedupWindow {
   seen: heapless::Deque<(ActionKey, Tick), DEDUP_CAPACITY>,
   window: u32,
}

impl DedupWindow {
   pub const fn new(window_ms: u32) -> Self {
      Self {
         seen: heapless::Deque::new(),
         window: window_ms,
      }
   }

   /// Records `key` at `now`. Returns `false` if it was already seen
   /// within the window.
   pub fn admit(&mut self, key: ActionKey, now: Tick) -> bool {
      while let Some((_, at)) = self.seen.front()
         && now.wrapping_sub(*at) > self.window
      {
         self.seen.pop_front();
      }

      if self.seen.iter().any(|(k, _)| *k == key) {
         return false;
      }
      if self.seen.is_full() {
         self.seen.pop_front();
      }
      let _ = self.seen.push_back((key, now));
      true
   }
}


#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_tick_reached_wraps() {
      assert!(tick_reached(10, 10));
      assert!(tick_reached(11, 10));
      assert!(!tick_reached(9, 10));
      assert!(tick_reached(5, u32::MAX - 5));
      assert!(!tick_reached(u32::MAX - 5, 5));
      assert_eq!(ticks_until(u32::MAX - 5, 5), 11);
      assert_eq!(ticks_until(20, 10), 0);
   }

   #[test]
   fn test_scheduler_orders_and_drains() {
      let mut sched = Scheduler::new();
      sched.schedule(300, "late");
      sched.schedule(100, "first");
      sched.schedule(100, "second");

      assert_eq!(sched.next_delay(50), Some(Duration::from_millis(50)));
      assert_eq!(sched.drain_due(99), Vec::<&str>::new());
      assert_eq!(sched.drain_due(150), vec!["first", "second"]);
      assert_eq!(sched.pending(), 1);
      assert_eq!(sched.drain_due(400), vec!["late"]);
      assert_eq!(sched.pending(), 0);
      assert_eq!(sched.next_delay(400), None);
   }

   #[test]
   fn test_past_target_is_due_immediately() {
      let mut sched = Scheduler::new();
      sched.schedule(10, 1u8);
      assert_eq!(sched.next_delay(500), Some(Duration::ZERO));
      assert_eq!(sched.drain_due(500), vec![1]);
   }

   #[test]
   fn test_scheduler_across_wrap() {
      let mut sched = Scheduler::new();
      let now = u32::MAX - 20;
      sched.schedule(now.wrapping_add(40), "after-wrap");
      assert!(sched.drain_due(now).is_empty());
      assert_eq!(sched.drain_due(now.wrapping_add(40)), vec!["after-wrap"]);
   }

   #[test]
   fn test_dedup_window() {
      let mut dedup = DedupWindow::new(500);
      let key = ActionKey {
         subsystem: 1,
         command: 5,
         target: 1000,
      };
      assert!(dedup.admit(key, 900));
      assert!(!dedup.admit(key, 950));
      assert!(dedup.admit(ActionKey { target: 1100, ..key }, 950));
      assert!(dedup.admit(key, 1500));
   }

   #[test]
   fn test_dedup_capacity_evicts_oldest() {
      let mut dedup = DedupWindow::new(10_000);
      for target in 0..=DEDUP_CAPACITY as u32 {
         let key = ActionKey {
            subsystem: 2,
            command: 1,
            target,
         };
         assert!(dedup.admit(key, 0));
      }
      let first = ActionKey {
         subsystem: 2,
         command: 1,
         target: 0,
      };
      assert!(dedup.admit(first, 0));
   }
}
