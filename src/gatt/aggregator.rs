//! Folds per-characteristic battery readings into a stable slot record.
//!
//! Notifications for different characteristics on the same device arrive
//! in arbitrary order and timing. The aggregator assigns each known
//! characteristic to one of three canonical slots and keeps that binding
//! for the lifetime of the connection, so the rendered record never
//! reorders under it.

use serde_json::json;
use smallvec::SmallVec;
use smol_str::SmolStr;

/// Classification of a battery characteristic, resolved once at scan time
/// from its presentation-format descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClass {
   Left,
   Right,
   /// The 0x0106 "main" description; single-battery devices and charging
   /// cases both report under it.
   Main,
   Unknown,
}

impl SlotClass {
   /// Derives the classification from a raw presentation-format
   /// descriptor value. The description field sits at bytes 5-6,
   /// little-endian.
   pub fn from_presentation_format(raw: &[u8]) -> Self {
      if raw.len() < 7 {
         return Self::Unknown;
      }
      match u16::from_le_bytes([raw[5], raw[6]]) {
         0x010D => Self::Left,
         0x010E => Self::Right,
         0x0106 => Self::Main,
         _ => Self::Unknown,
      }
   }
}

const SLOT_COUNT: usize = 3;

#[derive(Debug)]
struct Candidate {
   id: SmolStr,
   class: SlotClass,
   level: Option<u8>,
   slot: Option<usize>,
}

/// The three-slot output record. Absent slots are `None`, distinct from a
/// reading of zero, so consumers can tell "no data" from "empty battery".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CanonicalBatteryRecord {
   pub slot1: Option<u8>,
   pub slot2: Option<u8>,
   pub slot3: Option<u8>,
   /// Single representative level derived from the slots.
   pub computed: Option<u8>,
}

impl CanonicalBatteryRecord {
   pub fn to_json(self) -> serde_json::Value {
      json!({
          "slot1": self.slot1,
          "slot2": self.slot2,
          "slot3": self.slot3,
          "level": self.computed,
      })
   }
}

/// Per-device slot assignment state. Owned by the device's watcher and
/// only mutated from that watcher's own callbacks.
#[derive(Debug, Default)]
pub struct BatterySlotAggregator {
   // Discovery order, which doubles as the fallback fill order.
   candidates: SmallVec<[Candidate; SLOT_COUNT]>,
}

impl BatterySlotAggregator {
   pub fn new() -> Self {
      Self::default()
   }

   /// Registers a discovered characteristic. Re-registering a known id
   /// updates nothing; the classification resolves once, at scan time.
   pub fn register(&mut self, id: SmolStr, class: SlotClass) {
      if self.candidates.iter().any(|c| c.id == id) {
         return;
      }
      self.candidates.push(Candidate {
         id,
         class,
         level: None,
         slot: None,
      });
   }

   /// Records a new reading and returns the resulting record. Readings
   /// for unregistered ids are ignored.
   pub fn update(&mut self, id: &str, level: u8) -> CanonicalBatteryRecord {
      if let Some(candidate) = self.candidates.iter_mut().find(|c| c.id == id) {
         candidate.level = Some(level.min(100));
      }
      self.assign_slots();
      self.record()
   }

   /// Binds unbound candidates to free slots. Existing bindings are never
   /// moved: the record must not reorder once a slot is taken.
   fn assign_slots(&mut self) {
      let mut taken = [false; SLOT_COUNT];
      for candidate in &self.candidates {
         if let Some(slot) = candidate.slot {
            taken[slot] = true;
         }
      }

      // Reserved categories first: left (or a mono main via the fallback
      // below) anchors slot 1, right anchors slot 2.
      for (slot, class) in [(0, SlotClass::Left), (1, SlotClass::Right)] {
         if taken[slot] {
            continue;
         }
         if let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| c.slot.is_none() && c.class == class)
         {
            candidate.slot = Some(slot);
            taken[slot] = true;
         }
      }

      // Everything else fills the remaining slots in discovery order.
      for candidate in self.candidates.iter_mut().filter(|c| c.slot.is_none()) {
         let Some(slot) = taken.iter().position(|t| !t) else {
            break;
         };
         candidate.slot = Some(slot);
         taken[slot] = true;
      }
   }

   /// Builds the current record from the bound candidates.
   pub fn record(&self) -> CanonicalBatteryRecord {
      let mut slots = [None; SLOT_COUNT];
      for candidate in &self.candidates {
         if let (Some(slot), Some(level)) = (candidate.slot, candidate.level) {
            slots[slot] = Some(level);
         }
      }
      let computed = match (slots[0], slots[1]) {
         (Some(a), Some(b)) => Some(a.min(b)),
         (Some(a), None) => Some(a),
         (None, Some(b)) => Some(b),
         (None, None) => slots[2],
      };
      CanonicalBatteryRecord {
         slot1: slots[0],
         slot2: slots[1],
         slot3: slots[2],
         computed,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn agg(classes: &[SlotClass]) -> BatterySlotAggregator {
      let mut agg = BatterySlotAggregator::new();
      for (i, class) in classes.iter().enumerate() {
         agg.register(SmolStr::new(format!("char{i}")), *class);
      }
      agg
   }

   #[test]
   fn classifies_presentation_format() {
      let mut raw = [0u8; 7];
      for (code, expected) in [
         (0x010Du16, SlotClass::Left),
         (0x010E, SlotClass::Right),
         (0x0106, SlotClass::Main),
         (0x0000, SlotClass::Unknown),
         (0xBEEF, SlotClass::Unknown),
      ] {
         raw[5..7].copy_from_slice(&code.to_le_bytes());
         assert_eq!(SlotClass::from_presentation_format(&raw), expected);
      }
      assert_eq!(
         SlotClass::from_presentation_format(&[0x01, 0x0D]),
         SlotClass::Unknown,
         "short descriptor"
      );
   }

   #[test]
   fn left_right_case_bind_in_category_order() {
      let mut agg = agg(&[SlotClass::Left, SlotClass::Right, SlotClass::Main]);
      agg.update("char2", 90);
      agg.update("char0", 80);
      let record = agg.update("char1", 75);
      assert_eq!(record.slot1, Some(80));
      assert_eq!(record.slot2, Some(75));
      assert_eq!(record.slot3, Some(90));
      assert_eq!(record.computed, Some(75));
   }

   #[test]
   fn unknown_right_case_discovery_order() {
      // First-discovered unclassified characteristic takes slot 1 by
      // fallback; "right" anchors slot 2; the case fills slot 3.
      let mut agg = agg(&[SlotClass::Unknown, SlotClass::Right, SlotClass::Main]);
      agg.update("char0", 50);
      agg.update("char1", 60);
      let record = agg.update("char2", 70);
      assert_eq!(record.slot1, Some(50));
      assert_eq!(record.slot2, Some(60));
      assert_eq!(record.slot3, Some(70));
   }

   #[test]
   fn bindings_are_sticky() {
      let mut agg = agg(&[SlotClass::Unknown, SlotClass::Right]);
      agg.update("char0", 50);
      agg.update("char1", 60);

      // A left characteristic appearing later does not displace the
      // already-bound slot 1.
      agg.register(SmolStr::new("late"), SlotClass::Left);
      let record = agg.update("late", 99);
      assert_eq!(record.slot1, Some(50));
      assert_eq!(record.slot2, Some(60));
      assert_eq!(record.slot3, Some(99));
   }

   #[test]
   fn mono_device_fills_slot_one() {
      let mut agg = agg(&[SlotClass::Main]);
      let record = agg.update("char0", 42);
      assert_eq!(record.slot1, Some(42));
      assert_eq!(record.slot2, None);
      assert_eq!(record.slot3, None);
      assert_eq!(record.computed, Some(42));
   }

   #[test]
   fn absent_is_not_zero() {
      let mut agg = agg(&[SlotClass::Left, SlotClass::Right]);
      let record = agg.update("char0", 0);
      assert_eq!(record.slot1, Some(0));
      assert_eq!(record.slot2, None, "no reading yet stays absent");
      assert_eq!(record.computed, Some(0));
   }

   #[test]
   fn computed_is_worst_of_buds() {
      let mut agg = agg(&[SlotClass::Left, SlotClass::Right, SlotClass::Main]);
      agg.update("char0", 30);
      agg.update("char2", 100);
      let record = agg.update("char1", 80);
      assert_eq!(record.computed, Some(30), "case level does not mask buds");
   }

   #[test]
   fn arrival_order_does_not_matter() {
      let updates = [("char0", 10u8), ("char1", 20), ("char2", 30)];
      let mut records = Vec::new();
      for rotation in 0..updates.len() {
         let mut agg = agg(&[SlotClass::Left, SlotClass::Right, SlotClass::Main]);
         for i in 0..updates.len() {
            let (id, level) = updates[(rotation + i) % updates.len()];
            agg.update(id, level);
         }
         records.push(agg.record());
      }
      assert!(records.windows(2).all(|w| w[0] == w[1]));
   }

   #[test]
   fn duplicate_registration_is_ignored() {
      let mut agg = agg(&[SlotClass::Left]);
      agg.register(SmolStr::new("char0"), SlotClass::Right);
      let record = agg.update("char0", 55);
      assert_eq!(record.slot1, Some(55));
      assert_eq!(record.slot2, None);
   }

   #[test]
   fn unregistered_update_is_ignored() {
      let mut agg = agg(&[SlotClass::Left]);
      let record = agg.update("ghost", 55);
      assert_eq!(record, CanonicalBatteryRecord::default());
   }

   #[test]
   fn overflow_candidates_are_dropped() {
      let mut agg = agg(&[
         SlotClass::Unknown,
         SlotClass::Unknown,
         SlotClass::Unknown,
         SlotClass::Unknown,
      ]);
      for i in 0..4 {
         agg.update(&format!("char{i}"), 10 * (i as u8 + 1));
      }
      let record = agg.record();
      assert_eq!(record.slot1, Some(10));
      assert_eq!(record.slot2, Some(20));
      assert_eq!(record.slot3, Some(30));
   }
}
