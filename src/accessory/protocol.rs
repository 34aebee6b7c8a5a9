//! Accessory protocol definitions and data structures.
//!
//! This module contains the wire constants, typed control commands, and
//! the battery/ear-detection data model for the proprietary accessory
//! protocol spoken over the RFCOMM stream. Encoding lives here; the
//! decoding half is in [`crate::accessory::parser`].

use std::{fmt, num::NonZeroU8, str::FromStr, sync::LazyLock};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{accessory::capability::CapabilityProfile, bluetooth::transport::Packet};

/// Session-establishment packet, sent first on every new stream.
pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Steady-state notification request, sent after the feature selection.
pub const PKT_REQUEST_NOTIFY: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x0f, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff,
];

// Inbound frame signatures, matched as fixed byte prefixes.
pub const HDR_ACK_HANDSHAKE: &[u8] = b"\x01\x00\x04\x00";
pub const HDR_ACK_FEATURES: &[u8] = b"\x04\x00\x04\x00\x2b";
pub const HDR_BATTERY_STATE: &[u8] = b"\x04\x00\x04\x00\x04\x00";
pub const HDR_EAR_DETECTION: &[u8] = b"\x04\x00\x04\x00\x06\x00";
pub const HDR_AWARENESS: &[u8] = b"\x04\x00\x04\x00\x4b\x00\x02\x00\x01";
pub const HDR_CMD_CTL: &[u8] = b"\x04\x00\x04\x00\x09\x00";

/// Prefix of the feature-select packet; capability flags fill the payload.
const HDR_SET_FEATURES: &[u8] = b"\x04\x00\x04\x00\x4d\x00";

/// Physical components reporting battery state.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
pub enum Component {
   Headphone = 0x01,
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

/// Charge state reported per component.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[repr(u8)]
pub enum BatteryStatus {
   Normal = 0x00,
   Charging = 0x01,
   Discharging = 0x02,
   Disconnected = 0x04,
}

/// Noise control modes. Wire indices are model-dependent and resolved
/// through [`crate::accessory::capability::NoiseModeMap`].
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum NoiseControlMode {
   #[strum(serialize = "off")]
   Off,
   #[strum(serialize = "transparency", serialize = "trans")]
   Transparency,
   #[strum(serialize = "anc", serialize = "nc")]
   Anc,
   #[strum(serialize = "adaptive", serialize = "adapt")]
   Adaptive,
}

impl NoiseControlMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

pub const KNOWN_FEATURES: &[(u8, &str)] = &[
   (FeatureId::NOISE_CONTROL.id(), "noise_control"),
   (FeatureId::PRESS_SPEED.id(), "press_speed"),
   (FeatureId::PRESS_DURATION.id(), "press_duration"),
   (FeatureId::LONG_PRESS_CYCLE.id(), "long_press_cycle"),
   (FeatureId::TONE_VOLUME.id(), "tone_volume"),
   (FeatureId::VOLUME_SWIPE_LENGTH.id(), "volume_swipe_length"),
   (FeatureId::VOLUME_SWIPE.id(), "volume_swipe"),
   (FeatureId::ADAPTIVE_VOLUME.id(), "adaptive_volume"),
   (FeatureId::CONVERSATION_AWARENESS.id(), "conversation_awareness"),
];

/// Opcode byte of a control-set frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct FeatureId(u8);

impl FromStr for FeatureId {
   type Err = strum::ParseError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      for (repr, name) in KNOWN_FEATURES {
         if name.eq_ignore_ascii_case(s) {
            return Ok(Self(*repr));
         }
      }
      Err(strum::ParseError::VariantNotFound)
   }
}

static U8_TO_HEX: LazyLock<[[u8; 2]; 256]> = LazyLock::new(|| {
   let mut table = [[0u8; 2]; 256];
   for i in 0..=255u8 {
      const fn nibble_to_hex(n: u8) -> u8 {
         if n < 10 { n + b'0' } else { n - 10 + b'a' }
      }
      table[i as usize] = [nibble_to_hex(i >> 4), nibble_to_hex(i & 0x0f)];
   }
   table
});

impl FeatureId {
   pub const NOISE_CONTROL: Self = Self(0x0D);
   pub const PRESS_SPEED: Self = Self(0x17);
   pub const PRESS_DURATION: Self = Self(0x18);
   pub const LONG_PRESS_CYCLE: Self = Self(0x1A);
   pub const TONE_VOLUME: Self = Self(0x1F);
   pub const VOLUME_SWIPE_LENGTH: Self = Self(0x23);
   pub const VOLUME_SWIPE: Self = Self(0x25);
   pub const ADAPTIVE_VOLUME: Self = Self(0x26);
   pub const CONVERSATION_AWARENESS: Self = Self(0x28);

   pub const fn from_id(repr: u8) -> Self {
      Self(repr)
   }

   pub const fn id(self) -> u8 {
      self.0
   }

   pub fn try_to_str(self) -> Option<&'static str> {
      let Ok(i) = KNOWN_FEATURES.binary_search_by_key(&self.0, |(repr, _)| *repr) else {
         return None;
      };
      let (_, name) = KNOWN_FEATURES[i];
      Some(name)
   }

   pub fn to_str(self) -> &'static str {
      if let Some(name) = self.try_to_str() {
         name
      } else {
         let bytes = &U8_TO_HEX[self.0 as usize];
         str::from_utf8(bytes).unwrap_or("??")
      }
   }
}

impl fmt::Display for FeatureId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.to_str())
   }
}

/// Battery state for a single component. Level 0 means "no valid reading".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
   pub level: u8,
   pub status: BatteryStatus,
}

impl BatteryState {
   pub const fn new() -> Self {
      Self {
         level: 0,
         status: BatteryStatus::Disconnected,
      }
   }

   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }

   pub fn is_valid(&self) -> bool {
      self.level > 0 && self.status != BatteryStatus::Disconnected
   }

   pub fn is_available(&self) -> bool {
      self.status != BatteryStatus::Disconnected
   }
}

impl Default for BatteryState {
   fn default() -> Self {
      Self::new()
   }
}

/// Complete battery information across all components of an accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatteryInfo {
   pub left: BatteryState,
   pub right: BatteryState,
   pub case: BatteryState,
   pub headphone: BatteryState,
}

impl BatteryInfo {
   pub const fn new() -> Self {
      Self {
         left: BatteryState::new(),
         right: BatteryState::new(),
         case: BatteryState::new(),
         headphone: BatteryState::new(),
      }
   }

   /// Representative single level for a two-bud accessory, reduced from
   /// the left/right pair; single-piece devices report the headphone
   /// component directly.
   pub fn representative_level(&self, single_piece: bool) -> u8 {
      if single_piece {
         self.headphone.level
      } else {
         reduce_pair(self.left, self.right)
      }
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_level": u32::from(self.left.level),
          "right_level": u32::from(self.right.level),
          "case_level": u32::from(self.case.level),
          "headphone_level": u32::from(self.headphone.level),
          "left_charging": self.left.is_charging(),
          "right_charging": self.right.is_charging(),
          "case_charging": self.case.is_charging(),
          "left_available": self.left.is_available(),
          "right_available": self.right.is_available(),
          "case_available": self.case.is_available(),
      })
   }
}

/// Reduces two independent bud readings to a single displayed level.
///
/// The rule order matters: the charging special cases have to win over
/// the generic minimum, otherwise a charging bud with a stale zero
/// reading drags the displayed percentage down.
pub fn reduce_pair(a: BatteryState, b: BatteryState) -> u8 {
   let (a_valid, b_valid) = (a.is_valid(), b.is_valid());
   let (a_chg, b_chg) = (a.is_charging(), b.is_charging());

   if a_chg != b_chg {
      let (charging, other) = if a_chg { (a, b) } else { (b, a) };
      if charging.is_valid() && !other.is_valid() {
         return charging.level;
      }
      return if other.is_valid() { other.level } else { 0 };
   }
   match (a_valid, b_valid) {
      (false, false) => 0,
      (true, false) => a.level,
      (false, true) => b.level,
      (true, true) => a.level.min(b.level),
   }
}

/// In-ear state of the left and right buds.
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct EarDetectionStatus(NonZeroU8);

impl EarDetectionStatus {
   pub const LEFT: u8 = 1 << 0;
   pub const RIGHT: u8 = 1 << 1;
   pub const VALID: u8 = 0x80;

   pub const fn new(left_in_ear: bool, right_in_ear: bool) -> Self {
      let mut flags = Self::VALID;
      if left_in_ear {
         flags |= Self::LEFT;
      }
      if right_in_ear {
         flags |= Self::RIGHT;
      }
      Self(NonZeroU8::new(flags).expect("(x|valid) != 0"))
   }

   pub const fn is_left_in_ear(&self) -> bool {
      self.0.get() & Self::LEFT != 0
   }
   pub const fn is_right_in_ear(&self) -> bool {
      self.0.get() & Self::RIGHT != 0
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_in_ear": self.is_left_in_ear(),
          "right_in_ear": self.is_right_in_ear(),
      })
   }
}

/// Typed outbound command. Every command has exactly one wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
   Handshake,
   SelectFeatures(CapabilityProfile),
   RequestNotifications,
   Control { op: FeatureId, value: u32 },
}

impl Command {
   pub fn encode(&self) -> Packet {
      match self {
         Self::Handshake => Packet::from_slice(PKT_HANDSHAKE),
         Self::RequestNotifications => Packet::from_slice(PKT_REQUEST_NOTIFY),
         Self::SelectFeatures(caps) => build_feature_select(caps),
         Self::Control { op, value } => build_control_packet(op.id(), value.to_le_bytes()),
      }
   }
}

/// Builds the feature-select packet. The first payload byte enables the
/// baseline notification set; the optional bytes after it are only set
/// when the model advertises the matching capability.
pub fn build_feature_select(caps: &CapabilityProfile) -> Packet {
   let mut pkt = Packet::from_slice(HDR_SET_FEATURES);
   pkt.push(0xff);
   pkt.push(if caps.conversation_awareness { 0x01 } else { 0x00 });
   pkt.push(if caps.adaptive_transparency { 0x01 } else { 0x00 });
   pkt.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00]);
   pkt
}

/// Builds a control-set packet: `[prefix][settings marker][op][value]`.
pub fn build_control_packet(op: u8, data: [u8; 4]) -> Packet {
   HDR_CMD_CTL
      .iter()
      .copied()
      .chain([op])
      .chain(data.iter().copied())
      .collect()
}

#[cfg(test)]
mod tests {
   use super::*;

   fn state(level: u8, status: BatteryStatus) -> BatteryState {
      BatteryState { level, status }
   }

   const INVALID: BatteryState = BatteryState::new();

   #[test]
   fn reduce_charging_side_wins_over_invalid() {
      assert_eq!(reduce_pair(state(60, BatteryStatus::Charging), INVALID), 60);
      assert_eq!(reduce_pair(INVALID, state(45, BatteryStatus::Charging)), 45);
   }

   #[test]
   fn reduce_prefers_non_charging_side() {
      assert_eq!(
         reduce_pair(
            state(80, BatteryStatus::Charging),
            state(30, BatteryStatus::Discharging)
         ),
         30
      );
   }

   #[test]
   fn reduce_both_invalid_is_zero() {
      assert_eq!(reduce_pair(INVALID, INVALID), 0);
   }

   #[test]
   fn reduce_single_valid_side() {
      assert_eq!(
         reduce_pair(state(42, BatteryStatus::Discharging), INVALID),
         42
      );
      assert_eq!(
         reduce_pair(INVALID, state(17, BatteryStatus::Normal)),
         17
      );
   }

   #[test]
   fn reduce_minimum_governs() {
      assert_eq!(
         reduce_pair(
            state(55, BatteryStatus::Discharging),
            state(70, BatteryStatus::Discharging)
         ),
         55
      );
   }

   #[test]
   fn reduce_both_charging_falls_through_to_minimum() {
      assert_eq!(
         reduce_pair(
            state(80, BatteryStatus::Charging),
            state(30, BatteryStatus::Charging)
         ),
         30
      );
   }

   #[test]
   fn control_packet_shape() {
      let pkt = build_control_packet(FeatureId::NOISE_CONTROL.id(), 3u32.to_le_bytes());
      assert_eq!(&pkt[..6], HDR_CMD_CTL);
      assert_eq!(pkt[6], 0x0D);
      assert_eq!(&pkt[7..], &[0x03, 0x00, 0x00, 0x00]);
   }

   #[test]
   fn feature_id_names() {
      assert_eq!(FeatureId::NOISE_CONTROL.to_str(), "noise_control");
      assert_eq!("volume_swipe".parse::<FeatureId>(), Ok(FeatureId::VOLUME_SWIPE));
      assert_eq!(FeatureId::from_id(0xE9).to_str(), "e9");
   }

   #[test]
   fn known_features_sorted_for_binary_search() {
      let mut sorted = KNOWN_FEATURES.to_vec();
      sorted.sort_by_key(|(repr, _)| *repr);
      assert_eq!(sorted, KNOWN_FEATURES);
   }
}
