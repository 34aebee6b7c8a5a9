//! Accessory model recognition and capability profiles.
//!
//! Supported accessories are identified by the 4-hex-digit product code in
//! the device's modalias (`v004Cp<code>d...`). Each known code maps to a
//! static [`CapabilityProfile`] describing its battery topology and which
//! optional features the model exposes. Model-dependent wire quirks, such
//! as the noise-control index layout, are resolved here once so the rest
//! of the engine works off data lookups instead of per-model branches.

use std::fmt;

use crate::accessory::protocol::NoiseControlMode;

/// Vendor id that prefixes every supported modalias.
const VENDOR_TAG: &str = "v004Cp";

/// Battery layout of an accessory family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryTopology {
   /// One battery for the whole unit (over-ear, single-piece devices).
   Single,
   /// Independent left/right buds plus a charging case.
   TriplePart,
}

/// 4-hex-digit product code parsed out of a modalias string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ModelCode(pub u16);

impl fmt::Display for ModelCode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:04x}", self.0)
   }
}

impl ModelCode {
   /// Extracts the product code from a modalias string such as
   /// `bluetooth:v004Cp2014d0100`. Returns `None` for anything that does
   /// not carry the vendor tag or a well-formed 4-hex-digit code.
   pub fn from_modalias(modalias: &str) -> Option<Self> {
      let at = modalias.find(VENDOR_TAG)?;
      let rest = &modalias[at + VENDOR_TAG.len()..];
      let code = rest.get(..4)?;
      if !rest[4..].starts_with('d') {
         return None;
      }
      u16::from_str_radix(code, 16).ok().map(Self)
   }
}

/// Static description of what a given accessory model can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityProfile {
   pub model: ModelCode,
   pub family: &'static str,
   pub topology: BatteryTopology,
   pub noise_control: bool,
   pub adaptive_transparency: bool,
   pub conversation_awareness: bool,
   pub press_control: bool,
   pub volume_swipe: bool,
   pub long_press_cycle: bool,
   pub tone_volume: bool,
}

impl CapabilityProfile {
   /// Resolves the noise-control wire mapping for this model.
   pub const fn noise_mode_map(&self) -> NoiseModeMap {
      if self.adaptive_transparency {
         NoiseModeMap::Adaptive
      } else {
         NoiseModeMap::Basic
      }
   }
}

const fn profile(
   model: u16,
   family: &'static str,
   topology: BatteryTopology,
   adaptive_transparency: bool,
   conversation_awareness: bool,
) -> CapabilityProfile {
   CapabilityProfile {
      model: ModelCode(model),
      family,
      topology,
      noise_control: true,
      adaptive_transparency,
      conversation_awareness,
      press_control: matches!(topology, BatteryTopology::TriplePart),
      volume_swipe: adaptive_transparency,
      long_press_cycle: true,
      tone_volume: conversation_awareness,
   }
}

/// All accessory models the enhanced protocol path is enabled for.
pub const KNOWN_MODELS: &[CapabilityProfile] = &[
   profile(0x2002, "Beats", BatteryTopology::Single, false, false),
   profile(0x200A, "AirPods (3rd gen)", BatteryTopology::TriplePart, false, false),
   profile(0x200E, "AirPods (2nd gen)", BatteryTopology::TriplePart, false, false),
   profile(0x200F, "Beats Solo Pro", BatteryTopology::Single, false, false),
   profile(0x2012, "PowerBeats Pro", BatteryTopology::TriplePart, false, false),
   profile(0x2013, "AirPods Max", BatteryTopology::Single, false, false),
   profile(0x2014, "AirPods Pro (2nd gen)", BatteryTopology::TriplePart, true, true),
   profile(0x2024, "AirPods Pro", BatteryTopology::TriplePart, false, false),
];

/// Looks up the capability profile for a model code.
pub fn profile_for(model: ModelCode) -> Option<&'static CapabilityProfile> {
   KNOWN_MODELS.iter().find(|p| p.model == model)
}

/// Looks up the capability profile straight from a modalias string.
pub fn profile_from_modalias(modalias: &str) -> Option<&'static CapabilityProfile> {
   ModelCode::from_modalias(modalias).and_then(profile_for)
}

/// Whether the enhanced protocol path should be entered for this model.
pub fn is_supported_model(model: ModelCode) -> bool {
   profile_for(model).is_some()
}

/// Model-dependent noise-control index layout.
///
/// Adaptive-capable models insert "adaptive" at wire index 3 and shift
/// "anc" up to 4; on everything else index 3 is "anc" directly. The same
/// table drives encode and decode, so a mode always has one canonical
/// wire value per model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseModeMap {
   Basic,
   Adaptive,
}

impl NoiseModeMap {
   pub fn decode(self, index: u8) -> Option<NoiseControlMode> {
      match (self, index) {
         (_, 1) => Some(NoiseControlMode::Off),
         (_, 2) => Some(NoiseControlMode::Transparency),
         (Self::Adaptive, 3) => Some(NoiseControlMode::Adaptive),
         (Self::Adaptive, 4) => Some(NoiseControlMode::Anc),
         (Self::Basic, 3) => Some(NoiseControlMode::Anc),
         _ => None,
      }
   }

   pub fn encode(self, mode: NoiseControlMode) -> Option<u8> {
      match (self, mode) {
         (_, NoiseControlMode::Off) => Some(1),
         (_, NoiseControlMode::Transparency) => Some(2),
         (Self::Adaptive, NoiseControlMode::Adaptive) => Some(3),
         (Self::Adaptive, NoiseControlMode::Anc) => Some(4),
         (Self::Basic, NoiseControlMode::Anc) => Some(3),
         (Self::Basic, NoiseControlMode::Adaptive) => None,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn parses_modalias_product_code() {
      let code = ModelCode::from_modalias("bluetooth:v004Cp2014d0100").unwrap();
      assert_eq!(code, ModelCode(0x2014));

      let code = ModelCode::from_modalias("usb:v004Cp200Ed0217").unwrap();
      assert_eq!(code, ModelCode(0x200E));
   }

   #[test]
   fn malformed_modalias_is_unsupported() {
      for bad in [
         "",
         "bluetooth:v004C",
         "bluetooth:v004Cp20",
         "bluetooth:v004Cp20ZZd0100",
         "bluetooth:v05ACp024Fd0001",
         "bluetooth:v004Cp2014",
         "completely unrelated",
      ] {
         assert!(ModelCode::from_modalias(bad).is_none(), "accepted {bad:?}");
      }
   }

   #[test]
   fn all_known_models_are_supported() {
      for profile in KNOWN_MODELS {
         assert!(is_supported_model(profile.model));
         let found = profile_for(profile.model).unwrap();
         assert_eq!(found.topology, profile.topology);
      }
   }

   #[test]
   fn unknown_model_is_unsupported() {
      assert!(!is_supported_model(ModelCode(0xBEEF)));
      assert!(profile_from_modalias("bluetooth:v004CpBEEFd0001").is_none());
   }

   #[test]
   fn single_topology_models() {
      for code in [0x2013, 0x200F, 0x2002] {
         let profile = profile_for(ModelCode(code)).unwrap();
         assert_eq!(profile.topology, BatteryTopology::Single, "{code:#06x}");
      }
   }

   #[test]
   fn noise_map_adaptive_indices() {
      let map = NoiseModeMap::Adaptive;
      assert_eq!(map.decode(3), Some(NoiseControlMode::Adaptive));
      assert_eq!(map.decode(4), Some(NoiseControlMode::Anc));
      assert_eq!(map.encode(NoiseControlMode::Adaptive), Some(3));
      assert_eq!(map.encode(NoiseControlMode::Anc), Some(4));
   }

   #[test]
   fn noise_map_basic_indices() {
      let map = NoiseModeMap::Basic;
      assert_eq!(map.decode(3), Some(NoiseControlMode::Anc));
      assert_eq!(map.decode(4), None);
      assert_eq!(map.encode(NoiseControlMode::Anc), Some(3));
      assert_eq!(map.encode(NoiseControlMode::Adaptive), None);
   }

   #[test]
   fn noise_map_round_trip() {
      for map in [NoiseModeMap::Basic, NoiseModeMap::Adaptive] {
         for index in 1..=4u8 {
            if let Some(mode) = map.decode(index) {
               assert_eq!(map.encode(mode), Some(index));
            }
         }
      }
   }
}
