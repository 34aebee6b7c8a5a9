//! Inbound frame classification for the accessory protocol.
//!
//! Frames are matched against fixed byte-prefix signatures in a fixed
//! priority order and parsed into typed [`InboundEvent`]s. A buffer that
//! matches no signature decodes to [`InboundEvent::Unknown`]; only a
//! buffer that matches a signature but carries a malformed payload is an
//! error, and the engine logs and drops those without closing the
//! connection.

use log::{debug, warn};
use thiserror::Error;

use crate::accessory::protocol::{
   BatteryInfo, BatteryState, BatteryStatus, Component, EarDetectionStatus, FeatureId,
   HDR_ACK_FEATURES, HDR_ACK_HANDSHAKE, HDR_AWARENESS, HDR_BATTERY_STATE, HDR_CMD_CTL,
   HDR_EAR_DETECTION,
};

/// Error type for protocol parsing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtoError {
   /// Packet is too short for the expected format
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   /// Invalid battery count in battery status packet
   #[error("Invalid battery count: {count} (must be 0-3)")]
   InvalidBatteryCount { count: u8 },

   /// Packet size doesn't match expected size based on content
   #[error("Packet size mismatch: expected {expected} bytes, got {actual} bytes")]
   PacketSizeMismatch { expected: usize, actual: usize },

   /// Generic invalid packet format
   #[error("Invalid packet format: {reason}")]
   InvalidFormat { reason: &'static str },
}

/// Decoded inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundEvent {
   HandshakeAck,
   FeaturesAck,
   BatteryStatus(BatteryInfo),
   EarDetection(EarDetectionStatus),
   AwarenessAttenuation(bool),
   FeatureState(FeatureId, u32),
   Unknown,
}

/// Classifies an inbound buffer. Signature checks run in a fixed priority
/// order: handshake ack, features ack, battery status, ear detection,
/// awareness data, then the generic feature-state frame.
pub fn classify(data: &[u8]) -> Result<InboundEvent, ProtoError> {
   if data.starts_with(HDR_ACK_HANDSHAKE) {
      Ok(InboundEvent::HandshakeAck)
   } else if data.starts_with(HDR_ACK_FEATURES) {
      Ok(InboundEvent::FeaturesAck)
   } else if data.starts_with(HDR_BATTERY_STATE) {
      parse_battery_status(data).map(InboundEvent::BatteryStatus)
   } else if data.starts_with(HDR_EAR_DETECTION) {
      parse_ear_detection(data).map(InboundEvent::EarDetection)
   } else if data.starts_with(HDR_AWARENESS) {
      parse_awareness(data).map(InboundEvent::AwarenessAttenuation)
   } else if data.starts_with(HDR_CMD_CTL) {
      parse_feature_state(data)
   } else {
      Ok(InboundEvent::Unknown)
   }
}

/// Parses a battery status frame.
///
/// The payload carries a component count followed by 5-byte entries
/// (component id, pad, level, charge status, pad) for up to 3 components.
fn parse_battery_status(data: &[u8]) -> Result<BatteryInfo, ProtoError> {
   if data.len() < 7 {
      return Err(ProtoError::PacketTooShort {
         expected: 7,
         actual: data.len(),
      });
   }

   let battery_count = data[6];
   let expected_length = 7 + 5 * battery_count as usize;

   debug!("Battery packet: {}", hex::encode(data));

   if battery_count > 3 {
      return Err(ProtoError::InvalidBatteryCount {
         count: battery_count,
      });
   }

   if data.len() != expected_length {
      return Err(ProtoError::PacketSizeMismatch {
         expected: expected_length,
         actual: data.len(),
      });
   }

   let mut battery_info = BatteryInfo::new();

   for i in 0..battery_count {
      let offset = 7 + (5 * i) as usize;
      let id = data[offset];
      let level = data[offset + 2];
      let status = data[offset + 3];

      let Some(component) = Component::from_repr(id) else {
         warn!("Unknown component type 0x{id:02x}");
         continue;
      };

      let bat_status = BatteryStatus::from_repr(status).unwrap_or_else(|| {
         warn!(
            "Unknown battery status 0x{status:02x} for component {component}, treating as Normal"
         );
         BatteryStatus::Normal
      });

      debug!("Parsed component: {component} = {level}% ({bat_status})");

      if bat_status != BatteryStatus::Disconnected {
         let battery_state = BatteryState {
            level,
            status: bat_status,
         };
         match component {
            Component::Left => battery_info.left = battery_state,
            Component::Right => battery_info.right = battery_state,
            Component::Case => battery_info.case = battery_state,
            Component::Headphone => battery_info.headphone = battery_state,
         }
      }
   }
   Ok(battery_info)
}

fn parse_ear_detection(data: &[u8]) -> Result<EarDetectionStatus, ProtoError> {
   if data.len() < 8 {
      return Err(ProtoError::PacketTooShort {
         expected: 8,
         actual: data.len(),
      });
   }
   let left_out = data[6] == 0x01;
   let right_out = data[7] == 0x01;
   Ok(EarDetectionStatus::new(!left_out, !right_out))
}

/// Conversation-awareness data frame: one level byte follows the header,
/// levels 1-3 mean the wearer started speaking (attenuate), higher levels
/// mean speech ended.
fn parse_awareness(data: &[u8]) -> Result<bool, ProtoError> {
   let Some(&level) = data.get(HDR_AWARENESS.len()) else {
      return Err(ProtoError::PacketTooShort {
         expected: HDR_AWARENESS.len() + 1,
         actual: data.len(),
      });
   };
   Ok((1..=3).contains(&level))
}

fn parse_feature_state(data: &[u8]) -> Result<InboundEvent, ProtoError> {
   let rest = data
      .strip_prefix(HDR_CMD_CTL)
      .ok_or(ProtoError::InvalidFormat {
         reason: "missing control header",
      })?;
   let (op, rest) = rest.split_first().ok_or(ProtoError::PacketTooShort {
      expected: HDR_CMD_CTL.len() + 5,
      actual: data.len(),
   })?;
   let value: [u8; 4] = rest.try_into().map_err(|_| ProtoError::PacketSizeMismatch {
      expected: HDR_CMD_CTL.len() + 5,
      actual: data.len(),
   })?;
   Ok(InboundEvent::FeatureState(
      FeatureId::from_id(*op),
      u32::from_le_bytes(value),
   ))
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::accessory::protocol::{Command, PKT_HANDSHAKE, build_control_packet};

   fn battery_frame(entries: &[(u8, u8, u8)]) -> Vec<u8> {
      let mut frame = HDR_BATTERY_STATE.to_vec();
      frame.push(entries.len() as u8);
      for (id, level, status) in entries {
         frame.extend_from_slice(&[*id, 0x00, *level, *status, 0x00]);
      }
      frame
   }

   #[test]
   fn classifies_acks_first() {
      assert_eq!(
         classify(&[0x01, 0x00, 0x04, 0x00, 0x01, 0x00]),
         Ok(InboundEvent::HandshakeAck)
      );
      assert_eq!(
         classify(&[0x04, 0x00, 0x04, 0x00, 0x2b, 0x00, 0x01]),
         Ok(InboundEvent::FeaturesAck)
      );
   }

   #[test]
   fn parses_battery_frame() {
      let frame = battery_frame(&[(0x04, 80, 0x01), (0x02, 75, 0x02), (0x08, 90, 0x00)]);
      let Ok(InboundEvent::BatteryStatus(info)) = classify(&frame) else {
         panic!("not a battery event");
      };
      assert_eq!(info.left.level, 80);
      assert!(info.left.is_charging());
      assert_eq!(info.right.level, 75);
      assert_eq!(info.right.status, BatteryStatus::Discharging);
      assert_eq!(info.case.level, 90);
   }

   #[test]
   fn disconnected_component_stays_invalid() {
      let frame = battery_frame(&[(0x04, 55, 0x04)]);
      let Ok(InboundEvent::BatteryStatus(info)) = classify(&frame) else {
         panic!("not a battery event");
      };
      assert!(!info.left.is_valid());
      assert_eq!(info.left.level, 0);
   }

   #[test]
   fn battery_frame_size_mismatch_is_error() {
      let mut frame = battery_frame(&[(0x04, 80, 0x01)]);
      frame.pop();
      assert!(matches!(
         classify(&frame),
         Err(ProtoError::PacketSizeMismatch { .. })
      ));

      let mut frame = HDR_BATTERY_STATE.to_vec();
      frame.push(9);
      frame.resize(7 + 45, 0);
      assert_eq!(
         classify(&frame),
         Err(ProtoError::InvalidBatteryCount { count: 9 })
      );
   }

   #[test]
   fn parses_ear_detection() {
      let mut frame = HDR_EAR_DETECTION.to_vec();
      frame.extend_from_slice(&[0x00, 0x01]);
      let Ok(InboundEvent::EarDetection(status)) = classify(&frame) else {
         panic!("not an ear detection event");
      };
      assert!(status.is_left_in_ear());
      assert!(!status.is_right_in_ear());
   }

   #[test]
   fn parses_awareness_levels() {
      for (level, expected) in [(1u8, true), (3, true), (8, false), (9, false)] {
         let mut frame = HDR_AWARENESS.to_vec();
         frame.push(level);
         assert_eq!(
            classify(&frame),
            Ok(InboundEvent::AwarenessAttenuation(expected)),
            "level {level}"
         );
      }
   }

   #[test]
   fn control_commands_round_trip() {
      for (op, value) in [
         (FeatureId::NOISE_CONTROL, 3u32),
         (FeatureId::CONVERSATION_AWARENESS, 1),
         (FeatureId::TONE_VOLUME, 75),
         (FeatureId::PRESS_SPEED, 2),
         (FeatureId::PRESS_DURATION, 1),
         (FeatureId::VOLUME_SWIPE, 1),
         (FeatureId::VOLUME_SWIPE_LENGTH, 3),
         (FeatureId::LONG_PRESS_CYCLE, 5),
      ] {
         let pkt = Command::Control { op, value }.encode();
         assert_eq!(
            classify(&pkt),
            Ok(InboundEvent::FeatureState(op, value)),
            "{op}"
         );
      }
   }

   #[test]
   fn value_range_round_trips() {
      for value in [0u32, 1, 0xFF, 0x1234, u32::MAX] {
         let pkt = build_control_packet(0x42, value.to_le_bytes());
         assert_eq!(
            classify(&pkt),
            Ok(InboundEvent::FeatureState(FeatureId::from_id(0x42), value))
         );
      }
   }

   #[test]
   fn unknown_buffers_do_not_error() {
      assert_eq!(classify(&[]), Ok(InboundEvent::Unknown));
      assert_eq!(classify(&[0xde, 0xad, 0xbe, 0xef]), Ok(InboundEvent::Unknown));
      assert_eq!(classify(b"garbage data here"), Ok(InboundEvent::Unknown));
   }

   #[test]
   fn outbound_handshake_is_not_misclassified() {
      // The handshake we send must not look like any inbound signature.
      assert_eq!(classify(PKT_HANDSHAKE), Ok(InboundEvent::Unknown));
   }
}
