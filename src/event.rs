//! Event plumbing for accessory status updates.
//!
//! State changes flow out of the protocol and GATT engines through the
//! [`EventBus`] trait, a one-way fire-and-forget data sink. Consumers
//! (the D-Bus surface, in this daemon) implement the trait; producers
//! hold an `EventSender` and never learn who is listening.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::{
   accessory::protocol::{BatteryInfo, EarDetectionStatus, FeatureId, NoiseControlMode},
   gatt::aggregator::CanonicalBatteryRecord,
};

/// Events emitted by the accessory engines, keyed by device address.
#[derive(Debug, Clone)]
pub enum AccessoryEvent {
   DeviceConnected,
   DeviceDisconnected,
   DeviceError,
   BatteryUpdated(BatteryInfo),
   GattBatteryUpdated(CanonicalBatteryRecord),
   NoiseControlChanged(NoiseControlMode),
   EarDetectionChanged(EarDetectionStatus),
   AwarenessChanged(bool),
   FeatureStateChanged(FeatureId, u32),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, address: &SmolStr, event: AccessoryEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
