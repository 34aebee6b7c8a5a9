use std::{collections::HashMap, str::FromStr};

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter, zvariant};

use crate::{accessory::protocol::NoiseControlMode, bluetooth::manager::BluetoothManager};

pub struct AccessoryService {
   bluetooth_manager: BluetoothManager,
}

impl AccessoryService {
   pub const fn new(bluetooth_manager: BluetoothManager) -> Self {
      Self { bluetooth_manager }
   }
}

fn invalid_args(e: impl ToString) -> zbus::fdo::Error {
   zbus::fdo::Error::InvalidArgs(e.to_string())
}

#[interface(name = "org.podlink")]
impl AccessoryService {
   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let states = self.bluetooth_manager.all_devices_json().await;
      Ok(serde_json::Value::Array(states).to_string())
   }

   async fn get_device(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = Address::from_str(&address).map_err(invalid_args)?;

      let state = self
         .bluetooth_manager
         .device_json(addr)
         .await
         .ok_or_else(|| zbus::fdo::Error::Failed("Device not found".into()))?;
      Ok(state.to_string())
   }

   async fn passthrough(&self, address: String, packet: String) -> zbus::fdo::Result<bool> {
      let addr = Address::from_str(&address).map_err(invalid_args)?;

      let dev = self
         .bluetooth_manager
         .get_device(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      let packet = hex::decode(packet).map_err(invalid_args)?;

      dev.passthrough(&packet)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   async fn send_command(
      &self,
      address: String,
      action: String,
      params: HashMap<String, zvariant::Value<'_>>,
   ) -> zbus::fdo::Result<bool> {
      let addr = Address::from_str(&address).map_err(invalid_args)?;

      let dev = self
         .bluetooth_manager
         .get_device(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      match action.as_str() {
         "set_noise_mode" => {
            let mode_str = params
               .get("value")
               .ok_or_else(|| invalid_args("Missing 'value' parameter"))?
               .downcast_ref::<String>()
               .map_err(|e| invalid_args(format!("Invalid 'value' parameter: {e}")))?;

            let mode = NoiseControlMode::from_str(mode_str.as_str())
               .map_err(|_| invalid_args(format!("Invalid noise mode: {mode_str}")))?;

            dev.set_noise_control(mode)
               .await
               .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

            info!("Set noise mode to {mode} for {address}");
         },

         "set_awareness" => {
            let enabled = params
               .get("enabled")
               .ok_or_else(|| invalid_args("Missing 'enabled' parameter"))?
               .downcast_ref::<bool>()
               .map_err(|e| invalid_args(format!("Invalid 'enabled' parameter: {e}")))?;

            dev.set_conversation_awareness(enabled)
               .await
               .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

            info!("Set conversation awareness to {enabled} for {address}");
         },

         "set_feature" => {
            let feature = params
               .get("feature")
               .ok_or_else(|| invalid_args("Missing 'feature' parameter"))?
               .downcast_ref::<String>()
               .map_err(|e| invalid_args(format!("Invalid 'feature' parameter: {e}")))?;

            let value = params
               .get("value")
               .ok_or_else(|| invalid_args("Missing 'value' parameter"))?
               .downcast_ref::<u32>()
               .map_err(|e| {
                  invalid_args(format!("Invalid 'value' for feature {feature}: {e}"))
               })?;

            let byte =
               || u8::try_from(value).map_err(|_| invalid_args(format!("Value out of range: {value}")));

            let result = match feature.as_str() {
               "volume_swipe" => dev.set_volume_swipe(value != 0).await,
               "volume_swipe_length" => dev.set_volume_swipe_length(byte()?).await,
               "tone_volume" => dev.set_tone_volume(byte()?).await,
               "press_speed" => dev.set_press_speed(byte()?).await,
               "press_duration" => dev.set_press_duration(byte()?).await,
               "adaptive_volume" => dev.set_adaptive_volume(byte()?).await,
               "long_press_cycle" => dev.set_long_press_cycle(byte()?).await,
               _ => {
                  return Err(invalid_args(format!("Unknown feature: {feature}")));
               },
            };
            result.map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

            info!("Set feature {feature} to {value} for {address}");
         },

         _ => {
            return Err(invalid_args(format!("Unknown action: {action}")));
         },
      }

      Ok(true)
   }

   async fn connect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = Address::from_str(&address).map_err(invalid_args)?;

      self
         .bluetooth_manager
         .connect_device(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   async fn disconnect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = Address::from_str(&address).map_err(invalid_args)?;

      self
         .bluetooth_manager
         .disconnect_device(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      battery: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn gatt_battery_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      battery: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn noise_control_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      mode: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ear_detection_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      ear_detection: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn awareness_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      attenuating: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn feature_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      feature: &str,
      value: u32,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self.bluetooth_manager.count_devices().await
   }
}
