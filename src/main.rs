//! PodLink accessory daemon
//!
//! This service speaks the enhanced stream protocol of supported
//! Bluetooth accessories and watches the standard GATT Battery Service
//! on devices that expose one, publishing both over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use smol_str::SmolStr;
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::manager::BluetoothManager;
use dbus::AccessoryService;
use event::{AccessoryEvent, EventBus};

mod accessory;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod gatt;

use crate::{dbus::AccessoryServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting podlink D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   // The profile registrar and GATT scanner talk to BlueZ on the system
   // bus, and the outward service lives there too.
   let connection = connection::Builder::system()?.name("org.podlink")?.build().await?;

   // Create event channel
   let event_bus = EventProcessor::new();

   // Create Bluetooth manager with event sender and config
   let bluetooth_manager =
      BluetoothManager::new(event_bus.clone(), config, connection.clone()).await?;

   // Create D-Bus service
   let service = AccessoryService::new(bluetooth_manager);
   connection
      .object_server()
      .at("/org/podlink/manager", service)
      .await?;

   info!("podlink D-Bus service started at org.podlink");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down podlink service...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(SmolStr, AccessoryEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(SmolStr, AccessoryEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<AccessoryService>,
      (address, event): (SmolStr, AccessoryEvent),
   ) -> Result<()> {
      let addr_str = address.as_str();
      match event {
         AccessoryEvent::DeviceConnected => {
            iface.device_connected(addr_str).await?;
         },
         AccessoryEvent::DeviceDisconnected => {
            iface.device_disconnected(addr_str).await?;
         },
         AccessoryEvent::BatteryUpdated(battery) => {
            iface
               .battery_updated(addr_str, &battery.to_json().to_string())
               .await?;
         },
         AccessoryEvent::GattBatteryUpdated(record) => {
            iface
               .gatt_battery_updated(addr_str, &record.to_json().to_string())
               .await?;
         },
         AccessoryEvent::NoiseControlChanged(mode) => {
            iface.noise_control_changed(addr_str, mode.to_str()).await?;
         },
         AccessoryEvent::EarDetectionChanged(ear_detection) => {
            iface
               .ear_detection_changed(addr_str, &ear_detection.to_json().to_string())
               .await?;
         },
         AccessoryEvent::AwarenessChanged(attenuating) => {
            iface.awareness_changed(addr_str, attenuating).await?;
         },
         AccessoryEvent::FeatureStateChanged(feature, value) => {
            iface
               .feature_state_changed(addr_str, feature.to_str(), value)
               .await?;
         },
         AccessoryEvent::DeviceError => {
            iface.device_error(addr_str).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, AccessoryService>("/org/podlink/manager")
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, address: &SmolStr, event: AccessoryEvent) {
      self.queue.push((address.clone(), event));
      self.notifier.notify_waiters();
   }
}
