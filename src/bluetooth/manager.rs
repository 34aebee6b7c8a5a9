//! Bluetooth device manager.
//!
//! This module handles Bluetooth adapter management, device discovery,
//! and connection lifecycle for enhanced-protocol accessories, plus the
//! GATT battery watch on devices that expose the standard Battery
//! Service.

use std::{
   collections::{HashMap, HashSet},
   str::FromStr,
   time::Duration,
};

use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::{
   accessory::{
      capability::{self, CapabilityProfile, ModelCode},
      device::Accessory,
   },
   bluetooth::profile::{
      ACCESSORY_PROFILE_LABEL, ACCESSORY_SERVICE_UUID, ConnectionEvent, ProfileRegistrar,
   },
   config::Config,
   error::{PodLinkError, Result},
   event::{AccessoryEvent, EventSender},
   gatt::scanner::GattBatteryWatcher,
};

/// Interval to check for new adapters
const ADAPTER_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Delay before retrying adapter operations after failure
const ADAPTER_RECOVERY_DELAY: Duration = Duration::from_secs(5);
/// Maximum time to wait for the stream session to come up
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Maximum stream reconnect delay
const MAX_STREAM_RETRY_DELAY: Duration = Duration::from_secs(120);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Vendor id gating the enhanced-protocol path.
const ACCESSORY_VENDOR_ID: u32 = 0x004C;

// === Adapter Management ===

#[derive(Debug, Clone, PartialEq)]
enum AdapterState {
   Active,
   Lost,
   Failed(String),
}

struct AdapterInfo {
   adapter: Adapter,
   state: AdapterState,
   monitor_handle: Option<JoinHandle<()>>,
   retry_count: u32,
   name: SmolStr,
}

// === Device Management ===

#[derive(Debug, Copy, Clone, PartialEq)]
enum BluetoothState {
   Connected,
   Disconnected,
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum StreamState {
   Disconnected,
   Connecting,
   Connected,
   Failed(&'static str),
   WaitingToReconnect,
}

struct ManagedDevice {
   /// Present only for recognized enhanced-protocol models.
   accessory: Option<Accessory>,
   address_str: SmolStr,
   name: SmolStr,
   bluetooth_state: BluetoothState,
   stream_state: StreamState,
   adapter_name: SmolStr,
   retry_count: u32,
   stream_handle: Option<JoinHandle<()>>,
   gatt: Option<GattBatteryWatcher>,
}

impl ManagedDevice {
   fn to_json(&self) -> serde_json::Value {
      let mut info = match &self.accessory {
         Some(accessory) => accessory.to_json(),
         None => serde_json::json!({
             "address": self.address_str.as_str(),
             "name": self.name.as_str(),
             "connected": self.bluetooth_state == BluetoothState::Connected,
         }),
      };
      if let Some(gatt) = &self.gatt {
         info["gatt_battery"] = gatt.record().to_json();
      }
      info
   }
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Adapter events
   AdapterAvailable(SmolStr, Adapter),
   AdapterLost(SmolStr),
   AdapterError(SmolStr, String),

   // Device events
   DeviceDiscovered(Address, SmolStr),
   BluetoothConnected(Address),
   BluetoothDisconnected(Address),
   StreamEstablished(Address),
   StreamClosed(Address, bool),
   DeviceLost(Address),

   // User commands
   EstablishStream(Address, Option<oneshot::Sender<Result<()>>>),
   DisconnectStream(Address, Option<oneshot::Sender<Result<()>>>),
   GetDevice(Address, oneshot::Sender<Option<Accessory>>),
   GetDeviceJson(Address, oneshot::Sender<Option<serde_json::Value>>),
   GetAllDevicesJson(oneshot::Sender<Vec<serde_json::Value>>),
   CountDevices(oneshot::Sender<u32>),
}

// === Main Manager ===

/// High-level interface for managing accessories across all available
/// Bluetooth adapters.
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl BluetoothManager {
   pub async fn new(
      event_tx: EventSender,
      config: Config,
      bus: zbus::Connection,
   ) -> Result<Self> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ManagerActor::new(config, event_tx, command_rx, bus).await?;
      tokio::spawn(actor.run());
      Ok(Self { inbox: command_tx })
   }

   pub async fn connect_device(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::EstablishStream(address, Some(tx)))
         .await
         .map_err(|_| PodLinkError::ManagerShutdown)?;
      rx.await.map_err(|_| PodLinkError::ManagerShutdown)?
   }

   pub async fn disconnect_device(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::DisconnectStream(address, Some(tx)))
         .await
         .map_err(|_| PodLinkError::ManagerShutdown)?;
      rx.await.map_err(|_| PodLinkError::ManagerShutdown)?
   }

   /// Fetches the protocol engine handle for a recognized accessory.
   pub async fn get_device(&self, address: Address) -> Result<Accessory> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetDevice(address, tx))
         .await
         .map_err(|_| PodLinkError::DeviceNotFound(address))?;

      rx.await
         .ok()
         .flatten()
         .ok_or(PodLinkError::DeviceNotFound(address))
   }

   pub async fn device_json(&self, address: Address) -> Option<serde_json::Value> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetDeviceJson(address, tx))
         .await
         .ok()?;
      rx.await.ok().flatten()
   }

   pub async fn all_devices_json(&self) -> Vec<serde_json::Value> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetAllDevicesJson(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   pub async fn count_devices(&self) -> u32 {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::CountDevices(tx))
         .await
         .is_err()
      {
         return 0;
      }
      rx.await.unwrap_or_default()
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   session: Session,
   bus: zbus::Connection,
   registrar: ProfileRegistrar,
   profile_events: mpsc::Receiver<ConnectionEvent>,

   // State
   adapters: HashMap<SmolStr, AdapterInfo>,
   devices: HashMap<Address, ManagedDevice>,
   stream_connecting: HashSet<Address>,
}

impl ManagerActor {
   async fn new(
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
      bus: zbus::Connection,
   ) -> Result<Self> {
      let session = Session::new().await?;
      let (registrar, profile_events) = ProfileRegistrar::new(bus.clone());

      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Ok(Self {
         config,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         session,
         bus,
         registrar,
         profile_events,
         adapters: HashMap::new(),
         devices: HashMap::new(),
         stream_connecting: HashSet::new(),
      })
   }

   async fn run(mut self) {
      info!("Bluetooth manager starting up");

      if let Err(e) = self
         .registrar
         .register(ACCESSORY_PROFILE_LABEL, ACCESSORY_SERVICE_UUID)
         .await
      {
         // BlueZ may not be up yet; connections cannot arrive until this
         // succeeds, so keep retrying from the adapter check tick.
         error!("Initial profile registration failed: {e}");
      }

      self.initialize_adapters().await;

      let mut health_check_interval =
         time::interval(Duration::from_secs(self.config.health_interval_sec.max(1)));
      health_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut adapter_check_interval = time::interval(ADAPTER_CHECK_INTERVAL);
      adapter_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             _ = health_check_interval.tick() => {
                 self.check_connection_health().await;
                 self.scan_for_connected_accessories().await;
             }
             _ = adapter_check_interval.tick() => {
                 let _ = self
                    .registrar
                    .register(ACCESSORY_PROFILE_LABEL, ACCESSORY_SERVICE_UUID)
                    .await;
                 self.discover_new_adapters().await;
             }
             Some(event) = self.profile_events.recv() => {
                 self.handle_stream_offered(event).await;
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Bluetooth manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      self.cleanup().await;
   }

   async fn initialize_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => {
            error!("Failed to get adapter names: {e}");
         },
      }

      if self.adapters.is_empty() {
         self.initialize_adapter(SmolStr::new_static("hci0")).await;
      }
   }

   async fn initialize_adapter(&mut self, name: SmolStr) {
      match self.session.adapter(&name) {
         Ok(adapter) => {
            info!("Initializing adapter: {name}");

            if let Ok(powered) = adapter.is_powered().await
               && !powered
            {
               if let Err(e) = adapter.set_powered(true).await {
                  warn!("Failed to power on adapter {name}: {e}");
                  let loopback = self.loopback_tx.clone();
                  let name_clone = name.clone();
                  let adapter_clone = adapter.clone();
                  tokio::spawn(async move {
                     time::sleep(ADAPTER_RECOVERY_DELAY).await;
                     let _ = loopback
                        .send(ManagerCommand::AdapterAvailable(name_clone, adapter_clone))
                        .await;
                  });
                  return;
               }
               info!("Powered on adapter: {name}");
            }

            self.adapters.insert(
               name.clone(),
               AdapterInfo {
                  state: AdapterState::Active,
                  monitor_handle: Some(Self::start_adapter_monitor(
                     self.loopback_tx.clone(),
                     name.clone(),
                     adapter.clone(),
                  )),
                  adapter,
                  retry_count: 0,
                  name: name.clone(),
               },
            );

            self.check_connected_devices(&name).await;
         },
         Err(e) => {
            warn!("Failed to initialize adapter {name}: {e}");
         },
      }
   }

   fn start_adapter_monitor(
      loopback: mpsc::Sender<ManagerCommand>,
      name: SmolStr,
      adapter: Adapter,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let Ok(mut events) = adapter.events().await else {
            if let Err(e) = loopback
               .send(ManagerCommand::AdapterError(
                  name.clone(),
                  "Failed to get adapter events".to_string(),
               ))
               .await
            {
               warn!("Channel overflow sending adapter error: {e}");
            }
            return;
         };

         while let Some(event) = events.next().await {
            match event {
               AdapterEvent::DeviceAdded(addr) => {
                  debug!("Device added on {name}: {addr}");
                  let _ = loopback
                     .send(ManagerCommand::DeviceDiscovered(addr, name.clone()))
                     .await;
               },
               AdapterEvent::DeviceRemoved(addr) => {
                  debug!("Device removed on {name}: {addr}");
                  let _ = loopback.send(ManagerCommand::DeviceLost(addr)).await;
               },
               // Connection state changes are detected by the periodic
               // health check; bluer's adapter stream has no event for
               // them.
               _ => {},
            }
         }

         if let Err(e) = loopback.send(ManagerCommand::AdapterLost(name)).await {
            warn!("Channel overflow sending adapter lost: {e}");
         }
      })
   }

   async fn check_connected_devices(&self, adapter_name: &SmolStr) {
      let Some(adapter_info) = self.adapters.get(adapter_name) else {
         return;
      };

      let Ok(addresses) = adapter_info.adapter.device_addresses().await else {
         return;
      };

      for addr in addresses {
         if let Ok(device) = adapter_info.adapter.device(addr)
            && device.is_connected().await == Ok(true)
            && !self.devices.contains_key(&addr)
         {
            let _ = self
               .loopback_tx
               .send(ManagerCommand::DeviceDiscovered(addr, adapter_name.clone()))
               .await;
         }
      }
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::AdapterAvailable(name, adapter) => {
            self.handle_adapter_available(name, adapter).await;
         },
         ManagerCommand::AdapterLost(name) => {
            self.handle_adapter_lost(name);
         },
         ManagerCommand::AdapterError(name, error) => {
            self.handle_adapter_error(&name, error);
         },
         ManagerCommand::DeviceDiscovered(addr, adapter_name) => {
            self.handle_device_discovered(addr, adapter_name).await;
         },
         ManagerCommand::BluetoothConnected(addr) => {
            self.handle_bluetooth_connected(addr).await;
         },
         ManagerCommand::BluetoothDisconnected(addr) => {
            self.handle_bluetooth_disconnected(addr).await;
         },
         ManagerCommand::StreamEstablished(addr) => {
            self.handle_stream_established(addr);
         },
         ManagerCommand::StreamClosed(addr, is_error) => {
            self.handle_stream_closed(addr, is_error);
         },
         ManagerCommand::DeviceLost(addr) => {
            self.handle_device_lost(addr).await;
         },
         ManagerCommand::EstablishStream(addr, reply) => {
            let result = self.establish_stream(addr).await;
            if let Some(reply) = reply {
               let _ = reply.send(result);
            }
         },
         ManagerCommand::DisconnectStream(addr, reply) => {
            let result = self.disconnect_stream(addr).await;
            if let Some(reply) = reply {
               let _ = reply.send(result);
            }
         },
         ManagerCommand::GetDevice(addr, reply) => {
            let device = self
               .devices
               .get(&addr)
               .and_then(|d| d.accessory.clone());
            let _ = reply.send(device);
         },
         ManagerCommand::GetDeviceJson(addr, reply) => {
            let json = self.devices.get(&addr).map(ManagedDevice::to_json);
            let _ = reply.send(json);
         },
         ManagerCommand::GetAllDevicesJson(reply) => {
            let states = self.devices.values().map(ManagedDevice::to_json).collect();
            let _ = reply.send(states);
         },
         ManagerCommand::CountDevices(reply) => {
            let count = self.devices.len() as u32;
            let _ = reply.send(count);
         },
      }
   }

   async fn handle_adapter_available(&mut self, name: SmolStr, adapter: Adapter) {
      info!("Adapter available: {name}");

      if let Some(info) = self.adapters.get_mut(&name) {
         info.adapter = adapter;
         info.state = AdapterState::Active;
         info.retry_count = 0;

         if info.monitor_handle.is_none() {
            info.monitor_handle = Some(Self::start_adapter_monitor(
               self.loopback_tx.clone(),
               name.clone(),
               info.adapter.clone(),
            ));
         }

         self.check_connected_devices(&name).await;

         let devices_to_reconnect: Vec<Address> = self
            .devices
            .iter()
            .filter(|(_, d)| {
               d.adapter_name == name
                  && d.bluetooth_state == BluetoothState::Connected
                  && matches!(
                     d.stream_state,
                     StreamState::Failed(_) | StreamState::Disconnected
                  )
            })
            .map(|(addr, _)| *addr)
            .collect();

         for addr in devices_to_reconnect {
            let _ = self.establish_stream(addr).await;
         }
      } else {
         self.initialize_adapter(name).await;
      }
   }

   fn handle_adapter_lost(&mut self, name: SmolStr) {
      warn!("Adapter lost: {name}");

      if let Some(info) = self.adapters.get_mut(&name) {
         info.state = AdapterState::Lost;
         info.retry_count += 1;

         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
         }

         for device in self.devices.values_mut() {
            if device.adapter_name == name {
               device.stream_state = StreamState::Failed("Adapter lost");
               if let Some(handle) = device.stream_handle.take() {
                  handle.abort();
               }
               self
                  .event_tx
                  .emit(&device.address_str, AccessoryEvent::DeviceError);
            }
         }

         let loopback = self.loopback_tx.clone();
         let session = self.session.clone();
         let retry_count = info.retry_count;
         let delay = calc_retry_delay(retry_count, ADAPTER_RECOVERY_DELAY);

         tokio::spawn(async move {
            time::sleep(delay).await;

            match session.adapter(&name) {
               Ok(adapter) => {
                  let _ = loopback
                     .send(ManagerCommand::AdapterAvailable(name, adapter))
                     .await;
               },
               Err(e) => {
                  let _ = loopback
                     .send(ManagerCommand::AdapterError(
                        name,
                        format!("Recovery failed: {e}"),
                     ))
                     .await;
               },
            }
         });
      }
   }

   fn handle_adapter_error(&mut self, name: &SmolStr, error: String) {
      error!("Adapter error on {name}: {error}");

      if let Some(info) = self.adapters.get_mut(name) {
         info.state = AdapterState::Failed(error);
      }
   }

   async fn handle_device_discovered(&mut self, addr: Address, adapter_name: SmolStr) {
      if self.devices.contains_key(&addr) {
         return;
      }

      let Some(adapter_info) = self.adapters.get(&adapter_name) else {
         return;
      };

      let Ok(device) = adapter_info.adapter.device(addr) else {
         return;
      };

      if !device.is_connected().await.unwrap_or(false) {
         return;
      }

      let caps = recognize(&device).await;
      let gatt = self.start_gatt_watch(addr, &adapter_name).await;

      if caps.is_none() && gatt.is_none() {
         // Nothing we can do for this device.
         return;
      }

      let address_str = addr.to_smolstr();
      let name: SmolStr = match self.config.is_known_device(&address_str) {
         Some(known) => known.into(),
         None => device
            .name()
            .await
            .ok()
            .flatten()
            .map_or_else(|| address_str.clone(), SmolStr::from),
      };

      let accessory = caps.map(|caps| {
         info!(
            "Found connected accessory: {name} ({addr}), model {}",
            caps.model
         );
         Accessory::new(addr, name.to_string(), *caps)
      });
      if accessory.is_none() {
         info!("Watching GATT battery on {name} ({addr})");
      }

      let has_accessory = accessory.is_some();
      self.devices.insert(addr, ManagedDevice {
         accessory,
         address_str,
         name,
         bluetooth_state: BluetoothState::Connected,
         stream_state: StreamState::Disconnected,
         adapter_name,
         retry_count: 0,
         stream_handle: None,
         gatt,
      });

      if has_accessory {
         let _ = self.establish_stream(addr).await;
      }
   }

   async fn handle_bluetooth_connected(&mut self, addr: Address) {
      if let Some(device) = self.devices.get(&addr) {
         let adapter_name = device.adapter_name.clone();
         let needs_gatt = device.gatt.is_none();
         let gatt = if needs_gatt {
            self.start_gatt_watch(addr, &adapter_name).await
         } else {
            None
         };

         let mut has_accessory = false;
         if let Some(device) = self.devices.get_mut(&addr) {
            device.bluetooth_state = BluetoothState::Connected;
            if needs_gatt {
               device.gatt = gatt;
            }
            has_accessory = device.accessory.is_some();
         }
         if has_accessory {
            let _ = self.establish_stream(addr).await;
         }
      } else {
         for adapter_name in self.adapters.keys().cloned().collect::<Vec<_>>() {
            let _ = self
               .loopback_tx
               .send(ManagerCommand::DeviceDiscovered(addr, adapter_name))
               .await;
         }
      }
   }

   async fn handle_bluetooth_disconnected(&mut self, addr: Address) {
      if let Some(device) = self.devices.get_mut(&addr) {
         device.bluetooth_state = BluetoothState::Disconnected;
         device.stream_state = StreamState::Disconnected;
         device.gatt = None;

         if let Some(handle) = device.stream_handle.take() {
            handle.abort();
         }
         if let Some(accessory) = &device.accessory {
            accessory.disconnect().await;
         }
         if let Ok(path) = device_object_path(&device.adapter_name, addr) {
            self.registrar.forget_device(ACCESSORY_PROFILE_LABEL, &path);
         }

         self
            .event_tx
            .emit(&device.address_str, AccessoryEvent::DeviceDisconnected);
      }

      self.stream_connecting.remove(&addr);
   }

   fn handle_stream_established(&mut self, addr: Address) {
      if let Some(device) = self.devices.get_mut(&addr) {
         device.stream_state = StreamState::Connected;
         device.retry_count = 0;

         self
            .event_tx
            .emit(&device.address_str, AccessoryEvent::DeviceConnected);
      }

      self.stream_connecting.remove(&addr);
   }

   fn handle_stream_closed(&mut self, addr: Address, is_error: bool) {
      if let Some(device) = self.devices.get_mut(&addr) {
         if is_error && device.bluetooth_state == BluetoothState::Connected {
            device.retry_count += 1;
            if device.retry_count > self.config.connection_retry_count {
               warn!("Giving up on stream session with {addr} after {} attempts",
                  device.retry_count - 1);
               device.stream_state = StreamState::Failed("Retries exhausted");
               self.stream_connecting.remove(&addr);
               return;
            }
            device.stream_state = StreamState::WaitingToReconnect;

            let loopback = self.loopback_tx.clone();
            let base = Duration::from_secs(self.config.reconnect_delay_sec.max(1));
            let delay = calc_retry_delay(device.retry_count, base);
            info!("Stream session with {addr} failed, retrying in {delay:?}");

            tokio::spawn(async move {
               time::sleep(delay).await;
               let _ = loopback
                  .send(ManagerCommand::EstablishStream(addr, None))
                  .await;
            });
         } else {
            device.stream_state = StreamState::Disconnected;
            device.retry_count = 0;
         }
      }

      self.stream_connecting.remove(&addr);
   }

   async fn handle_device_lost(&mut self, addr: Address) {
      if let Some(device) = self.devices.remove(&addr) {
         if let Some(handle) = device.stream_handle {
            handle.abort();
         }
         if let Some(accessory) = &device.accessory {
            accessory.disconnect().await;
         }
         if let Ok(path) = device_object_path(&device.adapter_name, addr) {
            self.registrar.forget_device(ACCESSORY_PROFILE_LABEL, &path);
         }
         self
            .event_tx
            .emit(&device.address_str, AccessoryEvent::DeviceDisconnected);
      }
      self.stream_connecting.remove(&addr);
   }

   /// Claims the descriptor BlueZ just handed over and starts the
   /// handshake on it.
   async fn handle_stream_offered(&mut self, event: ConnectionEvent) {
      let Some((adapter_name, addr)) = parse_device_path(&event.device) else {
         warn!("Connection on unparseable device path {}", event.device);
         return;
      };
      debug!("Stream offered for {addr} via {}", event.label);

      if !self.devices.contains_key(&addr) {
         self.handle_device_discovered(addr, adapter_name).await;
      }

      let Some(device) = self.devices.get_mut(&addr) else {
         // Unsupported device; drop the parked descriptor.
         let _ = self.registrar.take_pending(&event.device);
         return;
      };
      let Some(accessory) = device.accessory.clone() else {
         let _ = self.registrar.take_pending(&event.device);
         return;
      };

      let Some(fd) = self.registrar.take_pending(&event.device) else {
         debug!("Descriptor for {addr} already claimed");
         return;
      };

      if let Some(handle) = device.stream_handle.take() {
         handle.abort();
      }
      accessory.disconnect().await;

      device.stream_state = StreamState::Connecting;
      self.stream_connecting.insert(addr);
      let handle = self.spawn_stream_connect(addr, accessory, fd);
      if let Some(device) = self.devices.get_mut(&addr) {
         device.stream_handle = Some(handle);
      }
   }

   fn spawn_stream_connect(
      &self,
      addr: Address,
      accessory: Accessory,
      fd: std::os::fd::OwnedFd,
   ) -> JoinHandle<()> {
      let event_tx = self.event_tx.clone();
      let loopback = self.loopback_tx.clone();

      tokio::spawn(async move {
         let err =
            match time::timeout(STREAM_CONNECT_TIMEOUT, accessory.connect(fd, &event_tx)).await {
               Ok(Err(e)) => {
                  warn!("Failed to open session with {addr}: {e}");
                  Some(e)
               },
               Err(_) => {
                  warn!("Session setup with {addr} timed out");
                  Some(PodLinkError::RequestTimeout)
               },
               Ok(Ok(jhandle)) => {
                  if let Err(e) = loopback.send(ManagerCommand::StreamEstablished(addr)).await {
                     warn!("Channel overflow sending session established: {e}");
                     return;
                  }

                  let err = match jhandle.await {
                     Ok(x) => x,
                     Err(x) => Some(PodLinkError::ActorPanicked(x)),
                  };

                  if let Some(err) = &err {
                     warn!("Session with {addr} terminated: {err:?}");
                  } else {
                     info!("Session with {addr} closed cleanly");
                  }
                  err
               },
            };
         if let Err(e) = loopback
            .send(ManagerCommand::StreamClosed(addr, err.is_some()))
            .await
         {
            warn!("Channel overflow sending session closed: {e}");
         }
      })
   }

   async fn establish_stream(&mut self, addr: Address) -> Result<()> {
      if self.stream_connecting.contains(&addr) {
         return Err(PodLinkError::AlreadyConnecting);
      }

      let device = self
         .devices
         .get_mut(&addr)
         .ok_or(PodLinkError::DeviceNotFound(addr))?;

      if device.accessory.is_none() {
         return Err(PodLinkError::UnsupportedModel(addr.to_string()));
      }

      let adapter_info = self
         .adapters
         .get(&device.adapter_name)
         .ok_or(PodLinkError::AdapterNotFound)?;

      if adapter_info.state != AdapterState::Active {
         return Err(PodLinkError::AdapterNotAvailable);
      }

      if device.bluetooth_state != BluetoothState::Connected {
         return Err(PodLinkError::DeviceNotConnected);
      }

      // A descriptor may already be parked from a NewConnection whose
      // event got dropped; claim it instead of dialing again.
      let path = device_object_path(&device.adapter_name, addr)?;
      if let Some(fd) = self.registrar.take_pending(&path) {
         let accessory = device
            .accessory
            .clone()
            .ok_or(PodLinkError::UnsupportedModel(addr.to_string()))?;
         device.stream_state = StreamState::Connecting;
         self.stream_connecting.insert(addr);
         let handle = self.spawn_stream_connect(addr, accessory, fd);
         if let Some(device) = self.devices.get_mut(&addr) {
            device.stream_handle = Some(handle);
         }
         return Ok(());
      }

      let bluer_device = adapter_info.adapter.device(addr)?;
      device.stream_state = StreamState::Connecting;
      self.stream_connecting.insert(addr);

      // Ask bluetoothd to bring the channel up; the accepted socket then
      // arrives through Profile1.NewConnection.
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         if let Err(e) = bluer_device
            .connect_profile(&ACCESSORY_SERVICE_UUID)
            .await
         {
            warn!("ConnectProfile to {addr} failed: {e}");
            let _ = loopback.send(ManagerCommand::StreamClosed(addr, true)).await;
         }
      });

      Ok(())
   }

   async fn disconnect_stream(&mut self, addr: Address) -> Result<()> {
      let device = self
         .devices
         .get_mut(&addr)
         .ok_or(PodLinkError::DeviceNotFound(addr))?;

      if let Some(handle) = device.stream_handle.take() {
         handle.abort();
      }

      device.stream_state = StreamState::Disconnected;
      if let Some(accessory) = &device.accessory {
         accessory.disconnect().await;
      }

      self.stream_connecting.remove(&addr);
      self
         .event_tx
         .emit(&device.address_str, AccessoryEvent::DeviceDisconnected);

      Ok(())
   }

   async fn start_gatt_watch(
      &self,
      addr: Address,
      adapter_name: &SmolStr,
   ) -> Option<GattBatteryWatcher> {
      if !self.config.gatt_battery {
         return None;
      }
      let path = device_object_path(adapter_name, addr).ok()?;
      match GattBatteryWatcher::start(&self.bus, addr.to_smolstr(), &path, &self.event_tx).await {
         Ok(watcher) if !watcher.is_empty() => Some(watcher),
         Ok(_) => None,
         Err(e) => {
            debug!("No GATT battery on {addr}: {e}");
            None
         },
      }
   }

   async fn cleanup(&mut self) {
      use tokio::time::timeout;
      info!("Cleaning up Bluetooth manager");

      for info in self.adapters.values_mut() {
         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
            let _ = timeout(Duration::from_secs(1), handle).await;
         }
      }

      for (addr, device) in &mut self.devices {
         if let Some(handle) = device.stream_handle.take() {
            handle.abort();
            let _ = timeout(Duration::from_secs(1), handle).await;
         }
         if let Some(accessory) = &device.accessory {
            accessory.disconnect().await;
         }
         if let Ok(path) = device_object_path(&device.adapter_name, *addr) {
            self.registrar.forget_device(ACCESSORY_PROFILE_LABEL, &path);
         }
      }

      if let Err(e) = self.registrar.unregister(ACCESSORY_PROFILE_LABEL).await {
         debug!("Profile unregister on shutdown: {e}");
      }
   }

   async fn discover_new_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names.into_iter().map(SmolStr::from) {
               if !self.adapters.contains_key(&name)
                  || matches!(
                     self.adapters.get(&name).map(|info| &info.state),
                     Some(AdapterState::Lost | AdapterState::Failed(_))
                  )
               {
                  self.initialize_adapter(name).await;
               }
            }
         },
         Err(e) => {
            warn!("Failed to poll adapter names: {e}. Retrying later.");
         },
      }
   }

   async fn scan_for_connected_accessories(&self) {
      for adapter_info in self.adapters.values() {
         if adapter_info.state != AdapterState::Active {
            continue;
         }

         if let Ok(addresses) = adapter_info.adapter.device_addresses().await {
            for addr in addresses {
               if self.devices.contains_key(&addr) {
                  continue;
               }
               if let Ok(device) = adapter_info.adapter.device(addr)
                  && device.is_connected().await.unwrap_or(false)
               {
                  let _ = self
                     .loopback_tx
                     .send(ManagerCommand::DeviceDiscovered(
                        addr,
                        adapter_info.name.clone(),
                     ))
                     .await;
               }
            }
         }
      }
   }

   async fn check_connection_health(&self) {
      for (addr, device) in &self.devices {
         if let Some(adapter_info) = self.adapters.get(&device.adapter_name)
            && let Ok(bluer_device) = adapter_info.adapter.device(*addr)
         {
            let is_connected = bluer_device.is_connected().await.unwrap_or(false);

            match (device.bluetooth_state, is_connected) {
               (BluetoothState::Connected, false) => {
                  let _ = self
                     .loopback_tx
                     .send(ManagerCommand::BluetoothDisconnected(*addr))
                     .await;
               },
               (BluetoothState::Disconnected, true) => {
                  let _ = self
                     .loopback_tx
                     .send(ManagerCommand::BluetoothConnected(*addr))
                     .await;
               },
               _ => {},
            }
         }
      }
   }
}

/// Resolves the capability profile for a device from its modalias. The
/// enhanced-protocol path is never entered for an unrecognized model.
async fn recognize(device: &bluer::Device) -> Option<&'static CapabilityProfile> {
   let modalias = device.modalias().await.ok().flatten()?;
   if modalias.vendor != ACCESSORY_VENDOR_ID {
      return None;
   }
   let product = u16::try_from(modalias.product).ok()?;
   capability::profile_for(ModelCode(product))
}

/// BlueZ object path for `addr` on `adapter`.
fn device_object_path(adapter: &str, addr: Address) -> Result<OwnedObjectPath> {
   let mac = addr.to_string().replace(':', "_");
   OwnedObjectPath::try_from(format!("/org/bluez/{adapter}/dev_{mac}"))
      .map_err(|e| zbus::Error::from(e).into())
}

/// Splits a BlueZ device path into its adapter name and address.
fn parse_device_path(path: &ObjectPath<'_>) -> Option<(SmolStr, Address)> {
   let rest = path.as_str().strip_prefix("/org/bluez/")?;
   let (adapter, dev) = rest.split_once('/')?;
   let mac = dev.strip_prefix("dev_")?.replace('_', ":");
   let addr = Address::from_str(&mac).ok()?;
   Some((SmolStr::new(adapter), addr))
}

fn calc_retry_delay(retry_count: u32, base: Duration) -> Duration {
   let exponential = base * (1u32 << retry_count.min(4));
   let delay = exponential.min(MAX_STREAM_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn parses_device_paths() {
      let path = ObjectPath::try_from("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF").unwrap();
      let (adapter, addr) = parse_device_path(&path).unwrap();
      assert_eq!(adapter, "hci0");
      assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
   }

   #[test]
   fn rejects_foreign_paths() {
      for bad in [
         "/org/bluez/hci0",
         "/org/freedesktop/UPower",
         "/org/bluez/hci0/dev_notamac",
         "/",
      ] {
         let path = ObjectPath::try_from(bad).unwrap();
         assert!(parse_device_path(&path).is_none(), "{bad}");
      }
   }

   #[test]
   fn object_path_round_trips() {
      let addr = Address::from_str("AA:BB:CC:DD:EE:FF").unwrap();
      let path = device_object_path("hci1", addr).unwrap();
      assert_eq!(path.as_str(), "/org/bluez/hci1/dev_AA_BB_CC_DD_EE_FF");
      let (adapter, parsed) = parse_device_path(&path).unwrap();
      assert_eq!(adapter, "hci1");
      assert_eq!(parsed, addr);
   }

   #[test]
   fn retry_delay_is_bounded() {
      let base = Duration::from_secs(2);
      for retries in 0..20 {
         let delay = calc_retry_delay(retries, base);
         assert!(delay >= base);
         assert!(delay <= MAX_STREAM_RETRY_DELAY + Duration::from_secs(1));
      }
   }
}
