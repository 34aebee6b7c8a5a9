//! RFCOMM profile registration against BlueZ.
//!
//! Registers an `org.bluez.Profile1` object on the system bus for the
//! accessory service UUID. BlueZ calls `NewConnection` with the accepted
//! socket descriptor when a paired accessory opens the channel; the
//! registrar parks the descriptor keyed by device path and raises an
//! event. Device and profile startup order is not guaranteed, so a caller
//! that comes up late can claim a parked descriptor synchronously through
//! [`ProfileRegistrar::take_pending`] instead of waiting for the event.

use std::{
   collections::{HashMap, HashSet},
   os::fd::OwnedFd,
   sync::Arc,
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use uuid::Uuid;
use zbus::{
   Connection, interface, proxy,
   zvariant::{self, ObjectPath, OwnedObjectPath, OwnedValue},
};

use crate::error::{PodLinkError, Result};

/// Service UUID of the accessory control channel.
pub const ACCESSORY_SERVICE_UUID: Uuid = Uuid::from_u128(0x74ec2172_0bad_4d01_8f77_997b2be0722a);

/// Well-known label for the accessory profile registration.
pub const ACCESSORY_PROFILE_LABEL: &str = "accessory";

const PROFILE_PATH_BASE: &str = "/org/podlink/profile";

#[proxy(
   interface = "org.bluez.ProfileManager1",
   default_service = "org.bluez",
   default_path = "/org/bluez"
)]
trait ProfileManager1 {
   fn register_profile(
      &self,
      profile: &ObjectPath<'_>,
      uuid: &str,
      options: HashMap<&str, zvariant::Value<'_>>,
   ) -> zbus::Result<()>;

   fn unregister_profile(&self, profile: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// Raised when BlueZ hands over a freshly accepted connection. The
/// descriptor itself stays parked in the registrar until claimed with
/// [`ProfileRegistrar::take_pending`].
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
   pub label: SmolStr,
   pub device: OwnedObjectPath,
}

#[derive(Debug, Default)]
struct ProfileState {
   pending: HashMap<OwnedObjectPath, OwnedFd>,
   connected: HashMap<SmolStr, HashSet<OwnedObjectPath>>,
}

impl ProfileState {
   fn record_connection(&mut self, label: &SmolStr, device: OwnedObjectPath, fd: OwnedFd) {
      // A reconnect before we noticed the old stream died just replaces
      // the stale descriptor.
      self.pending.insert(device.clone(), fd);
      self.connected.entry(label.clone()).or_default().insert(device);
   }

   fn record_disconnection(&mut self, label: &SmolStr, device: &OwnedObjectPath) {
      self.pending.remove(device);
      if let Some(devices) = self.connected.get_mut(label) {
         devices.remove(device);
      }
   }

   fn take_pending(&mut self, device: &OwnedObjectPath) -> Option<OwnedFd> {
      self.pending.remove(device)
   }

   fn has_connected(&self, label: &str) -> bool {
      self.connected.get(label).is_some_and(|d| !d.is_empty())
   }
}

/// The bus-side `org.bluez.Profile1` object, one per registered label.
struct ProfileObject {
   label: SmolStr,
   state: Arc<Mutex<ProfileState>>,
   events: mpsc::Sender<ConnectionEvent>,
}

#[interface(name = "org.bluez.Profile1")]
impl ProfileObject {
   async fn release(&self) {
      info!("Profile {} released by BlueZ", self.label);
   }

   async fn new_connection(
      &self,
      device: OwnedObjectPath,
      fd: zvariant::OwnedFd,
      _props: HashMap<String, OwnedValue>,
   ) -> zbus::fdo::Result<()> {
      info!("New {} connection from {device}", self.label);
      self
         .state
         .lock()
         .record_connection(&self.label, device.clone(), fd.into());

      if let Err(e) = self
         .events
         .try_send(ConnectionEvent {
            label: self.label.clone(),
            device,
         })
      {
         warn!("Dropping connection event, channel full: {e}");
      }
      Ok(())
   }

   async fn request_disconnection(&self, device: OwnedObjectPath) -> zbus::fdo::Result<()> {
      debug!("Disconnection requested for {device}");
      self.state.lock().record_disconnection(&self.label, &device);
      Ok(())
   }
}

/// Registers and tracks RFCOMM profiles, parking inbound descriptors.
pub struct ProfileRegistrar {
   connection: Connection,
   state: Arc<Mutex<ProfileState>>,
   registered: Mutex<HashMap<SmolStr, OwnedObjectPath>>,
   events_tx: mpsc::Sender<ConnectionEvent>,
}

impl ProfileRegistrar {
   pub fn new(connection: Connection) -> (Self, mpsc::Receiver<ConnectionEvent>) {
      let (events_tx, events_rx) = mpsc::channel(64);
      (
         Self {
            connection,
            state: Arc::new(Mutex::new(ProfileState::default())),
            registered: Mutex::new(HashMap::new()),
            events_tx,
         },
         events_rx,
      )
   }

   /// Registers the profile for `label` with BlueZ. Registering the same
   /// label twice is a no-op. On failure the profile is left absent; a
   /// later explicit call may retry.
   pub async fn register(&self, label: &str, uuid: Uuid) -> Result<()> {
      let path = {
         let registered = self.registered.lock();
         if registered.contains_key(label) {
            debug!("Profile {label} already registered");
            return Ok(());
         }
         OwnedObjectPath::try_from(format!("{PROFILE_PATH_BASE}/{label}")).map_err(zbus::Error::from)?
      };

      let object = ProfileObject {
         label: SmolStr::new(label),
         state: self.state.clone(),
         events: self.events_tx.clone(),
      };
      self
         .connection
         .object_server()
         .at(path.as_str(), object)
         .await?;

      let manager = ProfileManager1Proxy::new(&self.connection).await?;
      let options = HashMap::from([
         ("Name", zvariant::Value::from("podlink accessory link")),
         ("Role", zvariant::Value::from("client")),
         ("RequireAuthentication", zvariant::Value::from(false)),
         ("AutoConnect", zvariant::Value::from(true)),
      ]);

      if let Err(e) = manager
         .register_profile(&path, &uuid.to_string(), options)
         .await
      {
         warn!("Failed to register profile {label}: {e}");
         let _ = self
            .connection
            .object_server()
            .remove::<ProfileObject, _>(path.as_str())
            .await;
         return Err(e.into());
      }

      info!("Registered profile {label} ({uuid})");
      self.registered.lock().insert(SmolStr::new(label), path);
      Ok(())
   }

   /// Unregisters the profile; refused while any device of this label is
   /// still connected.
   pub async fn unregister(&self, label: &str) -> Result<()> {
      if self.state.lock().has_connected(label) {
         return Err(PodLinkError::ProfileBusy(label.to_string()));
      }
      let path = self
         .registered
         .lock()
         .remove(label)
         .ok_or_else(|| PodLinkError::ProfileNotRegistered(label.to_string()))?;

      let manager = ProfileManager1Proxy::new(&self.connection).await?;
      manager.unregister_profile(&path).await?;
      let _ = self
         .connection
         .object_server()
         .remove::<ProfileObject, _>(path.as_str())
         .await;
      info!("Unregistered profile {label}");
      Ok(())
   }

   /// Claims a descriptor parked by an earlier `NewConnection`, if any.
   pub fn take_pending(&self, device: &OwnedObjectPath) -> Option<OwnedFd> {
      self.state.lock().take_pending(device)
   }

   /// Marks a device's stream as gone so the label can be unregistered.
   pub fn forget_device(&self, label: &str, device: &OwnedObjectPath) {
      self
         .state
         .lock()
         .record_disconnection(&SmolStr::new(label), device);
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::os::unix::net::UnixStream;

   fn path(s: &str) -> OwnedObjectPath {
      OwnedObjectPath::try_from(s.to_string()).unwrap()
   }

   fn fresh_fd() -> OwnedFd {
      let (a, _b) = UnixStream::pair().unwrap();
      a.into()
   }

   #[test]
   fn pending_descriptor_is_claimed_once() {
      let mut state = ProfileState::default();
      let label = SmolStr::new("accessory");
      let dev = path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");

      state.record_connection(&label, dev.clone(), fresh_fd());
      assert!(state.take_pending(&dev).is_some());
      assert!(state.take_pending(&dev).is_none());
   }

   #[test]
   fn new_connection_overwrites_prior_descriptor() {
      let mut state = ProfileState::default();
      let label = SmolStr::new("accessory");
      let dev = path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");

      state.record_connection(&label, dev.clone(), fresh_fd());
      state.record_connection(&label, dev.clone(), fresh_fd());
      assert_eq!(state.pending.len(), 1);
      assert!(state.take_pending(&dev).is_some());
      assert!(state.take_pending(&dev).is_none());
   }

   #[test]
   fn disconnection_forgets_the_descriptor() {
      let mut state = ProfileState::default();
      let label = SmolStr::new("accessory");
      let dev = path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");

      state.record_connection(&label, dev.clone(), fresh_fd());
      state.record_disconnection(&label, &dev);
      assert!(state.take_pending(&dev).is_none());
      assert!(!state.has_connected("accessory"));
   }

   #[test]
   fn label_busy_while_devices_connected() {
      let mut state = ProfileState::default();
      let label = SmolStr::new("accessory");
      let dev_a = path("/org/bluez/hci0/dev_AA_AA_AA_AA_AA_AA");
      let dev_b = path("/org/bluez/hci0/dev_BB_BB_BB_BB_BB_BB");

      state.record_connection(&label, dev_a.clone(), fresh_fd());
      state.record_connection(&label, dev_b.clone(), fresh_fd());
      assert!(state.has_connected("accessory"));

      state.record_disconnection(&label, &dev_a);
      assert!(state.has_connected("accessory"));
      state.record_disconnection(&label, &dev_b);
      assert!(!state.has_connected("accessory"));
   }
}
