//! Discovery and subscription for GATT Battery Level characteristics.
//!
//! One ObjectManager snapshot yields every battery characteristic under a
//! device path; the optional presentation-format descriptor next to each
//! one decides its slot classification. Each characteristic gets a notify
//! subscription plus one explicit initial read, since BlueZ only pushes a
//! value change when the physical level moves.

use std::collections::HashMap;

use futures::StreamExt;
use log::{debug, warn};
use parking_lot::Mutex;
use smol_str::{SmolStr, ToSmolStr};
use std::sync::Arc;
use tokio::task::JoinSet;
use zbus::{
   Connection, proxy,
   zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value},
};

use crate::{
   error::Result,
   event::{AccessoryEvent, EventSender},
   gatt::aggregator::{BatterySlotAggregator, CanonicalBatteryRecord, SlotClass},
};

/// Standard Battery Level characteristic UUID.
pub const BATTERY_LEVEL_UUID: &str = "00002a19-0000-1000-8000-00805f9b34fb";
/// Standard Characteristic Presentation Format descriptor UUID.
pub const PRESENTATION_FORMAT_UUID: &str = "00002904-0000-1000-8000-00805f9b34fb";

const GATT_CHARACTERISTIC_IFACE: &str = "org.bluez.GattCharacteristic1";
const GATT_DESCRIPTOR_IFACE: &str = "org.bluez.GattDescriptor1";

#[proxy(
   interface = "org.freedesktop.DBus.ObjectManager",
   default_service = "org.bluez",
   default_path = "/"
)]
trait ObjectManager {
   fn get_managed_objects(
      &self,
   ) -> zbus::Result<HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>>;
}

#[proxy(interface = "org.bluez.GattCharacteristic1", default_service = "org.bluez")]
trait GattCharacteristic1 {
   fn read_value(&self, options: HashMap<&str, Value<'_>>) -> zbus::Result<Vec<u8>>;

   fn start_notify(&self) -> zbus::Result<()>;

   fn stop_notify(&self) -> zbus::Result<()>;

   #[zbus(property)]
   fn value(&self) -> zbus::Result<Vec<u8>>;
}

#[proxy(interface = "org.bluez.GattDescriptor1", default_service = "org.bluez")]
trait GattDescriptor1 {
   fn read_value(&self, options: HashMap<&str, Value<'_>>) -> zbus::Result<Vec<u8>>;
}

/// One discovered battery characteristic.
#[derive(Debug, Clone)]
pub struct GattCharacteristicRecord {
   pub path: OwnedObjectPath,
   pub class: SlotClass,
}

fn str_prop<'a>(props: &'a HashMap<String, OwnedValue>, key: &str) -> Option<&'a str> {
   props.get(key)?.downcast_ref::<&str>().ok()
}

/// Enumerates the battery characteristics of one device from a single
/// bus-wide object snapshot. Descriptor failures degrade the match to
/// [`SlotClass::Unknown`] instead of dropping it.
pub async fn scan(
   connection: &Connection,
   device_path: &ObjectPath<'_>,
) -> Result<Vec<GattCharacteristicRecord>> {
   let object_manager = ObjectManagerProxy::new(connection).await?;
   let objects = object_manager.get_managed_objects().await?;

   let device_prefix = format!("{device_path}/");
   let mut records = Vec::new();

   let mut paths: Vec<_> = objects.keys().collect();
   paths.sort_by(|a, b| a.as_str().cmp(b.as_str()));

   for path in paths {
      let interfaces = &objects[path];
      if !path.as_str().starts_with(&device_prefix) {
         continue;
      }
      let Some(props) = interfaces.get(GATT_CHARACTERISTIC_IFACE) else {
         continue;
      };
      if str_prop(props, "UUID") != Some(BATTERY_LEVEL_UUID) {
         continue;
      }

      let class = match find_presentation_format(&objects, path) {
         Some(descriptor) => match read_descriptor(connection, &descriptor).await {
            Ok(raw) => SlotClass::from_presentation_format(&raw),
            Err(e) => {
               warn!("Failed to read presentation format of {path}: {e}");
               SlotClass::Unknown
            },
         },
         None => SlotClass::Unknown,
      };

      debug!("Battery characteristic {path} classified as {class:?}");
      records.push(GattCharacteristicRecord {
         path: path.clone(),
         class,
      });
   }
   Ok(records)
}

/// Finds the presentation-format descriptor attached to a characteristic
/// in the same snapshot.
fn find_presentation_format(
   objects: &HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>,
   characteristic: &OwnedObjectPath,
) -> Option<OwnedObjectPath> {
   let prefix = format!("{characteristic}/");
   objects.iter().find_map(|(path, interfaces)| {
      let props = interfaces.get(GATT_DESCRIPTOR_IFACE)?;
      (path.as_str().starts_with(&prefix)
         && str_prop(props, "UUID") == Some(PRESENTATION_FORMAT_UUID))
      .then(|| path.clone())
   })
}

async fn read_descriptor(connection: &Connection, path: &OwnedObjectPath) -> Result<Vec<u8>> {
   let descriptor = GattDescriptor1Proxy::builder(connection)
      .path(path.clone())?
      .build()
      .await?;
   Ok(descriptor.read_value(HashMap::new()).await?)
}

/// Watches all battery characteristics of one device and feeds their
/// readings through a shared [`BatterySlotAggregator`]. Dropping the
/// watcher cancels every subscription task.
pub struct GattBatteryWatcher {
   address: SmolStr,
   aggregator: Arc<Mutex<BatterySlotAggregator>>,
   tasks: JoinSet<()>,
}

impl GattBatteryWatcher {
   /// Scans the device and subscribes to every battery characteristic
   /// found. A characteristic whose subscription fails is logged and
   /// skipped; an empty scan result is not an error.
   pub async fn start(
      connection: &Connection,
      address: impl Into<SmolStr>,
      device_path: &ObjectPath<'_>,
      event_tx: &EventSender,
   ) -> Result<Self> {
      let address = address.into();
      let records = scan(connection, device_path).await?;
      debug!(
         "{address}: {} battery characteristic(s) under {device_path}",
         records.len()
      );

      let aggregator = Arc::new(Mutex::new(BatterySlotAggregator::new()));
      let mut tasks = JoinSet::new();

      for record in records {
         let proxy = match GattCharacteristic1Proxy::builder(connection)
            .path(record.path.clone())
         {
            Ok(builder) => match builder.build().await {
               Ok(proxy) => proxy,
               Err(e) => {
                  warn!("{address}: Proxy for {} failed: {e}", record.path);
                  continue;
               },
            },
            Err(e) => {
               warn!("{address}: Bad characteristic path {}: {e}", record.path);
               continue;
            },
         };

         if let Err(e) = proxy.start_notify().await {
            warn!("{address}: StartNotify on {} failed: {e}", record.path);
            continue;
         }

         let id = record.path.to_smolstr();
         aggregator.lock().register(id.clone(), record.class);

         tasks.spawn(Self::watch_characteristic(
            proxy,
            id,
            address.clone(),
            aggregator.clone(),
            event_tx.clone(),
         ));
      }

      Ok(Self {
         address,
         aggregator,
         tasks,
      })
   }

   pub fn address(&self) -> &SmolStr {
      &self.address
   }

   pub fn record(&self) -> CanonicalBatteryRecord {
      self.aggregator.lock().record()
   }

   pub fn is_empty(&self) -> bool {
      self.tasks.is_empty()
   }

   async fn watch_characteristic(
      proxy: GattCharacteristic1Proxy<'static>,
      id: SmolStr,
      address: SmolStr,
      aggregator: Arc<Mutex<BatterySlotAggregator>>,
      event_tx: EventSender,
   ) {
      let mut last = None;
      let mut apply = |value: &[u8]| {
         let Some(&level) = value.first() else {
            return;
         };
         let record = aggregator.lock().update(&id, level);
         if last != Some(record) {
            last = Some(record);
            event_tx.emit(&address, AccessoryEvent::GattBatteryUpdated(record));
         }
      };

      let mut changes = proxy.receive_value_changed().await;

      // Notifications only fire on change, so pull the current level once
      // right after the subscription.
      match proxy.read_value(HashMap::new()).await {
         Ok(value) => apply(&value),
         Err(e) => warn!("{address}: Initial read of {id} failed: {e}"),
      }

      while let Some(change) = changes.next().await {
         match change.get().await {
            Ok(value) => apply(&value),
            Err(e) => {
               warn!("{address}: Value update on {id} failed: {e}");
               break;
            },
         }
      }
      debug!("{address}: Watch on {id} ended");
   }
}

impl Drop for GattBatteryWatcher {
   fn drop(&mut self) {
      self.tasks.abort_all();
   }
}
