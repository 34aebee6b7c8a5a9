//! Accessory device state and the handshake session state machine.
//!
//! This module provides the [`Accessory`] type which represents one
//! connected enhanced-protocol accessory: it owns the byte-stream
//! transport for that device, drives the three-step handshake, turns
//! decoded frames into semantic events and turns application commands
//! into encoded packets.

use std::{
   fmt,
   collections::HashMap,
   os::fd::OwnedFd,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use serde_json::json;
use smallvec::SmallVec;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   sync::RwLock,
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   accessory::{
      capability::{BatteryTopology, CapabilityProfile, NoiseModeMap},
      parser::{self, InboundEvent},
      protocol::{
         BatteryInfo, Command, EarDetectionStatus, FeatureId, NoiseControlMode,
         PKT_REQUEST_NOTIFY,
      },
   },
   bluetooth::transport::{Packet, Transport, TransportReceiver},
   error::{PodLinkError, Result},
   event::{AccessoryEvent, EventSender},
};

/// Session establishment phases of the accessory protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
   Disconnected,
   AwaitingHandshakeAck,
   AwaitingFeaturesAck,
   Ready,
}

/// Semantic result of applying an inbound frame to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionOutput {
   Battery(BatteryInfo),
   EarDetection(EarDetectionStatus),
   Awareness(bool),
   Feature(FeatureId, u32),
}

/// The handshake state machine. Pure with respect to I/O: applying an
/// event yields the packets to send, so the machine can be driven and
/// tested without a transport.
struct Session {
   state: SessionState,
   caps: CapabilityProfile,
}

type Outbound = SmallVec<[Packet; 2]>;

impl Session {
   const fn new(caps: CapabilityProfile) -> Self {
      Self {
         state: SessionState::Disconnected,
         caps,
      }
   }

   /// Called when the transport opens; yields the handshake packet.
   fn start(&mut self) -> Outbound {
      self.state = SessionState::AwaitingHandshakeAck;
      SmallVec::from_iter([Command::Handshake.encode()])
   }

   fn reset(&mut self) {
      self.state = SessionState::Disconnected;
   }

   /// Applies a decoded inbound event. Acks out of turn and steady-state
   /// notifications before `Ready` are ignored.
   fn on_event(&mut self, event: InboundEvent) -> (Outbound, Option<SessionOutput>) {
      let mut out = Outbound::new();
      match event {
         InboundEvent::HandshakeAck => {
            if self.state == SessionState::AwaitingHandshakeAck {
               out.push(Command::SelectFeatures(self.caps).encode());
               out.push(Command::RequestNotifications.encode());
               self.state = SessionState::AwaitingFeaturesAck;
            } else {
               debug!("Handshake ack in state {:?}, ignoring", self.state);
            }
         },
         InboundEvent::FeaturesAck => {
            if self.state == SessionState::AwaitingFeaturesAck {
               self.state = SessionState::Ready;
            } else {
               debug!("Features ack in state {:?}, ignoring", self.state);
            }
         },
         InboundEvent::BatteryStatus(info) if self.state == SessionState::Ready => {
            return (out, Some(SessionOutput::Battery(info)));
         },
         InboundEvent::EarDetection(status) if self.state == SessionState::Ready => {
            return (out, Some(SessionOutput::EarDetection(status)));
         },
         InboundEvent::AwarenessAttenuation(attenuate) if self.state == SessionState::Ready => {
            return (out, Some(SessionOutput::Awareness(attenuate)));
         },
         InboundEvent::FeatureState(feature, value) if self.state == SessionState::Ready => {
            return (out, Some(SessionOutput::Feature(feature, value)));
         },
         InboundEvent::Unknown => {},
         other => {
            debug!("Notification {other:?} before Ready, ignoring");
         },
      }
      (out, None)
   }
}

/// Internal state for an active stream connection.
struct ConnectionState {
   transport: Transport,
   tasks: JoinSet<()>,
}

impl Drop for ConnectionState {
   fn drop(&mut self) {
      self.transport.close();
      self.tasks.abort_all();
   }
}

/// Internal shared state for one accessory.
struct AccessoryInner {
   address: Address,
   address_str: SmolStr,
   name: parking_lot::Mutex<SmolStr>,
   caps: CapabilityProfile,
   noise_map: NoiseModeMap,
   battery: AtomicCell<Option<BatteryInfo>>,
   ear_detection: AtomicCell<Option<EarDetectionStatus>>,
   awareness: AtomicCell<Option<bool>>,
   noise_mode: AtomicCell<Option<NoiseControlMode>>,
   feature_values: parking_lot::Mutex<HashMap<u8, u32>>,
   is_connected: AtomicBool,
   session: parking_lot::Mutex<Session>,
   conn: RwLock<Option<ConnectionState>>,
}

/// Represents one enhanced-protocol accessory.
///
/// This type is cheaply cloneable and thread-safe. The connection it
/// owns is destroyed when [`Accessory::disconnect`] runs or the peer
/// closes the stream; reconnection is initiated externally by the
/// manager observing the Bluetooth connection state.
#[derive(Clone)]
pub struct Accessory(Arc<AccessoryInner>);

/// Weak reference to an [`Accessory`].
#[derive(Clone)]
pub struct WeakAccessory(Weak<AccessoryInner>);

impl WeakAccessory {
   pub fn new(accessory: &Accessory) -> Self {
      Self(Arc::downgrade(&accessory.0))
   }

   pub fn upgrade(&self) -> Option<Accessory> {
      self.0.upgrade().map(Accessory)
   }
}

impl fmt::Debug for Accessory {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Accessory")
         .field("address", &self.0.address_str)
         .field("model", &self.0.caps.model)
         .finish()
   }
}

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, Copy)]
pub enum UpdateOp<T> {
   Noop,
   Inserted,
   Deleted(T),
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   fn apply_atomic(dst: &AtomicCell<Option<T>>, new: Option<T>) -> Self
   where
      T: Copy,
   {
      Self::new(dst.swap(new), new)
   }

   fn new(prev: Option<T>, new: Option<T>) -> Self {
      match (prev, new) {
         (Some(p), Some(n)) if p == n => Self::Noop,
         (None, Some(_)) => Self::Inserted,
         (Some(p), None) => Self::Deleted(p),
         (Some(_), Some(n)) => Self::Updated(n),
         (None, None) => Self::Noop,
      }
   }

   const fn is_updated(&self) -> bool {
      matches!(self, Self::Inserted | Self::Updated(_))
   }
}

impl Accessory {
   /// Creates a new accessory instance for a recognized model.
   pub fn new(address: Address, name: String, caps: CapabilityProfile) -> Self {
      Self(Arc::new(AccessoryInner {
         address,
         address_str: address.to_smolstr(),
         name: parking_lot::Mutex::new(name.into()),
         noise_map: caps.noise_mode_map(),
         session: parking_lot::Mutex::new(Session::new(caps)),
         caps,
         battery: AtomicCell::new(None),
         ear_detection: AtomicCell::new(None),
         awareness: AtomicCell::new(None),
         noise_mode: AtomicCell::new(None),
         feature_values: parking_lot::Mutex::new(HashMap::new()),
         is_connected: AtomicBool::new(false),
         conn: RwLock::new(None),
      }))
   }

   pub fn address(&self) -> Address {
      self.0.address
   }

   pub fn address_str(&self) -> &SmolStr {
      &self.0.address_str
   }

   pub fn name(&self) -> SmolStr {
      self.0.name.lock().clone()
   }

   pub fn capabilities(&self) -> &CapabilityProfile {
      &self.0.caps
   }

   pub fn is_connected(&self) -> bool {
      self.0.is_connected.load(Ordering::Relaxed)
   }

   pub fn session_state(&self) -> SessionState {
      self.0.session.lock().state
   }

   pub fn battery_info(&self) -> Option<BatteryInfo> {
      self.0.battery.load()
   }

   /// Single displayed level, reduced per the battery topology.
   pub fn representative_level(&self) -> Option<u8> {
      let single = self.0.caps.topology == BatteryTopology::Single;
      self.battery_info().map(|b| b.representative_level(single))
   }

   pub fn ear_detection(&self) -> Option<EarDetectionStatus> {
      self.0.ear_detection.load()
   }

   pub fn noise_mode(&self) -> Option<NoiseControlMode> {
      self.0.noise_mode.load()
   }

   /// Converts the device state to a JSON representation for the bus.
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
          "address": self.address_str().as_str(),
          "name": self.name().as_str(),
          "model": self.0.caps.model.to_string(),
          "family": self.0.caps.family,
          "connected": self.is_connected(),
      });

      if let Some(battery) = self.battery_info() {
         info["battery"] = battery.to_json();
      }
      if let Some(level) = self.representative_level() {
         info["battery_level"] = json!(u32::from(level));
      }
      if let Some(mode) = self.noise_mode() {
         info["noise_mode"] = json!(mode.to_str());
      }
      if let Some(ear) = self.ear_detection() {
         info["ear_detection"] = ear.to_json();
      }

      let features: HashMap<_, _> = self
         .0
         .feature_values
         .lock()
         .iter()
         .map(|(op, value)| (FeatureId::from_id(*op).to_str(), *value))
         .collect();
      info["features"] = json!(features);
      info
   }

   /// Takes ownership of an accepted stream descriptor and starts the
   /// handshake. Returns a handle that resolves when the connection dies.
   pub async fn connect(
      &self,
      fd: OwnedFd,
      event_tx: &EventSender,
   ) -> Result<JoinHandle<Option<PodLinkError>>> {
      info!("Opening accessory session with {}", self.address());
      let mut conn = self.0.conn.write().await;
      let _ = conn.take();

      let (transport, receiver) = Transport::open(fd)?;

      let opening = self.0.session.lock().start();
      for pkt in opening {
         transport.send(&pkt)?;
      }

      let mut tasks = JoinSet::new();
      self.spawn_notify_retry(&mut tasks);
      let jhandle = self.start_packet_processor(receiver, event_tx.clone());

      *conn = Some(ConnectionState { transport, tasks });
      self.0.is_connected.store(true, Ordering::Relaxed);

      info!("Handshake started with {}", self.address());
      Ok(jhandle)
   }

   /// Tears down the connection. Idempotent and safe to call from error
   /// paths; owned resources are released in a fixed order (tasks, then
   /// transport via the connection state drop).
   pub async fn disconnect(&self) {
      self.0.is_connected.store(false, Ordering::Relaxed);
      self.0.session.lock().reset();
      let _ = self.0.conn.write().await.take();
      info!("Disconnected from {}", self.address());
   }

   async fn notify_disconnected(&self, event_tx: &EventSender) {
      self.disconnect().await;
      event_tx.emit(self.address_str(), AccessoryEvent::DeviceDisconnected);
   }

   /// Notifications alone may not deliver a battery reading before the
   /// next physical change, so nudge the device until one lands.
   fn spawn_notify_retry(&self, tasks: &mut JoinSet<()>) {
      const RETRY_SCHEDULE: &[Duration] = &[
         Duration::from_secs(2),
         Duration::from_secs(3),
         Duration::from_secs(5),
         Duration::from_secs(10),
      ];

      let weak = WeakAccessory::new(self);
      let mac = self.address();
      tasks.spawn(async move {
         time::sleep(Duration::from_secs(1)).await;
         for (i, delay) in RETRY_SCHEDULE.iter().enumerate() {
            let Some(this) = weak.upgrade() else { return };
            if this.battery_info().is_some() {
               debug!("{mac}: Battery status established after {i} retries");
               return;
            }
            warn!("{mac}: [Retry {i}] No battery status yet, re-requesting in {delay:?}");
            let _ = this.send_raw(PKT_REQUEST_NOTIFY).await;
            time::sleep(*delay).await;
         }
      });
   }

   fn start_packet_processor(
      &self,
      mut rx: TransportReceiver,
      event_tx: EventSender,
   ) -> JoinHandle<Option<PodLinkError>> {
      let addr = self.address();
      let weak = WeakAccessory::new(self);
      tokio::spawn(async move {
         let mut err = None;
         loop {
            match rx.recv().await {
               Ok(packet) => {
                  if let Some(this) = weak.upgrade() {
                     this.process_packet(&packet, &event_tx).await;
                  } else {
                     warn!("{addr}: Accessory instance was dropped");
                     break;
                  }
               },
               Err(e) => {
                  if let Some(this) = weak.upgrade() {
                     this.notify_disconnected(&event_tx).await;
                  } else {
                     warn!("{addr}: Connection closed: {e:?}");
                  }
                  err = Some(e);
                  break;
               },
            }
         }
         err
      })
   }

   async fn process_packet(&self, packet: &[u8], event_tx: &EventSender) {
      let event = match parser::classify(packet) {
         Ok(event) => event,
         Err(e) => {
            // Malformed frame under a known signature: drop it, the
            // connection stays open.
            warn!("{}: Dropping malformed frame: {e}", self.address());
            return;
         },
      };

      if event == InboundEvent::Unknown {
         debug!(
            "{}: Unknown packet, {} bytes => {}",
            self.address(),
            packet.len(),
            hex::encode(packet)
         );
         return;
      }

      let (outbound, output) = self.0.session.lock().on_event(event);
      for pkt in &outbound {
         if let Err(e) = self.send_raw(pkt).await {
            warn!("{}: Failed to send session packet: {e}", self.address());
            return;
         }
      }

      match output {
         Some(SessionOutput::Battery(battery)) => {
            debug!(
               "Battery updated for {}: L:{}% R:{}% C:{}%",
               self.address(),
               battery.left.level,
               battery.right.level,
               battery.case.level
            );
            if UpdateOp::apply_atomic(&self.0.battery, Some(battery)).is_updated() {
               event_tx.emit(self.address_str(), AccessoryEvent::BatteryUpdated(battery));
            }
         },
         Some(SessionOutput::EarDetection(status)) => {
            if UpdateOp::apply_atomic(&self.0.ear_detection, Some(status)).is_updated() {
               event_tx.emit(
                  self.address_str(),
                  AccessoryEvent::EarDetectionChanged(status),
               );
            }
         },
         Some(SessionOutput::Awareness(attenuate)) => {
            if UpdateOp::apply_atomic(&self.0.awareness, Some(attenuate)).is_updated() {
               event_tx.emit(self.address_str(), AccessoryEvent::AwarenessChanged(attenuate));
            }
         },
         Some(SessionOutput::Feature(feature, value)) => {
            self.apply_feature_state(feature, value, event_tx);
         },
         None => {},
      }
   }

   fn apply_feature_state(&self, feature: FeatureId, value: u32, event_tx: &EventSender) {
      if feature == FeatureId::NOISE_CONTROL {
         let Some(mode) = u8::try_from(value)
            .ok()
            .and_then(|idx| self.0.noise_map.decode(idx))
         else {
            warn!("{}: Unknown noise mode index {value}", self.address());
            return;
         };
         if UpdateOp::apply_atomic(&self.0.noise_mode, Some(mode)).is_updated() {
            event_tx.emit(self.address_str(), AccessoryEvent::NoiseControlChanged(mode));
         }
         return;
      }

      let prev = self.0.feature_values.lock().insert(feature.id(), value);
      if prev != Some(value) {
         event_tx.emit(
            self.address_str(),
            AccessoryEvent::FeatureStateChanged(feature, value),
         );
      }
   }

   async fn send_raw(&self, packet: &[u8]) -> Result<()> {
      let conn = self.0.conn.read().await;
      match conn.as_ref() {
         Some(conn) => conn.transport.send(packet),
         None => Err(PodLinkError::DeviceNotConnected),
      }
   }

   /// Sends a control command. A logged no-op while the session is still
   /// establishing; an error when there is no connection at all.
   async fn send_control(&self, op: FeatureId, value: u32) -> Result<bool> {
      match self.session_state() {
         SessionState::Ready => {
            self
               .send_raw(&Command::Control { op, value }.encode())
               .await?;
            Ok(true)
         },
         SessionState::Disconnected => Err(PodLinkError::DeviceNotConnected),
         state => {
            warn!(
               "{}: Ignoring {op} command, session in {state:?}",
               self.address()
            );
            Ok(false)
         },
      }
   }

   fn require(&self, supported: bool, what: &str) -> Result<()> {
      if supported {
         Ok(())
      } else {
         Err(PodLinkError::FeatureNotSupported(what.to_string()))
      }
   }

   pub async fn set_noise_control(&self, mode: NoiseControlMode) -> Result<()> {
      self.require(self.0.caps.noise_control, "noise_control")?;
      let index = self
         .0
         .noise_map
         .encode(mode)
         .ok_or_else(|| PodLinkError::FeatureNotSupported(mode.to_str().to_string()))?;
      if self
         .send_control(FeatureId::NOISE_CONTROL, u32::from(index))
         .await?
      {
         self.0.noise_mode.store(Some(mode));
      }
      Ok(())
   }

   pub async fn set_conversation_awareness(&self, enabled: bool) -> Result<()> {
      self.require(self.0.caps.conversation_awareness, "conversation_awareness")?;
      self
         .send_control(
            FeatureId::CONVERSATION_AWARENESS,
            if enabled { 1 } else { 2 },
         )
         .await
         .map(drop)
   }

   pub async fn set_tone_volume(&self, volume: u8) -> Result<()> {
      self.require(self.0.caps.tone_volume, "tone_volume")?;
      self
         .send_control(FeatureId::TONE_VOLUME, u32::from(volume.min(100)))
         .await
         .map(drop)
   }

   pub async fn set_press_speed(&self, speed: u8) -> Result<()> {
      self.require(self.0.caps.press_control, "press_speed")?;
      self
         .send_control(FeatureId::PRESS_SPEED, u32::from(speed))
         .await
         .map(drop)
   }

   pub async fn set_press_duration(&self, duration: u8) -> Result<()> {
      self.require(self.0.caps.press_control, "press_duration")?;
      self
         .send_control(FeatureId::PRESS_DURATION, u32::from(duration))
         .await
         .map(drop)
   }

   pub async fn set_volume_swipe(&self, enabled: bool) -> Result<()> {
      self.require(self.0.caps.volume_swipe, "volume_swipe")?;
      self
         .send_control(FeatureId::VOLUME_SWIPE, if enabled { 1 } else { 2 })
         .await
         .map(drop)
   }

   pub async fn set_volume_swipe_length(&self, length: u8) -> Result<()> {
      self.require(self.0.caps.volume_swipe, "volume_swipe_length")?;
      self
         .send_control(FeatureId::VOLUME_SWIPE_LENGTH, u32::from(length))
         .await
         .map(drop)
   }

   pub async fn set_adaptive_volume(&self, level: u8) -> Result<()> {
      self.require(self.0.caps.adaptive_transparency, "adaptive_volume")?;
      self
         .send_control(FeatureId::ADAPTIVE_VOLUME, u32::from(level.min(100)))
         .await
         .map(drop)
   }

   pub async fn set_long_press_cycle(&self, value: u8) -> Result<()> {
      self.require(self.0.caps.long_press_cycle, "long_press_cycle")?;
      self
         .send_control(FeatureId::LONG_PRESS_CYCLE, u32::from(value))
         .await
         .map(drop)
   }

   /// Sends a raw prebuilt packet, for diagnostics over the bus.
   pub async fn passthrough(&self, packet: &[u8]) -> Result<()> {
      self.send_raw(packet).await
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::accessory::{
      capability::{ModelCode, profile_for},
      protocol::{
         BatteryState, BatteryStatus, HDR_ACK_FEATURES, HDR_ACK_HANDSHAKE, HDR_BATTERY_STATE,
         PKT_HANDSHAKE,
      },
   };
   use std::os::unix::net::UnixStream as StdUnixStream;
   use tokio::{
      io::{AsyncReadExt, AsyncWriteExt},
      net::UnixStream,
   };

   fn caps() -> CapabilityProfile {
      *profile_for(ModelCode(0x2014)).unwrap()
   }

   fn battery(left: u8, right: u8) -> InboundEvent {
      InboundEvent::BatteryStatus(BatteryInfo {
         left: BatteryState {
            level: left,
            status: BatteryStatus::Discharging,
         },
         right: BatteryState {
            level: right,
            status: BatteryStatus::Discharging,
         },
         ..BatteryInfo::new()
      })
   }

   #[test]
   fn handshake_sequence_reaches_ready() {
      let mut session = Session::new(caps());
      let opening = session.start();
      assert_eq!(opening.len(), 1);
      assert_eq!(&opening[0][..], PKT_HANDSHAKE);
      assert_eq!(session.state, SessionState::AwaitingHandshakeAck);

      let (out, output) = session.on_event(InboundEvent::HandshakeAck);
      assert_eq!(out.len(), 2, "feature select + notify request");
      assert!(output.is_none());
      assert_eq!(session.state, SessionState::AwaitingFeaturesAck);

      let (out, output) = session.on_event(InboundEvent::FeaturesAck);
      assert!(out.is_empty());
      assert!(output.is_none());
      assert_eq!(session.state, SessionState::Ready);
   }

   #[test]
   fn premature_features_ack_is_ignored() {
      let mut session = Session::new(caps());
      session.start();

      let (out, output) = session.on_event(InboundEvent::FeaturesAck);
      assert!(out.is_empty());
      assert!(output.is_none());
      assert_eq!(session.state, SessionState::AwaitingHandshakeAck);
   }

   #[test]
   fn notifications_before_ready_are_dropped() {
      let mut session = Session::new(caps());
      session.start();
      session.on_event(InboundEvent::HandshakeAck);

      let (_, output) = session.on_event(battery(50, 60));
      assert!(output.is_none());
      assert_eq!(session.state, SessionState::AwaitingFeaturesAck);
   }

   #[test]
   fn notifications_flow_once_ready() {
      let mut session = Session::new(caps());
      session.start();
      session.on_event(InboundEvent::HandshakeAck);
      session.on_event(InboundEvent::FeaturesAck);

      let (_, output) = session.on_event(battery(50, 60));
      assert!(matches!(output, Some(SessionOutput::Battery(_))));
   }

   #[test]
   fn duplicate_handshake_ack_sends_nothing() {
      let mut session = Session::new(caps());
      session.start();
      session.on_event(InboundEvent::HandshakeAck);
      let (out, _) = session.on_event(InboundEvent::HandshakeAck);
      assert!(out.is_empty());
      assert_eq!(session.state, SessionState::AwaitingFeaturesAck);
   }

   struct CollectBus(parking_lot::Mutex<Vec<AccessoryEvent>>);

   impl EventBus for CollectBus {
      fn emit(&self, _address: &SmolStr, event: AccessoryEvent) {
         self.0.lock().push(event);
      }
   }

   use crate::event::EventBus;

   fn test_accessory() -> Accessory {
      Accessory::new(Address::any(), "Test Buds".to_string(), caps())
   }

   async fn connected_pair(
      accessory: &Accessory,
      event_tx: &EventSender,
   ) -> (UnixStream, JoinHandle<Option<PodLinkError>>) {
      let (ours, theirs) = StdUnixStream::pair().unwrap();
      theirs.set_nonblocking(true).unwrap();
      let peer = UnixStream::from_std(theirs).unwrap();
      let handle = accessory.connect(ours.into(), event_tx).await.unwrap();
      (peer, handle)
   }

   #[tokio::test]
   async fn full_session_against_fake_device() {
      let bus = Arc::new(CollectBus(parking_lot::Mutex::new(Vec::new())));
      let event_tx: EventSender = bus.clone();
      let accessory = test_accessory();
      let (mut peer, _handle) = connected_pair(&accessory, &event_tx).await;

      // Device side: expect the handshake, then ack it.
      let mut buf = vec![0u8; PKT_HANDSHAKE.len()];
      peer.read_exact(&mut buf).await.unwrap();
      assert_eq!(buf, PKT_HANDSHAKE);
      peer.write_all(HDR_ACK_HANDSHAKE).await.unwrap();

      // Expect feature select + notify request, then ack the features.
      let mut buf = [0u8; 64];
      let n = peer.read(&mut buf).await.unwrap();
      assert!(n > 0);
      peer.write_all(HDR_ACK_FEATURES).await.unwrap();

      // Wait for the ack to land before writing more, so the two frames
      // cannot coalesce into a single read on the accessory side.
      for _ in 0..100 {
         if accessory.session_state() == SessionState::Ready {
            break;
         }
         time::sleep(Duration::from_millis(10)).await;
      }
      assert_eq!(accessory.session_state(), SessionState::Ready);

      // Steady state: push a battery frame and wait for the event.
      let mut frame = HDR_BATTERY_STATE.to_vec();
      frame.push(2);
      frame.extend_from_slice(&[0x04, 0x00, 80, 0x02, 0x00]);
      frame.extend_from_slice(&[0x02, 0x00, 73, 0x02, 0x00]);
      peer.write_all(&frame).await.unwrap();

      let mut battery = None;
      for _ in 0..100 {
         if let Some(AccessoryEvent::BatteryUpdated(info)) = bus
            .0
            .lock()
            .iter()
            .find(|e| matches!(e, AccessoryEvent::BatteryUpdated(_)))
            .cloned()
         {
            battery = Some(info);
            break;
         }
         time::sleep(Duration::from_millis(10)).await;
      }
      let battery = battery.expect("no battery event");
      assert_eq!(battery.left.level, 80);
      assert_eq!(battery.right.level, 73);
      assert_eq!(accessory.session_state(), SessionState::Ready);
      assert_eq!(accessory.representative_level(), Some(73));
   }

   #[tokio::test]
   async fn commands_before_ready_are_noops() {
      let bus = Arc::new(CollectBus(parking_lot::Mutex::new(Vec::new())));
      let event_tx: EventSender = bus;
      let accessory = test_accessory();
      let (mut peer, _handle) = connected_pair(&accessory, &event_tx).await;

      // Still awaiting the handshake ack; the command must not crash and
      // must not hit the wire.
      accessory
         .set_noise_control(NoiseControlMode::Anc)
         .await
         .unwrap();

      let mut buf = vec![0u8; PKT_HANDSHAKE.len()];
      peer.read_exact(&mut buf).await.unwrap();
      assert_eq!(buf, PKT_HANDSHAKE);

      // Nothing else queued behind the handshake.
      let extra = time::timeout(Duration::from_millis(100), peer.read(&mut buf)).await;
      assert!(extra.is_err(), "unexpected bytes after handshake");
   }

   #[tokio::test]
   async fn commands_without_connection_fail() {
      let accessory = test_accessory();
      assert!(matches!(
         accessory.set_volume_swipe(true).await,
         Err(PodLinkError::DeviceNotConnected)
      ));
      assert!(matches!(
         accessory.passthrough(&[0x00]).await,
         Err(PodLinkError::DeviceNotConnected)
      ));
   }

   #[tokio::test]
   async fn unsupported_feature_is_rejected() {
      let basic = *profile_for(ModelCode(0x200E)).unwrap();
      let accessory = Accessory::new(Address::any(), "Old Buds".to_string(), basic);
      assert!(matches!(
         accessory.set_volume_swipe(true).await,
         Err(PodLinkError::FeatureNotSupported(_))
      ));
   }
}
