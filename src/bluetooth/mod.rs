//! Bluetooth communication layer.
//!
//! This module provides connectivity for enhanced-protocol accessories:
//! the RFCOMM profile registration with BlueZ, the adopted byte-stream
//! transport, and device discovery/connection handling.

pub mod manager;
pub mod profile;
pub mod transport;
