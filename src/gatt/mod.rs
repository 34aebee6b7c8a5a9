//! BLE GATT Battery Service aggregation.
//!
//! Some accessories expose per-component battery levels through standard
//! GATT Battery Level characteristics instead of (or in addition to) the
//! enhanced stream protocol. This module discovers those characteristics,
//! classifies them by their presentation-format descriptor, and folds the
//! readings into a stable three-slot record.

pub mod aggregator;
pub mod scanner;
