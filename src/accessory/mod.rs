//! Accessory device management and the enhanced protocol engine.
//!
//! This module contains the accessory-specific functionality including
//! model recognition, protocol encoding and parsing, and session
//! handling for connected devices.

pub mod capability;
pub mod device;
pub mod parser;
pub mod protocol;
