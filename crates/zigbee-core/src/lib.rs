//! Zigbee device store
//!
//! This crate keeps the table of devices known to the coordinator and the
//! per-device command history that the low-level ZiGate transport consults
//! when diagnosing APS delivery failures.

pub mod device;
pub mod persistence;
pub mod store;

pub use device::{ZigbeeDevice, LAST_CMDS_RETENTION};
pub use store::DeviceStore;
