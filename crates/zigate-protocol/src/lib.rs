//! ZiGate serial protocol implementation
//!
//! This crate implements the transport and command-coordination layer for
//! ZiGate Zigbee coordinator dongles, reachable over a serial UART
//! (USB, DIN-rail or Raspberry Pi flavours) or a Wi-Fi TCP bridge.

pub mod codec;
pub mod commands;
pub mod config;
pub mod frame;
pub mod history;
pub mod link;
mod pipeline;
pub mod sqn;
pub mod stats;
pub mod transport;
pub mod types;

pub use commands::{CommandCatalog, CommandClass};
pub use config::{LinkConfig, OperatingMode, TransportConfig, BAUD_RATE};
pub use frame::Frame;
pub use history::{CommandHistory, CommandRecord};
pub use link::LinkStream;
pub use sqn::SqnManager;
pub use stats::TransportStatistics;
pub use transport::ZigateTransport;
pub use types::*;
