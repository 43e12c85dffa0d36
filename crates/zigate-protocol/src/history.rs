//! Per-destination command history
//!
//! When an APS failure reports that a destination has no route, the
//! coordinator needs to know which command to replay once a route discovery
//! completes. The device store lives with the embedding application, so the
//! transport talks to it through this narrow contract instead of holding a
//! reference to the full device model.

use std::time::Instant;

/// One command sent towards a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub at: Instant,
    pub opcode: u16,
    /// Retained only when a retry policy is active; replay needs it
    pub payload: Option<Vec<u8>>,
}

impl CommandRecord {
    #[must_use]
    pub fn new(opcode: u16, payload: Option<Vec<u8>>) -> Self {
        Self {
            at: Instant::now(),
            opcode,
            payload,
        }
    }
}

/// Command log owned by the embedding application's device store
pub trait CommandHistory: Send + Sync {
    /// Whether the destination is a known device
    fn contains(&self, nwkid: u16) -> bool;

    /// Append a record to the destination's history
    fn record(&self, nwkid: u16, record: CommandRecord);

    /// Most recent records for the destination, newest first
    fn recent(&self, nwkid: u16, limit: usize) -> Vec<CommandRecord>;
}
