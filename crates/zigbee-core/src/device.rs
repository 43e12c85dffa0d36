//! Zigbee device representation

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use zigate_protocol::CommandRecord;

/// How many sent commands to remember per device; the transport only ever
/// inspects the newest few when diagnosing an APS failure
pub const LAST_CMDS_RETENTION: usize = 10;

/// A Zigbee device on the network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZigbeeDevice {
    /// Network short address
    pub nwk_address: u16,
    /// IEEE address (EUI-64), once learned
    pub ieee_address: Option<[u8; 8]>,
    /// Model identifier (from the Basic cluster)
    pub model: Option<String>,
    /// User-assigned friendly name
    pub friendly_name: Option<String>,
    /// Last seen timestamp
    #[serde(skip)]
    pub last_seen: Option<Instant>,
    /// Commands recently sent to this device, oldest first
    #[serde(skip)]
    pub last_cmds: VecDeque<CommandRecord>,
}

impl ZigbeeDevice {
    /// Create a new device with just its short address
    #[must_use]
    pub fn new(nwk_address: u16) -> Self {
        Self {
            nwk_address,
            ieee_address: None,
            model: None,
            friendly_name: None,
            last_seen: None,
            last_cmds: VecDeque::new(),
        }
    }

    /// Remember a sent command, trimming the history to its retention
    pub fn push_cmd(&mut self, record: CommandRecord) {
        if self.last_cmds.len() == LAST_CMDS_RETENTION {
            self.last_cmds.pop_front();
        }
        self.last_cmds.push_back(record);
    }

    /// Get IEEE address as hex string, big-endian display order
    #[must_use]
    pub fn ieee_address_string(&self) -> Option<String> {
        self.ieee_address.map(|ieee| {
            ieee.iter()
                .rev()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":")
        })
    }

    /// Get a display name (friendly name, model, or the short address)
    #[must_use]
    pub fn display_name(&self) -> String {
        self.friendly_name
            .clone()
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| format!("{:#06x}", self.nwk_address))
    }
}
