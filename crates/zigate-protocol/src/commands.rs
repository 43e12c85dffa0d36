//! ZiGate command catalog
//!
//! Static metadata for every host command: how the firmware answers it and
//! whether its payload carries a destination short address. The coordinator
//! consults this table to decide what a submitted command must wait for.

use std::collections::{HashMap, HashSet};

/// Status response confirming receipt of a host command
pub const STATUS: u16 = 0x8000;
/// APS acknowledgement relayed from the remote device (firmware 3.1b+)
pub const APS_DATA_ACK: u16 = 0x8011;
/// Route discovery completed (success or failure)
pub const ROUTE_DISCOVERY_CONFIRM: u16 = 0x8701;
/// APS transmission could not be delivered
pub const APS_DATA_CONFIRM_FAILED: u16 = 0x8702;

/// How the firmware answers a host command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Host-side persistent-data-manager traffic; bypasses queuing entirely
    PdmOnHost,
    /// Only the `0x8000` status is expected
    StatusOnly,
    /// A `0x8000` status followed by a data response with this opcode
    StatusThenData(u16),
}

/// Host commands: `(opcode, nwkid in payload bytes 1..3, expected data response)`
///
/// Commands with a leading address-mode byte carry the destination short
/// address in payload bytes 1..3; those feed the per-device command log.
const COMMANDS: &[(u16, bool, Option<u16>)] = &[
    // Network and dongle management
    (0x0009, false, Some(0x8009)), // Get network state
    (0x0010, false, Some(0x8010)), // Get version
    (0x0011, false, None),         // Reset
    (0x0012, false, None),         // Erase persistent data
    (0x0014, false, Some(0x8014)), // Permit join status
    (0x0015, false, Some(0x8015)), // Get devices list
    (0x0016, false, None),         // Set time
    (0x0017, false, Some(0x8017)), // Get time
    (0x0018, false, None),         // Set LED
    (0x0019, false, None),         // Set certification
    (0x0020, false, None),         // Set extended PAN id
    (0x0021, false, None),         // Set channel mask
    (0x0023, false, None),         // Set device type
    (0x0024, false, Some(0x8024)), // Start network
    (0x0025, false, Some(0x8025)), // Start network scan
    (0x0026, false, None),         // Remove device
    (0x0027, false, None),         // Enable permissions controlled joins
    (0x0049, false, None),         // Permit joining request
    (0x004A, false, Some(0x804A)), // Management network update request
    (0x004B, false, Some(0x804B)), // System server discovery request
    (0x004E, false, Some(0x804E)), // Management LQI request
    (0x0530, false, None),         // Raw APS data request
    // ZDO requests; destination address leads the payload (bytes 0..2)
    (0x0030, false, Some(0x8030)), // Bind
    (0x0031, false, Some(0x8031)), // Unbind
    (0x0040, false, Some(0x8040)), // Network address request
    (0x0041, false, Some(0x8041)), // IEEE address request
    (0x0042, false, Some(0x8042)), // Node descriptor request
    (0x0043, false, Some(0x8043)), // Simple descriptor request
    (0x0044, false, Some(0x8044)), // Power descriptor request
    (0x0045, false, Some(0x8045)), // Active endpoints request
    (0x0046, false, Some(0x8046)), // Match descriptor request
    (0x0047, false, Some(0x8047)), // Management leave request
    // Group commands; address mode then destination in bytes 1..3
    (0x0060, true, Some(0x8060)), // Add group
    (0x0061, true, Some(0x8061)), // View group
    (0x0062, true, Some(0x8062)), // Get group membership
    (0x0063, true, Some(0x8063)), // Remove group
    (0x0064, true, None),         // Remove all groups
    (0x0065, true, None),         // Add group if identify
    // Identify
    (0x0070, true, None),         // Identify send
    (0x0071, true, Some(0x8071)), // Identify query
    // Level control; action commands answer with a status only
    (0x0080, true, None), // Move to level
    (0x0081, true, None), // Move to level with on/off
    (0x0082, true, None), // Move step
    (0x0083, true, None), // Move stop
    (0x0084, true, None), // Move stop with on/off
    // On/off
    (0x0092, true, None), // On/off state change
    (0x0093, true, None), // On/off timed send
    (0x0094, true, None), // On/off with effects
    // Colour control
    (0x00B0, true, None), // Move to hue
    (0x00B1, true, None), // Move to hue and saturation
    (0x00B2, true, None), // Move to colour
    (0x00B3, true, None), // Move colour
    (0x00B7, true, None), // Move to colour temperature
    (0x00C0, true, None), // Move to hue - enhanced
    (0x00C1, true, None), // Move to saturation
    (0x00C2, true, None), // Move colour temperature
    // Attribute operations
    (0x0100, true, Some(0x8100)), // Read attribute request
    (0x0110, true, Some(0x8110)), // Write attribute request
    (0x0120, true, Some(0x8120)), // Configure reporting request
];

/// Host-side PDM traffic: answers to the dongle's persistent-data requests.
/// No status confirmation follows; these must never occupy the wait slot.
const PDM_ON_HOST: &[u16] = &[
    0x8200, 0x8201, 0x8204, 0x8205, 0x8206, 0x8207, 0x8208, 0x8300,
];

/// Firmware-originated asynchronous notifications, forwarded untouched
const STANDALONE: &[u16] = &[
    0x004D, // Device announce
    0x8001, // Log message
    0x8002, // Data indication
    0x8003, // Cluster list
    0x8004, // Attribute list
    0x8005, // Command list
    0x8006, // Non factory-new restart
    0x8007, // Factory-new restart
    0x8008, // Heartbeat
    0x8035, // PDM event
    0x8048, // Leave indication
    0x8085, // Remote button - level control
    0x8095, // Remote button - on/off
    0x80A7, // Remote button - scene control
    0x8101, // Default response
    0x8102, // Individual attribute report
    0x8401, // IAS zone status change
    0x8501, // OTA image block request
    0x8503, // OTA upgrade end request
];

/// Per-opcode metadata
#[derive(Debug, Clone, Copy)]
struct CommandSpec {
    class: CommandClass,
    nwk_id_in_payload: bool,
}

/// Lookup table built once at transport construction
#[derive(Debug)]
pub struct CommandCatalog {
    commands: HashMap<u16, CommandSpec>,
    standalone: HashSet<u16>,
}

impl Default for CommandCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandCatalog {
    #[must_use]
    pub fn new() -> Self {
        let mut commands = HashMap::with_capacity(COMMANDS.len() + PDM_ON_HOST.len());
        for &(opcode, nwk_id_in_payload, data_response) in COMMANDS {
            let class = match data_response {
                Some(expected) => CommandClass::StatusThenData(expected),
                None => CommandClass::StatusOnly,
            };
            commands.insert(
                opcode,
                CommandSpec {
                    class,
                    nwk_id_in_payload,
                },
            );
        }
        for &opcode in PDM_ON_HOST {
            commands.insert(
                opcode,
                CommandSpec {
                    class: CommandClass::PdmOnHost,
                    nwk_id_in_payload: false,
                },
            );
        }

        Self {
            commands,
            standalone: STANDALONE.iter().copied().collect(),
        }
    }

    /// Classify a host command; unknown opcodes expect a bare status
    #[must_use]
    pub fn classify(&self, opcode: u16) -> CommandClass {
        self.commands
            .get(&opcode)
            .map_or(CommandClass::StatusOnly, |spec| spec.class)
    }

    /// Whether payload bytes 1..3 carry the destination short address
    #[must_use]
    pub fn nwk_id_in_payload(&self, opcode: u16) -> bool {
        self.commands
            .get(&opcode)
            .is_some_and(|spec| spec.nwk_id_in_payload)
    }

    /// Whether the opcode is a pure-async firmware notification
    #[must_use]
    pub fn is_standalone(&self, opcode: u16) -> bool {
        self.standalone.contains(&opcode)
    }
}
