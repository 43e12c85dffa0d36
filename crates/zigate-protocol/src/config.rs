//! Transport configuration

use crate::types::ProtocolError;
use std::fmt;
use std::time::Duration;

/// Fixed baud rate for all serial ZiGate flavours
pub const BAUD_RATE: u32 = 115200;

/// Default expiry for the status/data wait slots
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Physical connection to the dongle
#[derive(Debug, Clone)]
pub enum LinkConfig {
    /// ZiGate USB-TTL dongle
    Usb { path: String },
    /// DIN-rail mounted ZiGate
    Din { path: String },
    /// Raspberry Pi hat, on the Pi's own UART
    Pi { path: String },
    /// Wi-Fi bridge exposing the UART over TCP
    Wifi { address: String, port: u16 },
}

impl LinkConfig {
    /// Serial device path for the serial flavours
    #[must_use]
    pub fn serial_path(&self) -> Option<&str> {
        match self {
            LinkConfig::Usb { path } | LinkConfig::Din { path } | LinkConfig::Pi { path } => {
                Some(path)
            }
            LinkConfig::Wifi { .. } => None,
        }
    }

    /// Reject serial paths that cannot be a tty
    #[allow(clippy::missing_errors_doc)]
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(path) = self.serial_path() {
            if !path.starts_with("/dev/") && !path.starts_with("COM") {
                return Err(ProtocolError::InvalidLinkConfig(format!(
                    "serial device path must match /dev/* or COM*: {path}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for LinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkConfig::Usb { path } => write!(f, "serial (USB) {path}"),
            LinkConfig::Din { path } => write!(f, "serial (DIN) {path}"),
            LinkConfig::Pi { path } => write!(f, "serial (PI) {path}"),
            LinkConfig::Wifi { address, port } => write!(f, "tcp {address}:{port}"),
        }
    }
}

/// How eagerly the coordinator frees the in-flight slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// Wait for the data response of commands that have one
    ZigBee,
    /// Only the status gates the in-flight slot; never wait for data
    Aggressive,
}

/// Transport-wide settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub link: LinkConfig,
    pub mode: OperatingMode,
    /// Expiry for the head of the status and data wait slots
    pub command_timeout: Duration,
    /// Track commands for APS acknowledgement (firmware 3.1b+)
    pub aps_ack: bool,
    /// Resend a failed command inside the retry window
    pub aps_retransmit: bool,
    /// Requeue route-unavailable failures until the route discovery confirm
    pub aps_route_error: bool,
}

impl TransportConfig {
    #[must_use]
    pub fn new(link: LinkConfig) -> Self {
        Self {
            link,
            mode: OperatingMode::ZigBee,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            aps_ack: false,
            aps_retransmit: false,
            aps_route_error: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_path_validation() {
        assert!(LinkConfig::Usb {
            path: "/dev/ttyUSB0".to_string()
        }
        .validate()
        .is_ok());
        assert!(LinkConfig::Din {
            path: "COM3".to_string()
        }
        .validate()
        .is_ok());
        assert!(LinkConfig::Usb {
            path: "ttyUSB0".to_string()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_wifi_needs_no_path() {
        let config = LinkConfig::Wifi {
            address: "192.168.1.10".to_string(),
            port: 9999,
        };
        assert!(config.serial_path().is_none());
        assert!(config.validate().is_ok());
    }
}
