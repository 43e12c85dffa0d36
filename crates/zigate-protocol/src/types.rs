//! Common types used throughout the protocol

use thiserror::Error;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Frame length mismatch: header implies {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Invalid link configuration: {0}")]
    InvalidLinkConfig(String),

    #[error("Link I/O error: {0}")]
    Link(#[from] std::io::Error),

    #[error("Transport not connected")]
    NotConnected,
}

/// APS delivery status codes reported in `0x8702` frames
pub mod aps_status {
    /// Unicast had no route available; a route discovery was started instead
    pub const ROUTE_UNAVAILABLE: u8 = 0xD1;
    /// Unicast had no route but the frame is buffered for automatic resend
    pub const ROUTE_BUFFERED: u8 = 0xD4;
    /// No acknowledgement received when expected
    pub const NO_ACK: u8 = 0xE9;
    /// Pending transaction expired and the data was discarded
    pub const EXPIRED: u8 = 0xF0;
    /// Route discovery failed due to lack of routing table space
    pub const NO_ROUTE_TABLE_SPACE: u8 = 0xCF;
}

/// Status confirmation (`0x8000`) sent for every host command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: u8,
    /// Sequence number the dongle assigned to the command
    pub sqn: u8,
    /// Opcode of the command being confirmed
    pub packet_type: u16,
}

impl StatusResponse {
    #[allow(clippy::missing_errors_doc)]
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::FrameTooShort(payload.len()));
        }
        Ok(Self {
            status: payload[0],
            sqn: payload[1],
            packet_type: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == 0x00
    }
}

/// APS acknowledgement (`0x8011`) from the remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApsAcknowledgement {
    pub status: u8,
    pub src_addr: u16,
    pub src_endpoint: u8,
    pub cluster: u16,
}

/// `0x8011` status value reporting a negative acknowledgement
pub const APS_NACK_STATUS: u8 = 0xA7;

impl ApsAcknowledgement {
    #[allow(clippy::missing_errors_doc)]
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 6 {
            return Err(ProtocolError::FrameTooShort(payload.len()));
        }
        Ok(Self {
            status: payload[0],
            src_addr: u16::from_be_bytes([payload[1], payload[2]]),
            src_endpoint: payload[3],
            cluster: u16::from_be_bytes([payload[4], payload[5]]),
        })
    }
}

/// Route discovery confirmation (`0x8701`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDiscoveryConfirm {
    pub nwk_status: u8,
    pub status: u8,
    /// Source of the discovery; only recent firmware reports it
    pub src: Option<u16>,
}

impl RouteDiscoveryConfirm {
    #[allow(clippy::missing_errors_doc)]
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 2 {
            return Err(ProtocolError::FrameTooShort(payload.len()));
        }
        let src = (payload.len() >= 4).then(|| u16::from_be_bytes([payload[2], payload[3]]));
        Ok(Self {
            nwk_status: payload[0],
            status: payload[1],
            src,
        })
    }

    /// Both the network layer and the request itself succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.nwk_status == 0x00 && self.status == 0x00
    }
}

/// Destination address of a failed APS transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Ieee([u8; 8]),
    Short(u16),
    Group(u16),
}

impl Destination {
    /// The 16-bit network address, when the mode carries one
    #[must_use]
    pub fn short_address(&self) -> Option<u16> {
        match self {
            Destination::Short(addr) | Destination::Group(addr) => Some(*addr),
            Destination::Ieee(_) => None,
        }
    }
}

/// APS failure indication (`0x8702`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApsFailure {
    pub status: u8,
    pub src_endpoint: u8,
    pub dst_endpoint: u8,
    pub destination: Destination,
    pub sqn: u8,
}

impl ApsFailure {
    #[allow(clippy::missing_errors_doc)]
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::FrameTooShort(payload.len()));
        }
        let status = payload[0];
        let src_endpoint = payload[1];
        let dst_endpoint = payload[2];

        let (destination, sqn_idx) = match payload[3] {
            0x01 => {
                if payload.len() < 13 {
                    return Err(ProtocolError::FrameTooShort(payload.len()));
                }
                let mut ieee = [0u8; 8];
                ieee.copy_from_slice(&payload[4..12]);
                (Destination::Ieee(ieee), 12)
            }
            0x02 => {
                if payload.len() < 7 {
                    return Err(ProtocolError::FrameTooShort(payload.len()));
                }
                (
                    Destination::Short(u16::from_be_bytes([payload[4], payload[5]])),
                    6,
                )
            }
            0x03 => {
                if payload.len() < 7 {
                    return Err(ProtocolError::FrameTooShort(payload.len()));
                }
                (
                    Destination::Group(u16::from_be_bytes([payload[4], payload[5]])),
                    6,
                )
            }
            mode => {
                return Err(ProtocolError::InvalidFrame(format!(
                    "unknown destination address mode: {mode:#04x}"
                )))
            }
        };

        Ok(Self {
            status,
            src_endpoint,
            dst_endpoint,
            destination,
            sqn: payload[sqn_idx],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_response_parse() {
        let status = StatusResponse::parse(&[0x00, 0x42, 0x01, 0x00]).expect("parse");
        assert!(status.is_success());
        assert_eq!(status.sqn, 0x42);
        assert_eq!(status.packet_type, 0x0100);
    }

    #[test]
    fn test_aps_failure_short_address() {
        let payload = [0xD1, 0x01, 0x01, 0x02, 0x12, 0x34, 0x77];
        let failure = ApsFailure::parse(&payload).expect("parse");
        assert_eq!(failure.status, aps_status::ROUTE_UNAVAILABLE);
        assert_eq!(failure.destination, Destination::Short(0x1234));
        assert_eq!(failure.destination.short_address(), Some(0x1234));
        assert_eq!(failure.sqn, 0x77);
    }

    #[test]
    fn test_aps_failure_ieee_address() {
        let mut payload = vec![0xE9, 0x01, 0x01, 0x01];
        payload.extend_from_slice(&[0x00, 0x15, 0x8D, 0x00, 0x01, 0x02, 0x03, 0x04]);
        payload.push(0x21);
        let failure = ApsFailure::parse(&payload).expect("parse");
        assert!(failure.destination.short_address().is_none());
        assert_eq!(failure.sqn, 0x21);
    }

    #[test]
    fn test_route_discovery_confirm_with_source() {
        let confirm = RouteDiscoveryConfirm::parse(&[0x00, 0x00, 0x12, 0x34]).expect("parse");
        assert!(confirm.is_success());
        assert_eq!(confirm.src, Some(0x1234));

        let confirm = RouteDiscoveryConfirm::parse(&[0xC4, 0x00]).expect("parse");
        assert!(!confirm.is_success());
        assert!(confirm.src.is_none());
    }
}
