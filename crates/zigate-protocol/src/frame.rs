//! ZiGate frame structure and checksum handling

use crate::codec::{self, FRAME_END, FRAME_START};
use crate::types::ProtocolError;

/// Minimum de-stuffed frame size:
/// `start(1) + msg_type(2) + length(2) + checksum(1) + end(1) = 7`
pub const MIN_FRAME_SIZE: usize = 7;

/// A ZiGate protocol frame
///
/// De-stuffed wire format:
/// ```text
/// [Start: 0x01]
/// [Message type: 2 bytes BE]
/// [Length: 2 bytes BE]
/// [Checksum: 1 byte] (XOR of msg_type, length and payload bytes)
/// [Payload: variable]
/// [RSSI: 1 byte] (inbound frames only; counted by the length field)
/// [End: 0x03]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u16,
    pub payload: Vec<u8>,
    /// Link quality reported by the dongle; zero on outbound frames
    pub rssi: u8,
}

impl Frame {
    /// Create a new outbound frame
    #[must_use]
    pub fn new(msg_type: u16, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            payload,
            rssi: 0,
        }
    }

    /// Serialize to stuffed wire bytes, markers included
    #[must_use]
    #[allow(clippy::missing_panics_doc)] // Panic only on protocol-violating payload size
    pub fn serialize(&self) -> Vec<u8> {
        let length =
            u16::try_from(self.payload.len()).expect("payload exceeds protocol maximum");

        let mut inner = Vec::with_capacity(5 + self.payload.len());
        inner.extend_from_slice(&self.msg_type.to_be_bytes());
        inner.extend_from_slice(&length.to_be_bytes());
        inner.push(0x00); // checksum placeholder
        inner.extend_from_slice(&self.payload);

        inner[4] = xor_skipping(&inner, 4);

        let mut wire = Vec::with_capacity(inner.len() * 2 + 2);
        wire.push(FRAME_START);
        wire.extend_from_slice(&codec::stuff(&inner));
        wire.push(FRAME_END);
        wire
    }

    /// Deserialize a de-stuffed frame region (markers included).
    ///
    /// The on-wire length field counts the payload plus the trailing RSSI
    /// byte, so the region must span exactly `length + 7` bytes.
    #[allow(clippy::missing_errors_doc)]
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < MIN_FRAME_SIZE {
            return Err(ProtocolError::FrameTooShort(data.len()));
        }
        if data[0] != FRAME_START || data[data.len() - 1] != FRAME_END {
            return Err(ProtocolError::InvalidFrame(
                "missing frame markers".to_string(),
            ));
        }

        let msg_type = u16::from_be_bytes([data[1], data[2]]);
        let length = u16::from_be_bytes([data[3], data[4]]) as usize;
        let received_checksum = data[5];

        let expected_total = length + 7;
        if expected_total != data.len() {
            return Err(ProtocolError::LengthMismatch {
                expected: expected_total,
                actual: data.len(),
            });
        }

        // XOR of everything between the markers except the checksum itself
        let computed = xor_skipping(&data[1..data.len() - 1], 4);
        if computed != received_checksum {
            return Err(ProtocolError::ChecksumMismatch {
                expected: computed,
                actual: received_checksum,
            });
        }

        let (payload, rssi) = if length == 0 {
            (Vec::new(), 0)
        } else {
            (data[6..data.len() - 2].to_vec(), data[data.len() - 2])
        };

        Ok(Self {
            msg_type,
            payload,
            rssi,
        })
    }
}

/// XOR all bytes except the one at `skip`
fn xor_skipping(data: &[u8], skip: usize) -> u8 {
    data.iter()
        .enumerate()
        .filter(|(idx, _)| *idx != skip)
        .fold(0, |acc, (_, &b)| acc ^ b)
}
