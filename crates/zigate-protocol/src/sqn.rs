//! Internal/external sequence-number correlation
//!
//! Every submitted command gets a host-side sequence number so callers can
//! match later responses to their request. The dongle assigns its own 8-bit
//! sequence, echoed in status frames; the manager binds the two together.

use std::collections::VecDeque;

/// How many internal/external bindings to keep around for correlation
const BINDING_CAPACITY: usize = 64;

#[derive(Debug, Default)]
pub struct SqnManager {
    next: u8,
    last_issued: Option<u8>,
    bindings: VecDeque<(u8, u8)>,
}

impl SqnManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next internal sequence number (wrapping at 256)
    pub fn generate_internal_sqn(&mut self) -> u8 {
        let sqn = self.next;
        self.next = self.next.wrapping_add(1);
        self.last_issued = Some(sqn);
        sqn
    }

    /// Bind an externally observed sequence number to the most recently
    /// issued internal one
    pub fn record_external_sqn(&mut self, external: u8) {
        let Some(internal) = self.last_issued else {
            return;
        };
        if self.bindings.len() == BINDING_CAPACITY {
            self.bindings.pop_front();
        }
        self.bindings.push_back((internal, external));
    }

    /// External sequence number last bound to the given internal one
    #[must_use]
    pub fn external_for(&self, internal: u8) -> Option<u8> {
        self.bindings
            .iter()
            .rev()
            .find(|(int, _)| *int == internal)
            .map(|(_, ext)| *ext)
    }
}
