//! Transport statistics
//!
//! The transport only ever increments these; reading them is the embedding
//! application's business (dashboards, health checks, log lines).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident => $incr:ident),+ $(,)?) => {
        /// Monotonic event counters maintained by the transport
        #[derive(Debug, Default)]
        pub struct TransportStatistics {
            $($(#[$doc])* $name: AtomicU64,)+
            load: AtomicUsize,
            max_load: AtomicUsize,
        }

        impl TransportStatistics {
            $(
                pub(crate) fn $incr(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }

                $(#[$doc])*
                #[must_use]
                pub fn $name(&self) -> u64 {
                    self.$name.load(Ordering::Relaxed)
                }
            )+
        }
    };
}

counters! {
    /// Commands pushed to the wire
    sent => incr_sent,
    /// Frames received with valid length and checksum
    received => incr_received,
    /// Status confirmations (`0x8000`)
    ack => incr_ack,
    /// Status confirmations with a non-zero status
    ack_ko => incr_ack_ko,
    /// Data responses
    data => incr_data,
    /// Frames dropped on a length mismatch
    frame_errors => incr_frame_errors,
    /// Frames dropped on a checksum mismatch
    crc_errors => incr_crc_errors,
    /// APS acknowledgements (`0x8011`, status 0x00)
    aps_ack => incr_aps_ack,
    /// APS negative acknowledgements (`0x8011`, status 0xa7)
    aps_nck => incr_aps_nck,
    /// APS delivery failures (`0x8702`)
    aps_failure => incr_aps_failure,
    /// Commands dropped waiting for their status
    to_status => incr_to_status,
    /// Commands dropped waiting for their data response
    to_data => incr_to_data,
    /// Commands retransmitted after an APS failure
    re_tx => incr_re_tx,
}

impl TransportStatistics {
    /// Record the current depth of the send queue
    pub(crate) fn set_load(&self, load: usize) {
        self.load.store(load, Ordering::Relaxed);
        self.max_load.fetch_max(load, Ordering::Relaxed);
    }

    /// Current depth of the send queue
    #[must_use]
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// High-water mark of the send queue
    #[must_use]
    pub fn max_load(&self) -> usize {
        self.max_load.load(Ordering::Relaxed)
    }
}
