//! Command coordination - the request/status/data lifecycle
//!
//! The ZiGate firmware confirms every host command with a `0x8000` status
//! and, for most commands, answers later with a command-specific data frame.
//! Only one command may occupy that status/data slot at a time; the rest
//! queue here. The pipeline also tracks APS acknowledgements and parks
//! commands whose destination lost its route until the firmware reports the
//! route discovery outcome.
//!
//! The pipeline is plain state owned by a single coordinator task; submits,
//! decoded frames and timer ticks all arrive through that task's event loop,
//! so no handler can re-enter another.

use crate::commands::{self, CommandCatalog, CommandClass};
use crate::config::{OperatingMode, TransportConfig};
use crate::frame::Frame;
use crate::history::{CommandHistory, CommandRecord};
use crate::sqn::SqnManager;
use crate::stats::TransportStatistics;
use crate::types::{
    aps_status, ApsAcknowledgement, ApsFailure, RouteDiscoveryConfirm, StatusResponse,
    APS_NACK_STATUS,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

/// Retransmissions allowed for one command after APS failures
pub(crate) const APS_MAX_RETRY: usize = 2;
/// Spacing the firmware needs between retransmissions
const APS_DELAY: Duration = Duration::from_secs(1);
/// Window inside which repeated identical sends count as retransmissions
pub(crate) const APS_TIME_WINDOW: Duration =
    Duration::from_secs(APS_MAX_RETRY as u64 * APS_DELAY.as_secs());

/// A command travelling through the queues
#[derive(Debug, Clone)]
struct QueueEntry {
    opcode: u16,
    payload: Vec<u8>,
    enqueued_at: Instant,
    retransmits: u32,
}

impl QueueEntry {
    fn new(opcode: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            payload,
            enqueued_at: Instant::now(),
            retransmits: 0,
        }
    }

    fn retry(opcode: u16, payload: Vec<u8>) -> Self {
        Self {
            retransmits: 1,
            ..Self::new(opcode, payload)
        }
    }

    fn restamped(self) -> Self {
        Self {
            enqueued_at: Instant::now(),
            ..self
        }
    }
}

/// A sent command whose status arrived, still awaiting its data response
#[derive(Debug)]
struct DataWait {
    expected: u16,
    opcode: u16,
    enqueued_at: Instant,
}

/// A command parked after a route-unavailable APS failure
#[derive(Debug)]
struct RouteWait {
    opcode: u16,
    payload: Vec<u8>,
    /// The original `0x8702`, surfaced if the route discovery fails too
    failure: Frame,
}

/// The coordinator state machine.
///
/// At most one command occupies the status/data slot (`wait_status`,
/// `wait_data`); `send_queue` holds the backlog in FIFO order.
pub(crate) struct CommandPipeline {
    config: TransportConfig,
    catalog: CommandCatalog,
    sqn: SqnManager,
    stats: Arc<TransportStatistics>,
    history: Option<Arc<dyn CommandHistory>>,
    send_queue: VecDeque<QueueEntry>,
    wait_status: Option<QueueEntry>,
    wait_data: Option<DataWait>,
    wait_aps: Vec<QueueEntry>,
    wait_route_confirm: Vec<RouteWait>,
    /// While set, only PDM traffic may reach the dongle
    pdm_only: Arc<AtomicBool>,
    wire_tx: mpsc::UnboundedSender<Vec<u8>>,
    frame_tx: broadcast::Sender<Frame>,
}

impl CommandPipeline {
    pub(crate) fn new(
        config: TransportConfig,
        stats: Arc<TransportStatistics>,
        history: Option<Arc<dyn CommandHistory>>,
        wire_tx: mpsc::UnboundedSender<Vec<u8>>,
        frame_tx: broadcast::Sender<Frame>,
        pdm_only: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            catalog: CommandCatalog::new(),
            sqn: SqnManager::new(),
            stats,
            history,
            send_queue: VecDeque::new(),
            wait_status: None,
            wait_data: None,
            wait_aps: Vec::new(),
            wait_route_confirm: Vec::new(),
            pdm_only,
            wire_tx,
            frame_tx,
        }
    }

    /// Accept a command from the collaborator.
    ///
    /// Always allocates and returns a fresh internal sequence number, even
    /// when the command itself is dropped as a duplicate.
    pub(crate) fn submit(&mut self, opcode: u16, payload: Vec<u8>) -> u8 {
        tracing::debug!(
            target: "zigate_protocol::tx",
            "submit {:04X} {:02X?} queued: {}",
            opcode,
            payload,
            self.send_queue.len()
        );
        let sqn = self.sqn.generate_internal_sqn();
        self.dispatch(QueueEntry::new(opcode, payload));
        sqn
    }

    /// Send now if the in-flight slot allows it, otherwise queue
    fn dispatch(&mut self, entry: QueueEntry) {
        let class = self.catalog.classify(entry.opcode);
        let pdm_bypass = class == CommandClass::PdmOnHost;
        let slot_free = self.wait_status.is_none() && self.wait_data.is_none();
        let pdm_gate = pdm_bypass || !self.pdm_only.load(Ordering::Relaxed);

        if (slot_free || pdm_bypass) && pdm_gate {
            let entry = entry.restamped();
            if !pdm_bypass {
                if self.config.mode == OperatingMode::ZigBee {
                    if let CommandClass::StatusThenData(expected) = class {
                        self.wait_data = Some(DataWait {
                            expected,
                            opcode: entry.opcode,
                            enqueued_at: entry.enqueued_at,
                        });
                    }
                }
                self.wait_status = Some(entry.clone());
            }
            self.wire_send(&entry);
        } else {
            self.enqueue(entry);
        }
    }

    /// Append to the send queue, dropping exact duplicates
    fn enqueue(&mut self, entry: QueueEntry) {
        let duplicate = self
            .send_queue
            .iter()
            .any(|queued| queued.opcode == entry.opcode && queued.payload == entry.payload);
        if duplicate {
            tracing::debug!(
                target: "zigate_protocol::tx",
                "{:04X} already queued with the same payload, dropping",
                entry.opcode
            );
            return;
        }
        self.send_queue.push_back(entry);
        self.stats.set_load(self.send_queue.len());
    }

    /// Encode and hand the command to the link writer
    fn wire_send(&mut self, entry: &QueueEntry) {
        self.record_command(entry);

        let wire = Frame::new(entry.opcode, entry.payload.clone()).serialize();
        tracing::debug!(
            target: "zigate_protocol::tx",
            "--> {:04X} {:02X?} (retransmits: {})",
            entry.opcode,
            entry.payload,
            entry.retransmits
        );
        if self.wire_tx.send(wire).is_err() {
            tracing::error!("link writer is gone, dropping command {:04X}", entry.opcode);
            return;
        }
        self.stats.incr_sent();
    }

    /// Log the command against its destination when the payload names one
    fn record_command(&self, entry: &QueueEntry) {
        if entry.payload.len() < 4 || !self.catalog.nwk_id_in_payload(entry.opcode) {
            return;
        }
        let Some(history) = &self.history else {
            return;
        };
        let nwkid = u16::from_be_bytes([entry.payload[1], entry.payload[2]]);
        if !history.contains(nwkid) {
            return;
        }
        // the payload is only worth keeping when a retry policy can replay it
        let payload = (self.config.aps_retransmit || self.config.aps_route_error)
            .then(|| entry.payload.clone());
        history.record(nwkid, CommandRecord::new(entry.opcode, payload));
    }

    /// Route one decoded frame through the coordinator
    pub(crate) fn handle_frame(&mut self, frame: Frame) {
        match frame.msg_type {
            commands::STATUS => self.process_status(frame),
            commands::APS_DATA_ACK => self.process_aps_ack(frame),
            commands::ROUTE_DISCOVERY_CONFIRM => self.process_route_discovery(frame),
            commands::APS_DATA_CONFIRM_FAILED => self.process_aps_failure(frame),
            msg_type if self.catalog.is_standalone(msg_type) => self.forward(frame),
            _ => self.process_data(frame),
        }
    }

    fn process_status(&mut self, frame: Frame) {
        let status = match StatusResponse::parse(&frame.payload) {
            Ok(status) => status,
            Err(_) => {
                tracing::debug!("status frame with truncated payload, forwarding as-is");
                self.forward(frame);
                return;
            }
        };

        self.sqn.record_external_sqn(status.sqn);
        self.stats.incr_ack();

        if !status.is_success() {
            self.stats.incr_ack_ko();
            // the data response will never come, free that half of the slot
            if let Some(wait) = self.wait_data.take() {
                tracing::debug!(
                    "command {:04X} failed with {:02X}, releasing data wait for {:04X}",
                    status.packet_type,
                    status.status,
                    wait.expected
                );
            }
        }

        match self.wait_status.take() {
            None => tracing::debug!("status for {:04X} with nothing in flight", status.packet_type),
            Some(entry) => {
                if entry.opcode != status.packet_type {
                    // the on-wire confirmation is authoritative; the head is
                    // consumed either way
                    tracing::warn!(
                        "status sync error: sent {:04X}, dongle confirmed {:04X}",
                        entry.opcode,
                        status.packet_type
                    );
                }
                if self.config.aps_ack && status.is_success() {
                    if entry.opcode == status.packet_type {
                        self.wait_aps.push(entry.restamped());
                    } else {
                        tracing::error!(
                            "not tracking {:04X} for APS ack, confirmation was for {:04X}",
                            entry.opcode,
                            status.packet_type
                        );
                    }
                }
            }
        }

        self.forward(frame);
        self.pump();
    }

    fn process_aps_ack(&mut self, frame: Frame) {
        match ApsAcknowledgement::parse(&frame.payload) {
            Ok(ack) if ack.status == 0x00 => {
                self.stats.incr_aps_ack();
                self.release_aps_waiter(Some(ack.src_addr));
            }
            Ok(ack) if ack.status == APS_NACK_STATUS => {
                self.stats.incr_aps_nck();
                self.release_aps_waiter(Some(ack.src_addr));
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("unparseable APS acknowledgement: {e}"),
        }
        self.forward(frame);
    }

    /// Drop the APS waiter for the given destination, or the oldest one
    /// when the destination cannot be matched
    fn release_aps_waiter(&mut self, nwkid: Option<u16>) {
        if self.wait_aps.is_empty() {
            return;
        }
        let idx = nwkid
            .and_then(|addr| {
                self.wait_aps.iter().position(|entry| {
                    entry.payload.len() >= 3
                        && u16::from_be_bytes([entry.payload[1], entry.payload[2]]) == addr
                })
            })
            .unwrap_or(0);
        self.wait_aps.remove(idx);
    }

    fn process_route_discovery(&mut self, frame: Frame) {
        if !self.config.aps_route_error {
            self.forward(frame);
            return;
        }

        let confirm = match RouteDiscoveryConfirm::parse(&frame.payload) {
            Ok(confirm) => confirm,
            Err(e) => {
                tracing::debug!("unparseable route discovery confirm: {e}");
                self.forward(frame);
                return;
            }
        };
        if let Some(src) = confirm.src {
            tracing::info!("new route discovery for {:04X}", src);
        }

        // taking the queue up front keeps resubmissions from observing it
        let pending = std::mem::take(&mut self.wait_route_confirm);
        for wait in pending {
            if confirm.is_success() {
                tracing::debug!(
                    "route discovery ok, resending {:04X} {:02X?}",
                    wait.opcode,
                    wait.payload
                );
                self.dispatch(QueueEntry::retry(wait.opcode, wait.payload));
            } else {
                tracing::debug!(
                    "route discovery failed, surfacing the original failure for {:04X}",
                    wait.opcode
                );
                self.forward(wait.failure);
            }
        }
        // the confirm itself stays internal once handled
    }

    fn process_aps_failure(&mut self, frame: Frame) {
        self.stats.incr_aps_failure();

        let retry_enabled = self.config.aps_route_error || self.config.aps_retransmit;
        if !retry_enabled && !self.config.aps_ack {
            self.forward(frame);
            return;
        }

        let failure = match ApsFailure::parse(&frame.payload) {
            Ok(failure) => failure,
            Err(e) => {
                tracing::debug!("unparseable APS failure: {e}");
                self.forward(frame);
                return;
            }
        };

        if self.config.aps_ack {
            self.release_aps_waiter(failure.destination.short_address());
        }
        if !retry_enabled {
            self.forward(frame);
            return;
        }

        let Some(nwkid) = failure.destination.short_address() else {
            // IEEE-addressed failure; the store is nwkid-keyed, nothing to replay
            self.forward(frame);
            return;
        };
        let Some(history) = self.history.clone() else {
            self.forward(frame);
            return;
        };
        if failure.status != aps_status::ROUTE_UNAVAILABLE || !history.contains(nwkid) {
            self.forward(frame);
            return;
        }

        let recent = history.recent(nwkid, APS_MAX_RETRY + 1);
        let Some(last) = recent.first().cloned() else {
            tracing::debug!("no command history for {:04X}, surfacing the failure", nwkid);
            self.forward(frame);
            return;
        };
        let Some(payload) = last.payload.clone() else {
            tracing::warn!(
                "no payload retained for {:04X} towards {:04X}, cannot replay",
                last.opcode,
                nwkid
            );
            self.forward(frame);
            return;
        };

        if self.config.aps_route_error {
            let already_parked = self
                .wait_route_confirm
                .iter()
                .any(|wait| wait.opcode == last.opcode && wait.payload == payload);
            if already_parked {
                tracing::debug!(
                    "{:04X} towards {:04X} is already waiting for a route",
                    last.opcode,
                    nwkid
                );
            } else {
                tracing::debug!(
                    "no route to {:04X}, parking {:04X} until the discovery confirms",
                    nwkid,
                    last.opcode
                );
                self.wait_route_confirm.push(RouteWait {
                    opcode: last.opcode,
                    payload,
                    failure: frame,
                });
            }
            return;
        }

        // Retransmit policy: give up once the same command has already been
        // replayed inside the retry window
        if let Some(previous) = recent.get(1) {
            let same_command =
                previous.opcode == last.opcode && previous.payload == last.payload;
            if same_command && last.at.duration_since(previous.at) <= APS_TIME_WINDOW {
                self.forward(frame);
                return;
            }
        }
        if last.at.elapsed() <= APS_TIME_WINDOW {
            self.stats.incr_re_tx();
            tracing::debug!("replaying {:04X} towards {:04X}", last.opcode, nwkid);
            self.dispatch(QueueEntry::retry(last.opcode, payload));
        } else {
            self.forward(frame);
        }
    }

    fn process_data(&mut self, frame: Frame) {
        self.stats.incr_data();

        match &self.wait_data {
            Some(wait) if wait.expected == frame.msg_type => {
                if let Some(wait) = self.wait_data.take() {
                    tracing::debug!(
                        target: "zigate_protocol::rx",
                        "data {:04X} completes command {:04X}",
                        frame.msg_type,
                        wait.opcode
                    );
                }
            }
            Some(wait) => {
                tracing::debug!(
                    target: "zigate_protocol::rx",
                    "data {:04X} while waiting for {:04X}, not correlated",
                    frame.msg_type,
                    wait.expected
                );
            }
            None => {}
        }

        self.forward(frame);
        self.pump();
    }

    /// Expire stale wait-slot heads, then try to advance the queue
    pub(crate) fn check_timeouts(&mut self) {
        let timeout = self.config.command_timeout;

        if self
            .wait_status
            .as_ref()
            .is_some_and(|entry| entry.enqueued_at.elapsed() > timeout)
        {
            if let Some(entry) = self.wait_status.take() {
                self.stats.incr_to_status();
                tracing::debug!("status timeout on {:04X}", entry.opcode);
            }
        }

        if self
            .wait_data
            .as_ref()
            .is_some_and(|wait| wait.enqueued_at.elapsed() > timeout)
        {
            if let Some(wait) = self.wait_data.take() {
                self.stats.incr_to_data();
                tracing::debug!(
                    "data timeout on {:04X}, was waiting for {:04X}",
                    wait.opcode,
                    wait.expected
                );
            }
        }

        if self.config.aps_ack {
            let before = self.wait_aps.len();
            self.wait_aps
                .retain(|entry| entry.enqueued_at.elapsed() <= APS_TIME_WINDOW);
            if self.wait_aps.len() != before {
                tracing::debug!("expired {} APS ack waiters", before - self.wait_aps.len());
            }
        }

        self.pump();
    }

    /// Advance the send queue when the in-flight slot is free
    fn pump(&mut self) {
        if self.wait_status.is_some() || self.wait_data.is_some() {
            return;
        }
        let Some(entry) = self.send_queue.pop_front() else {
            return;
        };
        self.stats.set_load(self.send_queue.len());
        tracing::debug!(
            target: "zigate_protocol::tx",
            "unqueued {:04X}, {} still waiting",
            entry.opcode,
            self.send_queue.len()
        );
        self.dispatch(entry);
    }

    /// Hand a frame to the collaborator
    fn forward(&self, frame: Frame) {
        // nobody subscribed yet is fine
        let _ = self.frame_tx.send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Harness {
        pipeline: CommandPipeline,
        wire_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        frame_rx: broadcast::Receiver<Frame>,
    }

    fn harness(configure: impl FnOnce(&mut TransportConfig)) -> Harness {
        harness_with_history(None, configure)
    }

    fn harness_with_history(
        history: Option<Arc<dyn CommandHistory>>,
        configure: impl FnOnce(&mut TransportConfig),
    ) -> Harness {
        let mut config = TransportConfig::new(LinkConfig::Usb {
            path: "/dev/ttyUSB0".to_string(),
        });
        configure(&mut config);
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = broadcast::channel(64);
        let pipeline = CommandPipeline::new(
            config,
            Arc::new(TransportStatistics::default()),
            history,
            wire_tx,
            frame_tx,
            Arc::new(AtomicBool::new(false)),
        );
        Harness {
            pipeline,
            wire_rx,
            frame_rx,
        }
    }

    fn status_frame(status: u8, sqn: u8, packet_type: u16) -> Frame {
        let mut payload = vec![status, sqn];
        payload.extend_from_slice(&packet_type.to_be_bytes());
        Frame {
            msg_type: commands::STATUS,
            payload,
            rssi: 0xC8,
        }
    }

    fn data_frame(msg_type: u16, payload: &[u8]) -> Frame {
        Frame {
            msg_type,
            payload: payload.to_vec(),
            rssi: 0xC8,
        }
    }

    /// nwkid-keyed in-memory history, newest record first
    #[derive(Default)]
    struct RecordedHistory {
        cmds: Mutex<HashMap<u16, Vec<CommandRecord>>>,
    }

    impl RecordedHistory {
        fn with(nwkid: u16, opcode: u16, payload: &[u8]) -> Arc<Self> {
            let history = Arc::new(Self::default());
            history.record(nwkid, CommandRecord::new(opcode, Some(payload.to_vec())));
            history
        }
    }

    impl CommandHistory for RecordedHistory {
        fn contains(&self, nwkid: u16) -> bool {
            self.cmds.lock().unwrap().contains_key(&nwkid)
        }

        fn record(&self, nwkid: u16, record: CommandRecord) {
            self.cmds.lock().unwrap().entry(nwkid).or_default().push(record);
        }

        fn recent(&self, nwkid: u16, limit: usize) -> Vec<CommandRecord> {
            self.cmds
                .lock()
                .unwrap()
                .get(&nwkid)
                .map(|records| records.iter().rev().take(limit).cloned().collect())
                .unwrap_or_default()
        }
    }

    #[test]
    fn test_status_only_command_path() {
        let mut h = harness(|_| {});
        h.pipeline.submit(0x0049, vec![0xFF, 0xFC, 0x1E, 0x00]);
        assert!(h.pipeline.wait_status.is_some());
        assert!(h.pipeline.wait_data.is_none());
        assert!(h.wire_rx.try_recv().is_ok());

        h.pipeline.handle_frame(status_frame(0x00, 0x11, 0x0049));
        assert_eq!(h.pipeline.stats.ack(), 1);
        assert_eq!(h.pipeline.stats.ack_ko(), 0);
        assert!(h.pipeline.wait_status.is_none());
        assert!(h.pipeline.wait_data.is_none());
        assert!(h.pipeline.send_queue.is_empty());
    }

    #[test]
    fn test_status_then_data_zigbee_mode() {
        let mut h = harness(|_| {});
        h.pipeline.submit(0x0100, vec![0x01]);
        assert!(h.pipeline.wait_status.is_some());
        assert_eq!(h.pipeline.wait_data.as_ref().map(|w| w.expected), Some(0x8100));

        h.pipeline.handle_frame(status_frame(0x00, 0x01, 0x0100));
        assert!(h.pipeline.wait_status.is_none());
        assert!(h.pipeline.wait_data.is_some());

        h.pipeline.handle_frame(data_frame(0x8100, &[0x01]));
        assert!(h.pipeline.wait_data.is_none());
        assert_eq!(h.pipeline.stats.data(), 1);
    }

    #[test]
    fn test_failed_status_purges_data_wait() {
        let mut h = harness(|_| {});
        h.pipeline.submit(0x0100, vec![0x01]);

        h.pipeline.handle_frame(status_frame(0x01, 0x01, 0x0100));
        assert!(h.pipeline.wait_status.is_none());
        assert!(h.pipeline.wait_data.is_none());
        assert_eq!(h.pipeline.stats.ack_ko(), 1);
    }

    #[test]
    fn test_aggressive_mode_skips_data_wait() {
        let mut h = harness(|config| config.mode = OperatingMode::Aggressive);
        h.pipeline.submit(0x0100, vec![0x01]);
        assert!(h.pipeline.wait_status.is_some());
        assert!(h.pipeline.wait_data.is_none());
    }

    #[test]
    fn test_backpressure_fifo_order() {
        let mut h = harness(|_| {});
        h.pipeline.submit(0x0100, vec![0x01]);
        h.pipeline.submit(0x0100, vec![0x02]);
        h.pipeline.submit(0x0100, vec![0x03]);
        assert_eq!(h.pipeline.send_queue.len(), 2);
        assert_eq!(h.pipeline.stats.load(), 2);

        // only the first command has reached the wire
        assert!(h.wire_rx.try_recv().is_ok());
        assert!(h.wire_rx.try_recv().is_err());

        h.pipeline.handle_frame(status_frame(0x00, 0x01, 0x0100));
        h.pipeline.handle_frame(data_frame(0x8100, &[0x01]));
        // A's data response released B
        assert_eq!(
            h.pipeline.wait_status.as_ref().map(|e| e.payload.clone()),
            Some(vec![0x02])
        );
        assert!(h.wire_rx.try_recv().is_ok());
        assert!(h.wire_rx.try_recv().is_err());

        h.pipeline.handle_frame(status_frame(0x00, 0x02, 0x0100));
        h.pipeline.handle_frame(data_frame(0x8100, &[0x02]));
        assert_eq!(
            h.pipeline.wait_status.as_ref().map(|e| e.payload.clone()),
            Some(vec![0x03])
        );
        assert!(h.pipeline.send_queue.is_empty());
    }

    #[test]
    fn test_duplicate_submission_is_dropped() {
        let mut h = harness(|_| {});
        h.pipeline.submit(0x0092, vec![0x02, 0x12, 0x34, 0x01, 0x01, 0x01]);
        h.pipeline.submit(0x0092, vec![0x02, 0x12, 0x34, 0x01, 0x01, 0x01]);
        assert_eq!(h.pipeline.send_queue.len(), 1);

        // an exact duplicate of the queued entry is dropped
        h.pipeline.submit(0x0092, vec![0x02, 0x12, 0x34, 0x01, 0x01, 0x01]);
        assert_eq!(h.pipeline.send_queue.len(), 1);
        assert_eq!(h.pipeline.stats.load(), 1);

        // a different payload still queues
        h.pipeline.submit(0x0092, vec![0x02, 0x12, 0x34, 0x01, 0x01, 0x00]);
        assert_eq!(h.pipeline.send_queue.len(), 2);
    }

    #[test]
    fn test_submit_returns_increasing_sqns() {
        let mut h = harness(|_| {});
        let first = h.pipeline.submit(0x0049, vec![0xFF, 0xFC, 0x1E, 0x00]);
        let second = h.pipeline.submit(0x0011, Vec::new());
        assert_eq!(second, first.wrapping_add(1));
    }

    #[test]
    fn test_pdm_command_bypasses_occupied_slot() {
        let mut h = harness(|_| {});
        h.pipeline.submit(0x0100, vec![0x01]);
        assert!(h.wire_rx.try_recv().is_ok());

        h.pipeline.submit(0x8204, vec![0x00, 0x01]);
        // straight to the wire, no queuing, wait slots untouched
        assert!(h.wire_rx.try_recv().is_ok());
        assert!(h.pipeline.send_queue.is_empty());
        assert_eq!(h.pipeline.wait_status.as_ref().map(|e| e.opcode), Some(0x0100));
    }

    #[test]
    fn test_pdm_lock_holds_back_normal_traffic() {
        let mut h = harness(|_| {});
        h.pipeline.pdm_only.store(true, Ordering::Relaxed);

        h.pipeline.submit(0x0049, vec![0xFF, 0xFC, 0x1E, 0x00]);
        assert!(h.wire_rx.try_recv().is_err());
        assert_eq!(h.pipeline.send_queue.len(), 1);

        h.pipeline.submit(0x8204, vec![0x00, 0x01]);
        assert!(h.wire_rx.try_recv().is_ok());
    }

    #[test]
    fn test_status_desync_still_consumes_head() {
        let mut h = harness(|_| {});
        h.pipeline.submit(0x0049, vec![0xFF, 0xFC, 0x1E, 0x00]);

        // the dongle confirms a different opcode; the head goes anyway
        h.pipeline.handle_frame(status_frame(0x00, 0x01, 0x0011));
        assert!(h.pipeline.wait_status.is_none());
        assert_eq!(h.pipeline.stats.ack(), 1);
    }

    #[test]
    fn test_unmatched_data_is_forwarded_without_consuming_wait() {
        let mut h = harness(|_| {});
        h.pipeline.submit(0x0100, vec![0x01]);
        h.pipeline.handle_frame(status_frame(0x00, 0x01, 0x0100));

        h.pipeline.handle_frame(data_frame(0x8110, &[0x00]));
        assert!(h.pipeline.wait_data.is_some());
        assert_eq!(h.frame_rx.try_recv().unwrap().msg_type, 0x8000);
        assert_eq!(h.frame_rx.try_recv().unwrap().msg_type, 0x8110);
    }

    #[test]
    fn test_standalone_frames_are_forwarded() {
        let mut h = harness(|_| {});
        h.pipeline.handle_frame(data_frame(0x8102, &[0x00, 0x01]));
        assert_eq!(h.frame_rx.try_recv().unwrap().msg_type, 0x8102);
        // not counted as a correlated data response
        assert_eq!(h.pipeline.stats.data(), 0);
    }

    #[test]
    fn test_aps_ack_counters() {
        let mut h = harness(|_| {});
        h.pipeline
            .handle_frame(data_frame(0x8011, &[0x00, 0x12, 0x34, 0x01, 0x00, 0x06]));
        h.pipeline
            .handle_frame(data_frame(0x8011, &[0xA7, 0x12, 0x34, 0x01, 0x00, 0x06]));
        assert_eq!(h.pipeline.stats.aps_ack(), 1);
        assert_eq!(h.pipeline.stats.aps_nck(), 1);
    }

    #[test]
    fn test_aps_ack_mode_tracks_and_releases_waiters() {
        let mut h = harness(|config| config.aps_ack = true);
        h.pipeline.submit(0x0092, vec![0x02, 0x12, 0x34, 0x01, 0x01, 0x01]);
        h.pipeline.handle_frame(status_frame(0x00, 0x01, 0x0092));
        assert_eq!(h.pipeline.wait_aps.len(), 1);

        h.pipeline
            .handle_frame(data_frame(0x8011, &[0x00, 0x12, 0x34, 0x01, 0x00, 0x06]));
        assert!(h.pipeline.wait_aps.is_empty());
    }

    #[test]
    fn test_route_discovery_gated_retry() {
        let history = RecordedHistory::with(0x1234, 0x0092, &[0x02, 0x12, 0x34, 0x01, 0x01, 0x01]);
        let mut h = harness_with_history(Some(history), |config| config.aps_route_error = true);

        // route unavailable towards 0x1234
        h.pipeline.handle_frame(data_frame(
            0x8702,
            &[aps_status::ROUTE_UNAVAILABLE, 0x01, 0x01, 0x02, 0x12, 0x34, 0x05],
        ));
        assert_eq!(h.pipeline.wait_route_confirm.len(), 1);
        // swallowed, not surfaced to the collaborator
        assert!(h.frame_rx.try_recv().is_err());

        // a second identical failure does not park twice
        h.pipeline.handle_frame(data_frame(
            0x8702,
            &[aps_status::ROUTE_UNAVAILABLE, 0x01, 0x01, 0x02, 0x12, 0x34, 0x06],
        ));
        assert_eq!(h.pipeline.wait_route_confirm.len(), 1);

        // route discovery succeeded: the command is resubmitted
        h.pipeline.handle_frame(data_frame(0x8701, &[0x00, 0x00, 0x12, 0x34]));
        assert!(h.pipeline.wait_route_confirm.is_empty());
        assert_eq!(h.pipeline.wait_status.as_ref().map(|e| e.opcode), Some(0x0092));
        assert!(h.wire_rx.try_recv().is_ok());
    }

    #[test]
    fn test_failed_route_discovery_surfaces_original_failure() {
        let history = RecordedHistory::with(0x1234, 0x0092, &[0x02, 0x12, 0x34, 0x01, 0x01, 0x01]);
        let mut h = harness_with_history(Some(history), |config| config.aps_route_error = true);

        h.pipeline.handle_frame(data_frame(
            0x8702,
            &[aps_status::ROUTE_UNAVAILABLE, 0x01, 0x01, 0x02, 0x12, 0x34, 0x05],
        ));
        h.pipeline.handle_frame(data_frame(0x8701, &[0xC4, 0x00]));

        assert!(h.pipeline.wait_route_confirm.is_empty());
        assert!(h.pipeline.wait_status.is_none());
        // the stored 0x8702 reaches the collaborator instead
        assert_eq!(h.frame_rx.try_recv().unwrap().msg_type, 0x8702);
    }

    #[test]
    fn test_non_route_failures_are_surfaced() {
        let history = RecordedHistory::with(0x1234, 0x0092, &[0x02, 0x12, 0x34, 0x01, 0x01, 0x01]);
        let mut h = harness_with_history(Some(history), |config| config.aps_route_error = true);

        h.pipeline.handle_frame(data_frame(
            0x8702,
            &[aps_status::NO_ACK, 0x01, 0x01, 0x02, 0x12, 0x34, 0x05],
        ));
        assert!(h.pipeline.wait_route_confirm.is_empty());
        assert_eq!(h.frame_rx.try_recv().unwrap().msg_type, 0x8702);
        assert_eq!(h.pipeline.stats.aps_failure(), 1);
    }

    #[test]
    fn test_retransmit_policy_replays_within_window() {
        let history = RecordedHistory::with(0x1234, 0x0092, &[0x02, 0x12, 0x34, 0x01, 0x01, 0x01]);
        let mut h = harness_with_history(Some(history), |config| config.aps_retransmit = true);

        h.pipeline.handle_frame(data_frame(
            0x8702,
            &[aps_status::ROUTE_UNAVAILABLE, 0x01, 0x01, 0x02, 0x12, 0x34, 0x05],
        ));
        assert_eq!(h.pipeline.stats.re_tx(), 1);
        assert_eq!(h.pipeline.wait_status.as_ref().map(|e| e.opcode), Some(0x0092));
        assert!(h.frame_rx.try_recv().is_err());
    }

    #[test]
    fn test_retransmit_policy_gives_up_after_retry_window() {
        let payload = [0x02, 0x12, 0x34, 0x01, 0x01, 0x01];
        let history = RecordedHistory::with(0x1234, 0x0092, &payload);
        // a second identical send right after: the retry budget is spent
        history.record(0x1234, CommandRecord::new(0x0092, Some(payload.to_vec())));
        let mut h = harness_with_history(Some(history), |config| config.aps_retransmit = true);

        h.pipeline.handle_frame(data_frame(
            0x8702,
            &[aps_status::ROUTE_UNAVAILABLE, 0x01, 0x01, 0x02, 0x12, 0x34, 0x05],
        ));
        assert_eq!(h.pipeline.stats.re_tx(), 0);
        assert_eq!(h.frame_rx.try_recv().unwrap().msg_type, 0x8702);
    }

    #[test]
    fn test_fresh_commands_survive_the_tick() {
        let mut h = harness(|_| {});
        h.pipeline.submit(0x0100, vec![0x01]);
        h.pipeline.check_timeouts();
        assert!(h.pipeline.wait_status.is_some());
        assert!(h.pipeline.wait_data.is_some());
        assert_eq!(h.pipeline.stats.to_status(), 0);
    }

    #[test]
    fn test_status_timeout_drops_head_and_pumps() {
        let mut h = harness(|config| config.command_timeout = Duration::ZERO);
        h.pipeline.submit(0x0100, vec![0x01]);
        h.pipeline.submit(0x0100, vec![0x02]);

        std::thread::sleep(Duration::from_millis(5));
        h.pipeline.check_timeouts();

        assert_eq!(h.pipeline.stats.to_status(), 1);
        assert_eq!(h.pipeline.stats.to_data(), 1);
        // the queued command took over the slot
        assert_eq!(
            h.pipeline.wait_status.as_ref().map(|e| e.payload.clone()),
            Some(vec![0x02])
        );
        assert!(h.pipeline.send_queue.is_empty());
    }

    #[test]
    fn test_send_queue_never_grows_on_tick() {
        let mut h = harness(|_| {});
        h.pipeline.submit(0x0100, vec![0x01]);
        h.pipeline.submit(0x0100, vec![0x02]);
        let depth = h.pipeline.send_queue.len();
        h.pipeline.check_timeouts();
        assert!(h.pipeline.send_queue.len() <= depth);
    }

    #[test]
    fn test_commands_are_recorded_against_their_destination() {
        let history = Arc::new(RecordedHistory::default());
        history.record(0x1234, CommandRecord::new(0x0000, None));
        let h_arc: Arc<dyn CommandHistory> = history.clone();
        let mut h = harness_with_history(Some(h_arc), |config| config.aps_route_error = true);

        h.pipeline.submit(0x0092, vec![0x02, 0x12, 0x34, 0x01, 0x01, 0x01]);
        let recent = history.recent(0x1234, 1);
        assert_eq!(recent[0].opcode, 0x0092);
        assert!(recent[0].payload.is_some());

        // unknown destinations are not recorded
        h.pipeline.handle_frame(status_frame(0x00, 0x01, 0x0092));
        h.pipeline.submit(0x0092, vec![0x02, 0x56, 0x78, 0x01, 0x01, 0x01]);
        assert!(history.recent(0x5678, 1).is_empty());
    }
}
