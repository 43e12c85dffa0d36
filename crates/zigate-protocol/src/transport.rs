//! Async transport for ZiGate coordinator dongles
//!
//! Three workers drive the protocol: a writer task draining encoded frames
//! into the link, a blocking reader thread assembling and validating inbound
//! frames, and a coordinator task that owns the command pipeline and reacts
//! to submits, decoded frames and a periodic timeout tick.

use crate::codec::FrameAssembler;
use crate::config::TransportConfig;
use crate::frame::Frame;
use crate::history::CommandHistory;
use crate::link::LinkStream;
use crate::pipeline::CommandPipeline;
use crate::stats::TransportStatistics;
use crate::types::ProtocolError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, MissedTickBehavior};

/// Read buffer for the reader thread
const READ_CHUNK: usize = 1024;
/// Period of the queue-timeout sweep
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Control messages for the writer task
enum LinkCommand {
    /// Replace the current link (reconnect)
    Swap(LinkStream),
    /// Drop the current link but keep draining
    Close,
}

/// Requests for the coordinator task
enum CoordinatorCommand {
    Submit {
        opcode: u16,
        payload: Vec<u8>,
        reply: oneshot::Sender<u8>,
    },
    Shutdown,
}

/// Handle to a running ZiGate transport
pub struct ZigateTransport {
    config: TransportConfig,
    cmd_tx: mpsc::Sender<CoordinatorCommand>,
    link_ctl_tx: mpsc::Sender<LinkCommand>,
    decoded_tx: mpsc::Sender<Frame>,
    frame_tx: broadcast::Sender<Frame>,
    stats: Arc<TransportStatistics>,
    pdm_only: Arc<AtomicBool>,
    /// Stop flag of the currently running reader thread
    reader_stop: Mutex<Arc<AtomicBool>>,
}

impl ZigateTransport {
    /// Open the link and start the transport workers.
    ///
    /// `history` is the embedding application's per-device command log; pass
    /// `None` when no retry policy needs it.
    #[allow(clippy::missing_errors_doc)]
    pub async fn connect(
        config: TransportConfig,
        history: Option<Arc<dyn CommandHistory>>,
    ) -> Result<Self, ProtocolError> {
        tracing::info!("connecting to ZiGate over {}", config.link);

        let link = LinkStream::open(&config.link)?;
        let reader_link = link.try_clone()?;

        let stats = Arc::new(TransportStatistics::default());
        let pdm_only = Arc::new(AtomicBool::new(false));
        let (frame_tx, _) = broadcast::channel(64);
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let (link_ctl_tx, link_ctl_rx) = mpsc::channel(4);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (decoded_tx, decoded_rx) = mpsc::channel(64);

        tokio::spawn(Self::writer_task(Some(link), wire_rx, link_ctl_rx));

        let reader_stop = Arc::new(AtomicBool::new(false));
        Self::spawn_reader(reader_link, decoded_tx.clone(), stats.clone(), reader_stop.clone());

        let pipeline = CommandPipeline::new(
            config.clone(),
            stats.clone(),
            history,
            wire_tx,
            frame_tx.clone(),
            pdm_only.clone(),
        );
        tokio::spawn(Self::coordinator_task(pipeline, cmd_rx, decoded_rx));

        tracing::info!("connected to ZiGate");

        Ok(Self {
            config,
            cmd_tx,
            link_ctl_tx,
            decoded_tx,
            frame_tx,
            stats,
            pdm_only,
            reader_stop: Mutex::new(reader_stop),
        })
    }

    /// Submit a command; returns the internal sequence number assigned to it.
    ///
    /// The sequence number comes back before any byte reaches the link; the
    /// command itself is sent, queued or dropped as a duplicate according to
    /// the in-flight state.
    #[allow(clippy::missing_errors_doc)]
    pub async fn send_data(&self, opcode: u16, payload: &[u8]) -> Result<u8, ProtocolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(CoordinatorCommand::Submit {
                opcode,
                payload: payload.to_vec(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProtocolError::NotConnected)?;
        reply_rx.await.map_err(|_| ProtocolError::NotConnected)
    }

    /// Subscribe to frames forwarded by the coordinator
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.frame_tx.subscribe()
    }

    /// Statistics counters, shared with the transport workers
    #[must_use]
    pub fn statistics(&self) -> Arc<TransportStatistics> {
        self.stats.clone()
    }

    /// Depth of the send queue
    #[must_use]
    pub fn load_transmit(&self) -> usize {
        self.stats.load()
    }

    /// While locked, only PDM traffic may reach the dongle
    pub fn pdm_lock(&self, lock: bool) {
        self.pdm_only.store(lock, Ordering::Relaxed);
    }

    #[must_use]
    pub fn pdm_lock_status(&self) -> bool {
        self.pdm_only.load(Ordering::Relaxed)
    }

    /// Close the link. Queued commands survive and flow again after
    /// [`ZigateTransport::reconnect`].
    pub async fn disconnect(&self) {
        tracing::info!("closing link to ZiGate");
        self.stop_reader();
        let _ = self.link_ctl_tx.send(LinkCommand::Close).await;
    }

    /// Close the current link if still open, then open a fresh one
    #[allow(clippy::missing_errors_doc)]
    pub async fn reconnect(&self) -> Result<(), ProtocolError> {
        tracing::info!("reconnecting to ZiGate over {}", self.config.link);
        self.stop_reader();

        let link = LinkStream::open(&self.config.link)?;
        let reader_link = link.try_clone()?;

        let stop = Arc::new(AtomicBool::new(false));
        if let Ok(mut guard) = self.reader_stop.lock() {
            *guard = stop.clone();
        }
        Self::spawn_reader(reader_link, self.decoded_tx.clone(), self.stats.clone(), stop);

        self.link_ctl_tx
            .send(LinkCommand::Swap(link))
            .await
            .map_err(|_| ProtocolError::NotConnected)?;
        Ok(())
    }

    fn stop_reader(&self) {
        if let Ok(guard) = self.reader_stop.lock() {
            guard.store(true, Ordering::Relaxed);
        }
    }

    fn spawn_reader(
        link: LinkStream,
        decoded_tx: mpsc::Sender<Frame>,
        stats: Arc<TransportStatistics>,
        stop: Arc<AtomicBool>,
    ) {
        std::thread::spawn(move || {
            Self::reader_thread(&link, &decoded_tx, &stats, &stop);
        });
    }

    /// Writer task - drains encoded frames into the link
    async fn writer_task(
        mut link: Option<LinkStream>,
        mut wire_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut ctl_rx: mpsc::Receiver<LinkCommand>,
    ) {
        loop {
            tokio::select! {
                ctl = ctl_rx.recv() => match ctl {
                    Some(LinkCommand::Swap(new_link)) => link = Some(new_link),
                    Some(LinkCommand::Close) => link = None,
                    None => break,
                },
                data = wire_rx.recv() => match data {
                    Some(data) => {
                        let Some(link) = link.as_ref() else {
                            tracing::warn!("link closed, dropping {} outgoing bytes", data.len());
                            continue;
                        };
                        tracing::debug!(
                            target: "zigate_protocol::tx",
                            "writing {} bytes: {:02X?}",
                            data.len(),
                            data
                        );
                        if let Err(e) = link.write_all(&data) {
                            tracing::error!("link write error: {e}");
                            continue;
                        }
                        if let Err(e) = link.flush() {
                            tracing::error!("link flush error: {e}");
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("writer task shutting down");
    }

    /// Reader thread - blocking reads, frame assembly and validation
    fn reader_thread(
        link: &LinkStream,
        decoded_tx: &mpsc::Sender<Frame>,
        stats: &TransportStatistics,
        stop: &AtomicBool,
    ) {
        tracing::debug!("reader thread started");
        let mut buffer = [0u8; READ_CHUNK];
        let mut assembler = FrameAssembler::new();

        while !stop.load(Ordering::Relaxed) {
            match link.read(&mut buffer) {
                Ok(0) => {
                    tracing::warn!("link closed by the other side");
                    break;
                }
                Ok(n) => {
                    tracing::debug!(
                        target: "zigate_protocol::rx",
                        "read {} bytes: {:02X?}",
                        n,
                        &buffer[..n]
                    );
                    for region in assembler.feed(&buffer[..n]) {
                        match Frame::deserialize(&region) {
                            Ok(frame) => {
                                stats.incr_received();
                                if decoded_tx.blocking_send(frame).is_err() {
                                    tracing::debug!("frame channel closed");
                                    return;
                                }
                            }
                            Err(e @ ProtocolError::ChecksumMismatch { .. }) => {
                                stats.incr_crc_errors();
                                tracing::error!("dropping frame: {e}");
                            }
                            Err(e) => {
                                stats.incr_frame_errors();
                                tracing::error!("dropping frame: {e}");
                            }
                        }
                    }
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(e) => {
                    tracing::error!("link read error: {e}");
                    break;
                }
            }
        }
        tracing::debug!("reader thread shutting down");
    }

    /// Coordinator task - single owner of the command pipeline
    async fn coordinator_task(
        mut pipeline: CommandPipeline,
        mut cmd_rx: mpsc::Receiver<CoordinatorCommand>,
        mut decoded_rx: mpsc::Receiver<Frame>,
    ) {
        let mut tick = tokio::time::interval(TICK_PERIOD);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(CoordinatorCommand::Submit { opcode, payload, reply }) => {
                        let sqn = pipeline.submit(opcode, payload);
                        let _ = reply.send(sqn);
                    }
                    Some(CoordinatorCommand::Shutdown) | None => break,
                },
                frame = decoded_rx.recv() => match frame {
                    Some(frame) => pipeline.handle_frame(frame),
                    None => break,
                },
                _ = tick.tick() => pipeline.check_timeouts(),
            }
        }
        tracing::debug!("coordinator task shutting down");
    }
}

impl Drop for ZigateTransport {
    fn drop(&mut self) {
        self.stop_reader();
        // best effort; the workers also exit once their channels close
        let _ = self.cmd_tx.try_send(CoordinatorCommand::Shutdown);
    }
}
