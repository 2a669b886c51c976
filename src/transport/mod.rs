//! # Transport Layer
//!
//! One framed stream connection driven by a single background task.
//!
//! The task decodes frames from the peer into the inbound queue while, at the
//! same time, writing queued outbound packets in batches of at most
//! `MAX_BATCH_FRAMES` followed by one flush. A peer that stops reading never
//! blocks reading, and stopping never waits on a stuck write. Callers never
//! touch the socket: [`Transport::enqueue`] and [`Transport::dequeue`] are
//! non-blocking queue operations and [`Transport::recv`] waits for the next
//! inbound packet. The outbound queue is bounded by `outbound_capacity`;
//! `enqueue` reports `QueueFull` instead of buffering without limit.
//!
//! Any stream works; TCP helpers live in [`tcp`]. In-memory pairs from
//! `tokio::io::duplex` are handy in tests.
//!
//! ```rust,no_run
//! use muxwire::config::TransportConfig;
//! use muxwire::core::packet::Packet;
//! use muxwire::transport::Transport;
//!
//! # async fn demo() -> muxwire::error::Result<()> {
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let config = TransportConfig::default();
//! let left = Transport::from_stream(a, &config);
//! let right = Transport::from_stream(b, &config);
//!
//! left.enqueue(Packet::new(1, vec![55]))?;
//! let packet = right.recv().await?;
//! assert_eq!(packet.payload.as_ref(), &[55]);
//! # Ok(())
//! # }
//! ```

pub mod tcp;

use crate::config::TransportConfig;
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::timeout::with_timeout_error;

use futures::{Sink, SinkExt, Stream, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Frames written between flushes
const MAX_BATCH_FRAMES: usize = 64;

/// Why a transport stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `stop()` or `dispose()` was called on this side
    Stopped,
    /// The peer closed its end of the stream
    PeerClosed,
    /// Reading, writing or framing failed
    Error(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Stopped => write!(f, "stopped locally"),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Error(e) => write!(f, "{e}"),
        }
    }
}

/// State shared between the handle and the connection task
#[derive(Debug)]
struct Shared {
    inbound: Mutex<VecDeque<Packet>>,
    inbound_ready: Notify,
    stopped: AtomicBool,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl Shared {
    fn push_inbound(&self, packet: Packet) {
        match self.inbound.lock() {
            Ok(mut queue) => queue.push_back(packet),
            Err(poisoned) => poisoned.into_inner().push_back(packet),
        }
        self.inbound_ready.notify_waiters();
    }

    fn pop_inbound(&self) -> Result<Option<Packet>> {
        let mut queue = self
            .inbound
            .lock()
            .map_err(|_| ProtocolError::ServiceError(constants::ERR_LOCK_POISONED.into()))?;
        Ok(queue.pop_front())
    }

    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
        self.inbound_ready.notify_waiters();
    }

    fn mark_closed(&self, reason: CloseReason) {
        self.close_tx.send_replace(Some(reason));
        self.mark_stopped();
    }
}

/// A framed connection with a background processing task
#[derive(Debug)]
pub struct Transport {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Packet>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    close_rx: watch::Receiver<Option<CloseReason>>,
    max_payload: usize,
    peer_addr: Option<SocketAddr>,
}

impl Transport {
    /// Wrap a connected stream and spawn its processing task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S>(stream: S, config: &TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = PacketCodec::with_max_payload(config.max_payload_size);
        let max_payload = codec.max_payload();
        let framed = Framed::new(stream, codec);

        let (close_tx, close_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            inbound: Mutex::new(VecDeque::new()),
            inbound_ready: Notify::new(),
            stopped: AtomicBool::new(false),
            close_tx,
        });
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_connection(
            framed,
            shared.clone(),
            outbound_rx,
            cancel.clone(),
            config.shutdown_timeout,
        ));

        Self {
            shared,
            outbound,
            cancel,
            task: Mutex::new(Some(task)),
            close_rx,
            max_payload,
            peer_addr: None,
        }
    }

    pub(crate) fn with_peer_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.peer_addr = addr;
        self
    }

    /// Remote address, when the stream is a socket
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Largest payload this transport accepts
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Packets that can be queued right now without `QueueFull`
    pub fn send_capacity(&self) -> usize {
        self.outbound.capacity()
    }

    /// Queue a packet for sending without waiting
    ///
    /// # Errors
    /// `PacketTooLarge` if the payload exceeds the frame limit, `QueueFull`
    /// while the write side is backed up, `Disposed` once the transport has
    /// stopped.
    pub fn enqueue(&self, packet: Packet) -> Result<()> {
        if packet.payload.len() > self.max_payload {
            return Err(ProtocolError::PacketTooLarge(packet.payload.len()));
        }
        if self.is_stopped() {
            return Err(ProtocolError::Disposed);
        }
        match self.outbound.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ProtocolError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(ProtocolError::Disposed),
        }
    }

    /// Take the oldest received packet, if any
    ///
    /// Packets that arrived before the transport stopped are still returned;
    /// once those are drained this fails with `Disposed`.
    pub fn dequeue(&self) -> Result<Option<Packet>> {
        match self.shared.pop_inbound()? {
            Some(packet) => Ok(Some(packet)),
            None if self.is_stopped() => Err(ProtocolError::Disposed),
            None => Ok(None),
        }
    }

    /// Wait for the next received packet
    ///
    /// Dropping the future cancels the wait. Fails with `Disposed` when the
    /// transport stops and nothing is left to read.
    pub async fn recv(&self) -> Result<Packet> {
        loop {
            let notified = self.shared.inbound_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(packet) = self.dequeue()? {
                return Ok(packet);
            }
            notified.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop accepting packets and signal the processing task
    ///
    /// Takes effect immediately, even while a write is blocked on the peer.
    pub fn stop(&self) {
        self.shared.mark_stopped();
        self.cancel.cancel();
    }

    /// Stop and wait for the processing task to finish
    pub async fn dispose(&self) {
        self.stop();
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Transport task ended abnormally");
            }
        }
    }

    /// Why the transport stopped, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_rx.borrow().clone()
    }

    /// Wait until the transport stops
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.close_rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Stopped),
            // Sender lives in `shared`, which we hold
            Err(_) => CloseReason::Stopped,
        };
        reason
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs both halves of the connection until either one ends or the
/// transport is cancelled
#[instrument(skip_all, level = "debug")]
async fn run_connection<S>(
    framed: Framed<S, PacketCodec>,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sink, stream) = framed.split();
    let halt = cancel.child_token();

    let reading = async {
        let reason = read_half(stream, &shared, &halt).await;
        halt.cancel();
        reason
    };
    let writing = async {
        let reason = write_half(&mut sink, &mut outbound_rx, &halt).await;
        halt.cancel();
        reason
    };
    let (read_reason, write_reason) = tokio::join!(reading, writing);
    let reason = read_reason.or(write_reason).unwrap_or(CloseReason::Stopped);

    outbound_rx.close();
    shared.mark_closed(reason.clone());

    if reason != CloseReason::PeerClosed {
        if let Err(e) = with_timeout_error(sink.close(), shutdown_timeout).await {
            debug!(error = %e, "Write half did not close cleanly");
        }
    }

    info!(reason = %reason, "Transport closed");
}

/// Decode frames into the inbound queue; `None` when halted from outside
async fn read_half<R>(
    mut stream: R,
    shared: &Shared,
    halt: &CancellationToken,
) -> Option<CloseReason>
where
    R: Stream<Item = Result<Packet>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = halt.cancelled() => return None,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(packet)) => {
                debug!(type_id = packet.type_id, len = packet.len(), "Frame received");
                shared.push_inbound(packet);
            }
            Some(Err(e)) => {
                warn!(error = %e, "Inbound stream failed");
                return Some(CloseReason::Error(e.to_string()));
            }
            None => return Some(CloseReason::PeerClosed),
        }
    }
}

/// Write queued packets in bounded batches; a blocked write still yields to
/// `halt`
async fn write_half<W>(
    sink: &mut W,
    outbound_rx: &mut mpsc::Receiver<Packet>,
    halt: &CancellationToken,
) -> Option<CloseReason>
where
    W: Sink<Packet, Error = ProtocolError> + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = halt.cancelled() => return None,
            packet = outbound_rx.recv() => match packet {
                Some(packet) => packet,
                // Handle dropped
                None => return None,
            },
        };
        let written = tokio::select! {
            biased;
            _ = halt.cancelled() => return None,
            written = write_batch(sink, outbound_rx, first) => written,
        };
        match written {
            Ok(frames) => debug!(frames, "Outbound batch flushed"),
            Err(e) => {
                warn!(error = %e, "Outbound stream failed");
                return Some(CloseReason::Error(e.to_string()));
            }
        }
    }
}

async fn write_batch<W>(
    sink: &mut W,
    outbound_rx: &mut mpsc::Receiver<Packet>,
    first: Packet,
) -> Result<usize>
where
    W: Sink<Packet, Error = ProtocolError> + Unpin,
{
    sink.feed(first).await?;
    let mut frames = 1usize;
    while frames < MAX_BATCH_FRAMES {
        match outbound_rx.try_recv() {
            Ok(packet) => {
                sink.feed(packet).await?;
                frames += 1;
            }
            Err(_) => break,
        }
    }
    sink.flush().await?;
    Ok(frames)
}
