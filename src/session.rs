//! # Session
//!
//! One secured, multiplexed connection: a [`Transport`], a
//! [`CryptoTransform`] and a [`Balancer`] driven by a background task.
//!
//! Each driver iteration either drains up to [`MAX_INBOUND_PER_PASS`]
//! buffered packets through the transform into the balancer, or, on the
//! tick, runs one outbound pass: backlog flush, rekey check, service
//! collection, sealing, and handing the sealed packets to the transport.
//!
//! Packets the transport cannot take yet wait in a session backlog. While
//! the backlog is non-empty services are not collected, so a slow peer
//! leaves data in the services instead of growing memory.
//!
//! Key agreement math runs on the blocking pool so a slow exchange never
//! stalls other tasks on the runtime.
//!
//! Per-message problems (malformed service message, unknown service id,
//! oversized message) are logged, counted and dropped. Handshake, integrity,
//! policy and framing errors close the session.
//!
//! ```rust,no_run
//! use muxwire::config::NetworkConfig;
//! use muxwire::service::{MailboxService, ServiceHandle, ServicePriority};
//! use muxwire::session::Session;
//! use std::time::Duration;
//!
//! # async fn demo() -> muxwire::error::Result<()> {
//! let config = NetworkConfig::default();
//! let session = Session::connect("127.0.0.1:9000", &config).await?;
//!
//! let (mailbox, handle) = ServiceHandle::wrap(MailboxService::new());
//! session.balancer().add_service(&handle, ServicePriority::High);
//! session.wait_established(Duration::from_secs(5)).await?;
//!
//! mailbox.push(&b"hello"[..])?;
//! let reply = mailbox.recv().await?;
//! # let _ = reply;
//! session.dispose().await;
//! # Ok(())
//! # }
//! ```

use crate::config::NetworkConfig;
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::balancer::Balancer;
use crate::protocol::message::{PacketTag, ServiceMessage};
use crate::protocol::transform::{CryptoTransform, Received, Role, ESTABLISHED_CYCLE};
use crate::transport::tcp::{self, TransportListener};
use crate::transport::{CloseReason, Transport};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

const EVENT_CAPACITY: usize = 64;

/// Inbound packets handled before the driver yields to the tick
pub const MAX_INBOUND_PER_PASS: usize = 256;

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Both sides hold the mutual key; application data flows
    Established { cycle: u64 },
    /// A later exchange installed a fresh key
    Rekeyed { cycle: u64 },
    /// The session stopped
    Closed(CloseReason),
}

#[derive(Debug)]
struct Inner {
    transport: Transport,
    transform: CryptoTransform,
    balancer: Arc<Balancer>,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<SessionEvent>,
    cycle_tx: watch::Sender<u64>,
    close_tx: watch::Sender<Option<CloseReason>>,
    /// Packets waiting for room in the transport queue, in send order
    backlog: Mutex<VecDeque<Packet>>,
}

/// Run `work` on the blocking pool
async fn offload<C, T, F>(ctx: &Arc<C>, work: F) -> Result<T>
where
    C: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&C) -> Result<T> + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    tokio::task::spawn_blocking(move || work(&ctx))
        .await
        .map_err(|e| {
            ProtocolError::HandshakeFailure(format!("{}: {e}", constants::ERR_AGREEMENT_TASK))
        })?
}

impl Inner {
    fn lock_backlog(&self) -> MutexGuard<'_, VecDeque<Packet>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `packet` to the transport; gives it back if the queue is full
    fn try_enqueue(&self, packet: Packet) -> Result<Option<Packet>> {
        let len = packet.len();
        match self.transport.enqueue(packet.clone()) {
            Ok(()) => {
                self.metrics.packet_sent(len);
                Ok(None)
            }
            Err(ProtocolError::QueueFull) => Ok(Some(packet)),
            Err(e) => Err(e),
        }
    }

    fn send_packet(&self, packet: Packet) -> Result<()> {
        let mut backlog = self.lock_backlog();
        if !backlog.is_empty() {
            backlog.push_back(packet);
            return Ok(());
        }
        if let Some(packet) = self.try_enqueue(packet)? {
            debug!("Transport queue full, packet held back");
            backlog.push_back(packet);
        }
        Ok(())
    }

    /// Move held-back packets into the transport; true once none are left
    fn flush_backlog(&self) -> Result<bool> {
        let mut backlog = self.lock_backlog();
        while let Some(packet) = backlog.pop_front() {
            if let Some(packet) = self.try_enqueue(packet)? {
                backlog.push_front(packet);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn backlog_len(&self) -> usize {
        self.lock_backlog().len()
    }

    fn note_cycle(&self, before: u64) {
        let after = self.transform.cycle();
        if after == before {
            return;
        }
        for _ in before..after {
            self.metrics.key_installed();
        }
        self.cycle_tx.send_replace(after);

        if after >= ESTABLISHED_CYCLE {
            let event = if before < ESTABLISHED_CYCLE {
                info!(cycle = after, "Session established");
                SessionEvent::Established { cycle: after }
            } else {
                debug!(cycle = after, "Session rekeyed");
                SessionEvent::Rekeyed { cycle: after }
            };
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    async fn start(self: &Arc<Self>) -> Result<()> {
        let opening = offload(self, |inner| inner.transform.start()).await?;
        if !opening.is_empty() {
            self.metrics.handshake_started();
        }
        for packet in opening {
            self.send_packet(packet)?;
        }
        Ok(())
    }

    async fn handle_inbound(self: &Arc<Self>, packet: Packet) -> Result<()> {
        self.metrics.packet_received(packet.len());
        let before = self.transform.cycle();

        let received = if packet.type_id == u8::from(PacketTag::Normal) {
            self.transform.receive(packet)?
        } else {
            offload(self, move |inner| inner.transform.receive(packet)).await?
        };
        match received {
            Received::Application(data) => self.deliver(&data),
            Received::Handshake(replies) => {
                let request: u8 = PacketTag::AgreementRequest.into();
                if replies.iter().any(|p| p.type_id == request) {
                    self.metrics.handshake_started();
                }
                for reply in replies {
                    self.send_packet(reply)?;
                }
            }
        }

        self.note_cycle(before);
        Ok(())
    }

    fn deliver(&self, data: &[u8]) {
        let message = match ServiceMessage::decode(data) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Malformed service message dropped");
                self.metrics.malformed_message();
                return;
            }
        };
        match self.balancer.dispatch_inbound(message) {
            Ok(()) => self.metrics.message_dispatched(),
            Err(ProtocolError::UnknownServiceTarget(id)) => {
                warn!(service_id = id, "Message for unknown service dropped");
                self.metrics.unknown_service();
            }
            // Already logged by the balancer
            Err(_) => {}
        }
    }

    async fn inbound_pass(self: &Arc<Self>, first: Packet) -> Result<()> {
        self.handle_inbound(first).await?;
        for _ in 1..MAX_INBOUND_PER_PASS {
            match self.transport.dequeue()? {
                Some(packet) => self.handle_inbound(packet).await?,
                None => break,
            }
        }
        Ok(())
    }

    async fn outbound_pass(self: &Arc<Self>) -> Result<()> {
        let before = self.transform.cycle();
        let clear = self.flush_backlog()?;

        let now = Instant::now();
        let rekey = if self.transform.rekey_due(now) {
            offload(self, move |inner| inner.transform.poll(now)).await?
        } else {
            self.transform.poll(now)?
        };
        if !rekey.is_empty() {
            self.metrics.handshake_started();
        }
        for packet in rekey {
            self.send_packet(packet)?;
        }

        if !clear {
            // Leave service data where it is until the peer catches up
            self.note_cycle(before);
            return Ok(());
        }

        let collected = self.balancer.collect_outbound();
        self.metrics.messages_collected(collected.len());
        for message in collected {
            match self.transform.enqueue(message.encode()) {
                Ok(()) => {}
                Err(ProtocolError::PacketTooLarge(len)) => {
                    warn!(
                        service_id = message.service_id,
                        sealed_len = len,
                        "Outbound message exceeds frame limit, dropped"
                    );
                    self.metrics.oversize_dropped();
                }
                Err(e) => return Err(e),
            }
        }

        for packet in self.transform.drain()? {
            self.send_packet(packet)?;
        }
        self.note_cycle(before);
        Ok(())
    }
}

/// A running secured connection
#[derive(Debug)]
pub struct Session {
    inner: Arc<Inner>,
    role: Role,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Drive `transport` with a fresh balancer
    pub fn start(transport: Transport, role: Role, config: &NetworkConfig) -> Self {
        let balancer = Arc::new(Balancer::from_config(&config.balancer));
        Self::start_with_balancer(transport, role, config, balancer)
    }

    /// Drive `transport` with a caller-supplied balancer
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_with_balancer(
        transport: Transport,
        role: Role,
        config: &NetworkConfig,
        balancer: Arc<Balancer>,
    ) -> Self {
        let transform = CryptoTransform::new(role, &config.crypto)
            .with_max_payload(transport.max_payload());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (cycle_tx, _) = watch::channel(0);
        let (close_tx, _) = watch::channel(None);

        let inner = Arc::new(Inner {
            transport,
            transform,
            balancer,
            metrics: Arc::new(Metrics::new()),
            events,
            cycle_tx,
            close_tx,
            backlog: Mutex::new(VecDeque::new()),
        });

        let cancel = CancellationToken::new();
        let span = tracing::info_span!("session", role = ?role, peer = ?inner.transport.peer_addr());
        let driver = tokio::spawn(
            drive(inner.clone(), cancel.clone(), config.balancer.tick_interval).instrument(span),
        );

        Self {
            inner,
            role,
            cancel,
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Connect over TCP as the initiator
    #[instrument(skip(config))]
    pub async fn connect(addr: &str, config: &NetworkConfig) -> Result<Self> {
        let transport = tcp::connect(addr, &config.transport).await?;
        Ok(Self::start(transport, Role::Initiator, config))
    }

    /// Accept one TCP connection as the responder
    pub async fn accept(listener: &TransportListener, config: &NetworkConfig) -> Result<Self> {
        let transport = listener.accept().await?;
        Ok(Self::start(transport, Role::Responder, config))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.inner.balancer
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn cycle(&self) -> u64 {
        self.inner.transform.cycle()
    }

    pub fn is_established(&self) -> bool {
        self.inner.transform.is_established()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until application data may flow; returns the cycle
    ///
    /// # Errors
    /// `Timeout` after `timeout`, `Disposed` if the session closes first.
    pub async fn wait_established(&self, timeout: Duration) -> Result<u64> {
        let mut cycle_rx = self.inner.cycle_tx.subscribe();
        let mut close_rx = self.inner.close_tx.subscribe();
        let wait = async {
            tokio::select! {
                biased;
                _ = close_rx.wait_for(Option::is_some) => Err(ProtocolError::Disposed),
                cycle = cycle_rx.wait_for(|c| *c >= ESTABLISHED_CYCLE) => {
                    cycle.map(|c| *c).map_err(|_| ProtocolError::Disposed)
                }
            }
        };
        with_timeout_error(wait, timeout).await
    }

    /// Packets held back because the transport queue was full
    pub fn backlog_len(&self) -> usize {
        self.inner.backlog_len()
    }

    /// Start a rekey on the next tick regardless of policy
    pub fn request_rekey(&self) -> Result<()> {
        self.inner.transform.request_rekey()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_tx.borrow().clone()
    }

    /// Wait until the session closes
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.inner.close_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Stopped),
            Err(_) => CloseReason::Stopped,
        };
        reason
    }

    /// Signal the driver to stop
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for teardown to finish
    pub async fn dispose(&self) {
        self.stop();
        let driver = match self.driver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!(error = %e, "Session driver ended abnormally");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(inner: Arc<Inner>, cancel: CancellationToken, tick: Duration) {
    let mut ticker = tokio::time::interval(tick.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = match inner.start().await {
        Err(e) => fatal(&inner, e),
        Ok(()) => loop {
            // Unbiased so a busy inbound side cannot starve the tick
            tokio::select! {
                _ = cancel.cancelled() => break CloseReason::Stopped,

                packet = inner.transport.recv() => match packet {
                    Ok(packet) => {
                        if let Err(e) = inner.inbound_pass(packet).await {
                            break fatal(&inner, e);
                        }
                    }
                    Err(_) => {
                        break inner
                            .transport
                            .close_reason()
                            .unwrap_or(CloseReason::PeerClosed);
                    }
                },

                _ = ticker.tick() => {
                    if let Err(e) = inner.outbound_pass().await {
                        break fatal(&inner, e);
                    }
                }
            }
        },
    };

    inner.transform.dispose();
    inner.transport.dispose().await;
    inner.close_tx.send_replace(Some(reason.clone()));
    let _ = inner.events.send(SessionEvent::Closed(reason.clone()));
    inner.metrics.log_metrics();
    info!(reason = %reason, "Session closed");
}

fn fatal(inner: &Inner, e: ProtocolError) -> CloseReason {
    match e {
        // Transport went away underneath us
        ProtocolError::Disposed => inner
            .transport
            .close_reason()
            .unwrap_or(CloseReason::Stopped),
        e => {
            error!(error = %e, "Session failed");
            inner.metrics.fatal_error();
            CloseReason::Error(e.to_string())
        }
    }
}
