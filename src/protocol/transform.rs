//! # Crypto Transform
//!
//! Sans-IO state machine that keys a connection and seals its application
//! traffic. It consumes and produces [`Packet`]s; the session moves them to
//! and from the transport.
//!
//! ## Cycles
//! The cycle counts installed keys. At cycle 0 there is no key, at cycle 1
//! one unilateral exchange has completed and only agreement packets may
//! flow, and from cycle 2 on both sides have each generated a key and
//! application data is allowed.
//!
//! ```text
//! Initiator                                   Responder
//!   start()  --- Request (plain) ----------->
//!            <-- Response (plain) -----------  installs key 1
//!            <-- Request (key 1) ------------
//!   key 1
//!            --- Response (key 1) ---------->  installs key 2
//!   key 2
//! ```
//!
//! Rekeys repeat the second half under the current key. While this side
//! waits for its own response, outbound application data stays queued so the
//! peer never sees data sealed under a key it has not derived yet. When both
//! sides' requests cross, the connection initiator ignores the peer's request
//! and the responder drops its own exchange and answers.
//!
//! Establishment, and each later exchange this side starts, must finish
//! within `establish_timeout`; [`CryptoTransform::poll`] fails with
//! `HandshakeFailure` once that passes.

use crate::config::{CryptoConfig, RekeyPolicy};
use crate::core::packet::{Packet, MAX_PAYLOAD_SIZE};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{self, DhParams, DhSession};
use crate::protocol::message::PacketTag;
use crate::utils::crypto::{Crypto, SessionKey, IV_LEN};

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// First cycle at which application data may flow
pub const ESTABLISHED_CYCLE: u64 = 2;

/// Which end of the connection this transform sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection; sends the first request
    Initiator,
    /// Accepted the connection
    Responder,
}

/// Outcome of feeding one inbound packet
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// Decrypted application payload
    Application(Bytes),
    /// Agreement traffic; the packets must be sent in order
    Handshake(Vec<Packet>),
}

/// Size of a sealed envelope for `len` plaintext bytes
pub fn sealed_len(len: usize) -> usize {
    4 + IV_LEN + 4 + (len / 16 + 1) * 16
}

#[derive(Debug)]
struct Exchange {
    /// Our request awaiting a response
    pending: Option<DhSession>,
    pending_since: Instant,
    created_at: Instant,
    started: bool,
    rekey_requested: bool,
    installed_at: Instant,
    sealed_since_install: u64,
    outbound: VecDeque<Bytes>,
}

#[derive(Debug)]
pub struct CryptoTransform {
    role: Role,
    params: DhParams,
    policy: RekeyPolicy,
    rekey_interval: Duration,
    rekey_packet_limit: u64,
    establish_timeout: Duration,
    max_payload: usize,
    crypto: Crypto,
    key: RwLock<Option<Arc<SessionKey>>>,
    cycle: AtomicU64,
    state: Mutex<Exchange>,
    disposed: AtomicBool,
}

impl CryptoTransform {
    pub fn new(role: Role, config: &CryptoConfig) -> Self {
        Self::with_crypto(role, config, Crypto::new())
    }

    pub fn with_crypto(role: Role, config: &CryptoConfig, crypto: Crypto) -> Self {
        let now = Instant::now();
        Self {
            role,
            params: DhParams::from(config),
            policy: config.rekey_policy,
            rekey_interval: config.rekey_interval,
            rekey_packet_limit: config.rekey_packet_limit,
            establish_timeout: config.establish_timeout,
            max_payload: MAX_PAYLOAD_SIZE,
            crypto,
            key: RwLock::new(None),
            cycle: AtomicU64::new(0),
            state: Mutex::new(Exchange {
                pending: None,
                pending_since: now,
                created_at: now,
                started: false,
                rekey_requested: false,
                installed_at: now,
                sealed_since_install: 0,
                outbound: VecDeque::new(),
            }),
            disposed: AtomicBool::new(false),
        }
    }

    /// Lower the sealed packet limit to match a transport
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.min(MAX_PAYLOAD_SIZE);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of keys installed so far
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    pub fn is_established(&self) -> bool {
        self.cycle() >= ESTABLISHED_CYCLE
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(ProtocolError::Disposed)
        } else {
            Ok(())
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, Exchange>> {
        self.state
            .lock()
            .map_err(|_| ProtocolError::HandshakeFailure(constants::ERR_LOCK_POISONED.into()))
    }

    fn current_key(&self) -> Result<Arc<SessionKey>> {
        self.key
            .read()
            .map_err(|_| ProtocolError::HandshakeFailure(constants::ERR_LOCK_POISONED.into()))?
            .clone()
            .ok_or(ProtocolError::Disposed)
    }

    fn install(&self, state: &mut Exchange, key: SessionKey) -> Result<u64> {
        let mut slot = self
            .key
            .write()
            .map_err(|_| ProtocolError::HandshakeFailure(constants::ERR_LOCK_POISONED.into()))?;
        *slot = Some(Arc::new(key));
        drop(slot);

        state.installed_at = Instant::now();
        state.sealed_since_install = 0;
        let cycle = self.cycle.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(cycle, role = ?self.role, "Session key installed");
        Ok(cycle)
    }

    fn seal(&self, tag: PacketTag, plaintext: &[u8]) -> Result<Packet> {
        let key = self.current_key()?;
        let sealed = self.crypto.seal(&key, plaintext)?;
        Ok(Packet::new(tag.into(), sealed))
    }

    fn open(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let key = self.current_key()?;
        self.crypto.open(&key, payload)
    }

    /// Begin our own exchange; the request is sealed when a key exists
    fn begin_exchange(&self, state: &mut Exchange, now: Instant) -> Result<Packet> {
        let (session, request) = DhSession::initiate(&self.params)?;
        let packet = if self.cycle() == 0 {
            Packet::new(PacketTag::AgreementRequest.into(), request)
        } else {
            self.seal(PacketTag::AgreementRequest, &request)?
        };
        state.pending = Some(session);
        state.pending_since = now;
        state.rekey_requested = false;
        Ok(packet)
    }

    /// Emit the opening request; only the initiator sends one
    #[instrument(level = "debug", skip(self), fields(role = ?self.role))]
    pub fn start(&self) -> Result<Vec<Packet>> {
        self.ensure_live()?;
        let mut state = self.lock_state()?;
        if self.role != Role::Initiator || state.started {
            return Ok(Vec::new());
        }
        state.started = true;
        Ok(vec![self.begin_exchange(&mut state, Instant::now())?])
    }

    /// Queue application data for sealing
    ///
    /// # Errors
    /// `PacketTooLarge` if the sealed envelope would not fit in one frame.
    pub fn enqueue(&self, data: Bytes) -> Result<()> {
        self.ensure_live()?;
        let sealed = sealed_len(data.len());
        if sealed > self.max_payload {
            return Err(ProtocolError::PacketTooLarge(sealed));
        }
        self.lock_state()?.outbound.push_back(data);
        Ok(())
    }

    /// Application payloads waiting for a usable key
    pub fn queued(&self) -> usize {
        self.state.lock().map(|s| s.outbound.len()).unwrap_or(0)
    }

    /// Seal queued data; holds everything back until established and while
    /// our own exchange is in flight
    pub fn drain(&self) -> Result<Vec<Packet>> {
        self.ensure_live()?;
        let mut state = self.lock_state()?;
        if !self.is_established() || state.pending.is_some() || state.outbound.is_empty() {
            return Ok(Vec::new());
        }

        let mut packets = Vec::with_capacity(state.outbound.len());
        while let Some(data) = state.outbound.pop_front() {
            packets.push(self.seal(PacketTag::Normal, &data)?);
        }
        state.sealed_since_install += packets.len() as u64;
        Ok(packets)
    }

    /// Ask for a rekey on the next `poll`, regardless of policy
    pub fn request_rekey(&self) -> Result<()> {
        self.ensure_live()?;
        self.lock_state()?.rekey_requested = true;
        Ok(())
    }

    fn policy_allows(&self) -> bool {
        match self.policy {
            RekeyPolicy::Initiator => self.role == Role::Initiator,
            RekeyPolicy::Responder => self.role == Role::Responder,
            RekeyPolicy::Either => true,
        }
    }

    fn due(&self, state: &Exchange, now: Instant) -> bool {
        if !self.is_established() || state.pending.is_some() {
            return false;
        }
        let timed = now.saturating_duration_since(state.installed_at) >= self.rekey_interval;
        let counted =
            self.rekey_packet_limit > 0 && state.sealed_since_install >= self.rekey_packet_limit;
        state.rekey_requested || (self.policy_allows() && (timed || counted))
    }

    /// Whether the next `poll` at `now` would generate a request
    pub fn rekey_due(&self, now: Instant) -> bool {
        self.state
            .lock()
            .map(|state| self.due(&state, now))
            .unwrap_or(false)
    }

    /// Establishment, and every later exchange of our own, must finish
    /// within `establish_timeout`
    fn check_deadline(&self, state: &Exchange, now: Instant) -> Result<()> {
        let since = if !self.is_established() {
            state.created_at
        } else if state.pending.is_some() {
            state.pending_since
        } else {
            return Ok(());
        };
        if now.saturating_duration_since(since) >= self.establish_timeout {
            warn!(cycle = self.cycle(), role = ?self.role, "Key agreement stalled");
            return Err(ProtocolError::HandshakeFailure(
                constants::ERR_AGREEMENT_TIMED_OUT.into(),
            ));
        }
        Ok(())
    }

    /// Start a rekey if one is due
    ///
    /// # Errors
    /// `HandshakeFailure` once key agreement has been in flight longer than
    /// `establish_timeout`.
    pub fn poll(&self, now: Instant) -> Result<Vec<Packet>> {
        self.ensure_live()?;
        let mut state = self.lock_state()?;
        self.check_deadline(&state, now)?;
        if !self.due(&state, now) {
            return Ok(Vec::new());
        }

        info!(cycle = self.cycle(), role = ?self.role, "Starting rekey");
        Ok(vec![self.begin_exchange(&mut state, now)?])
    }

    /// Process one inbound packet
    ///
    /// # Errors
    /// Every error is connection-fatal: `PolicyViolation` for application
    /// data before the mutual exchange, `HandshakeFailure` for out-of-order or
    /// invalid agreement traffic, `IntegrityFailure` when decryption fails,
    /// `ProtocolDesync` for an unknown tag.
    pub fn receive(&self, packet: Packet) -> Result<Received> {
        self.ensure_live()?;
        match PacketTag::try_from(packet.type_id)? {
            PacketTag::Normal => {
                if !self.is_established() {
                    return Err(ProtocolError::PolicyViolation(
                        constants::ERR_NORMAL_BEFORE_MUTUAL.into(),
                    ));
                }
                let plain = self.open(&packet.payload)?;
                Ok(Received::Application(Bytes::from(plain)))
            }
            PacketTag::AgreementRequest => self.on_request(&packet.payload),
            PacketTag::AgreementResponse => self.on_response(&packet.payload),
        }
    }

    fn on_request(&self, payload: &[u8]) -> Result<Received> {
        let mut state = self.lock_state()?;

        if self.cycle() == 0 {
            if self.role == Role::Initiator {
                return Err(ProtocolError::HandshakeFailure(
                    constants::ERR_REQUEST_BEFORE_KEY.into(),
                ));
            }
            let (response, key) = handshake::respond(payload, &self.params)?;
            let reply = Packet::new(PacketTag::AgreementResponse.into(), response);
            self.install(&mut state, key)?;
            state.started = true;
            let request = self.begin_exchange(&mut state, Instant::now())?;
            return Ok(Received::Handshake(vec![reply, request]));
        }

        let request = self.open(payload)?;
        if state.pending.is_some() {
            if self.role == Role::Initiator {
                debug!("Crossed agreement requests; keeping ours");
                return Ok(Received::Handshake(Vec::new()));
            }
            debug!("Crossed agreement requests; answering the initiator's");
            state.pending = None;
        }

        let (response, key) = handshake::respond(&request, &self.params)?;
        let reply = self.seal(PacketTag::AgreementResponse, &response)?;
        self.install(&mut state, key)?;
        Ok(Received::Handshake(vec![reply]))
    }

    fn on_response(&self, payload: &[u8]) -> Result<Received> {
        let mut state = self.lock_state()?;
        let session = state.pending.take().ok_or_else(|| {
            ProtocolError::HandshakeFailure(constants::ERR_NO_EXCHANGE_IN_FLIGHT.into())
        })?;

        let key = if self.cycle() == 0 {
            session.complete(payload)?
        } else {
            let response = self.open(payload)?;
            session.complete(&response)?
        };
        self.install(&mut state, key)?;
        Ok(Received::Handshake(Vec::new()))
    }

    /// Wipe key material; every later call fails with `Disposed`
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.key.write() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        match self.state.lock() {
            Ok(mut state) => {
                state.pending = None;
                state.outbound.clear();
            }
            Err(_) => warn!("Transform state poisoned during dispose"),
        }
        debug!(role = ?self.role, "Transform disposed");
    }
}

impl Drop for CryptoTransform {
    fn drop(&mut self) {
        self.dispose();
    }
}
