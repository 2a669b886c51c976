//! Finite-field Diffie-Hellman key agreement
//!
//! One [`DhSession`] is created per exchange attempt and consumed when the
//! shared secret is computed. The secret exponent, the group parameters and
//! the shared secret are wiped before the session is released; only the
//! derived [`SessionKey`] survives.
//!
//! Wire payloads (all blobs are `[u32 len][big-endian magnitude]`):
//!
//! ```text
//! request:  [g][p][A]
//! response: [B]
//! ```
//!
//! The responder validates every peer-supplied value before exponentiating:
//! `min_modulus_bytes <= |p| <= max_modulus_bytes`, `1 < g < p-1` and
//! `1 < A < p-1`; the initiator checks `1 < B < p-1`.

use crate::config::{CryptoConfig, GroupKind};
use crate::core::wire::{WireReader, WireWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::bigint::ModularInteger;
use crate::utils::crypto::SessionKey;
use crate::utils::metrics::Timer;
use num_bigint::BigUint;
use num_traits::One;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

/// RFC 3526 group 14 prime (2048 bits)
const MODP_2048_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

/// Generator of the RFC 3526 groups
const MODP_GENERATOR: u32 = 2;

/// Attempts at drawing usable random parameters before giving up
const MAX_DRAW_ATTEMPTS: usize = 8;

/// Group a request is generated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhGroup {
    /// RFC 3526 group 14, g = 2
    Modp2048,
    /// Random full-width odd modulus and random generator per exchange.
    /// The modulus is not checked for primality, so this gives far weaker
    /// guarantees than a fixed safe-prime group.
    Random { modulus_bytes: usize },
}

/// Local exchange parameters and peer acceptance bounds
#[derive(Debug, Clone)]
pub struct DhParams {
    pub group: DhGroup,
    pub exponent_bytes: usize,
    pub min_modulus_bytes: usize,
    pub max_modulus_bytes: usize,
}

impl Default for DhParams {
    fn default() -> Self {
        Self::from(&CryptoConfig::default())
    }
}

impl From<&CryptoConfig> for DhParams {
    fn from(config: &CryptoConfig) -> Self {
        let group = match config.group {
            GroupKind::Modp2048 => DhGroup::Modp2048,
            GroupKind::Random => DhGroup::Random {
                modulus_bytes: config.random_modulus_bytes,
            },
        };
        Self {
            group,
            exponent_bytes: config.exponent_bytes,
            min_modulus_bytes: config.min_modulus_bytes,
            max_modulus_bytes: config.max_modulus_bytes,
        }
    }
}

/// The RFC 3526 group 14 prime
pub fn modp2048_prime() -> Result<BigUint> {
    BigUint::parse_bytes(MODP_2048_HEX.as_bytes(), 16)
        .ok_or_else(|| ProtocolError::HandshakeFailure("Invalid built-in group constant".into()))
}

fn random_bytes(len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(vec![0u8; len]);
    getrandom::fill(&mut buf)
        .map_err(|_| ProtocolError::HandshakeFailure(constants::ERR_RANDOM_SOURCE.into()))?;
    Ok(buf)
}

/// Random exponent of exactly `len` bytes with the top bit set
fn random_exponent(len: usize) -> Result<BigUint> {
    let mut raw = random_bytes(len.max(1))?;
    raw[0] |= 0x80;
    Ok(BigUint::from_be(&raw))
}

fn random_group(modulus_bytes: usize) -> Result<(BigUint, BigUint)> {
    let mut raw = random_bytes(modulus_bytes.max(4))?;
    raw[0] |= 0x80;
    let last = raw.len() - 1;
    raw[last] |= 0x01;
    let p = BigUint::from_be(&raw);

    // g uniformly in [2, p-2]
    let span = &p - BigUint::from(3u32);
    let raw_g = random_bytes(modulus_bytes.max(4))?;
    let g = BigUint::from_be(&raw_g) % span + BigUint::from(2u32);
    Ok((p, g))
}

fn read_value(r: &mut WireReader<'_>) -> Result<BigUint> {
    let raw = r
        .read_blob()
        .map_err(|e| ProtocolError::HandshakeFailure(e.to_string()))?;
    Ok(BigUint::from_be(raw))
}

fn finish(r: WireReader<'_>) -> Result<()> {
    r.finish()
        .map_err(|e| ProtocolError::HandshakeFailure(e.to_string()))
}

/// `SHA-256(S)` followed by wiping `S`
fn derive_key(mut shared: BigUint) -> Result<SessionKey> {
    if shared <= BigUint::one() {
        shared.wipe();
        return Err(ProtocolError::HandshakeFailure(
            "Degenerate shared secret".into(),
        ));
    }
    let bytes = Zeroizing::new(shared.to_be());
    shared.wipe();
    Ok(SessionKey::derive(&bytes))
}

/// Initiator side of one exchange
pub struct DhSession {
    p: BigUint,
    g: BigUint,
    a: BigUint,
}

impl std::fmt::Debug for DhSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhSession")
            .field("modulus_bytes", &self.p.byte_len())
            .finish_non_exhaustive()
    }
}

impl Drop for DhSession {
    fn drop(&mut self) {
        self.p.wipe();
        self.g.wipe();
        self.a.wipe();
    }
}

impl DhSession {
    /// Draw parameters and a private exponent; return the session and the
    /// request payload `[g][p][A]`.
    #[instrument(level = "debug", skip(params), fields(group = ?params.group))]
    pub fn initiate(params: &DhParams) -> Result<(Self, Vec<u8>)> {
        let _timer = Timer::start("dh_initiate");
        for _ in 0..MAX_DRAW_ATTEMPTS {
            let (p, g) = match params.group {
                DhGroup::Modp2048 => (modp2048_prime()?, BigUint::from(MODP_GENERATOR)),
                DhGroup::Random { modulus_bytes } => random_group(modulus_bytes)?,
            };
            let a = random_exponent(params.exponent_bytes)?;
            let public = g.pow_mod(&a, &p);

            // A random modulus can make g land in a tiny subgroup
            if !public.within_open_range(&p) {
                drop(Self { p, g, a });
                continue;
            }

            let mut w = WireWriter::with_capacity(12 + 3 * p.byte_len());
            w.put_blob(&g.to_be());
            w.put_blob(&p.to_be());
            w.put_blob(&public.to_be());

            debug!(modulus_bytes = p.byte_len(), "Agreement request generated");
            return Ok((Self { p, g, a }, w.into_vec()));
        }
        Err(ProtocolError::HandshakeFailure(
            "Could not draw usable group parameters".into(),
        ))
    }

    /// Consume the response `[B]` and derive the shared key
    #[instrument(level = "debug", skip_all)]
    pub fn complete(self, response: &[u8]) -> Result<SessionKey> {
        let mut r = WireReader::new(response);
        let peer = read_value(&mut r)?;
        finish(r)?;

        if !peer.within_open_range(&self.p) {
            return Err(ProtocolError::HandshakeFailure(
                constants::ERR_PUBLIC_RANGE.into(),
            ));
        }
        let key = derive_key(peer.pow_mod(&self.a, &self.p))?;
        debug!("Agreement completed by initiator");
        Ok(key)
    }
}

/// Answer a request `[g][p][A]`; return the response `[B]` and the key
#[instrument(level = "debug", skip_all)]
pub fn respond(request: &[u8], params: &DhParams) -> Result<(Vec<u8>, SessionKey)> {
    let _timer = Timer::start("dh_respond");
    let mut r = WireReader::new(request);
    let mut g = read_value(&mut r)?;
    let mut p = read_value(&mut r)?;
    let peer = read_value(&mut r)?;
    finish(r)?;

    let result = respond_with(&g, &p, &peer, params);
    g.wipe();
    p.wipe();
    result
}

fn respond_with(
    g: &BigUint,
    p: &BigUint,
    peer: &BigUint,
    params: &DhParams,
) -> Result<(Vec<u8>, SessionKey)> {
    let width = p.byte_len();
    if width < params.min_modulus_bytes || width > params.max_modulus_bytes {
        return Err(ProtocolError::HandshakeFailure(format!(
            "{}: {width} bytes",
            constants::ERR_MODULUS_SIZE
        )));
    }
    if !g.within_open_range(p) {
        return Err(ProtocolError::HandshakeFailure(
            constants::ERR_GENERATOR_RANGE.into(),
        ));
    }
    if !peer.within_open_range(p) {
        return Err(ProtocolError::HandshakeFailure(
            constants::ERR_PUBLIC_RANGE.into(),
        ));
    }

    let mut b = random_exponent(params.exponent_bytes)?;
    let public = g.pow_mod(&b, p);
    let shared = peer.pow_mod(&b, p);
    b.wipe();

    if !public.within_open_range(p) {
        let mut shared = shared;
        shared.wipe();
        return Err(ProtocolError::HandshakeFailure(
            constants::ERR_PUBLIC_RANGE.into(),
        ));
    }

    let key = derive_key(shared)?;
    let mut w = WireWriter::with_capacity(4 + width);
    w.put_blob(&public.to_be());

    debug!(modulus_bytes = width, "Agreement request answered");
    Ok((w.into_vec(), key))
}
