//! # Error Types
//!
//! Error handling for the protocol engine.
//!
//! This module defines every error variant that can surface from framing,
//! service multiplexing, the key exchange and the symmetric transform.
//!
//! ## Error Categories
//! - **I/O Errors**: socket failures
//! - **Framing Errors**: length desync, oversized packets, malformed fields
//! - **Multiplexer Errors**: messages addressed to unknown services, service callback failures
//! - **Cryptographic Errors**: handshake failures, integrity failures, policy violations
//! - **Lifecycle Errors**: operations on a stopped transport or disposed transform
//!
//! Handshake, integrity, policy and desync errors are connection-fatal; see
//! [`ProtocolError::is_fatal`].
//!
//! ## Example Usage
//! ```rust
//! use muxwire::error::{ProtocolError, Result};
//! use tracing::{info, error};
//!
//! fn check_len(len: usize) -> Result<u16> {
//!     u16::try_from(len).map_err(|_| ProtocolError::PacketTooLarge(len))
//! }
//!
//! fn main() {
//!     match check_len(70_000) {
//!         Ok(len) => info!(len, "Fits in a frame"),
//!         Err(e) => error!(error=%e, "Rejected"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_LENGTH_OVER_LIMIT: &str = "Declared frame length exceeds the payload limit";
    pub const ERR_UNKNOWN_PACKET_TAG: &str = "Unknown packet tag";
    pub const ERR_TRUNCATED: &str = "Unexpected end of input";
    pub const ERR_TRAILING_BYTES: &str = "Trailing bytes after message";
    pub const ERR_INVALID_UTF8: &str = "Invalid UTF-8 in string field";

    /// Handshake errors
    pub const ERR_MODULUS_SIZE: &str = "Modulus size outside accepted bounds";
    pub const ERR_GENERATOR_RANGE: &str = "Generator outside (1, p-1)";
    pub const ERR_PUBLIC_RANGE: &str = "Public value outside (1, p-1)";
    pub const ERR_NO_EXCHANGE_IN_FLIGHT: &str = "Agreement response without a pending request";
    pub const ERR_REQUEST_BEFORE_KEY: &str = "Agreement request reached the initiator before any key";
    pub const ERR_RANDOM_SOURCE: &str = "System random source unavailable";
    pub const ERR_AGREEMENT_TIMED_OUT: &str = "Key agreement did not complete in time";
    pub const ERR_AGREEMENT_TASK: &str = "Key agreement task failed";

    /// Stream service errors
    pub const ERR_STREAM_KIND: &str = "Unknown stream record kind";
    pub const ERR_STREAM_RECORD_SIZE: &str = "Stream record exceeds the size limit";

    /// Policy errors
    pub const ERR_NORMAL_BEFORE_MUTUAL: &str =
        "Application packet received before the mutual key exchange completed";

    /// Lock errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("No service registered with id {0}")]
    UnknownServiceTarget(i32),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("Integrity check failed")]
    IntegrityFailure,

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Object has been disposed")]
    Disposed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Whether the error must tear down the connection it occurred on.
    ///
    /// Per-message errors (unknown service, malformed service message,
    /// oversized payload) are isolated and leave the connection running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::ProtocolDesync(_)
                | ProtocolError::HandshakeFailure(_)
                | ProtocolError::IntegrityFailure
                | ProtocolError::PolicyViolation(_)
                | ProtocolError::Disposed
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
