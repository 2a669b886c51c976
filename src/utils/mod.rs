//! # Utility Modules
//!
//! Supporting utilities for cryptography, big-integer math, logging, metrics,
//! and timing.
//!
//! ## Components
//! - **Bigint**: modular arithmetic seam used by the key exchange
//! - **Crypto**: AES-256-CBC envelope sealing and session keys
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Per-connection observability counters
//! - **Timeout**: Async timeout wrappers
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom, rand)
//! - Memory zeroing for key material (zeroize crate)

pub mod bigint;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use bigint::ModularInteger;
pub use crypto::{Aes256Cbc, BlockCipher, Crypto, SessionKey};
