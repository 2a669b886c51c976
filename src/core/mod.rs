//! # Core Protocol Components
//!
//! Low-level packet handling, framing, and binary field encoding.
//!
//! ## Components
//! - **Wire**: big-endian integer and length-prefixed blob codec
//! - **Packet**: type identifier plus opaque payload
//! - **Codec**: Tokio codec for framing packets over byte streams
//!
//! ## Wire Format
//! ```text
//! [Length(2)] [Type(1)] [Payload(Length)]
//! ```
//!
//! ## Security
//! - Maximum payload size: 65,535 bytes, optionally lower per connection
//! - Length validation before allocation

pub mod codec;
pub mod packet;
pub mod wire;
