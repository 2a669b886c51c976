//! # Packet
//!
//! The unit carried by the transport: a one-byte type identifier and an
//! opaque payload of at most 65,535 bytes.
//!
//! ## Wire Format
//! ```text
//! [Length(2)] [Type(1)] [Payload(Length)]
//! ```
//! The length counts payload bytes only, so the whole 16-bit range is usable
//! and a zero-length payload is legal.

use crate::error::{constants, ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Header size: u16 length followed by the u8 type identifier
pub const HEADER_SIZE: usize = 3;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub type_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(type_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            payload: payload.into(),
        }
    }

    /// Length of the payload in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Size of this packet once framed
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize into a standalone frame
    ///
    /// # Errors
    /// `PacketTooLarge` if the payload does not fit the 16-bit length field.
    pub fn to_bytes(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PacketTooLarge(self.payload.len()));
        }
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.write_frame(&mut buf);
        Ok(buf.freeze())
    }

    /// Append the frame to `dst`; the caller has already checked the size.
    pub(crate) fn write_frame(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_u16(self.payload.len() as u16);
        dst.put_u8(self.type_id);
        dst.put_slice(&self.payload);
    }

    /// Parse exactly one frame from `data`
    ///
    /// # Errors
    /// `DeserializeError` if the header is truncated or the payload is shorter
    /// than declared, or if bytes follow the frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::DeserializeError(
                constants::ERR_TRUNCATED.into(),
            ));
        }
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let body = &data[HEADER_SIZE..];
        if body.len() < len {
            return Err(ProtocolError::DeserializeError(format!(
                "{}: declared {len} payload bytes, have {}",
                constants::ERR_TRUNCATED,
                body.len()
            )));
        }
        if body.len() > len {
            return Err(ProtocolError::DeserializeError(
                constants::ERR_TRAILING_BYTES.into(),
            ));
        }
        Ok(Self {
            type_id: data[2],
            payload: Bytes::copy_from_slice(body),
        })
    }
}
