//! # Packet Codec
//!
//! `tokio_util` framing for [`Packet`]s.
//!
//! Decoding peeks the 3-byte header without consuming it and waits until the
//! whole frame is buffered, then splits header and payload off the front of
//! the read buffer in one step. A declared length above the configured limit
//! cannot be resynchronized and is reported as [`ProtocolError::ProtocolDesync`].

use crate::core::packet::{Packet, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::{constants, ProtocolError};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_payload: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec with a payload limit below the 16-bit maximum
    ///
    /// Limits above 65,535 are clamped; the length field cannot express more.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len > self.max_payload {
            return Err(ProtocolError::ProtocolDesync(format!(
                "{}: {len} > {}",
                constants::ERR_LENGTH_OVER_LIMIT,
                self.max_payload
            )));
        }

        let frame_len = HEADER_SIZE + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(2);
        let type_id = frame.get_u8();

        Ok(Some(Packet {
            type_id,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_payload {
            return Err(ProtocolError::PacketTooLarge(item.payload.len()));
        }
        item.write_frame(dst);
        Ok(())
    }
}
