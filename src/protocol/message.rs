//! Packet tags and the service message envelope
//!
//! Every packet on the wire carries a [`PacketTag`] in its type byte.
//! Application packets (`Normal`) decrypt to a [`ServiceMessage`]:
//!
//! ```text
//! [i32 service_id][u32 length][data]
//! ```

use crate::core::wire::{WireReader, WireWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::service::ServiceId;
use bytes::Bytes;

/// Minimum encoded size of a [`ServiceMessage`]
pub const SERVICE_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketTag {
    /// Sealed application data
    Normal = 0,
    /// Key agreement request
    AgreementRequest = 1,
    /// Key agreement response
    AgreementResponse = 2,
}

impl TryFrom<u8> for PacketTag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketTag::Normal),
            1 => Ok(PacketTag::AgreementRequest),
            2 => Ok(PacketTag::AgreementResponse),
            other => Err(ProtocolError::ProtocolDesync(format!(
                "{}: {other}",
                constants::ERR_UNKNOWN_PACKET_TAG
            ))),
        }
    }
}

impl From<PacketTag> for u8 {
    fn from(tag: PacketTag) -> Self {
        tag as u8
    }
}

/// Data addressed to one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMessage {
    pub service_id: ServiceId,
    pub data: Bytes,
}

impl ServiceMessage {
    pub fn new(service_id: ServiceId, data: impl Into<Bytes>) -> Self {
        Self {
            service_id,
            data: data.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        SERVICE_HEADER_LEN + self.data.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::with_capacity(self.encoded_len());
        w.put_i32(self.service_id);
        w.put_blob(&self.data);
        w.freeze()
    }

    /// # Errors
    /// `DeserializeError` if the input is shorter than the header, the
    /// declared length disagrees with the remaining bytes, or bytes trail.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < SERVICE_HEADER_LEN {
            return Err(ProtocolError::DeserializeError(format!(
                "{}: service message of {} bytes",
                constants::ERR_TRUNCATED,
                data.len()
            )));
        }
        let mut r = WireReader::new(data);
        let service_id = r.read_i32()?;
        let body = r.read_blob()?;
        r.finish()?;
        Ok(Self {
            service_id,
            data: Bytes::copy_from_slice(body),
        })
    }
}
