//! # Binary Wire Codec
//!
//! Fixed-width integers and length-prefixed blobs, always big-endian.
//!
//! Every read checks the remaining input before touching it, so a truncated or
//! hostile buffer produces [`ProtocolError::DeserializeError`] instead of a
//! panic, and blob lengths are validated before any allocation happens.
//!
//! ```rust
//! use muxwire::core::wire::{WireReader, WireWriter};
//!
//! let mut w = WireWriter::new();
//! w.put_i32(-7);
//! w.put_blob(b"abc");
//! let bytes = w.freeze();
//!
//! let mut r = WireReader::new(&bytes);
//! assert_eq!(r.read_i32().unwrap(), -7);
//! assert_eq!(r.read_blob().unwrap(), b"abc");
//! r.finish().unwrap();
//! ```

use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the `u32` length prefix in front of blobs and strings
pub const BLOB_PREFIX_LEN: usize = 4;

/// Big-endian writer over a growable buffer
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    /// Write `[u32 len][utf-8 bytes]`
    pub fn put_string(&mut self, s: &str) {
        self.put_blob(s.as_bytes());
    }

    /// Write `[u32 len][bytes]`
    ///
    /// Blobs in this protocol are bounded by the 16-bit frame budget, far
    /// below `u32::MAX`.
    pub fn put_blob(&mut self, data: &[u8]) {
        self.buf.reserve(BLOB_PREFIX_LEN + data.len());
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
    }

    /// Write bytes with no length prefix
    pub fn put_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Big-endian reader over a borrowed byte slice
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.len() < n {
            return Err(ProtocolError::DeserializeError(format!(
                "{}: need {n} bytes, have {}",
                constants::ERR_TRUNCATED,
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.need(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    /// Read `[u32 len][bytes]`, borrowing the bytes from the input
    pub fn read_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_raw(len)
    }

    /// Read `[u32 len][utf-8 bytes]`
    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_blob()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::DeserializeError(constants::ERR_INVALID_UTF8.into()))
    }

    /// Read exactly `len` bytes with no prefix
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Fail if any input is left unread
    pub fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::DeserializeError(format!(
                "{}: {} bytes",
                constants::ERR_TRAILING_BYTES,
                self.buf.len()
            )))
        }
    }
}
