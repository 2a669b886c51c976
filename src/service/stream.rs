//! Byte-stream service for messages of any size
//!
//! [`push`](StreamService::push)ed messages are framed as records and the
//! resulting byte stream is handed to the balancer in chunks of at most
//! `chunk_size` bytes, so a single message may span many service messages.
//! The receiving side appends chunks and reassembles complete records.
//!
//! Record layout: `[u8 kind][u32 len][data]`, big-endian. Kind `0` is the
//! only one defined.

use super::Service;
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{trace, warn};

/// Bytes of record header before each message
pub const RECORD_HEADER_LEN: usize = 5;

/// Record kind carrying one application message
pub const RECORD_KIND_DATA: u8 = 0;

/// Largest chunk handed to the balancer per `send`
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Largest message accepted in either direction
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Default)]
struct Inbound {
    /// Bytes of an incomplete record
    partial: BytesMut,
    ready: VecDeque<Bytes>,
}

#[derive(Debug)]
pub struct StreamService {
    chunk_size: usize,
    max_message_len: usize,
    outgoing: Mutex<BytesMut>,
    inbound: Mutex<Inbound>,
    arrived: Notify,
}

impl Default for StreamService {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|e| ProtocolError::ServiceError(e.to_string()))
}

impl StreamService {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            outgoing: Mutex::new(BytesMut::new()),
            inbound: Mutex::new(Inbound::default()),
            arrived: Notify::new(),
        }
    }

    /// Cap each outbound chunk at `chunk_size` bytes (at least 1)
    ///
    /// Chunks must still fit a sealed frame once wrapped in a service
    /// message; oversize chunks are dropped by the session.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Reject messages longer than `max_message_len` in either direction
    pub fn with_max_message_len(mut self, max_message_len: usize) -> Self {
        self.max_message_len = max_message_len.min(u32::MAX as usize);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Queue one message for the peer
    ///
    /// # Errors
    /// `ServiceError` if the message is longer than the configured limit.
    pub fn push(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        if data.len() > self.max_message_len {
            return Err(ProtocolError::ServiceError(format!(
                "{}: {} bytes",
                constants::ERR_STREAM_RECORD_SIZE,
                data.len()
            )));
        }
        let mut out = lock(&self.outgoing)?;
        out.reserve(RECORD_HEADER_LEN + data.len());
        out.put_u8(RECORD_KIND_DATA);
        out.put_u32(data.len() as u32);
        out.put_slice(data);
        Ok(())
    }

    /// Oldest reassembled message from the peer, if any
    pub fn pop(&self) -> Result<Option<Bytes>> {
        Ok(lock(&self.inbound)?.ready.pop_front())
    }

    /// Wait for the next reassembled message from the peer
    pub async fn recv(&self) -> Result<Bytes> {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(data) = self.pop()? {
                return Ok(data);
            }
            notified.await;
        }
    }

    /// Bytes queued for the peer and not yet collected
    pub fn pending_bytes(&self) -> usize {
        lock(&self.outgoing).map(|out| out.len()).unwrap_or(0)
    }

    /// Bytes received that do not yet form a complete record
    pub fn partial_bytes(&self) -> usize {
        lock(&self.inbound).map(|i| i.partial.len()).unwrap_or(0)
    }

    /// Move every complete record out of `inbound.partial`
    fn reassemble(&self, inbound: &mut Inbound) -> Result<usize> {
        let mut complete = 0;
        while inbound.partial.len() >= RECORD_HEADER_LEN {
            let kind = inbound.partial[0];
            if kind != RECORD_KIND_DATA {
                inbound.partial.clear();
                return Err(ProtocolError::ServiceError(format!(
                    "{}: {kind}",
                    constants::ERR_STREAM_KIND
                )));
            }
            let header = &inbound.partial[..RECORD_HEADER_LEN];
            let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
            if len > self.max_message_len {
                inbound.partial.clear();
                return Err(ProtocolError::ServiceError(format!(
                    "{}: {len} bytes",
                    constants::ERR_STREAM_RECORD_SIZE
                )));
            }
            if inbound.partial.len() < RECORD_HEADER_LEN + len {
                break;
            }
            inbound.partial.advance(RECORD_HEADER_LEN);
            let message = inbound.partial.split_to(len).freeze();
            inbound.ready.push_back(message);
            complete += 1;
        }
        Ok(complete)
    }
}

impl Service for StreamService {
    fn receive(&self, data: Bytes) -> Result<()> {
        let complete = {
            let mut inbound = lock(&self.inbound)?;
            inbound.partial.extend_from_slice(&data);
            match self.reassemble(&mut inbound) {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Stream reset");
                    // Records completed before the bad header stay deliverable
                    if !inbound.ready.is_empty() {
                        self.arrived.notify_waiters();
                    }
                    return Err(e);
                }
            }
        };
        if complete > 0 {
            trace!(complete, "Stream records reassembled");
            self.arrived.notify_waiters();
        }
        Ok(())
    }

    fn available(&self) -> bool {
        self.pending_bytes() > 0
    }

    fn send(&self) -> Result<Bytes> {
        let mut out = lock(&self.outgoing)?;
        if out.is_empty() {
            return Err(ProtocolError::ServiceError("Stream has nothing to send".into()));
        }
        let n = out.len().min(self.chunk_size);
        Ok(out.split_to(n).freeze())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// Move every pending chunk from `from` into `to`
    fn shuttle(from: &StreamService, to: &StreamService) -> usize {
        let mut chunks = 0;
        while from.available() {
            to.receive(from.send().unwrap()).unwrap();
            chunks += 1;
        }
        chunks
    }

    #[test]
    fn test_large_message_is_chunked_and_reassembled() {
        let tx = StreamService::new().with_chunk_size(1000);
        let rx = StreamService::new();
        let big: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        tx.push(&big).unwrap();
        tx.push(b"tail").unwrap();

        let chunks = shuttle(&tx, &rx);
        // 10_000 + 4 bytes of data and two 5-byte headers
        assert_eq!(chunks, 11);
        assert_eq!(rx.pop().unwrap().unwrap().as_ref(), &big[..]);
        assert_eq!(rx.pop().unwrap().unwrap(), Bytes::from_static(b"tail"));
        assert!(rx.pop().unwrap().is_none());
        assert_eq!(rx.partial_bytes(), 0);
    }

    #[test]
    fn test_chunks_never_exceed_chunk_size() {
        let tx = StreamService::new().with_chunk_size(7);
        tx.push(vec![1u8; 50]).unwrap();
        while tx.available() {
            assert!(tx.send().unwrap().len() <= 7);
        }
        assert_eq!(tx.pending_bytes(), 0);
        assert!(tx.send().is_err());
    }

    #[test]
    fn test_header_split_across_chunks() {
        let rx = StreamService::new();
        rx.receive(Bytes::from_static(&[0, 0, 0])).unwrap();
        assert!(rx.pop().unwrap().is_none());
        rx.receive(Bytes::from_static(&[0, 3, b'a', b'b'])).unwrap();
        assert!(rx.pop().unwrap().is_none());
        assert_eq!(rx.partial_bytes(), 7);
        rx.receive(Bytes::from_static(b"c")).unwrap();
        assert_eq!(rx.pop().unwrap().unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_empty_message() {
        let tx = StreamService::new();
        let rx = StreamService::new();
        tx.push(b"").unwrap();
        shuttle(&tx, &rx);
        assert_eq!(rx.pop().unwrap().unwrap().len(), 0);
    }

    #[test]
    fn test_unknown_kind_resets_stream() {
        let rx = StreamService::new();
        let mut bad = vec![0, 0, 0, 0, 1, b'x'];
        bad.extend_from_slice(&[9, 0, 0, 0, 1, b'y']);
        let err = rx.receive(Bytes::from(bad)).unwrap_err();
        assert!(err.to_string().contains("Unknown stream record kind"));
        assert_eq!(rx.partial_bytes(), 0);
        // The record before the bad header survives
        assert_eq!(rx.pop().unwrap().unwrap(), Bytes::from_static(b"x"));

        // Stream resumes at the next record boundary
        rx.receive(Bytes::from_static(&[0, 0, 0, 0, 1, b'z'])).unwrap();
        assert_eq!(rx.pop().unwrap().unwrap(), Bytes::from_static(b"z"));
    }

    #[test]
    fn test_size_limit_both_directions() {
        let small = StreamService::new().with_max_message_len(8);
        assert!(small.push(vec![0u8; 9]).is_err());
        assert_eq!(small.pending_bytes(), 0);
        small.push(vec![0u8; 8]).unwrap();

        let err = small
            .receive(Bytes::from_static(&[0, 0, 0, 1, 0]))
            .unwrap_err();
        assert!(err.to_string().contains("exceeds the size limit"));
        assert_eq!(small.partial_bytes(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_last_chunk() {
        let tx = StreamService::new().with_chunk_size(3);
        let rx = Arc::new(StreamService::new());
        tx.push(b"hello world").unwrap();

        let waiter = {
            let rx = rx.clone();
            tokio::spawn(async move { rx.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        shuttle(&tx, &rx);

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, Bytes::from_static(b"hello world"));
    }
}
