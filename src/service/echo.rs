//! Service that sends back every message it receives

use super::Service;
use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::trace;

#[derive(Debug, Default)]
pub struct EchoService {
    pending: Mutex<VecDeque<Bytes>>,
}

impl EchoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received but not yet echoed
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl Service for EchoService {
    fn receive(&self, data: Bytes) -> Result<()> {
        trace!(len = data.len(), "Echo queued");
        self.pending
            .lock()
            .map_err(|e| ProtocolError::ServiceError(e.to_string()))?
            .push_back(data);
        Ok(())
    }

    fn available(&self) -> bool {
        self.pending() > 0
    }

    fn send(&self) -> Result<Bytes> {
        self.pending
            .lock()
            .map_err(|e| ProtocolError::ServiceError(e.to_string()))?
            .pop_front()
            .ok_or_else(|| ProtocolError::ServiceError("Echo queue empty".into()))
    }
}
