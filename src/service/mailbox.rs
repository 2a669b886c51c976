//! Application-facing queue pair
//!
//! The application [`push`](MailboxService::push)es messages for the peer and
//! [`pop`](MailboxService::pop)s or awaits ([`recv`](MailboxService::recv))
//! messages the peer sent to this service.

use super::Service;
use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct MailboxService {
    inbox: Mutex<VecDeque<Bytes>>,
    outbox: Mutex<VecDeque<Bytes>>,
    arrived: Notify,
}

fn lock(queue: &Mutex<VecDeque<Bytes>>) -> Result<MutexGuard<'_, VecDeque<Bytes>>> {
    queue
        .lock()
        .map_err(|e| ProtocolError::ServiceError(e.to_string()))
}

impl MailboxService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for the peer
    pub fn push(&self, data: impl Into<Bytes>) -> Result<()> {
        lock(&self.outbox)?.push_back(data.into());
        Ok(())
    }

    /// Oldest message from the peer, if any
    pub fn pop(&self) -> Result<Option<Bytes>> {
        Ok(lock(&self.inbox)?.pop_front())
    }

    /// Wait for the next message from the peer
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

    pub fn inbox_len(&self) -> usize {
        lock(&self.inbox).map(|q| q.len()).unwrap_or(0)
    }

    pub fn outbox_len(&self) -> usize {
        lock(&self.outbox).map(|q| q.len()).unwrap_or(0)
    }
}

impl Service for MailboxService {
    fn receive(&self, data: Bytes) -> Result<()> {
        lock(&self.inbox)?.push_back(data);
        self.arrived.notify_waiters();
        Ok(())
    }

    fn available(&self) -> bool {
        self.outbox_len() > 0
    }

    fn send(&self) -> Result<Bytes> {
        lock(&self.outbox)?
            .pop_front()
            .ok_or_else(|| ProtocolError::ServiceError("Mailbox outbox empty".into()))
    }
}
