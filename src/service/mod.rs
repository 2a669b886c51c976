//! # Services
//!
//! A service is an independent logical endpoint multiplexed over one
//! connection. The balancer pulls outbound data from services that report
//! themselves available and pushes inbound data to the service it is
//! addressed to.
//!
//! ## Components
//! - **Service**: the callback trait implemented by applications
//! - **ServiceHandle**: a service plus the id it was registered under
//! - **EchoService**: queues everything it receives back to the peer
//! - **MailboxService**: application-facing push/pop queues
//! - **StreamService**: messages of any size, chunked over the connection

pub mod echo;
pub mod mailbox;
pub mod stream;

pub use echo::EchoService;
pub use mailbox::MailboxService;
pub use stream::StreamService;

use crate::error::Result;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Identifier assigned at registration; never reused by a balancer
pub type ServiceId = i32;

/// Id of a handle that is not registered
pub const UNREGISTERED: ServiceId = 0;

/// Callbacks invoked by the balancer
///
/// Calls never overlap with balancer locks, so implementations may call back
/// into the balancer. Errors and panics are logged and contained.
pub trait Service: Send + Sync {
    /// Accept one inbound message
    fn receive(&self, data: Bytes) -> Result<()>;

    /// Whether `send` has something to return right now
    fn available(&self) -> bool;

    /// Produce one outbound message; only called after `available` is true
    fn send(&self) -> Result<Bytes>;
}

/// Scheduling tier; higher tiers are fully visited first on every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServicePriority {
    High,
    #[default]
    Med,
    Low,
}

impl ServicePriority {
    /// Tiers in visiting order
    pub const ALL: [ServicePriority; 3] = [
        ServicePriority::High,
        ServicePriority::Med,
        ServicePriority::Low,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            ServicePriority::High => 0,
            ServicePriority::Med => 1,
            ServicePriority::Low => 2,
        }
    }
}

/// A service together with its registration id
pub struct ServiceHandle {
    id: AtomicI32,
    service: Arc<dyn Service>,
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.service_id())
            .finish_non_exhaustive()
    }
}

impl ServiceHandle {
    pub fn new(service: Arc<dyn Service>) -> Arc<Self> {
        Arc::new(Self {
            id: AtomicI32::new(UNREGISTERED),
            service,
        })
    }

    /// Wrap a concrete service, keeping a typed reference for the caller
    pub fn wrap<S: Service + 'static>(service: S) -> (Arc<S>, Arc<Self>) {
        let service = Arc::new(service);
        let handle = Self::new(service.clone());
        (service, handle)
    }

    /// Current id, `UNREGISTERED` (0) when not registered
    pub fn service_id(&self) -> ServiceId {
        self.id.load(Ordering::Acquire)
    }

    pub fn is_registered(&self) -> bool {
        self.service_id() != UNREGISTERED
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    /// Take `id` if the handle is unregistered
    pub(crate) fn claim(&self, id: ServiceId) -> bool {
        self.id
            .compare_exchange(UNREGISTERED, id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop `id` if the handle still holds it
    pub(crate) fn release(&self, id: ServiceId) -> bool {
        self.id
            .compare_exchange(id, UNREGISTERED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
