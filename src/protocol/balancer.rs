//! # Service Balancer
//!
//! Routes inbound service messages by id and schedules outbound collection
//! across three priority tiers.
//!
//! On every [`collect_outbound`](Balancer::collect_outbound) pass each tier,
//! High then Med then Low, visits up to its limit of services starting at the
//! tier's round-robin cursor. A visited service is asked `available()` and,
//! only if it answers true, `send()`. The cursor advances by one per visited
//! slot and wraps at the tier length, so with a fixed registration order the
//! schedule is deterministic.
//!
//! ## Locking
//! The directory is an `RwLock`, each tier a `Mutex`, always taken in that
//! order. Service callbacks run with no lock held, so a service may register
//! or remove services from inside its own callbacks. Panics inside callbacks
//! are caught and logged.

use crate::config::BalancerConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::ServiceMessage;
use crate::service::{ServiceHandle, ServiceId, ServicePriority};

use bytes::Bytes;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
struct Entry {
    handle: Arc<ServiceHandle>,
    priority: ServicePriority,
}

#[derive(Debug, Default)]
struct Tier {
    ids: Vec<ServiceId>,
    cursor: usize,
}

impl Tier {
    fn remove(&mut self, id: ServiceId) {
        if let Some(pos) = self.ids.iter().position(|&x| x == id) {
            self.ids.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
            if self.cursor >= self.ids.len() {
                self.cursor = 0;
            }
        }
    }

    /// Ids to visit this pass; advances the cursor past them
    fn take_slots(&mut self, limit: usize) -> Vec<ServiceId> {
        let n = self.ids.len();
        if n == 0 || limit == 0 {
            return Vec::new();
        }
        let count = limit.min(n);
        let start = self.cursor % n;
        let slots = (0..count).map(|k| self.ids[(start + k) % n]).collect();
        self.cursor = (start + count) % n;
        slots
    }
}

/// Clears the single-flight flag even if a pass unwinds
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Priority-tiered service multiplexer
#[derive(Debug)]
pub struct Balancer {
    directory: RwLock<HashMap<ServiceId, Entry>>,
    tiers: [Mutex<Tier>; 3],
    limits: [AtomicUsize; 3],
    next_id: AtomicI32,
    collecting: AtomicBool,
    disposed: AtomicBool,
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer {
    pub fn new() -> Self {
        Self::from_config(&BalancerConfig::default())
    }

    pub fn from_config(config: &BalancerConfig) -> Self {
        Self {
            directory: RwLock::new(HashMap::new()),
            tiers: Default::default(),
            limits: [
                AtomicUsize::new(config.high_limit),
                AtomicUsize::new(config.med_limit),
                AtomicUsize::new(config.low_limit),
            ],
            next_id: AtomicI32::new(1),
            collecting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether `handle` is registered here, not merely somewhere
    fn owns(dir: &HashMap<ServiceId, Entry>, handle: &Arc<ServiceHandle>) -> bool {
        dir.get(&handle.service_id())
            .is_some_and(|e| Arc::ptr_eq(&e.handle, handle))
    }

    /// Register a service; returns the new id, or `None` if the handle is
    /// already registered, the balancer is disposed or ids are exhausted
    #[instrument(level = "debug", skip(self, handle))]
    pub fn add_service(
        &self,
        handle: &Arc<ServiceHandle>,
        priority: ServicePriority,
    ) -> Option<ServiceId> {
        if self.is_disposed() || handle.is_registered() {
            return None;
        }

        let mut dir = self
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Ids are never reused, so the space can run out
        let Ok(id) = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
        else {
            warn!("Service id space exhausted, registration refused");
            return None;
        };
        if !handle.claim(id) {
            return None;
        }
        dir.insert(
            id,
            Entry {
                handle: handle.clone(),
                priority,
            },
        );
        lock(&self.tiers[priority.index()]).ids.push(id);

        debug!(service_id = id, "Service registered");
        Some(id)
    }

    /// Unregister a service and reset its id; false if it was not registered here
    pub fn remove_service(&self, handle: &Arc<ServiceHandle>) -> bool {
        let mut dir = self
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !Self::owns(&dir, handle) {
            return false;
        }
        let id = handle.service_id();
        if let Some(entry) = dir.remove(&id) {
            lock(&self.tiers[entry.priority.index()]).remove(id);
        }
        handle.release(id);

        debug!(service_id = id, "Service removed");
        true
    }

    /// Move a service to another tier, registering it if needed
    ///
    /// A moved service is appended to the end of its new tier.
    pub fn set_priority(&self, handle: &Arc<ServiceHandle>, priority: ServicePriority) {
        {
            let mut dir = self
                .directory
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if Self::owns(&dir, handle) {
                let id = handle.service_id();
                if let Some(entry) = dir.get_mut(&id) {
                    if entry.priority != priority {
                        lock(&self.tiers[entry.priority.index()]).remove(id);
                        lock(&self.tiers[priority.index()]).ids.push(id);
                        entry.priority = priority;
                    }
                }
                return;
            }
        }
        self.add_service(handle, priority);
    }

    pub fn priority_of(&self, handle: &Arc<ServiceHandle>) -> Option<ServicePriority> {
        let dir = self
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if Self::owns(&dir, handle) {
            dir.get(&handle.service_id()).map(|e| e.priority)
        } else {
            None
        }
    }

    pub fn contains(&self, handle: &Arc<ServiceHandle>) -> bool {
        let dir = self
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Self::owns(&dir, handle)
    }

    /// Registered service count
    pub fn len(&self) -> usize {
        self.directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in a tier in visiting order from its first slot
    pub fn tier_ids(&self, priority: ServicePriority) -> Vec<ServiceId> {
        lock(&self.tiers[priority.index()]).ids.clone()
    }

    pub fn tier_limit(&self, priority: ServicePriority) -> usize {
        self.limits[priority.index()].load(Ordering::Relaxed)
    }

    pub fn set_tier_limit(&self, priority: ServicePriority, limit: usize) {
        self.limits[priority.index()].store(limit, Ordering::Relaxed);
    }

    /// Hand `message` to the service registered under its id
    ///
    /// # Errors
    /// `UnknownServiceTarget` when no service has the id; `ServiceError` when
    /// the service fails or panics.
    pub fn dispatch_inbound(&self, message: ServiceMessage) -> Result<()> {
        let id = message.service_id;
        let handle = {
            let dir = self
                .directory
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            dir.get(&id).map(|e| e.handle.clone())
        };
        let handle = handle.ok_or(ProtocolError::UnknownServiceTarget(id))?;

        let data = message.data;
        match catch_unwind(AssertUnwindSafe(|| handle.service().receive(data))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(service_id = id, error = %e, "Service rejected inbound message");
                Err(e)
            }
            Err(_) => {
                warn!(service_id = id, "Service panicked in receive");
                Err(ProtocolError::ServiceError(format!(
                    "Service {id} panicked in receive"
                )))
            }
        }
    }

    /// Ask scheduled services for outbound data
    ///
    /// Returns immediately with nothing if another pass is running.
    pub fn collect_outbound(&self) -> Vec<ServiceMessage> {
        if self
            .collecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Vec::new();
        }
        let _flight = FlightGuard(&self.collecting);

        let mut out = Vec::new();
        if self.is_disposed() {
            return out;
        }

        for priority in ServicePriority::ALL {
            let slots = lock(&self.tiers[priority.index()]).take_slots(self.tier_limit(priority));
            if slots.is_empty() {
                continue;
            }

            let visits: Vec<(ServiceId, Arc<ServiceHandle>)> = {
                let dir = self
                    .directory
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                slots
                    .into_iter()
                    .filter_map(|id| dir.get(&id).map(|e| (id, e.handle.clone())))
                    .collect()
            };

            for (id, handle) in visits {
                if let Some(data) = Self::poll_service(id, &handle) {
                    out.push(ServiceMessage::new(id, data));
                }
            }
        }
        out
    }

    fn poll_service(id: ServiceId, handle: &ServiceHandle) -> Option<Bytes> {
        let service = handle.service();
        let polled = catch_unwind(AssertUnwindSafe(|| {
            if service.available() {
                service.send().map(Some)
            } else {
                Ok(None)
            }
        }));
        match polled {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                warn!(service_id = id, error = %e, "Service send failed");
                None
            }
            Err(_) => {
                warn!(service_id = id, "Service panicked in send");
                None
            }
        }
    }

    /// Unregister everything; later mutations are ignored
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let mut dir = self
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for (id, entry) in dir.drain() {
            entry.handle.release(id);
        }
        for tier in &self.tiers {
            let mut tier = lock(tier);
            tier.ids.clear();
            tier.cursor = 0;
        }
        debug!("Balancer disposed");
    }
}
