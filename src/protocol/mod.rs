//! # Protocol Layer
//!
//! Everything between raw packets and application services.
//!
//! ## Components
//! - **Message**: packet tags and the service message envelope
//! - **Balancer**: priority-tiered service multiplexer
//! - **Handshake**: finite-field Diffie-Hellman exchange
//! - **Transform**: keying state machine and packet sealing
//!
//! ## Flow
//! ```text
//! inbound:  Packet -> CryptoTransform::receive -> ServiceMessage -> Balancer::dispatch_inbound
//! outbound: Balancer::collect_outbound -> ServiceMessage -> CryptoTransform::enqueue/drain -> Packet
//! ```

pub mod balancer;
pub mod handshake;
pub mod message;
pub mod transform;

#[cfg(test)]
mod tests;
