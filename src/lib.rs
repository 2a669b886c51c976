//! # muxwire
//!
//! Secured, multiplexed packet sessions over a single byte stream.
//!
//! A connection carries length-framed packets. After a Diffie-Hellman
//! exchange every application packet is sealed with AES-256-CBC, and a
//! priority-tiered balancer shares the connection between any number of
//! services addressed by numeric id.
//!
//! ## Layers
//! - [`core`]: packet type, framing codec, wire field encoding
//! - [`transport`]: stream-backed packet transport, TCP connect/listen
//! - [`protocol`]: message envelope, balancer, key exchange, transform
//! - [`service`]: the service contract plus echo and mailbox services
//! - [`session`]: background driver tying the layers together
//! - [`utils`]: crypto, big integers, logging, metrics, timeouts
//!
//! ## Quick start
//! ```rust,no_run
//! use muxwire::{NetworkConfig, Session, TransportListener};
//! use muxwire::service::{EchoService, ServiceHandle, ServicePriority};
//! use std::time::Duration;
//!
//! # async fn serve() -> muxwire::Result<()> {
//! let config = NetworkConfig::from_env()?;
//! muxwire::utils::logging::init_logging(&config.logging)?;
//!
//! let listener = TransportListener::bind_with_config(&config.transport).await?;
//! let session = Session::accept(&listener, &config).await?;
//! let (_echo, handle) = ServiceHandle::wrap(EchoService::new());
//! session.balancer().add_service(&handle, ServicePriority::High);
//! session.wait_established(Duration::from_secs(5)).await?;
//! session.closed().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::codec::PacketCodec;
pub use crate::core::packet::Packet;
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::balancer::Balancer;
pub use crate::protocol::message::{PacketTag, ServiceMessage};
pub use crate::protocol::transform::{CryptoTransform, Received, Role};
pub use crate::service::{Service, ServiceHandle, ServiceId, ServicePriority};
pub use crate::session::{Session, SessionEvent};
pub use crate::transport::tcp::TransportListener;
pub use crate::transport::{CloseReason, Transport};
