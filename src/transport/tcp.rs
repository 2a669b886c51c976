//! TCP connector and listener producing [`Transport`]s

use super::Transport;
use crate::config::TransportConfig;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout::with_timeout_error;

use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, instrument};

async fn resolve(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr).await?.next().ok_or_else(|| {
        ProtocolError::ConfigError(format!("Address did not resolve: {addr}"))
    })
}

/// Connect to `addr`, bounded by `config.connect_timeout`
#[instrument(skip(config))]
pub async fn connect(addr: &str, config: &TransportConfig) -> Result<Transport> {
    let stream = with_timeout_error(
        async { Ok(TcpStream::connect(addr).await?) },
        config.connect_timeout,
    )
    .await?;
    stream.set_nodelay(config.nodelay)?;

    let peer = stream.peer_addr().ok();
    info!(peer = ?peer, "Connected");
    Ok(Transport::from_stream(stream, config).with_peer_addr(peer))
}

/// Listening socket that hands out a [`Transport`] per accepted connection
#[derive(Debug)]
pub struct TransportListener {
    listener: TcpListener,
    config: TransportConfig,
}

impl TransportListener {
    /// Bind `addr` with the given pending-connection backlog
    pub async fn bind(addr: &str, backlog: u32) -> Result<Self> {
        let config = TransportConfig {
            address: addr.to_string(),
            backlog,
            ..TransportConfig::default()
        };
        Self::bind_with_config(&config).await
    }

    /// Bind `config.address` using the rest of `config` for accepted streams
    #[instrument(skip(config), fields(address = %config.address, backlog = config.backlog))]
    pub async fn bind_with_config(config: &TransportConfig) -> Result<Self> {
        let addr = resolve(&config.address).await?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;

        info!(local = ?listener.local_addr().ok(), "Listening");
        Ok(Self {
            listener,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next connection
    pub async fn accept(&self) -> Result<Transport> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(self.config.nodelay)?;
        debug!(peer = %peer, "Accepted connection");
        Ok(Transport::from_stream(stream, &self.config).with_peer_addr(Some(peer)))
    }
}
