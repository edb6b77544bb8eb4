//! # Taproot DNS Server
//!
//! Async UDP and TCP front end. Each listener parses RFC 1035 wire
//! messages, hands them to a [`QueryHandler`], and writes the response
//! back, truncating over UDP when the answer exceeds what the client
//! can take, so it retries over TCP.
//!
//! The server owns no resolution logic; the handler is the seam where
//! the coordinator plugs in.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod handler;
pub mod stats;
pub mod tcp;
pub mod udp;

pub use handler::{QueryContext, QueryHandler, ServfailHandler};
pub use stats::ServerStats;
pub use tcp::TcpServer;
pub use udp::UdpServer;

/// Server error types.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// DNS transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain UDP.
    Udp,
    /// Plain TCP.
    Tcp,
}

impl Protocol {
    /// Returns the protocol name.
    pub const fn name(&self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address both listeners bind to.
    pub listen: SocketAddr,

    /// Idle timeout for TCP connections.
    pub tcp_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5355".parse().expect("valid listen address"),
            tcp_idle_timeout: Duration::from_secs(10),
        }
    }
}

/// DNS server instance: one UDP and one TCP listener on the same port.
pub struct DnsServer {
    config: ServerConfig,
    handler: Arc<dyn QueryHandler>,
    stats: Arc<ServerStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DnsServer {
    /// Creates a new DNS server.
    pub fn new(config: ServerConfig, handler: Arc<dyn QueryHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler,
            stats: Arc::new(ServerStats::new()),
            shutdown_tx,
        }
    }

    /// Shared server statistics.
    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Binds and runs both listeners until shutdown.
    pub async fn run(&self) -> Result<()> {
        let udp = UdpServer::bind(self.config.listen, self.handler.clone(), self.stats.clone())
            .await?;
        let mut tcp = TcpServer::bind(self.config.listen, self.handler.clone(), self.stats.clone())
            .await?;
        tcp.set_idle_timeout(self.config.tcp_idle_timeout);

        let mut udp_shutdown = self.shutdown_tx.subscribe();
        let mut tcp_shutdown = self.shutdown_tx.subscribe();

        let udp_task = tokio::spawn(async move {
            tokio::select! {
                result = udp.run() => result,
                _ = udp_shutdown.recv() => Ok(()),
            }
        });
        let tcp_task = tokio::spawn(async move {
            tokio::select! {
                result = tcp.run() => result,
                _ = tcp_shutdown.recv() => Ok(()),
            }
        });

        for task in [udp_task, tcp_task] {
            task.await
                .map_err(|e| ServerError::Io(std::io::Error::other(e)))??;
        }

        Ok(())
    }

    /// Initiates graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names() {
        assert_eq!(Protocol::Udp.name(), "UDP");
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
    }

    #[test]
    fn default_config_uses_the_unprivileged_port() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.port(), 5355);
    }
}
