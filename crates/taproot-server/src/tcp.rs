//! TCP server implementation.
//!
//! Handles queries exceeding the UDP payload limit and client retries of
//! truncated UDP answers. Messages are length-prefixed per RFC 1035
//! §4.2.2; connections are reused until the idle timeout fires.

use super::handler::{QueryContext, QueryHandler};
use super::stats::ServerStats;
use super::{Protocol, Result};
use bytes::BytesMut;
use hickory_proto::op::Message;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

/// TCP DNS server.
pub struct TcpServer {
    listener: TcpListener,
    handler: Arc<dyn QueryHandler>,
    stats: Arc<ServerStats>,
    local_addr: SocketAddr,
    idle_timeout: Duration,
}

impl TcpServer {
    /// Binds a new TCP server to the given address.
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn QueryHandler>,
        stats: Arc<ServerStats>,
    ) -> Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;

        #[cfg(unix)]
        socket.set_reuse_port(true)?;

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "TCP server listening");

        Ok(Self {
            listener,
            handler,
            stats,
            local_addr,
            idle_timeout: Duration::from_secs(10),
        })
    }

    /// Returns the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sets the idle timeout for accepted connections.
    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        self.idle_timeout = idle_timeout;
    }

    /// Runs the accept loop; each connection is served on its own task.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let handler = self.handler.clone();
                    let stats = self.stats.clone();
                    let idle_timeout = self.idle_timeout;

                    tokio::spawn(async move {
                        stats.inc_tcp_connection();
                        if let Err(e) =
                            handle_connection(stream, peer, handler, stats.clone(), idle_timeout)
                                .await
                        {
                            debug!(error = %e, client = %peer, "TCP connection error");
                        }
                        stats.dec_tcp_connection();
                    });
                }
                Err(e) => {
                    error!(error = %e, "error accepting TCP connection");
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn QueryHandler>,
    stats: Arc<ServerStats>,
    idle_timeout: Duration,
) -> Result<()> {
    trace!(client = %peer, "new TCP connection");

    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let query_bytes = match timeout(idle_timeout, read_message(&mut stream, &mut buf)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    trace!(client = %peer, "TCP connection closed by client");
                } else {
                    debug!(error = %e, client = %peer, "TCP read error");
                }
                break;
            }
            Err(_) => {
                trace!(client = %peer, "TCP connection idle timeout");
                break;
            }
        };

        stats.inc_tcp();

        let query = match Message::from_vec(&query_bytes) {
            Ok(message) => message,
            Err(e) => {
                stats.inc_parse_error();
                debug!(error = %e, client = %peer, "failed to parse TCP query");
                continue;
            }
        };

        let ctx = QueryContext::new(peer, Protocol::Tcp);
        let response = handler.handle(query, ctx).await;

        match response.to_vec() {
            Ok(wire) => {
                write_message(&mut stream, &wire).await?;
                stats.inc_response();
            }
            Err(e) => {
                debug!(error = %e, "failed to serialize TCP response");
            }
        }
    }

    Ok(())
}

/// Reads one length-prefixed DNS message.
async fn read_message(stream: &mut TcpStream, buf: &mut BytesMut) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = usize::from(u16::from_be_bytes(len_buf));

    if len == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "zero-length TCP message",
        ));
    }

    buf.clear();
    buf.resize(len, 0);
    stream.read_exact(buf).await?;

    Ok(buf.to_vec())
}

/// Writes one length-prefixed DNS message.
async fn write_message(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    let len = data.len() as u16;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ServfailHandler;

    #[tokio::test]
    async fn tcp_server_binds_an_ephemeral_port() {
        let server = TcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(ServfailHandler),
            Arc::new(ServerStats::new()),
        )
        .await
        .unwrap();

        assert!(server.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn tcp_round_trip_serves_a_query() {
        use hickory_proto::op::Query;
        use hickory_proto::rr::{Name, RecordType};
        use std::str::FromStr;

        let server = TcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(ServfailHandler),
            Arc::new(ServerStats::new()),
        )
        .await
        .unwrap();
        let addr = server.local_addr();
        tokio::spawn(async move { server.run().await });

        let mut query = Message::new();
        query.set_id(0x77AA);
        query.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        let wire = query.to_vec().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&(wire.len() as u16).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&wire).await.unwrap();

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut response_buf = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
        stream.read_exact(&mut response_buf).await.unwrap();

        let response = Message::from_vec(&response_buf).unwrap();
        assert_eq!(response.id(), 0x77AA);
    }
}
