//! UDP server implementation.

use super::handler::{QueryContext, QueryHandler};
use super::stats::ServerStats;
use super::{Protocol, Result};
use bytes::Bytes;
use hickory_proto::op::Message;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace};

/// UDP DNS server.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    handler: Arc<dyn QueryHandler>,
    stats: Arc<ServerStats>,
    local_addr: SocketAddr,
}

impl UdpServer {
    /// Binds a new UDP server to the given address.
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

        let socket = Socket::new(domain, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;

        #[cfg(unix)]
        socket.set_reuse_port(true)?;

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        info!(addr = %local_addr, "UDP server listening");

        Ok(Self {
            socket: Arc::new(socket),
            handler,
            stats,
            local_addr,
        })
    }

    /// Returns the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the UDP receive loop; each query is served on its own task.
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; 65_535];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    let socket = self.socket.clone();
                    let handler = self.handler.clone();
                    let stats = self.stats.clone();

                    tokio::spawn(async move {
                        if let Err(e) = process_query(socket, handler, stats, data, src).await {
                            debug!(error = %e, client = %src, "error processing UDP query");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "error receiving UDP packet");
                }
            }
        }
    }
}

async fn process_query(
    socket: Arc<UdpSocket>,
    handler: Arc<dyn QueryHandler>,
    stats: Arc<ServerStats>,
    data: Bytes,
    src: SocketAddr,
) -> Result<()> {
    stats.inc_udp();

    let query = match Message::from_vec(&data) {
        Ok(message) => message,
        Err(e) => {
            stats.inc_parse_error();
            trace!(error = %e, client = %src, "failed to parse DNS query");
            return Ok(()); // malformed queries are dropped
        }
    };

    let udp_size = query
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload())
        .unwrap_or(512);
    let ctx = QueryContext::new(src, Protocol::Udp).with_udp_size(udp_size);
    let max_size = ctx.max_response_size();

    let mut response = handler.handle(query, ctx).await;

    let mut wire = match response.to_vec() {
        Ok(wire) => wire,
        Err(e) => {
            debug!(error = %e, "failed to serialize response");
            return Ok(());
        }
    };

    // Too big for the client's buffer: truncate so it retries over TCP.
    if wire.len() > max_size {
        truncate_response(&mut response);
        wire = response
            .to_vec()
            .map_err(|e| super::ServerError::Protocol(e.to_string()))?;
    }

    socket.send_to(&wire, src).await?;
    stats.inc_response();

    Ok(())
}

/// Strips the payload sections and sets the TC bit.
fn truncate_response(response: &mut Message) {
    response.set_truncated(true);
    let _ = response.take_answers();
    let _ = response.take_name_servers();
    let _ = response.take_additionals();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ServfailHandler;

    #[tokio::test]
    async fn udp_server_binds_an_ephemeral_port() {
        let server = UdpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(ServfailHandler),
            Arc::new(ServerStats::new()),
        )
        .await
        .unwrap();

        assert!(server.local_addr().port() > 0);
    }

    #[test]
    fn truncation_sets_tc_and_empties_sections() {
        use hickory_proto::rr::rdata::A;
        use hickory_proto::rr::{Name, RData, Record};
        use std::str::FromStr;

        let mut response = Message::new();
        response.add_answer(Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            300,
            RData::A(A::new(192, 0, 2, 1)),
        ));

        truncate_response(&mut response);

        assert!(response.truncated());
        assert!(response.answers().is_empty());
    }
}
