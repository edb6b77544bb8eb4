//! Query handler interface.

use async_trait::async_trait;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::time::Instant;

use super::Protocol;

/// Context for a DNS query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Client address.
    pub client: SocketAddr,

    /// Protocol the query arrived over.
    pub protocol: Protocol,

    /// When the query was received.
    pub received_at: Instant,

    /// EDNS UDP payload size advertised by the client.
    pub udp_size: Option<u16>,
}

impl QueryContext {
    /// Creates a new query context.
    pub fn new(client: SocketAddr, protocol: Protocol) -> Self {
        Self {
            client,
            protocol,
            received_at: Instant::now(),
            udp_size: None,
        }
    }

    /// Sets the client's advertised EDNS UDP size.
    pub fn with_udp_size(mut self, size: u16) -> Self {
        self.udp_size = Some(size);
        self
    }

    /// The largest response we may send without truncating.
    pub fn max_response_size(&self) -> usize {
        match self.protocol {
            Protocol::Udp => self.udp_size.map(usize::from).unwrap_or(512).max(512),
            Protocol::Tcp => 65_535,
        }
    }

    /// Time since the query was received.
    pub fn elapsed(&self) -> std::time::Duration {
        self.received_at.elapsed()
    }
}

/// Query handler trait.
///
/// Implement this to answer DNS queries; the coordinator in the binary
/// is the production implementation.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Handles a DNS query and returns the response to send.
    async fn handle(&self, query: Message, context: QueryContext) -> Message;
}

/// A handler answering SERVFAIL to everything. Useful as a fallback and
/// in listener tests.
pub struct ServfailHandler;

#[async_trait]
impl QueryHandler for ServfailHandler {
    async fn handle(&self, query: Message, _context: QueryContext) -> Message {
        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(hickory_proto::op::MessageType::Response);
        response.set_response_code(hickory_proto::op::ResponseCode::ServFail);
        for q in query.queries() {
            response.add_query(q.clone());
        }
        response
    }
}
