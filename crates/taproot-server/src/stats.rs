//! Server statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server activity counters.
#[derive(Debug)]
pub struct ServerStats {
    start_time: Instant,

    /// UDP queries received.
    pub udp_queries: AtomicU64,

    /// TCP queries received.
    pub tcp_queries: AtomicU64,

    /// Responses sent.
    pub responses: AtomicU64,

    /// Queries that failed to parse.
    pub parse_errors: AtomicU64,

    /// Currently open TCP connections.
    pub tcp_connections: AtomicU64,
}

impl ServerStats {
    /// Creates new server statistics.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            udp_queries: AtomicU64::new(0),
            tcp_queries: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            tcp_connections: AtomicU64::new(0),
        }
    }

    /// Server uptime.
    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Total queries received over both transports.
    pub fn total_queries(&self) -> u64 {
        self.udp_queries.load(Ordering::Relaxed) + self.tcp_queries.load(Ordering::Relaxed)
    }

    /// Increments the UDP query counter.
    pub fn inc_udp(&self) {
        self.udp_queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the TCP query counter.
    pub fn inc_tcp(&self) {
        self.tcp_queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the response counter.
    pub fn inc_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the parse error counter.
    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the open TCP connection gauge.
    pub fn inc_tcp_connection(&self) {
        self.tcp_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the open TCP connection gauge.
    pub fn dec_tcp_connection(&self) {
        self.tcp_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_both_transports() {
        let stats = ServerStats::new();
        stats.inc_udp();
        stats.inc_udp();
        stats.inc_tcp();

        assert_eq!(stats.total_queries(), 3);
    }
}
