//! Racing nameserver pool.
//!
//! Sends each query to every candidate server concurrently over UDP and
//! takes the first response with a usable rcode. Truncated answers are
//! retried over TCP against the same server. If the whole race dies
//! inside the fast window, one slower fallback exchange against the first
//! server gets a final chance before the error surfaces.
//!
//! The pool also keeps an EWMA latency table fed by explicit `. NS`
//! probes, which backs top-N server selection.

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::wire;
use super::{Exchanger, ResolverError, Result};

/// Pool timing configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Deadline for the whole concurrent race.
    pub fast_timeout: Duration,

    /// Per-server UDP exchange timeout inside the race.
    pub udp_timeout: Duration,

    /// Timeout for the single fallback exchange after a failed race.
    pub fallback_timeout: Duration,

    /// Timeout for latency measurement probes.
    pub probe_timeout: Duration,

    /// Servers above this measured RTT are not selected.
    pub max_selectable_latency: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            fast_timeout: Duration::from_millis(30),
            udp_timeout: Duration::from_millis(25),
            fallback_timeout: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(100),
            max_selectable_latency: Duration::from_millis(50),
        }
    }
}

/// Pool activity counters.
#[derive(Debug, Default)]
struct PoolStats {
    races: AtomicU64,
    race_wins: AtomicU64,
    fallbacks: AtomicU64,
    tcp_retries: AtomicU64,
    timeouts: AtomicU64,
}

/// A point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStatsSnapshot {
    /// Races started.
    pub races: u64,
    /// Races won inside the fast window.
    pub race_wins: u64,
    /// Fallback exchanges attempted.
    pub fallbacks: u64,
    /// TCP retries after truncation.
    pub tcp_retries: u64,
    /// Individual exchanges that timed out.
    pub timeouts: u64,
}

/// Concurrent-racing nameserver pool.
pub struct NameserverPool {
    config: PoolConfig,
    stats: PoolStats,
    /// EWMA round-trip time per server address.
    latency: RwLock<HashMap<SocketAddr, Duration>>,
}

impl NameserverPool {
    /// Creates a pool with the given timing configuration.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            stats: PoolStats::default(),
            latency: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            races: self.stats.races.load(Ordering::Relaxed),
            race_wins: self.stats.race_wins.load(Ordering::Relaxed),
            fallbacks: self.stats.fallbacks.load(Ordering::Relaxed),
            tcp_retries: self.stats.tcp_retries.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Races `query` against every server; first usable answer wins.
    ///
    /// A response counts as usable when its id and question match the
    /// query and its rcode is NOERROR or NXDOMAIN; an empty NOERROR
    /// answer is not retried here, that call belongs to the walker.
    pub async fn exchange(
        &self,
        servers: &[SocketAddr],
        query: &Message,
    ) -> Result<(Message, Duration)> {
        if servers.is_empty() {
            return Err(ResolverError::NoNameserversAvailable);
        }

        let start = Instant::now();
        self.stats.races.fetch_add(1, Ordering::Relaxed);

        match self.race(servers, query, start).await {
            Ok(response) => {
                self.stats.race_wins.fetch_add(1, Ordering::Relaxed);
                Ok((response, start.elapsed()))
            }
            Err(race_error) => {
                // The fast window produced nothing; one slower exchange
                // against the first server gets a final chance.
                self.stats.fallbacks.fetch_add(1, Ordering::Relaxed);
                debug!(error = %race_error, server = %servers[0], "race failed, trying fallback");

                match self
                    .query_server(servers[0], query, self.config.fallback_timeout)
                    .await
                {
                    Ok(response) => {
                        self.accept_rcode(&response)?;
                        Ok((response, start.elapsed()))
                    }
                    Err(_) => Err(race_error),
                }
            }
        }
    }

    async fn race(
        &self,
        servers: &[SocketAddr],
        query: &Message,
        start: Instant,
    ) -> Result<Message> {
        // Results funnel through a channel bounded by the racer count.
        let (tx, mut rx) = mpsc::channel::<(SocketAddr, Result<Message>)>(servers.len());
        let deadline = tokio::time::Instant::now() + self.config.fast_timeout;

        let mut handles = Vec::with_capacity(servers.len());
        for &server in servers {
            let tx = tx.clone();
            let query = query.clone();
            let udp_timeout = self.config.udp_timeout;
            let recv_size = recv_buffer_size(&query);

            handles.push(tokio::spawn(async move {
                let result = exchange_once(server, &query, udp_timeout, recv_size).await;
                let _ = tx.send((server, result)).await;
            }));
        }
        drop(tx);

        let mut last_error: Option<ResolverError> = None;
        let mut outcome = Err(ResolverError::Timeout);

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((server, Ok(response)))) => {
                    // Truncated answers are retransmitted over TCP to the
                    // same server, even if that overruns the fast window.
                    let response = if response.truncated() {
                        self.stats.tcp_retries.fetch_add(1, Ordering::Relaxed);
                        trace!(server = %server, "response truncated, retrying over TCP");
                        match exchange_tcp(server, query, self.config.fallback_timeout).await {
                            Ok(full) => full,
                            Err(e) => {
                                last_error = Some(e);
                                continue;
                            }
                        }
                    } else {
                        response
                    };

                    match self.accept_rcode(&response) {
                        Ok(()) => {
                            self.record_latency(server, start.elapsed());
                            outcome = Ok(response);
                            break;
                        }
                        Err(e) => {
                            trace!(server = %server, error = %e, "racer returned unusable rcode");
                            last_error = Some(e);
                        }
                    }
                }
                Ok(Some((server, Err(e)))) => {
                    if matches!(e, ResolverError::Timeout) {
                        self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    trace!(server = %server, error = %e, "racer failed");
                    last_error = Some(e);
                }
                Ok(None) => {
                    // Every racer reported in with nothing usable.
                    outcome = Err(last_error.take().unwrap_or(ResolverError::Timeout));
                    break;
                }
                Err(_) => {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    outcome = Err(last_error.take().unwrap_or(ResolverError::Timeout));
                    break;
                }
            }
        }

        // Best-effort cancellation of the losing racers.
        for handle in handles {
            handle.abort();
        }

        outcome
    }

    /// One exchange against one server with the given overall timeout:
    /// UDP first, TCP on truncation.
    async fn query_server(
        &self,
        server: SocketAddr,
        query: &Message,
        exchange_timeout: Duration,
    ) -> Result<Message> {
        let response =
            exchange_once(server, query, exchange_timeout, recv_buffer_size(query)).await?;

        if response.truncated() {
            self.stats.tcp_retries.fetch_add(1, Ordering::Relaxed);
            return exchange_tcp(server, query, exchange_timeout).await;
        }

        Ok(response)
    }

    fn accept_rcode(&self, response: &Message) -> Result<()> {
        match response.response_code() {
            ResponseCode::NoError | ResponseCode::NXDomain => Ok(()),
            ResponseCode::ServFail => Err(ResolverError::ServFail),
            other => Err(ResolverError::Protocol(format!("rcode {other}"))),
        }
    }

    /// Probes every server with a `. NS` query and records wall-clock
    /// round-trip times.
    pub async fn measure_latency(
        &self,
        servers: &[SocketAddr],
    ) -> HashMap<SocketAddr, Duration> {
        use hickory_proto::op::Query;
        use hickory_proto::rr::{Name, RecordType};

        let mut probe = Message::new();
        probe.set_id(rand::random());
        probe.add_query(Query::query(Name::root(), RecordType::NS));

        let probes = servers.iter().map(|&server| {
            let probe = probe.clone();
            let probe_timeout = self.config.probe_timeout;
            async move {
                let start = Instant::now();
                let result = exchange_once(server, &probe, probe_timeout, 512).await;
                (server, result.map(|_| start.elapsed()))
            }
        });

        let mut measured = HashMap::new();
        for (server, result) in futures::future::join_all(probes).await {
            if let Ok(rtt) = result {
                self.record_latency(server, rtt);
                measured.insert(server, rtt);
            }
        }
        measured
    }

    /// Returns up to `max` servers whose measured RTT is under the
    /// selectable ceiling, fastest first.
    pub async fn select_best(&self, servers: &[SocketAddr], max: usize) -> Vec<SocketAddr> {
        let measured = self.measure_latency(servers).await;

        let mut ranked: Vec<(SocketAddr, Duration)> = servers
            .iter()
            .filter_map(|server| measured.get(server).map(|rtt| (*server, *rtt)))
            .filter(|(_, rtt)| *rtt < self.config.max_selectable_latency)
            .collect();
        ranked.sort_by_key(|(_, rtt)| *rtt);

        ranked.into_iter().take(max).map(|(server, _)| server).collect()
    }

    fn record_latency(&self, server: SocketAddr, rtt: Duration) {
        let mut table = self.latency.write();
        let entry = table.entry(server).or_insert(rtt);
        // Exponential moving average, weighted 7:1 toward history.
        *entry = (*entry * 7 + rtt) / 8;
    }

    /// The last recorded EWMA latency for a server, if any.
    pub fn known_latency(&self, server: &SocketAddr) -> Option<Duration> {
        self.latency.read().get(server).copied()
    }
}

impl Default for NameserverPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[async_trait]
impl Exchanger for NameserverPool {
    async fn exchange(
        &self,
        servers: &[SocketAddr],
        query: &Message,
    ) -> Result<(Message, Duration)> {
        NameserverPool::exchange(self, servers, query).await
    }

    async fn select_servers(&self, servers: &[SocketAddr], max: usize) -> Vec<SocketAddr> {
        let best = self.select_best(servers, max).await;
        if best.is_empty() {
            // Nothing measured under the ceiling; racing unranked servers
            // still beats failing the request.
            servers.iter().take(max).copied().collect()
        } else {
            best
        }
    }
}

// ============================================================================
// Transport primitives
// ============================================================================

/// The UDP receive buffer follows the advertised EDNS payload: 512 bytes
/// classic, 4096 when the DO bit asks for DNSSEC-sized answers.
fn recv_buffer_size(query: &Message) -> usize {
    if wire::is_do_set(query) {
        4096
    } else {
        usize::from(wire::edns_payload_size(query))
    }
}

async fn exchange_once(
    server: SocketAddr,
    query: &Message,
    exchange_timeout: Duration,
    recv_size: usize,
) -> Result<Message> {
    match timeout(exchange_timeout, exchange_udp(server, query, recv_size)).await {
        Ok(result) => result,
        Err(_) => Err(ResolverError::Timeout),
    }
}

async fn exchange_udp(server: SocketAddr, query: &Message, recv_size: usize) -> Result<Message> {
    let bind_addr: SocketAddr = if server.is_ipv6() {
        "[::]:0".parse().expect("valid wildcard address")
    } else {
        "0.0.0.0:0".parse().expect("valid wildcard address")
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server).await?;

    let wire_bytes = query
        .to_vec()
        .map_err(|e| ResolverError::Protocol(e.to_string()))?;
    socket.send(&wire_bytes).await?;

    let mut buf = vec![0u8; recv_size.max(512)];
    loop {
        let len = socket.recv(&mut buf).await?;
        let response = match Message::from_vec(&buf[..len]) {
            Ok(message) => message,
            Err(e) => return Err(ResolverError::Protocol(e.to_string())),
        };

        if !response_matches(query, &response) {
            // Mismatched id or question: spoofed or stale datagram; keep
            // listening until the timeout fires.
            warn!(server = %server, "dropping response with mismatched id/question");
            continue;
        }

        return Ok(response);
    }
}

async fn exchange_tcp(
    server: SocketAddr,
    query: &Message,
    exchange_timeout: Duration,
) -> Result<Message> {
    let mut stream = timeout(exchange_timeout, TcpStream::connect(server))
        .await
        .map_err(|_| ResolverError::Timeout)??;

    let wire_bytes = query
        .to_vec()
        .map_err(|e| ResolverError::Protocol(e.to_string()))?;

    let len = wire_bytes.len() as u16;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&wire_bytes).await?;

    let mut len_buf = [0u8; 2];
    timeout(exchange_timeout, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| ResolverError::Timeout)??;

    let response_len = usize::from(u16::from_be_bytes(len_buf));
    let mut response_buf = vec![0u8; response_len];
    timeout(exchange_timeout, stream.read_exact(&mut response_buf))
        .await
        .map_err(|_| ResolverError::Timeout)??;

    let response = Message::from_vec(&response_buf)
        .map_err(|e| ResolverError::Protocol(e.to_string()))?;

    if !response_matches(query, &response) {
        return Err(ResolverError::Protocol(
            "TCP response does not match query".to_string(),
        ));
    }

    Ok(response)
}

/// A response is only acceptable when its id and question echo the query.
fn response_matches(query: &Message, response: &Message) -> bool {
    if query.id() != response.id() {
        return false;
    }

    match (query.queries().first(), response.queries().first()) {
        (Some(q), Some(r)) => {
            q.name().to_lowercase() == r.name().to_lowercase()
                && q.query_type() == r.query_type()
                && q.query_class() == r.query_class()
        }
        (None, _) => true,
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn query(name: &str) -> Message {
        let mut message = Message::new();
        message.set_id(0x5577);
        message.add_query(Query::query(
            Name::from_str(name).unwrap(),
            RecordType::A,
        ));
        message
    }

    #[test]
    fn response_must_echo_id_and_question() {
        let q = query("example.com.");

        let mut ok = q.clone();
        ok.set_message_type(MessageType::Response);
        assert!(response_matches(&q, &ok));

        let mut bad_id = ok.clone();
        bad_id.set_id(0x1111);
        assert!(!response_matches(&q, &bad_id));

        let mut bad_question = Message::new();
        bad_question.set_id(0x5577);
        bad_question.add_query(Query::query(
            Name::from_str("other.com.").unwrap(),
            RecordType::A,
        ));
        assert!(!response_matches(&q, &bad_question));
    }

    #[test]
    fn case_variant_question_still_matches() {
        let q = query("example.com.");
        let mut response = Message::new();
        response.set_id(0x5577);
        response.add_query(Query::query(
            Name::from_str("EXAMPLE.COM.").unwrap(),
            RecordType::A,
        ));
        assert!(response_matches(&q, &response));
    }

    #[test]
    fn recv_buffer_follows_do_bit() {
        let mut q = query("example.com.");
        assert_eq!(recv_buffer_size(&q), 512);

        wire::set_edns(&mut q, 4096, true);
        assert_eq!(recv_buffer_size(&q), 4096);
    }

    #[tokio::test]
    async fn empty_server_list_is_rejected() {
        let pool = NameserverPool::default();
        let err = pool.exchange(&[], &query("example.com.")).await.unwrap_err();
        assert!(matches!(err, ResolverError::NoNameserversAvailable));
    }

    #[tokio::test]
    async fn race_against_unroutable_servers_times_out() {
        // 192.0.2.0/24 is TEST-NET-1; nothing answers there.
        let pool = NameserverPool::new(PoolConfig {
            fast_timeout: Duration::from_millis(20),
            udp_timeout: Duration::from_millis(15),
            fallback_timeout: Duration::from_millis(20),
            ..PoolConfig::default()
        });

        let servers: Vec<SocketAddr> =
            vec!["192.0.2.1:53".parse().unwrap(), "192.0.2.2:53".parse().unwrap()];

        let err = pool
            .exchange(&servers, &query("example.com."))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolverError::Timeout | ResolverError::Network(_)
        ));
        assert_eq!(pool.stats().fallbacks, 1);
    }

    #[test]
    fn latency_ewma_converges() {
        let pool = NameserverPool::default();
        let server: SocketAddr = "192.0.2.1:53".parse().unwrap();

        pool.record_latency(server, Duration::from_millis(80));
        pool.record_latency(server, Duration::from_millis(8));

        let ewma = pool.known_latency(&server).unwrap();
        assert!(ewma < Duration::from_millis(80));
        assert!(ewma > Duration::from_millis(8));
    }
}
