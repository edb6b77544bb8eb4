//! # Taproot DNS Resolver
//!
//! Recursive DNS resolution from the root servers down.
//!
//! ## Features
//!
//! - **Nameserver racing**: every candidate server is queried
//!   concurrently; the first usable response wins and siblings are
//!   cancelled best-effort.
//! - **Delegation walking** with referral bailiwick checks, lame-referral
//!   rotation, loop detection, and a per-request query budget shared with
//!   nested glue resolutions.
//! - **CNAME chasing** with concurrent per-target resolution and
//!   response splicing.
//! - **DNSSEC integration**: delegation responses are fed to the
//!   taproot-dnssec authenticator in walk order.
//! - **IPv6 capability probing**: v6 root addresses are only used once
//!   connectivity has actually been observed.

use async_trait::async_trait;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

mod cname;
pub mod hints;
pub mod ipv6;
pub mod pool;
pub mod walker;
pub mod wire;

pub use hints::root_server_addrs;
pub use ipv6::ipv6_available;
pub use pool::{NameserverPool, PoolConfig, PoolStatsSnapshot};
pub use walker::{DelegationWalker, Resolution, WalkerConfig};

/// Resolver error.
#[derive(Error, Debug)]
pub enum ResolverError {
    /// The request deadline elapsed.
    #[error("timeout")]
    Timeout,

    /// No nameserver addresses were available to query.
    #[error("no nameservers available")]
    NoNameserversAvailable,

    /// Every raced nameserver failed.
    #[error("all nameservers failed: {0}")]
    AllNameserversFailed(String),

    /// The per-request query budget was exhausted.
    #[error("query budget exceeded")]
    QueryBudgetExceeded,

    /// The same (zone, server) pair was visited twice.
    #[error("resolution loop detected at zone {zone}")]
    ResolutionLoop {
        /// The zone where the walk started repeating itself.
        zone: String,
    },

    /// Every CNAME branch failed to resolve.
    #[error("all cname resolutions failed: {0}")]
    AllCnameFailed(String),

    /// An upstream answered SERVFAIL.
    #[error("SERVFAIL from upstream")]
    ServFail,

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Malformed or unexpected response data.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type for resolver operations.
pub type Result<T> = std::result::Result<T, ResolverError>;

/// Capability interface over "send this query to these servers".
///
/// The standard implementation is the racing [`NameserverPool`]; tests
/// substitute scripted doubles.
#[async_trait]
pub trait Exchanger: Send + Sync {
    /// Sends `query` to the given servers and returns the first usable
    /// response together with the elapsed round-trip time.
    async fn exchange(&self, servers: &[SocketAddr], query: &Message)
        -> Result<(Message, Duration)>;

    /// Ranks `servers` and returns up to `max` of them, best first.
    ///
    /// The default implementation applies no ranking.
    async fn select_servers(&self, servers: &[SocketAddr], max: usize) -> Vec<SocketAddr> {
        servers.iter().take(max).copied().collect()
    }
}
