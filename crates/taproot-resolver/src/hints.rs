//! Root server hints.
//!
//! The thirteen IANA root servers seed every delegation walk. IPv4
//! addresses are always offered; IPv6 addresses join only once the
//! capability probe has confirmed v6 connectivity.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::ipv6::ipv6_available;

/// A root server entry.
#[derive(Debug, Clone)]
pub struct RootServer {
    /// Hostname of the root server.
    pub name: &'static str,
    /// IPv4 address.
    pub ipv4: &'static str,
    /// IPv6 address.
    pub ipv6: &'static str,
}

/// IANA root servers.
pub static ROOT_HINTS: &[RootServer] = &[
    RootServer { name: "a.root-servers.net", ipv4: "198.41.0.4", ipv6: "2001:503:ba3e::2:30" },
    RootServer { name: "b.root-servers.net", ipv4: "199.9.14.201", ipv6: "2001:500:200::b" },
    RootServer { name: "c.root-servers.net", ipv4: "192.33.4.12", ipv6: "2001:500:2::c" },
    RootServer { name: "d.root-servers.net", ipv4: "199.7.91.13", ipv6: "2001:500:2d::d" },
    RootServer { name: "e.root-servers.net", ipv4: "192.203.230.10", ipv6: "2001:500:a8::e" },
    RootServer { name: "f.root-servers.net", ipv4: "192.5.5.241", ipv6: "2001:500:2f::f" },
    RootServer { name: "g.root-servers.net", ipv4: "192.112.36.4", ipv6: "2001:500:12::d0d" },
    RootServer { name: "h.root-servers.net", ipv4: "198.97.190.53", ipv6: "2001:500:1::53" },
    RootServer { name: "i.root-servers.net", ipv4: "192.36.148.17", ipv6: "2001:7fe::53" },
    RootServer { name: "j.root-servers.net", ipv4: "192.58.128.30", ipv6: "2001:503:c27::2:30" },
    RootServer { name: "k.root-servers.net", ipv4: "193.0.14.129", ipv6: "2001:7fd::1" },
    RootServer { name: "l.root-servers.net", ipv4: "199.7.83.42", ipv6: "2001:500:9f::42" },
    RootServer { name: "m.root-servers.net", ipv4: "202.12.27.33", ipv6: "2001:dc3::35" },
];

/// Socket addresses for the root servers.
///
/// IPv4 first; IPv6 addresses appended only when the capability probe
/// has answered positively.
pub fn root_server_addrs() -> Vec<SocketAddr> {
    let include_v6 = ipv6_available();
    let mut addrs = Vec::with_capacity(if include_v6 { 26 } else { 13 });

    for server in ROOT_HINTS {
        if let Ok(v4) = server.ipv4.parse::<Ipv4Addr>() {
            addrs.push(SocketAddr::new(IpAddr::V4(v4), 53));
        }
    }

    if include_v6 {
        for server in ROOT_HINTS {
            if let Ok(v6) = server.ipv6.parse::<Ipv6Addr>() {
                addrs.push(SocketAddr::new(IpAddr::V6(v6), 53));
            }
        }
    }

    addrs
}
