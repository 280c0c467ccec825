use std::fmt;
use std::net::Ipv4Addr;

use proxy_io::{HostAddr, SocksHost};
use serde::{Deserialize, Serialize};

/// Protocol a rule, request, or port predicate applies to (spec.md §3
/// `ConnectionState.protocol`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// A tagged address as a rule author writes it (spec.md §3 "RuleAddr").
///
/// `NotSet` never matches anything; `IfName` must be resolved to `Ipv4`
/// by the rule loader (see [`crate::base::add_rule`]) before the rule
/// base is used — the engine itself never sees an unresolved `IfName`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAddr {
    NotSet,
    Ipv4 { addr: Ipv4Addr, mask: Ipv4Addr },
    Domain(String),
    IfName(String),
}

impl Default for RuleAddr {
    fn default() -> Self {
        RuleAddr::NotSet
    }
}

impl fmt::Display for RuleAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAddr::NotSet => f.write_str("0.0.0.0/0"),
            RuleAddr::Ipv4 { addr, mask } => write!(f, "{}/{}", addr, mask),
            RuleAddr::Domain(d) => f.write_str(d),
            RuleAddr::IfName(i) => write!(f, "%{}", i),
        }
    }
}

/// Port-match operator (spec.md §3 `Port.op`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortOp {
    None,
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Range,
}

impl Default for PortOp {
    fn default() -> Self {
        PortOp::None
    }
}

/// Carries both protocols' port values plus the operator that relates
/// them to a request's actual port (spec.md §3 "Port", §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Port {
    pub tcp: u16,
    pub udp: u16,
    pub op: PortOp,
    pub end: u16,
}

impl Port {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn eq_both(port: u16) -> Self {
        Self {
            tcp: port,
            udp: port,
            op: PortOp::Eq,
            end: 0,
        }
    }

    fn base(&self, protocol: Protocol) -> u16 {
        match protocol {
            Protocol::Tcp => self.tcp,
            Protocol::Udp => self.udp,
        }
    }

    /// Applies the operator using `protocol`'s port field against `value`
    /// (spec.md §4.1 "Port operator is applied using the protocol's port
    /// field"). A `Range` with `start > end` never matches (spec.md §8
    /// boundary behavior).
    pub fn matches(&self, protocol: Protocol, value: u16) -> bool {
        let base = self.base(protocol);
        match self.op {
            PortOp::None => true,
            PortOp::Eq => value == base,
            PortOp::Ne => value != base,
            PortOp::Ge => value >= base,
            PortOp::Le => value <= base,
            PortOp::Gt => value > base,
            PortOp::Lt => value < base,
            PortOp::Range => base <= self.end && value >= base && value <= self.end,
        }
    }
}

/// A rule's address predicate: tagged address plus the port operator
/// that applies to it. This is the concrete type of `Rule::src`,
/// `Rule::dst`, `Rule::rdr_from`, and `Rule::rdr_to` (spec.md §3 "Rule").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: RuleAddr,
    pub port: Port,
}

impl Endpoint {
    pub fn new(addr: RuleAddr, port: Port) -> Self {
        Self { addr, port }
    }

    pub fn any() -> Self {
        Self {
            addr: RuleAddr::NotSet,
            port: Port::any(),
        }
    }

    /// The single concrete address this endpoint names, if it names
    /// exactly one (spec.md GLOSSARY "Bounce-to": "the fixed destination
    /// of a non-negotiating UDP forwarder"). `None` for anything wider
    /// than a /32 IPv4 address with an exact port.
    pub fn fixed_socket_addr(&self) -> Option<std::net::SocketAddr> {
        let RuleAddr::Ipv4 { addr, mask } = &self.addr else {
            return None;
        };
        if *mask != Ipv4Addr::new(255, 255, 255, 255) || self.port.op != PortOp::Eq {
            return None;
        }
        Some(std::net::SocketAddr::new(std::net::IpAddr::V4(*addr), self.port.tcp))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Resolves an `Endpoint` against a concrete `SocksHost` (spec.md §4.1
/// "addrmatch"). `alias` opts into resolver-backed alias expansion when
/// comparing a `Domain` rule against an IPv4 host; the rule engine
/// always calls this with `alias = false` (spec.md §9 open question —
/// behavior-compatible with the known source deficiency), leaving the
/// flag for callers who want to opt in.
pub fn addrmatch(
    endpoint: &Endpoint,
    host: &SocksHost,
    protocol: Protocol,
    alias: bool,
    resolved_aliases: &[Ipv4Addr],
) -> bool {
    if !endpoint.port.matches(protocol, host.port) {
        return false;
    }

    match (&endpoint.addr, &host.addr) {
        (RuleAddr::NotSet, _) => false,
        (RuleAddr::IfName(_), _) => false, // must have been resolved before this is called
        (RuleAddr::Ipv4 { addr, mask }, HostAddr::V4(hostaddr)) => {
            ipv4_masked_eq(*addr, *mask, *hostaddr)
        }
        (RuleAddr::Ipv4 { .. }, HostAddr::V6(_)) => false,
        (RuleAddr::Ipv4 { addr, mask }, HostAddr::Domain(_)) => {
            // Only reachable when the caller already resolved `host` to one
            // of `resolved_aliases` and opted into alias matching.
            alias && resolved_aliases.iter().any(|a| ipv4_masked_eq(*addr, *mask, *a))
        }
        (RuleAddr::Domain(d), HostAddr::Domain(hd)) => d.eq_ignore_ascii_case(hd),
        (RuleAddr::Domain(_), HostAddr::V4(hostaddr)) => {
            alias && resolved_aliases.contains(hostaddr)
        }
        (RuleAddr::Domain(_), HostAddr::V6(_)) => false,
    }
}

fn ipv4_masked_eq(rule_addr: Ipv4Addr, mask: Ipv4Addr, host_addr: Ipv4Addr) -> bool {
    let m = u32::from(mask);
    u32::from(rule_addr) & m == u32::from(host_addr) & m
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_io::HostAddr;

    fn host_v4(a: [u8; 4], port: u16) -> SocksHost {
        SocksHost::new(HostAddr::V4(Ipv4Addr::new(a[0], a[1], a[2], a[3])), port)
    }

    #[test]
    fn port_range_start_greater_than_end_never_matches() {
        let port = Port {
            tcp: 100,
            udp: 0,
            op: PortOp::Range,
            end: 50,
        };
        assert!(!port.matches(Protocol::Tcp, 75));
        assert!(!port.matches(Protocol::Tcp, 100));
        assert!(!port.matches(Protocol::Tcp, 50));
    }

    #[test]
    fn netmask_zero_matches_any_ipv4() {
        let endpoint = Endpoint::new(
            RuleAddr::Ipv4 {
                addr: Ipv4Addr::new(10, 0, 0, 0),
                mask: Ipv4Addr::new(0, 0, 0, 0),
            },
            Port::any(),
        );
        assert!(addrmatch(
            &endpoint,
            &host_v4([203, 0, 113, 7], 80),
            Protocol::Tcp,
            false,
            &[]
        ));
    }

    #[test]
    fn netmask_all_ones_requires_exact_address() {
        let endpoint = Endpoint::new(
            RuleAddr::Ipv4 {
                addr: Ipv4Addr::new(10, 0, 0, 1),
                mask: Ipv4Addr::new(255, 255, 255, 255),
            },
            Port::any(),
        );
        assert!(addrmatch(
            &endpoint,
            &host_v4([10, 0, 0, 1], 80),
            Protocol::Tcp,
            false,
            &[]
        ));
        assert!(!addrmatch(
            &endpoint,
            &host_v4([10, 0, 0, 2], 80),
            Protocol::Tcp,
            false,
            &[]
        ));
    }

    #[test]
    fn domain_rule_does_not_match_ipv4_host_without_alias_flag() {
        let endpoint = Endpoint::new(RuleAddr::Domain("example.com".into()), Port::any());
        let resolved = vec![Ipv4Addr::new(93, 184, 216, 34)];
        assert!(!addrmatch(
            &endpoint,
            &host_v4([93, 184, 216, 34], 443),
            Protocol::Tcp,
            false,
            &resolved
        ));
        assert!(addrmatch(
            &endpoint,
            &host_v4([93, 184, 216, 34], 443),
            Protocol::Tcp,
            true,
            &resolved
        ));
    }

    #[test]
    fn fixed_socket_addr_requires_a_single_host_and_exact_port() {
        let fixed = Endpoint::new(
            RuleAddr::Ipv4 {
                addr: Ipv4Addr::new(203, 0, 113, 1),
                mask: Ipv4Addr::new(255, 255, 255, 255),
            },
            Port::eq_both(9100),
        );
        assert_eq!(
            fixed.fixed_socket_addr(),
            Some(std::net::SocketAddr::new(
                std::net::IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)),
                9100
            ))
        );
        assert_eq!(Endpoint::any().fixed_socket_addr(), None);
    }

    #[test]
    fn not_set_never_matches() {
        let endpoint = Endpoint::any();
        assert!(!addrmatch(
            &endpoint,
            &host_v4([1, 2, 3, 4], 1),
            Protocol::Tcp,
            false,
            &[]
        ));
    }
}
