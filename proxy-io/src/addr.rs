use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    vec,
};

use log::{debug, error};
use tokio::net::lookup_host;

#[derive(Debug, Clone)]
pub enum TargetAddr {
    SocketAddr(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::SocketAddr(addr) => addr.fmt(f),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl Default for TargetAddr {
    fn default() -> Self {
        TargetAddr::SocketAddr(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0))
    }
}

impl<'a> ToSocketAddrs for TargetAddr {
    type Iter = vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<Self::Iter> {
        match self {
            TargetAddr::SocketAddr(s) => Ok(vec![*s].into_iter()),
            TargetAddr::Domain(d, p) => (d.as_ref(), *p).to_socket_addrs(),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::SocketAddr(addr)
    }
}

impl TargetAddr {
    pub async fn resolve_dns(&self) -> io::Result<TargetAddr> {
        match self {
            TargetAddr::SocketAddr(addr) => Ok(TargetAddr::SocketAddr(*addr)),
            TargetAddr::Domain(d, p) => {
                debug!("resolve the ip for {}:{} with native dns", d, p);
                lookup_host((&d[..], *p))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        error!("unable to resolve dns for {}:{}", d, p);
                        io::ErrorKind::HostUnreachable.into()
                    })
                    .map(|addr| TargetAddr::SocketAddr(addr))
            }
        }
    }
}

/// The three-way address discriminant used at match time (spec.md §3
/// "SocksHost"): `atype` is explicit rather than folded into a
/// `SocketAddr`/`Domain` split, because the rule engine needs to tell
/// IPv4 and IPv6 apart (an IPv4-only `RuleAddr` never matches an IPv6
/// host) even though the wire codec and `TargetAddr` do not care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAtype {
    Ipv4,
    Ipv6,
    Domain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

/// Resolved endpoint used at rule-match time: `{ atype, addr, port }`
/// (spec.md §3). Unlike `RuleAddr`, which describes what a rule was
/// *authored* with, `SocksHost` describes what the engine actually has
/// in hand for a given connection (either side of it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksHost {
    pub addr: HostAddr,
    pub port: u16,
}

impl SocksHost {
    pub fn new(addr: HostAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn atype(&self) -> HostAtype {
        match &self.addr {
            HostAddr::V4(_) => HostAtype::Ipv4,
            HostAddr::V6(_) => HostAtype::Ipv6,
            HostAddr::Domain(_) => HostAtype::Domain,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match &self.addr {
            HostAddr::Domain(d) => Some(d.as_str()),
            _ => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match &self.addr {
            HostAddr::V4(v4) => Some(IpAddr::V4(*v4)),
            HostAddr::V6(v6) => Some(IpAddr::V6(*v6)),
            HostAddr::Domain(_) => None,
        }
    }
}

impl fmt::Display for SocksHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            HostAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
            HostAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
            HostAddr::Domain(d) => write!(f, "{}:{}", d, self.port),
        }
    }
}

impl From<SocketAddr> for SocksHost {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => SocksHost::new(HostAddr::V4(*v4.ip()), v4.port()),
            SocketAddr::V6(v6) => SocksHost::new(HostAddr::V6(*v6.ip()), v6.port()),
        }
    }
}

impl From<TargetAddr> for SocksHost {
    fn from(addr: TargetAddr) -> Self {
        match addr {
            TargetAddr::SocketAddr(s) => s.into(),
            TargetAddr::Domain(d, p) => SocksHost::new(HostAddr::Domain(d), p),
        }
    }
}

impl From<&TargetAddr> for SocksHost {
    fn from(addr: &TargetAddr) -> Self {
        addr.clone().into()
    }
}
