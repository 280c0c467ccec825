//! SOCKSv5 UDP datagram header (spec.md §6 "The IO path must preserve the
//! SOCKSv5 UDP header structure exactly").
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```
//!
//! Fragmentation (`FRAG != 0`) is accepted on the wire but the IO stage
//! does not reassemble fragments (spec.md §1 lists transparent protocol
//! extensions as out of scope); a non-zero `frag` is preserved through
//! encode/decode so callers can choose to drop or reassemble it.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use proxy_io::TargetAddr;

use crate::error::Kind;
use crate::io_err;
use crate::types::{DST_DOMAIN, DST_IPV4, DST_IPV6};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub frag: u8,
    pub dst: TargetAddr,
}

impl UdpHeader {
    pub fn new(dst: TargetAddr) -> Self {
        Self { frag: 0, dst }
    }

    /// Prepends the header to `data` and returns the full datagram.
    pub fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(10 + data.len());
        out.push(0);
        out.push(0);
        out.push(self.frag);
        match &self.dst {
            TargetAddr::SocketAddr(SocketAddr::V4(v4)) => {
                out.push(DST_IPV4);
                out.extend_from_slice(&v4.ip().octets());
                out.extend_from_slice(&v4.port().to_be_bytes());
            }
            TargetAddr::SocketAddr(SocketAddr::V6(v6)) => {
                out.push(DST_IPV6);
                out.extend_from_slice(&v6.ip().octets());
                out.extend_from_slice(&v6.port().to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                if domain.len() > u8::MAX as usize {
                    return Err(io_err!(Kind::AddressTypeNotSupported));
                }
                out.push(DST_DOMAIN);
                out.push(domain.len() as u8);
                out.extend_from_slice(domain.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
        out.extend_from_slice(data);
        Ok(out)
    }

    /// Splits a received datagram into its header and the trailing payload.
    pub fn decode(datagram: &[u8]) -> io::Result<(Self, &[u8])> {
        if datagram.len() < 4 {
            return Err(io_err!(Kind::UnknownRep));
        }
        let frag = datagram[2];
        let atyp = datagram[3];
        let mut cursor = 4usize;
        let dst = match atyp {
            DST_IPV4 => {
                if datagram.len() < cursor + 6 {
                    return Err(io_err!(Kind::UnknownRep));
                }
                let ip = Ipv4Addr::new(
                    datagram[cursor],
                    datagram[cursor + 1],
                    datagram[cursor + 2],
                    datagram[cursor + 3],
                );
                let port = u16::from_be_bytes([datagram[cursor + 4], datagram[cursor + 5]]);
                cursor += 6;
                TargetAddr::SocketAddr(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            DST_IPV6 => {
                if datagram.len() < cursor + 18 {
                    return Err(io_err!(Kind::UnknownRep));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&datagram[cursor..cursor + 16]);
                let port =
                    u16::from_be_bytes([datagram[cursor + 16], datagram[cursor + 17]]);
                cursor += 18;
                TargetAddr::SocketAddr(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    0,
                    0,
                )))
            }
            DST_DOMAIN => {
                if datagram.len() < cursor + 1 {
                    return Err(io_err!(Kind::UnknownRep));
                }
                let len = datagram[cursor] as usize;
                cursor += 1;
                if datagram.len() < cursor + len + 2 {
                    return Err(io_err!(Kind::UnknownRep));
                }
                let domain = String::from_utf8(datagram[cursor..cursor + len].to_vec())
                    .map_err(|_| io_err!(Kind::AddressTypeNotSupported))?;
                cursor += len;
                let port = u16::from_be_bytes([datagram[cursor], datagram[cursor + 1]]);
                cursor += 2;
                TargetAddr::Domain(domain, port)
            }
            _ => return Err(io_err!(Kind::AddressTypeNotSupported)),
        };
        Ok((UdpHeader { frag, dst }, &datagram[cursor..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_datagram_round_trips() {
        let header = UdpHeader::new(TargetAddr::SocketAddr(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(198, 51, 100, 4),
            53,
        ))));
        let encoded = header.encode(b"payload").unwrap();
        let (decoded, payload) = UdpHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn ipv6_datagram_round_trips() {
        let header = UdpHeader::new(TargetAddr::SocketAddr(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::LOCALHOST,
            443,
            0,
            0,
        ))));
        let encoded = header.encode(b"abc").unwrap();
        let (decoded, payload) = UdpHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn domain_datagram_round_trips() {
        let header = UdpHeader::new(TargetAddr::Domain("example.com".to_string(), 80));
        let encoded = header.encode(b"hello").unwrap();
        let (decoded, payload) = UdpHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        let short = [0u8, 0, 0, DST_IPV4, 1, 2];
        assert!(UdpHeader::decode(&short).is_err());
    }
}
