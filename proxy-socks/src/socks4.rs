//! SOCKSv4 and SOCKSv4A request/reply codec (spec.md §6 "The server
//! consumes SOCKSv4, SOCKSv4A ... client protocols").
//!
//! SOCKSv4 has no method negotiation stage: the request itself carries the
//! (optional) `userid` field the client-rule engine may bind against. It has
//! no BLOCK/error taxonomy beyond "granted"/"rejected", so `Socks4Reply`
//! only distinguishes those two plus the two legacy ident-related codes
//! real SOCKSv4 servers occasionally emit.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use proxy_io::{AsyncFixedReadExt, TargetAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Kind;
use crate::{io_err, validate};

pub const SOCKS4_VERSION: u8 = 0x04;

pub const CD_CONNECT: u8 = 0x01;
pub const CD_BIND: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks4Command {
    Connect,
    Bind,
}

impl Socks4Command {
    fn from_u8(code: u8) -> Option<Self> {
        match code {
            CD_CONNECT => Some(Socks4Command::Connect),
            CD_BIND => Some(Socks4Command::Bind),
            _ => None,
        }
    }

    fn as_u8(&self) -> u8 {
        match self {
            Socks4Command::Connect => CD_CONNECT,
            Socks4Command::Bind => CD_BIND,
        }
    }
}

/// A decoded SOCKSv4/4A request.
///
/// +----+----+----+----+----+----+----+----+----+----+....+----+
/// | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
/// +----+----+----+----+----+----+----+----+----+----+....+----+
///
/// SOCKSv4A is distinguished by `DSTIP` being `0.0.0.x` with `x != 0`: the
/// real destination follows the (NUL-terminated) `USERID` as a hostname.
#[derive(Debug, Clone)]
pub struct Socks4Request {
    pub command: Socks4Command,
    pub userid: String,
    pub target: TargetAddr,
}

impl Socks4Request {
    pub fn is_connect(&self) -> bool {
        matches!(self.command, Socks4Command::Connect)
    }

    pub async fn read<S: AsyncRead + Unpin>(socket: &mut S) -> io::Result<Self> {
        let version = socket.read_u8().await?;
        validate!(version == SOCKS4_VERSION, Kind::InvalidVersion)?;
        let cd = socket.read_u8().await?;
        let command = Socks4Command::from_u8(cd).ok_or_else(|| io_err!(Kind::CommandNotSupported))?;
        let port = socket.read_u16().await?;
        let mut ip = [0u8; 4];
        socket.read_exact(&mut ip).await?;
        let mut userid = String::new();
        read_nul_terminated(socket, &mut userid).await?;

        // SOCKSv4A: 0.0.0.x with x != 0 means "resolve this hostname", which
        // follows the userid as a second NUL-terminated string.
        let is_socks4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;
        let target = if is_socks4a {
            let mut host = String::new();
            read_nul_terminated(socket, &mut host).await?;
            TargetAddr::Domain(host, port)
        } else {
            TargetAddr::SocketAddr(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
        };

        Ok(Self {
            command,
            userid,
            target,
        })
    }

    pub async fn write<S: AsyncWrite + Unpin>(&self, socket: &mut S) -> io::Result<()> {
        socket.write_u8(SOCKS4_VERSION).await?;
        socket.write_u8(self.command.as_u8()).await?;
        match &self.target {
            TargetAddr::SocketAddr(SocketAddr::V4(v4)) => {
                socket.write_u16(v4.port()).await?;
                socket.write_all(&v4.ip().octets()).await?;
                socket.write_all(self.userid.as_bytes()).await?;
                socket.write_u8(0).await?;
            }
            TargetAddr::SocketAddr(SocketAddr::V6(_)) => {
                return Err(io_err!(Kind::AddressTypeNotSupported));
            }
            TargetAddr::Domain(domain, port) => {
                socket.write_u16(*port).await?;
                socket.write_all(&[0, 0, 0, 1]).await?;
                socket.write_all(self.userid.as_bytes()).await?;
                socket.write_u8(0).await?;
                socket.write_all(domain.as_bytes()).await?;
                socket.write_u8(0).await?;
            }
        }
        Ok(())
    }
}

/// SOCKSv4 reply codes (the four legacy values; SOCKSv4 has no rich error
/// taxonomy, spec.md §7 maps `RuleBlocked`/`AuthFailure` onto `Rejected`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks4Status {
    Granted,
    Rejected,
    IdentdUnreachable,
    IdentdMismatch,
}

impl Socks4Status {
    fn as_u8(&self) -> u8 {
        match self {
            Socks4Status::Granted => 0x5a,
            Socks4Status::Rejected => 0x5b,
            Socks4Status::IdentdUnreachable => 0x5c,
            Socks4Status::IdentdMismatch => 0x5d,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Socks4Reply {
    pub status: Socks4Status,
    pub bound: SocketAddrV4,
}

impl Socks4Reply {
    pub fn new(status: Socks4Status, bound: SocketAddrV4) -> Self {
        Self { status, bound }
    }

    pub async fn write<S: AsyncWrite + Unpin>(&self, socket: &mut S) -> io::Result<()> {
        socket.write_u8(0x00).await?;
        socket.write_u8(self.status.as_u8()).await?;
        socket.write_u16(self.bound.port()).await?;
        socket.write_all(&self.bound.ip().octets()).await
    }
}

async fn read_nul_terminated<S: AsyncRead + Unpin>(
    socket: &mut S,
    dst: &mut String,
) -> io::Result<()> {
    let mut bytes = Vec::new();
    loop {
        let b = socket.read_u8().await?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    *dst = String::from_utf8(bytes).map_err(|_| io_err!(Kind::InvalidVersion))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_io::test_bytes;

    #[tokio::test]
    async fn connect_request_round_trips_through_wire_bytes() {
        let original = Socks4Request {
            command: Socks4Command::Connect,
            userid: "alice".to_string(),
            target: TargetAddr::SocketAddr(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(10, 0, 0, 1),
                8080,
            ))),
        };
        let mut io = test_bytes();
        original.write(&mut io).await.unwrap();
        let decoded = Socks4Request::read(&mut io).await.unwrap();
        assert_eq!(decoded.userid, "alice");
        assert!(decoded.is_connect());
    }

    #[tokio::test]
    async fn socks4a_request_carries_hostname_after_userid() {
        let original = Socks4Request {
            command: Socks4Command::Connect,
            userid: String::new(),
            target: TargetAddr::Domain("example.com".to_string(), 443),
        };
        let mut io = test_bytes();
        original.write(&mut io).await.unwrap();
        let decoded = Socks4Request::read(&mut io).await.unwrap();
        match decoded.target {
            TargetAddr::Domain(host, port) => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 443);
            }
            other => panic!("expected a domain target, got {:?}", other),
        }
    }
}
