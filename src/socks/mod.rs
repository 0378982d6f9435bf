//! SOCKS5 wire support.
//!
//! The address record is shared by the TCP handshake replies and the UDP
//! relay framing:
//!
//! ```text
//! +------+----------------------+------+
//! | ATYP | ADDR                 | PORT |
//! +------+----------------------+------+
//! | 0x01 | 4 bytes              | u16  |
//! | 0x03 | len (u8) + len bytes | u16  |
//! | 0x04 | 16 bytes             | u16  |
//! +------+----------------------+------+
//! ```
//!
//! Ports are big-endian.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use bytes::{Buf, BufMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

mod handshake;
mod udp;

pub use self::handshake::{associate, connect, Auth};
pub use self::udp::{decode_datagram, encode_datagram, UdpRelay, MAX_UDP_PACKET};

pub(crate) const VERSION: u8 = 0x05;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// The longest domain name an address record can carry.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Errors from encoding, decoding or negotiating SOCKS5.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SocksError {
    /// Domain names are length-prefixed with a single byte.
    #[error("domain name is {0} bytes, the limit is 255")]
    HostTooLong(usize),

    /// Unknown address type byte.
    #[error("invalid address type: {0:#04x}")]
    InvalidAddressType(u8),

    /// The record ended before the address was complete.
    #[error("truncated address record")]
    Truncated,

    /// Domain name bytes are not valid UTF-8.
    #[error("domain name is not valid utf-8")]
    InvalidDomain,

    /// A relayed datagram was too short or carried a fragment number.
    #[error("bad datagram header")]
    BadHeader,

    /// The proxy replied with a different protocol version.
    #[error("unexpected socks version: {0:#04x}")]
    Version(u8),

    /// The proxy accepted none of the offered authentication methods.
    #[error("no acceptable authentication method")]
    NoAcceptableAuth,

    /// The proxy selected a method that was not offered.
    #[error("proxy selected unoffered authentication method {0:#04x}")]
    MethodMismatch(u8),

    /// The proxy rejected the username and password.
    #[error("authentication failed")]
    AuthFailed,

    /// Username and password are limited to 255 bytes each.
    #[error("credentials too long")]
    CredentialsTooLong,

    /// The proxy refused the command.
    #[error("proxy replied: {0}")]
    Reply(Reply),

    /// I/O error on the underlying stream or socket.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Non-success reply codes from a SOCKS5 proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply(pub u8);

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self.0 {
            0x01 => "general failure",
            0x02 => "connection not allowed by ruleset",
            0x03 => "network unreachable",
            0x04 => "host unreachable",
            0x05 => "connection refused",
            0x06 => "ttl expired",
            0x07 => "command not supported",
            0x08 => "address type not supported",
            _ => "unknown reply",
        };
        write!(f, "{message} ({:#04x})", self.0)
    }
}

/// A SOCKS5 destination address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// An IPv4 or IPv6 socket address.
    Ip(SocketAddr),

    /// A domain name and port, resolved by the proxy.
    Domain(String, u16),
}

impl Address {
    /// Create an address from a host (IP literal or name) and port.
    pub fn new(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_owned(), port),
        }
    }

    /// The port of this address.
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// The host portion, without the port.
    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(name, _) => name.clone(),
        }
    }

    /// Number of bytes this address occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(name, _) => 1 + 1 + name.len() + 2,
        }
    }

    /// Append the wire form of this address to `buf`.
    ///
    /// Nothing is written if the address cannot be encoded.
    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<(), SocksError> {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Domain(name, _) => {
                let len = u8::try_from(name.len()).map_err(|_| SocksError::HostTooLong(name.len()))?;
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(len);
                buf.put_slice(name.as_bytes());
            }
        }
        buf.put_u16(self.port());
        Ok(())
    }

    /// Decode an address record from the front of `buf`.
    pub fn read_from<B: Buf>(buf: &mut B) -> Result<Self, SocksError> {
        if !buf.has_remaining() {
            return Err(SocksError::Truncated);
        }

        let address = match buf.get_u8() {
            ATYP_IPV4 => {
                ensure(buf, 4 + 2)?;
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Address::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), buf.get_u16()))
            }
            ATYP_IPV6 => {
                ensure(buf, 16 + 2)?;
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Address::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), buf.get_u16()))
            }
            ATYP_DOMAIN => {
                ensure(buf, 1)?;
                let len = usize::from(buf.get_u8());
                ensure(buf, len + 2)?;
                let mut name = vec![0u8; len];
                buf.copy_to_slice(&mut name);
                let name = String::from_utf8(name).map_err(|_| SocksError::InvalidDomain)?;
                Address::Domain(name, buf.get_u16())
            }
            other => return Err(SocksError::InvalidAddressType(other)),
        };

        Ok(address)
    }

    /// Read an address record from a stream.
    pub async fn read<R>(reader: &mut R) -> Result<Self, SocksError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        let mut record = vec![atyp];
        let remaining = match atyp {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            ATYP_DOMAIN => {
                let len = reader.read_u8().await?;
                record.push(len);
                usize::from(len) + 2
            }
            other => return Err(SocksError::InvalidAddressType(other)),
        };

        let start = record.len();
        record.resize(start + remaining, 0);
        reader.read_exact(&mut record[start..]).await?;
        Address::read_from(&mut record.as_slice())
    }
}

fn ensure<B: Buf>(buf: &B, n: usize) -> Result<(), SocksError> {
    if buf.remaining() < n {
        Err(SocksError::Truncated)
    } else {
        Ok(())
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{addr}"),
            Address::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

/// Error parsing an `host:port` string into an [`Address`].
#[derive(Debug, Error)]
#[error("invalid address: {0}")]
pub struct InvalidAddress(String);

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| InvalidAddress(s.to_owned()))?;
        let port = port.parse().map_err(|_| InvalidAddress(s.to_owned()))?;
        if host.is_empty() {
            return Err(InvalidAddress(s.to_owned()));
        }
        Ok(Address::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::BytesMut;

    fn round_trip(address: Address) {
        let mut buf = BytesMut::new();
        address.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), address.encoded_len());

        let mut frozen = buf.freeze();
        let decoded = Address::read_from(&mut frozen).unwrap();
        assert_eq!(decoded, address);
        assert!(frozen.is_empty());
    }

    #[test]
    fn ipv4_round_trip() {
        round_trip("127.0.0.1:1080".parse().unwrap());
        round_trip("0.0.0.0:0".parse().unwrap());
        round_trip("255.255.255.255:65535".parse().unwrap());
    }

    #[test]
    fn ipv6_round_trip() {
        round_trip("[::1]:443".parse().unwrap());
        round_trip("[2001:db8::ff00:42:8329]:8080".parse().unwrap());
    }

    #[test]
    fn domain_round_trip() {
        round_trip(Address::Domain("example.com".into(), 80));
        round_trip(Address::Domain(String::new(), 1));
        round_trip(Address::Domain("a".repeat(MAX_DOMAIN_LEN), 65535));
    }

    #[test]
    fn ipv4_wire_layout() {
        let mut buf = BytesMut::new();
        Address::from("10.0.0.2:8080".parse::<SocketAddr>().unwrap())
            .write_to(&mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x01, 10, 0, 0, 2, 0x1f, 0x90]);
    }

    #[test]
    fn domain_wire_layout() {
        let mut buf = BytesMut::new();
        Address::Domain("ab".into(), 1).write_to(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x03, 2, b'a', b'b', 0, 1]);
    }

    #[test]
    fn oversized_domain_fails() {
        let mut buf = BytesMut::new();
        let err = Address::Domain("a".repeat(256), 80)
            .write_to(&mut buf)
            .unwrap_err();
        assert!(matches!(err, SocksError::HostTooLong(256)));
        assert!(buf.is_empty());
    }

    #[test]
    fn invalid_atyp() {
        let mut data: &[u8] = &[0x02, 1, 2, 3, 4, 0, 80];
        let err = Address::read_from(&mut data).unwrap_err();
        assert!(matches!(err, SocksError::InvalidAddressType(0x02)));
    }

    #[test]
    fn truncated_records() {
        for data in [&[][..], &[0x01, 1, 2][..], &[0x03, 5, b'a'][..], &[0x04; 10][..]] {
            let mut data = data;
            let err = Address::read_from(&mut data).unwrap_err();
            assert!(matches!(err, SocksError::Truncated), "{err:?}");
        }
    }

    #[test]
    fn parse_host_port() {
        assert_eq!(
            "example.com:443".parse::<Address>().unwrap(),
            Address::Domain("example.com".into(), 443)
        );
        assert_eq!(Address::new("[::1]", 80), "[::1]:80".parse().unwrap());
        assert!("example.com".parse::<Address>().is_err());
        assert!(":80".parse::<Address>().is_err());
    }

    #[tokio::test]
    async fn read_from_stream() {
        let mut buf = BytesMut::new();
        let address = Address::Domain("proxy.internal".into(), 9050);
        address.write_to(&mut buf).unwrap();
        buf.extend_from_slice(b"trailing");

        let mut reader = &buf[..];
        let decoded = Address::read(&mut reader).await.unwrap();
        assert_eq!(decoded, address);
        assert_eq!(reader, b"trailing");
    }
}
