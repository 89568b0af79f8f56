//! Destination addresses and per-connection metadata.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::BytesMut;

use crate::{ParseResult, ProtoError, read_u16};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Maximum domain name length on the wire (1-byte length prefix).
pub const MAX_DOMAIN_LEN: usize = 255;

/// Host part of a destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

/// A destination: host plus port, encoded with SOCKS5 address rules
/// (1-byte type tag, length-prefixed domain, big-endian port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: Host,
    pub port: u16,
}

impl Address {
    /// Build a domain-name address, validating the length invariant.
    pub fn domain(name: impl Into<String>, port: u16) -> Result<Self, ProtoError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtoError::InvalidDomainLength);
        }
        if name.len() > MAX_DOMAIN_LEN {
            return Err(ProtoError::DomainTooLong);
        }
        Ok(Self {
            host: Host::Domain(name),
            port,
        })
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        let host = match ip {
            IpAddr::V4(v4) => Host::Ipv4(v4),
            IpAddr::V6(v6) => Host::Ipv6(v6),
        };
        Self { host, port }
    }

    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip(), addr.port())
    }

    /// The IP address, when this destination is not a domain name.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.host {
            Host::Ipv4(v4) => Some(IpAddr::V4(v4)),
            Host::Ipv6(v6) => Some(IpAddr::V6(v6)),
            Host::Domain(_) => None,
        }
    }

    /// The socket address, when this destination is not a domain name.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// The domain name, when this destination is one.
    pub fn domain_name(&self) -> Option<&str> {
        match &self.host {
            Host::Domain(d) => Some(d),
            _ => None,
        }
    }

    /// Encoded length on the wire, including the type tag.
    pub fn encoded_len(&self) -> usize {
        let host = match &self.host {
            Host::Ipv4(_) => 4,
            Host::Ipv6(_) => 16,
            Host::Domain(d) => 1 + d.len(),
        };
        1 + host + 2
    }

    /// Append the wire encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match &self.host {
            Host::Ipv4(ip) => {
                buf.extend_from_slice(&[ATYP_IPV4]);
                buf.extend_from_slice(&ip.octets());
            }
            Host::Ipv6(ip) => {
                buf.extend_from_slice(&[ATYP_IPV6]);
                buf.extend_from_slice(&ip.octets());
            }
            Host::Domain(d) => {
                debug_assert!(d.len() <= MAX_DOMAIN_LEN);
                buf.extend_from_slice(&[ATYP_DOMAIN, d.len() as u8]);
                buf.extend_from_slice(d.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    /// Parse an address starting at `buf[0]` (the type tag).
    ///
    /// On success returns the address and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> ParseResult<(Self, usize)> {
        if buf.is_empty() {
            return ParseResult::Incomplete(1);
        }
        match buf[0] {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return ParseResult::Incomplete(7);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = read_u16(&buf[5..7]);
                ParseResult::Complete((
                    Self {
                        host: Host::Ipv4(ip),
                        port,
                    },
                    7,
                ))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return ParseResult::Incomplete(19);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = read_u16(&buf[17..19]);
                ParseResult::Complete((
                    Self {
                        host: Host::Ipv6(Ipv6Addr::from(octets)),
                        port,
                    },
                    19,
                ))
            }
            ATYP_DOMAIN => {
                if buf.len() < 2 {
                    return ParseResult::Incomplete(2);
                }
                let len = buf[1] as usize;
                if len == 0 {
                    return ParseResult::Invalid(ProtoError::InvalidDomainLength);
                }
                let need = 2 + len + 2;
                if buf.len() < need {
                    return ParseResult::Incomplete(need);
                }
                let Ok(domain) = std::str::from_utf8(&buf[2..2 + len]) else {
                    return ParseResult::Invalid(ProtoError::InvalidUtf8);
                };
                let port = read_u16(&buf[2 + len..need]);
                ParseResult::Complete((
                    Self {
                        host: Host::Domain(domain.to_owned()),
                        port,
                    },
                    need,
                ))
            }
            _ => ParseResult::Invalid(ProtoError::InvalidAddressType),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            Host::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            Host::Domain(d) => write!(f, "{}:{}", d, self.port),
        }
    }
}

/// Transport kind a destination is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

/// Trojan commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    UdpAssociate = 0x03,
    /// Multiplexing extension: the stream carries a mux session.
    Mux = 0x7f,
}

impl Command {
    pub fn from_byte(b: u8) -> Result<Self, ProtoError> {
        match b {
            0x01 => Ok(Command::Connect),
            0x03 => Ok(Command::UdpAssociate),
            0x7f => Ok(Command::Mux),
            _ => Err(ProtoError::InvalidCommand),
        }
    }

    pub fn network(self) -> Network {
        match self {
            Command::UdpAssociate => Network::Udp,
            _ => Network::Tcp,
        }
    }
}

/// Per-connection routing header: what a server layer decoded, or what a
/// client layer is told to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub command: Command,
    pub address: Address,
}

impl Metadata {
    pub fn connect(address: Address) -> Self {
        Self {
            command: Command::Connect,
            address,
        }
    }

    /// Append `command | address` to `buf` (the SimpleSocks layout; the
    /// trojan request adds the hash prefix and CRLF separators around it).
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&[self.command as u8]);
        self.address.encode(buf);
    }

    /// Parse `command | address` starting at `buf[0]`.
    pub fn decode(buf: &[u8]) -> ParseResult<(Self, usize)> {
        if buf.is_empty() {
            return ParseResult::Incomplete(1);
        }
        let command = match Command::from_byte(buf[0]) {
            Ok(c) => c,
            Err(e) => return ParseResult::Invalid(e),
        };
        match Address::decode(&buf[1..]) {
            ParseResult::Complete((address, n)) => {
                ParseResult::Complete((Self { command, address }, 1 + n))
            }
            ParseResult::Incomplete(n) => ParseResult::Incomplete(1 + n),
            ParseResult::Invalid(e) => ParseResult::Invalid(e),
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.command, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: Address) {
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        assert_eq!(buf.len(), addr.encoded_len());
        match Address::decode(&buf) {
            ParseResult::Complete((decoded, n)) => {
                assert_eq!(decoded, addr);
                assert_eq!(n, buf.len());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn address_roundtrip_all_variants() {
        roundtrip(Address::from_ip(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 443));
        roundtrip(Address::from_ip(
            IpAddr::V6("2001:db8::1".parse().unwrap()),
            8443,
        ));
        roundtrip(Address::domain("example.com", 80).unwrap());
        roundtrip(Address::domain("a", 0).unwrap());
        roundtrip(Address::domain("x".repeat(255), 65535).unwrap());
    }

    #[test]
    fn domain_length_invariants() {
        assert_eq!(
            Address::domain("", 80).unwrap_err(),
            ProtoError::InvalidDomainLength
        );
        assert_eq!(
            Address::domain("x".repeat(256), 80).unwrap_err(),
            ProtoError::DomainTooLong
        );
    }

    #[test]
    fn decode_incomplete_reports_need() {
        let addr = Address::domain("example.com", 80).unwrap();
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        for cut in 0..buf.len() {
            match Address::decode(&buf[..cut]) {
                ParseResult::Incomplete(n) => assert!(n > cut, "need must exceed have"),
                other => panic!("cut {cut}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn decode_rejects_unknown_atyp() {
        assert_eq!(
            Address::decode(&[0x02, 0, 0, 0, 0, 0, 0]),
            ParseResult::Invalid(ProtoError::InvalidAddressType)
        );
    }

    #[test]
    fn decode_rejects_zero_length_domain() {
        assert_eq!(
            Address::decode(&[ATYP_DOMAIN, 0, 0, 80]),
            ParseResult::Invalid(ProtoError::InvalidDomainLength)
        );
    }

    #[test]
    fn command_bytes() {
        assert_eq!(Command::from_byte(0x01).unwrap(), Command::Connect);
        assert_eq!(Command::from_byte(0x03).unwrap(), Command::UdpAssociate);
        assert_eq!(Command::from_byte(0x7f).unwrap(), Command::Mux);
        assert!(Command::from_byte(0x02).is_err());
        assert_eq!(Command::UdpAssociate.network(), Network::Udp);
        assert_eq!(Command::Connect.network(), Network::Tcp);
    }

    #[test]
    fn metadata_roundtrip() {
        let meta = Metadata {
            command: Command::Connect,
            address: Address::domain("example.com", 443).unwrap(),
        };
        let mut buf = BytesMut::new();
        meta.encode(&mut buf);
        match Metadata::decode(&buf) {
            ParseResult::Complete((decoded, n)) => {
                assert_eq!(decoded, meta);
                assert_eq!(n, buf.len());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
