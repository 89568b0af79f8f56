//! Trojan request and UDP packet framing.
//!
//! Request layout (client → server, first bytes of every stream):
//!
//! ```text
//! +------+------+----------+------+----------+
//! | HASH | CRLF | Command  | Addr | CRLF ... |
//! | 56   | 2    | 1        | var  | 2        |
//! +------+------+----------+------+----------+
//! ```
//!
//! UDP packets ride the same stream after a `UdpAssociate` request:
//!
//! ```text
//! | Addr | Length (u16 BE) | CRLF | payload |
//! ```
//!
//! Anything that deviates from this layout before authentication must look
//! like a non-trojan connection to the caller, which is why parsing never
//! reads past what it needs and classifies every deviation as `Invalid`.

use bytes::BytesMut;

use crate::address::{Address, Command, Metadata};
use crate::{CRLF, ParseResult, ProtoError, expect_crlf, read_u16};

/// Hash field length: SHA-224 of the password as lowercase hex.
pub const HASH_LEN: usize = 56;

/// Maximum UDP payload carried by one packet frame (8 KiB).
pub const MAX_UDP_PAYLOAD: usize = 8 * 1024;

/// A parsed trojan request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The 56 hex characters presented by the peer, as received.
    pub hash: [u8; HASH_LEN],
    pub metadata: Metadata,
    /// Total header length; payload starts at `buf[header_len..]`.
    pub header_len: usize,
}

impl Request {
    /// The hash as a `&str`. Parsing guarantees ASCII hex digits.
    pub fn hash_str(&self) -> &str {
        std::str::from_utf8(&self.hash).expect("validated ASCII hex")
    }
}

/// A parsed UDP packet frame, borrowing its payload from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket<'a> {
    pub address: Address,
    pub payload: &'a [u8],
    /// Total frame length; the next frame starts at `buf[packet_len..]`.
    pub packet_len: usize,
}

fn is_hex(hash: &[u8]) -> bool {
    hash.iter().all(|b| b.is_ascii_hexdigit())
}

/// Incrementally parse a trojan request header from `buf`.
///
/// The hash field is validated without scanning ahead: exactly `HASH_LEN`
/// hex digits followed by CRLF, or the whole connection is `Invalid` and
/// belongs to the fallback.
pub fn parse_request(buf: &[u8]) -> ParseResult<Request> {
    if buf.len() < HASH_LEN {
        return ParseResult::Incomplete(HASH_LEN);
    }
    if !is_hex(&buf[..HASH_LEN]) {
        return ParseResult::Invalid(ProtoError::InvalidHash);
    }
    let mut offset = HASH_LEN;

    if let Some(res) = expect_crlf(buf, offset) {
        return res;
    }
    offset += 2;

    let meta = match Metadata::decode(&buf[offset..]) {
        ParseResult::Complete(v) => v,
        ParseResult::Incomplete(n) => return ParseResult::Incomplete(offset + n),
        ParseResult::Invalid(e) => return ParseResult::Invalid(e),
    };
    let (metadata, meta_len) = meta;
    offset += meta_len;

    if let Some(res) = expect_crlf(buf, offset) {
        return res;
    }
    offset += 2;

    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&buf[..HASH_LEN]);
    ParseResult::Complete(Request {
        hash,
        metadata,
        header_len: offset,
    })
}

/// Append a trojan request header to `buf`.
pub fn write_request(
    buf: &mut BytesMut,
    hash_hex: &str,
    metadata: &Metadata,
) -> Result<(), ProtoError> {
    if hash_hex.len() != HASH_LEN || !is_hex(hash_hex.as_bytes()) {
        return Err(ProtoError::InvalidHash);
    }
    buf.reserve(HASH_LEN + 4 + 1 + metadata.address.encoded_len());
    buf.extend_from_slice(hash_hex.as_bytes());
    buf.extend_from_slice(CRLF);
    metadata.encode(buf);
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// Incrementally parse a UDP packet frame from `buf`.
///
/// Frames with a length field above [`MAX_UDP_PAYLOAD`] are `Invalid`:
/// by the time UDP packets flow the stream is authenticated, so the caller
/// treats this as a fatal framing error and closes.
pub fn parse_udp_packet(buf: &[u8]) -> ParseResult<UdpPacket<'_>> {
    let (address, addr_len) = match Address::decode(buf) {
        ParseResult::Complete(v) => v,
        ParseResult::Incomplete(n) => return ParseResult::Incomplete(n),
        ParseResult::Invalid(e) => return ParseResult::Invalid(e),
    };

    let mut offset = addr_len;
    if buf.len() < offset + 2 {
        return ParseResult::Incomplete(offset + 2);
    }
    let length = read_u16(&buf[offset..offset + 2]) as usize;
    if length > MAX_UDP_PAYLOAD {
        return ParseResult::Invalid(ProtoError::PayloadTooLarge);
    }
    offset += 2;

    if let Some(res) = expect_crlf(buf, offset) {
        return res;
    }
    offset += 2;

    if buf.len() < offset + length {
        return ParseResult::Incomplete(offset + length);
    }
    ParseResult::Complete(UdpPacket {
        address,
        payload: &buf[offset..offset + length],
        packet_len: offset + length,
    })
}

/// Append a UDP packet frame to `buf`.
pub fn write_udp_packet(
    buf: &mut BytesMut,
    address: &Address,
    payload: &[u8],
) -> Result<(), ProtoError> {
    if payload.len() > MAX_UDP_PAYLOAD {
        return Err(ProtoError::PayloadTooLarge);
    }
    buf.reserve(address.encoded_len() + 4 + payload.len());
    address.encode(buf);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Host;

    const SAMPLE_HASH: &str = "0123456789abcdef0123456789abcdef0123456789abcdef01234567";

    fn sample_metadata() -> Metadata {
        Metadata {
            command: Command::Connect,
            address: Address::domain("example.com", 443).unwrap(),
        }
    }

    #[test]
    fn request_roundtrip_with_payload() {
        let mut buf = BytesMut::new();
        write_request(&mut buf, SAMPLE_HASH, &sample_metadata()).unwrap();
        let header_len = buf.len();
        buf.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");

        match parse_request(&buf) {
            ParseResult::Complete(req) => {
                assert_eq!(req.hash_str(), SAMPLE_HASH);
                assert_eq!(req.metadata, sample_metadata());
                assert_eq!(req.header_len, header_len);
                assert_eq!(&buf[req.header_len..], b"GET / HTTP/1.0\r\n\r\n");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn short_buffer_is_incomplete() {
        assert_eq!(
            parse_request(&[b'a'; HASH_LEN - 1]),
            ParseResult::Incomplete(HASH_LEN)
        );
    }

    #[test]
    fn non_hex_hash_is_invalid() {
        let mut buf = BytesMut::new();
        write_request(&mut buf, SAMPLE_HASH, &sample_metadata()).unwrap();
        buf[0] = b'g';
        assert_eq!(
            parse_request(&buf),
            ParseResult::Invalid(ProtoError::InvalidHash)
        );
    }

    #[test]
    fn missing_crlf_after_hash_is_invalid() {
        // Valid hash bytes, but byte 56/57 are not CRLF. This is the probe
        // shape the server must hand to the fallback.
        let mut buf = vec![b'a'; HASH_LEN];
        buf.extend_from_slice(b"xx");
        assert_eq!(
            parse_request(&buf),
            ParseResult::Invalid(ProtoError::InvalidCrlf)
        );
    }

    #[test]
    fn bad_command_is_invalid() {
        let mut buf = BytesMut::new();
        write_request(&mut buf, SAMPLE_HASH, &sample_metadata()).unwrap();
        buf[HASH_LEN + 2] = 0x05;
        assert_eq!(
            parse_request(&buf),
            ParseResult::Invalid(ProtoError::InvalidCommand)
        );
    }

    #[test]
    fn write_request_rejects_bad_hash() {
        let mut buf = BytesMut::new();
        assert_eq!(
            write_request(&mut buf, "tooshort", &sample_metadata()).unwrap_err(),
            ProtoError::InvalidHash
        );
    }

    #[test]
    fn udp_packet_roundtrip() {
        let addr = Address::from_ip([8, 8, 8, 8].into(), 53);
        let mut buf = BytesMut::new();
        write_udp_packet(&mut buf, &addr, b"PING").unwrap();

        match parse_udp_packet(&buf) {
            ParseResult::Complete(pkt) => {
                assert_eq!(pkt.address, addr);
                assert_eq!(pkt.payload, b"PING");
                assert_eq!(pkt.packet_len, buf.len());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn udp_packets_parse_back_to_back() {
        let a = Address::from_ip([1, 1, 1, 1].into(), 53);
        let b = Address::domain("dns.example", 5353).unwrap();
        let mut buf = BytesMut::new();
        write_udp_packet(&mut buf, &a, b"first").unwrap();
        write_udp_packet(&mut buf, &b, b"second").unwrap();

        let ParseResult::Complete(first) = parse_udp_packet(&buf) else {
            panic!("first frame");
        };
        assert_eq!(first.payload, b"first");
        let rest = &buf[first.packet_len..];
        let ParseResult::Complete(second) = parse_udp_packet(rest) else {
            panic!("second frame");
        };
        assert_eq!(second.payload, b"second");
        assert!(matches!(second.address.host, Host::Domain(_)));
        assert_eq!(second.packet_len, rest.len());
    }

    #[test]
    fn oversized_udp_length_is_fatal() {
        let addr = Address::from_ip([8, 8, 8, 8].into(), 53);
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        buf.extend_from_slice(&((MAX_UDP_PAYLOAD as u16) + 1).to_be_bytes());
        buf.extend_from_slice(CRLF);
        assert_eq!(
            parse_udp_packet(&buf),
            ParseResult::Invalid(ProtoError::PayloadTooLarge)
        );
    }

    #[test]
    fn write_udp_packet_rejects_oversized_payload() {
        let addr = Address::from_ip([8, 8, 8, 8].into(), 53);
        let mut buf = BytesMut::new();
        let payload = vec![0u8; MAX_UDP_PAYLOAD + 1];
        assert_eq!(
            write_udp_packet(&mut buf, &addr, &payload).unwrap_err(),
            ProtoError::PayloadTooLarge
        );
    }
}
