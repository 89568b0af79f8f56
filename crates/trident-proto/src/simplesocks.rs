//! SimpleSocks framing: the header used inside mux sessions.
//!
//! The outer stream is already authenticated, so the header is just
//! `Command | Address`: no hash, no CRLF.

use bytes::BytesMut;

use crate::address::Metadata;
use crate::ParseResult;

/// Incrementally parse a SimpleSocks header; on success returns the header
/// and its length.
pub fn parse_header(buf: &[u8]) -> ParseResult<(Metadata, usize)> {
    Metadata::decode(buf)
}

/// Append a SimpleSocks header to `buf`.
pub fn write_header(buf: &mut BytesMut, metadata: &Metadata) {
    metadata.encode(buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Command};
    use crate::ProtoError;

    #[test]
    fn header_roundtrip() {
        let metadata = Metadata {
            command: Command::Connect,
            address: Address::domain("example.com", 443).unwrap(),
        };
        let mut buf = BytesMut::new();
        write_header(&mut buf, &metadata);
        buf.extend_from_slice(b"payload");

        match parse_header(&buf) {
            ParseResult::Complete((decoded, len)) => {
                assert_eq!(decoded, metadata);
                assert_eq!(&buf[len..], b"payload");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn header_is_hashless() {
        // The first byte is the command, not hex: the trojan parser would
        // treat this as garbage, which is exactly why it only ever appears
        // inside an authenticated mux stream.
        let metadata = Metadata {
            command: Command::Connect,
            address: Address::from_ip([1, 2, 3, 4].into(), 80),
        };
        let mut buf = BytesMut::new();
        write_header(&mut buf, &metadata);
        assert_eq!(buf[0], 0x01);
        assert!(matches!(
            crate::trojan::parse_request(&buf),
            ParseResult::Incomplete(_) | ParseResult::Invalid(ProtoError::InvalidHash)
        ));
    }

    #[test]
    fn truncated_header_is_incomplete() {
        let metadata = Metadata {
            command: Command::UdpAssociate,
            address: Address::domain("host.example", 53).unwrap(),
        };
        let mut buf = BytesMut::new();
        write_header(&mut buf, &metadata);
        for cut in 0..buf.len() {
            assert!(matches!(
                parse_header(&buf[..cut]),
                ParseResult::Incomplete(_)
            ));
        }
    }
}
