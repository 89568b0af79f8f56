//! SOCKS5 local-entry adapter (RFC 1928 / 1929).
//!
//! Supports the no-auth and username/password methods, and the CONNECT
//! and UDP ASSOCIATE commands. No credential store is configured for the
//! local entry, so username/password sub-negotiation accepts any pair;
//! the method exists for clients that insist on offering it.
//!
//! The CONNECT reply is deferred: the success code goes out only after
//! the relay engine reports that the outbound leg is up, and dial
//! failures map to their proper reply codes (a router block is
//! `connection not allowed`, a refused target is `connection refused`).

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trident_proto::{Address, Metadata, ParseResult, ProtoError};

use crate::{
    BoxPacketConn, BoxStream, DialAck, PacketConn, StreamConn, TunnelError, TunnelStream,
};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_TTL_EXPIRED: u8 = 0x06;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Map a dial failure to the SOCKS reply code the client should see.
pub(crate) fn reply_code_for_dial_error(error: &TunnelError) -> u8 {
    match error {
        TunnelError::Blocked(_) => REPLY_CONNECTION_NOT_ALLOWED,
        TunnelError::Resolve(_) => REPLY_HOST_UNREACHABLE,
        TunnelError::Io(e) => match e.kind() {
            ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
            ErrorKind::NetworkUnreachable => REPLY_NETWORK_UNREACHABLE,
            ErrorKind::HostUnreachable | ErrorKind::AddrNotAvailable => REPLY_HOST_UNREACHABLE,
            ErrorKind::PermissionDenied => REPLY_CONNECTION_NOT_ALLOWED,
            ErrorKind::TimedOut => REPLY_TTL_EXPIRED,
            _ => REPLY_GENERAL_FAILURE,
        },
        _ => REPLY_GENERAL_FAILURE,
    }
}

/// Deferred CONNECT reply, resolved by the relay with the dial outcome.
struct ConnectAck;

#[async_trait]
impl DialAck for ConnectAck {
    async fn success(&mut self, stream: &mut BoxStream) -> std::io::Result<()> {
        send_reply_unspecified(stream, REPLY_SUCCEEDED).await?;
        stream.flush().await
    }

    async fn failure(
        &mut self,
        stream: &mut BoxStream,
        error: &TunnelError,
    ) -> std::io::Result<()> {
        send_reply_unspecified(stream, reply_code_for_dial_error(error)).await?;
        stream.flush().await
    }
}

/// Method negotiation, then the request. Returns the command byte and the
/// decoded destination.
async fn read_request<S>(stream: &mut S) -> Result<(u8, Address), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(TunnelError::Handshake(format!(
            "bad socks version {:#x}",
            header[0]
        )));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    } else if methods.contains(&METHOD_USERPASS) {
        stream.write_all(&[SOCKS_VERSION, METHOD_USERPASS]).await?;
        read_userpass(stream).await?;
    } else {
        let _ = stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await;
        return Err(TunnelError::Handshake("no acceptable auth method".into()));
    }

    // Request: VER CMD RSV ATYP ADDR PORT
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(TunnelError::Handshake(format!(
            "bad socks version {:#x}",
            head[0]
        )));
    }
    let address = read_address(stream, head[3]).await?;
    Ok((head[1], address))
}

/// RFC 1929 sub-negotiation; any credentials are accepted.
async fn read_userpass<S>(stream: &mut S) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut username = vec![0u8; head[1] as usize];
    stream.read_exact(&mut username).await?;
    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;
    debug!(user = %String::from_utf8_lossy(&username), "socks userpass accepted");
    stream.write_all(&[0x01, 0x00]).await?;
    Ok(())
}

async fn read_address<S>(stream: &mut S, atyp: u8) -> Result<Address, TunnelError>
where
    S: AsyncRead + Unpin,
{
    // Same wire layout as the tunnel address, tag included.
    let mut buf = BytesMut::with_capacity(32);
    buf.extend_from_slice(&[atyp]);
    loop {
        match Address::decode(&buf) {
            ParseResult::Complete((address, _)) => return Ok(address),
            ParseResult::Invalid(e) => return Err(TunnelError::Proto(e)),
            ParseResult::Incomplete(need) => {
                let missing = need - buf.len();
                let mut chunk = vec![0u8; missing];
                stream.read_exact(&mut chunk).await?;
                buf.extend_from_slice(&chunk);
            }
        }
    }
}

/// Send a reply with the given bind address.
pub(crate) async fn send_reply<S>(
    stream: &mut S,
    reply: u8,
    bind: SocketAddr,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(32);
    buf.extend_from_slice(&[SOCKS_VERSION, reply, 0x00]);
    Address::from_socket(bind).encode(&mut buf);
    stream.write_all(&buf).await
}

pub(crate) async fn send_reply_unspecified<S>(stream: &mut S, reply: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_reply(stream, reply, SocketAddr::from(([0, 0, 0, 0], 0))).await
}

/// Serve one local SOCKS5 connection, surfacing it as a tunnel stream or
/// packet connection.
pub(crate) async fn handle_conn<S>(
    mut stream: S,
    local_ip: IpAddr,
    stream_tx: mpsc::Sender<StreamConn>,
    packet_tx: mpsc::Sender<BoxPacketConn>,
    shutdown: CancellationToken,
) -> Result<(), TunnelError>
where
    S: TunnelStream + 'static,
{
    let (command, address) = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(TunnelError::Proto(ProtoError::InvalidAddressType)) => {
            let _ = send_reply_unspecified(&mut stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await;
            return Err(TunnelError::Proto(ProtoError::InvalidAddressType));
        }
        Err(e) => return Err(e),
    };
    match command {
        CMD_CONNECT => {
            debug!(target = %address, "socks CONNECT");
            // No reply yet: the relay resolves the ack once the outbound
            // dial settles, so a blocked or unreachable destination gets
            // its real reply code instead of a false success.
            let metadata = Metadata::connect(address);
            let conn =
                StreamConn::with_dial_ack(Box::new(stream), metadata, Box::new(ConnectAck));
            let _ = stream_tx.send(conn).await;
            Ok(())
        }
        CMD_UDP_ASSOCIATE => {
            let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
            let relay_addr = socket.local_addr()?;
            debug!(relay = %relay_addr, "socks UDP ASSOCIATE");
            send_reply(&mut stream, REPLY_SUCCEEDED, relay_addr).await?;

            let closed = shutdown.child_token();
            let conn: BoxPacketConn = Box::new(SocksPacketConn {
                socket,
                client: StdMutex::new(None),
                closed: closed.clone(),
            });
            let _ = packet_tx.send(conn).await;

            // Per RFC 1928 the association lives as long as the TCP
            // control connection.
            tokio::spawn(async move {
                let mut probe = [0u8; 1];
                loop {
                    match stream.read(&mut probe).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                debug!("socks control connection closed, ending association");
                closed.cancel();
            });
            Ok(())
        }
        other => {
            let _ = send_reply_unspecified(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await;
            Err(TunnelError::Handshake(format!(
                "unsupported socks command {other:#x}"
            )))
        }
    }
}

// ── UDP relay ──

/// The SOCKS5 UDP request header: `RSV(2) FRAG(1) ATYP ADDR PORT`.
pub(crate) fn parse_udp_datagram(pkt: &[u8]) -> Result<(Address, &[u8]), TunnelError> {
    if pkt.len() < 4 {
        return Err(TunnelError::Handshake("short socks udp packet".into()));
    }
    if pkt[2] != 0 {
        // Fragmentation is not supported; drop silently per RFC 1928.
        return Err(TunnelError::Handshake("fragmented socks udp packet".into()));
    }
    match Address::decode(&pkt[3..]) {
        ParseResult::Complete((address, n)) => Ok((address, &pkt[3 + n..])),
        ParseResult::Incomplete(_) => {
            Err(TunnelError::Handshake("truncated socks udp packet".into()))
        }
        ParseResult::Invalid(e) => Err(TunnelError::Proto(e)),
    }
}

pub(crate) fn encode_udp_datagram(address: &Address, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(payload.len() + address.encoded_len() + 3);
    buf.extend_from_slice(&[0, 0, 0]);
    address.encode(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Packet endpoint bridging the client's UDP socket and the tunnel.
struct SocksPacketConn {
    socket: UdpSocket,
    /// Last client source; replies go back there.
    client: StdMutex<Option<SocketAddr>>,
    closed: CancellationToken,
}

#[async_trait]
impl PacketConn for SocksPacketConn {
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Address), TunnelError> {
        let mut scratch = vec![0u8; buf.len() + 300];
        loop {
            let (n, from) = tokio::select! {
                _ = self.closed.cancelled() => return Err(TunnelError::Closed),
                result = self.socket.recv_from(&mut scratch) => result?,
            };
            match parse_udp_datagram(&scratch[..n]) {
                Ok((address, payload)) => {
                    *self.client.lock().expect("client lock") = Some(from);
                    let len = payload.len().min(buf.len());
                    buf[..len].copy_from_slice(&payload[..len]);
                    return Ok((len, address));
                }
                Err(e) => {
                    debug!(error = %e, "dropping invalid socks udp packet");
                }
            }
        }
    }

    async fn write_to(&self, buf: &[u8], addr: &Address) -> Result<usize, TunnelError> {
        let client = *self.client.lock().expect("client lock");
        let Some(client) = client else {
            // No datagram seen from the client yet; nowhere to send.
            return Ok(buf.len());
        };
        let datagram = encode_udp_datagram(addr, buf);
        self.socket.send_to(&datagram, client).await?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use trident_proto::Command;

    #[test]
    fn udp_datagram_roundtrip() {
        let addr = Address::domain("dns.example", 53).unwrap();
        let datagram = encode_udp_datagram(&addr, b"PING");
        let (decoded, payload) = parse_udp_datagram(&datagram).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(payload, b"PING");
    }

    #[test]
    fn fragmented_datagrams_are_dropped() {
        let addr = Address::from_ip([1, 2, 3, 4].into(), 53);
        let mut datagram = encode_udp_datagram(&addr, b"PING");
        datagram[2] = 1;
        assert!(parse_udp_datagram(&datagram).is_err());
    }

    async fn connect_handshake(
    ) -> (tokio::io::DuplexStream, StreamConn, tokio::task::JoinHandle<Result<(), TunnelError>>)
    {
        let (mut client, server_side) = duplex(1024);
        let (stream_tx, mut stream_rx) = mpsc::channel(4);
        let (packet_tx, _packet_rx) = mpsc::channel(4);

        let handler = tokio::spawn(handle_conn(
            server_side,
            IpAddr::from([127, 0, 0, 1]),
            stream_tx,
            packet_tx,
            CancellationToken::new(),
        ));

        // Greeting offering no-auth, then CONNECT example.com:80.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let conn = stream_rx.recv().await.unwrap();
        (client, conn, handler)
    }

    #[tokio::test]
    async fn connect_reply_waits_for_dial_outcome() {
        let (mut client, mut conn, handler) = connect_handshake().await;
        assert_eq!(conn.metadata().address.to_string(), "example.com:80");
        assert_eq!(conn.metadata().command, Command::Connect);

        // Nothing is on the wire until the relay reports the dial.
        let mut probe = [0u8; 1];
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), client.read(&mut probe))
                .await;
        assert!(pending.is_err(), "no reply before the dial resolves");

        conn.dial_ready().await.unwrap();
        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[..2], [0x05, REPLY_SUCCEEDED]);
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn blocked_dial_reports_connection_not_allowed() {
        let (mut client, conn, handler) = connect_handshake().await;

        let blocked = Address::domain("example.com", 80).unwrap();
        conn.dial_failed(&TunnelError::Blocked(blocked)).await;

        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[..2], [0x05, REPLY_CONNECTION_NOT_ALLOWED]);
        handler.await.unwrap().unwrap();
    }

    #[test]
    fn dial_errors_map_to_reply_codes() {
        let blocked = Address::domain("x.test", 80).unwrap();
        assert_eq!(
            reply_code_for_dial_error(&TunnelError::Blocked(blocked)),
            REPLY_CONNECTION_NOT_ALLOWED
        );
        assert_eq!(
            reply_code_for_dial_error(&TunnelError::Resolve("x.test:80".into())),
            REPLY_HOST_UNREACHABLE
        );
        assert_eq!(
            reply_code_for_dial_error(&TunnelError::Io(std::io::Error::new(
                ErrorKind::ConnectionRefused,
                "refused"
            ))),
            REPLY_CONNECTION_REFUSED
        );
        assert_eq!(
            reply_code_for_dial_error(&TunnelError::Io(std::io::Error::new(
                ErrorKind::TimedOut,
                "timeout"
            ))),
            REPLY_TTL_EXPIRED
        );
        assert_eq!(
            reply_code_for_dial_error(&TunnelError::Closed),
            REPLY_GENERAL_FAILURE
        );
    }

    #[tokio::test]
    async fn unsupported_command_is_rejected() {
        let (mut client, server_side) = duplex(1024);
        let (stream_tx, _stream_rx) = mpsc::channel(4);
        let (packet_tx, _packet_rx) = mpsc::channel(4);

        let handler = tokio::spawn(handle_conn(
            server_side,
            IpAddr::from([127, 0, 0, 1]),
            stream_tx,
            packet_tx,
            CancellationToken::new(),
        ));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        // BIND (0x02) is not supported.
        let request = [0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
        client.write_all(&request).await.unwrap();

        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], REPLY_COMMAND_NOT_SUPPORTED);
        assert!(handler.await.unwrap().is_err());
    }
}
