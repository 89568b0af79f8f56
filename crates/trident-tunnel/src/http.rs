//! Plain HTTP local-entry adapter.
//!
//! Handles the browser-facing side of an HTTP proxy: `CONNECT` turns into
//! a relayed tunnel; ordinary methods are rewritten to origin-form and
//! forwarded one request at a time, keeping the client connection alive
//! between requests.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trident_core::PrefixedStream;
use trident_core::defaults::DEFAULT_MAX_HEADER_BYTES;
use trident_proto::{Address, Metadata};

use crate::{BoxStream, StreamConn, TunnelError, TunnelStream};

/// A parsed HTTP request head.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub uri: String,
    pub version: String,
    /// Raw header lines, in order.
    pub headers: Vec<(String, String)>,
    /// Bytes of the head on the wire, including the final blank line.
    pub raw_len: usize,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read a request head (`...\r\n\r\n`) from `stream`, using `buf` as the
/// accumulator; leftover body bytes stay in `buf` past `raw_len`.
pub(crate) async fn read_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<RequestHead, TunnelError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_head_end(buf) {
            return parse_head(&buf[..end], end);
        }
        if buf.len() > DEFAULT_MAX_HEADER_BYTES {
            return Err(TunnelError::Handshake("http head too large".into()));
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(TunnelError::Closed);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(head: &[u8], raw_len: usize) -> Result<RequestHead, TunnelError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| TunnelError::Handshake("http head is not utf-8".into()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| TunnelError::Handshake("empty http head".into()))?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(TunnelError::Handshake(format!(
            "bad request line {request_line:?}"
        )));
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(TunnelError::Handshake(format!("bad header line {line:?}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method: method.to_uppercase(),
        uri: uri.to_string(),
        version: version.to_string(),
        headers,
        raw_len,
    })
}

/// Split `host[:port]` into an [`Address`], defaulting the port.
pub(crate) fn parse_host_port(input: &str, default_port: u16) -> Result<Address, TunnelError> {
    let (host, port) = if let Some(stripped) = input.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let Some(end) = stripped.find(']') else {
            return Err(TunnelError::Handshake(format!("bad host {input:?}")));
        };
        let host = &stripped[..end];
        let port = match stripped[end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| TunnelError::Handshake(format!("bad port in {input:?}")))?,
            None => default_port,
        };
        (host, port)
    } else {
        match input.rsplit_once(':') {
            Some((h, p)) if !p.contains(']') => (
                h,
                p.parse()
                    .map_err(|_| TunnelError::Handshake(format!("bad port in {input:?}")))?,
            ),
            _ => (input, default_port),
        }
    };

    if let Ok(ip) = host.parse() {
        return Ok(Address::from_ip(ip, port));
    }
    Address::domain(host, port).map_err(TunnelError::Proto)
}

/// Rewrite an absolute-form URI (`http://host/path`) to its origin-form
/// path and the destination address.
fn split_absolute_uri(uri: &str) -> Result<(Address, String), TunnelError> {
    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| TunnelError::Handshake(format!("not an absolute http uri: {uri:?}")))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    Ok((parse_host_port(authority, 80)?, path.to_string()))
}

/// Serve one local HTTP proxy connection, pushing a tunnel stream per
/// request until the client goes away.
pub(crate) async fn handle_conn<S>(
    mut stream: S,
    stream_tx: mpsc::Sender<StreamConn>,
    shutdown: CancellationToken,
) -> Result<(), TunnelError>
where
    S: TunnelStream + 'static,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let head = match read_head(&mut stream, &mut buf).await {
            Ok(head) => head,
            Err(TunnelError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };

        if head.method == "CONNECT" {
            let address = parse_host_port(&head.uri, 443)?;
            debug!(target = %address, "http CONNECT");
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
            let leftover = buf.split_off(head.raw_len);
            let boxed: BoxStream = Box::new(PrefixedStream::new(leftover.freeze(), stream));
            let _ = stream_tx
                .send(StreamConn::from_boxed(boxed, Metadata::connect(address)))
                .await;
            return Ok(());
        }

        // Origin-form forwarding: one tunnel stream per request.
        let (address, path) = match split_absolute_uri(&head.uri) {
            Ok(parts) => parts,
            Err(_) => {
                // Fall back to the Host header for origin-form requests.
                let host = head
                    .header("host")
                    .ok_or_else(|| TunnelError::Handshake("request without host".into()))?;
                (parse_host_port(host, 80)?, head.uri.clone())
            }
        };
        debug!(target = %address, method = %head.method, "http request");

        let mut request = BytesMut::with_capacity(head.raw_len + 64);
        request.extend_from_slice(
            format!("{} {} {}\r\n", head.method, path, head.version).as_bytes(),
        );
        for (name, value) in &head.headers {
            if name.eq_ignore_ascii_case("proxy-connection")
                || name.eq_ignore_ascii_case("proxy-authorization")
            {
                continue;
            }
            if name.eq_ignore_ascii_case("connection") {
                continue;
            }
            request.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        request.extend_from_slice(b"connection: close\r\n\r\n");

        // Pull the request body off the client connection.
        let body_len: usize = head
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = buf.split_off(head.raw_len);
        buf.clear();
        while body.len() < body_len {
            let n = stream.read_buf(&mut body).await?;
            if n == 0 {
                return Ok(());
            }
        }
        request.extend_from_slice(&body[..body_len]);
        let trailing = body.split_off(body_len);
        buf.unsplit(trailing);

        // The relay couples the far side of this pipe with the outbound leg.
        let (near, far) = tokio::io::duplex(32 * 1024);
        let _ = stream_tx
            .send(StreamConn::new(far, Metadata::connect(address)))
            .await;

        let (mut near_r, mut near_w) = tokio::io::split(near);
        near_w.write_all(&request).await?;

        // Stream the response back; `connection: close` on the outbound leg
        // means EOF delimits it.
        let mut response = [0u8; 16 * 1024];
        loop {
            let n = near_r.read(&mut response).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&response[..n]).await?;
        }
        stream.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_connect_head() {
        let (mut w, mut r) = tokio::io::duplex(1024);
        w.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let mut buf = BytesMut::new();
        let head = read_head(&mut r, &mut buf).await.unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.uri, "example.com:443");
        assert_eq!(head.header("host"), Some("example.com:443"));
        assert_eq!(head.raw_len, buf.len());
    }

    #[test]
    fn host_port_forms() {
        let addr = parse_host_port("example.com:8080", 80).unwrap();
        assert_eq!(addr.to_string(), "example.com:8080");

        let addr = parse_host_port("example.com", 80).unwrap();
        assert_eq!(addr.port, 80);

        let addr = parse_host_port("[::1]:443", 80).unwrap();
        assert_eq!(addr.to_string(), "[::1]:443");

        let addr = parse_host_port("10.1.2.3:53", 80).unwrap();
        assert_eq!(addr.to_string(), "10.1.2.3:53");
    }

    #[test]
    fn absolute_uri_rewrites_to_origin_form() {
        let (addr, path) = split_absolute_uri("http://example.com/a/b?c=d").unwrap();
        assert_eq!(addr.to_string(), "example.com:80");
        assert_eq!(path, "/a/b?c=d");

        let (addr, path) = split_absolute_uri("http://example.com:8080").unwrap();
        assert_eq!(addr.to_string(), "example.com:8080");
        assert_eq!(path, "/");

        assert!(split_absolute_uri("ftp://example.com/").is_err());
    }
}
