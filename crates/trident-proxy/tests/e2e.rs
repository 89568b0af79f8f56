//! End-to-end scenarios: a full client stack talking to a full server
//! stack over loopback TLS.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use trident_config::{Config, validate_config};
use trident_proxy::proxy::build_proxy;

#[ctor::ctor]
fn init_crypto() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("install crypto provider");
}

// ── harness ──

struct TestCert {
    cert_path: std::path::PathBuf,
    key_path: std::path::PathBuf,
}

fn make_cert(tag: &str) -> TestCert {
    let signed = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let dir = std::env::temp_dir();
    let cert_path = dir.join(format!("trident-e2e-{tag}-{}.crt", std::process::id()));
    let key_path = dir.join(format!("trident-e2e-{tag}-{}.key", std::process::id()));
    std::fs::write(&cert_path, signed.cert.pem()).unwrap();
    std::fs::write(&key_path, signed.key_pair.serialize_pem()).unwrap();
    TestCert {
        cert_path,
        key_path,
    }
}

async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn wait_for_tcp(addr: SocketAddr) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timeout waiting for {addr}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn server_config(port: u16, cert: &TestCert, fallback_port: u16) -> Config {
    let cfg: Config = serde_json::from_value(serde_json::json!({
        "run_type": "server",
        "local_addr": "127.0.0.1",
        "local_port": port,
        "remote_addr": "127.0.0.1",
        "remote_port": fallback_port,
        "password": ["hunter2"],
        "log_level": 5,
        "ssl": {
            "cert": cert.cert_path.display().to_string(),
            "key": cert.key_path.display().to_string(),
            "fallback_addr": "127.0.0.1",
            "fallback_port": fallback_port,
        },
    }))
    .unwrap();
    validate_config(&cfg).unwrap();
    cfg
}

fn client_config(local_port: u16, server_port: u16) -> Config {
    let cfg: Config = serde_json::from_value(serde_json::json!({
        "run_type": "client",
        "local_addr": "127.0.0.1",
        "local_port": local_port,
        "remote_addr": "127.0.0.1",
        "remote_port": server_port,
        "password": ["hunter2"],
        "log_level": 5,
        "ssl": { "sni": "localhost", "verify": false },
    }))
    .unwrap();
    validate_config(&cfg).unwrap();
    cfg
}

async fn spawn_proxy(config: Config, root: &CancellationToken) {
    let proxy = Arc::new(build_proxy(&config, root).await.unwrap());
    tokio::spawn(async move { proxy.run().await });
}

/// Static HTTP-ish origin used as decoy and as a plain origin.
async fn spawn_static_origin(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = conn.read(&mut buf).await;
                let _ = conn.write_all(response).await;
                let _ = conn.flush().await;
                // Keep the connection open; the prober must not see a reset.
                tokio::time::sleep(Duration::from_secs(10)).await;
            });
        }
    });
    addr
}

// ── SOCKS5 client helpers ──

async fn socks_connect(proxy: SocketAddr, host: &str, port: u16) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    assert_eq!(reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(std::io::Error::other(format!("socks reply {:#x}", head[1])));
    }
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => panic!("unexpected atyp {other:#x}"),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;
    Ok(stream)
}

async fn socks_udp_associate(proxy: SocketAddr) -> (TcpStream, SocketAddr) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();

    let request = [0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
    stream.write_all(&request).await.unwrap();

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1], 0x00);
    assert_eq!(head[3], 0x01);
    let mut rest = [0u8; 6];
    stream.read_exact(&mut rest).await.unwrap();
    let relay = SocketAddr::from((
        [rest[0], rest[1], rest[2], rest[3]],
        u16::from_be_bytes([rest[4], rest[5]]),
    ));
    (stream, relay)
}

fn socks_udp_frame(host: [u8; 4], port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0, 0, 0, 0x01];
    frame.extend_from_slice(&host);
    frame.extend_from_slice(&port.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

// ── scenarios ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_through_tunnel() {
    let root = CancellationToken::new();
    let origin = spawn_static_origin(b"HTTP/1.0 200 OK\r\n\r\nHELLO").await;

    let cert = make_cert("connect");
    let server_port = free_port().await;
    spawn_proxy(server_config(server_port, &cert, origin.port()), &root).await;
    wait_for_tcp(SocketAddr::from(([127, 0, 0, 1], server_port))).await;

    let client_port = free_port().await;
    spawn_proxy(client_config(client_port, server_port), &root).await;
    let client_addr = SocketAddr::from(([127, 0, 0, 1], client_port));
    wait_for_tcp(client_addr).await;

    let mut stream = socks_connect(client_addr, "127.0.0.1", origin.port())
        .await
        .unwrap();
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while response.len() < 24 {
        let n = tokio::time::timeout_at(deadline, stream.read(&mut buf))
            .await
            .expect("response in time")
            .unwrap();
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&response, b"HTTP/1.0 200 OK\r\n\r\nHELLO");

    root.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn probe_sees_only_the_decoy() {
    let root = CancellationToken::new();
    let decoy = spawn_static_origin(b"HTTP/1.0 200 OK\r\n\r\n<html>decoy</html>").await;

    let cert = make_cert("probe");
    let server_port = free_port().await;
    spawn_proxy(server_config(server_port, &cert, decoy.port()), &root).await;
    let server_addr = SocketAddr::from(([127, 0, 0, 1], server_port));
    wait_for_tcp(server_addr).await;

    // Valid TLS, then 57 junk bytes + CRLF: not a registered hash.
    let tls_config = trident_tunnel::tls::build_client_config(&trident_tunnel::tls::TlsClientOptions {
        sni: "localhost".into(),
        verify: false,
        ..Default::default()
    })
    .unwrap();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
    let tcp = TcpStream::connect(server_addr).await.unwrap();
    let sni = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(sni, tcp).await.unwrap();

    let mut probe = vec![b'Z'; 57];
    probe.extend_from_slice(b"\r\n");
    tls.write_all(&probe).await.unwrap();

    // The prober receives the decoy page, not an error or a reset.
    let mut page = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while page.len() < 38 {
        let n = tokio::time::timeout_at(deadline, tls.read(&mut buf))
            .await
            .expect("decoy bytes in time")
            .unwrap();
        if n == 0 {
            break;
        }
        page.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&page, b"HTTP/1.0 200 OK\r\n\r\n<html>decoy</html>");

    root.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn router_block_opens_no_outbound() {
    let root = CancellationToken::new();

    // The "server" is a listener that must never see a connection.
    let trap = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let trap_addr = trap.local_addr().unwrap();
    let touched = Arc::new(AtomicUsize::new(0));
    {
        let touched = touched.clone();
        tokio::spawn(async move {
            while trap.accept().await.is_ok() {
                touched.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let client_port = free_port().await;
    let mut cfg = client_config(client_port, trap_addr.port());
    cfg.router.enabled = true;
    cfg.router.block = vec!["domain:blocked.test".into()];
    spawn_proxy(cfg, &root).await;
    let client_addr = SocketAddr::from(([127, 0, 0, 1], client_port));
    wait_for_tcp(client_addr).await;

    // Blocked destination: the client sees REP=0x02 and nothing dials out.
    let err = socks_connect(client_addr, "blocked.test", 443)
        .await
        .expect_err("blocked CONNECT must not succeed");
    assert!(
        err.to_string().contains("0x2"),
        "expected connection-not-allowed reply, got: {err}"
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(touched.load(Ordering::SeqCst), 0, "no outbound socket");

    root.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_associate_echo() {
    let root = CancellationToken::new();

    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, peer)) = echo.recv_from(&mut buf).await else {
                break;
            };
            let _ = echo.send_to(&buf[..n], peer).await;
        }
    });

    let decoy = spawn_static_origin(b"nothing here").await;
    let cert = make_cert("udp");
    let server_port = free_port().await;
    spawn_proxy(server_config(server_port, &cert, decoy.port()), &root).await;
    wait_for_tcp(SocketAddr::from(([127, 0, 0, 1], server_port))).await;

    let client_port = free_port().await;
    spawn_proxy(client_config(client_port, server_port), &root).await;
    let client_addr = SocketAddr::from(([127, 0, 0, 1], client_port));
    wait_for_tcp(client_addr).await;

    let (_control, relay) = socks_udp_associate(client_addr).await;
    let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let frame = socks_udp_frame([127, 0, 0, 1], echo_addr.port(), b"PING");
    local.send_to(&frame, relay).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), local.recv_from(&mut buf))
        .await
        .expect("echo reply in time")
        .unwrap();
    // Reply comes back with the SOCKS UDP header; payload is at the tail.
    assert!(buf[..n].ends_with(b"PING"));

    root.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mux_bounds_underlying_connections() {
    let root = CancellationToken::new();
    let origin = spawn_static_origin(b"HTTP/1.0 200 OK\r\n\r\nMUXED").await;

    let cert = make_cert("mux");
    let server_port = free_port().await;
    spawn_proxy(server_config(server_port, &cert, origin.port()), &root).await;
    let server_addr = SocketAddr::from(([127, 0, 0, 1], server_port));
    wait_for_tcp(server_addr).await;

    // Count underlying TCP connections by interposing a forwarder.
    let forwarder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let forwarder_port = forwarder.local_addr().unwrap().port();
    let underlying = Arc::new(AtomicUsize::new(0));
    {
        let underlying = underlying.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut inbound, _)) = forwarder.accept().await else {
                    break;
                };
                underlying.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(server_addr).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
            }
        });
    }

    let client_port = free_port().await;
    let mut cfg = client_config(client_port, forwarder_port);
    cfg.tcp.mux.enabled = true;
    cfg.tcp.mux.concurrency = 4;
    spawn_proxy(cfg, &root).await;
    let client_addr = SocketAddr::from(([127, 0, 0, 1], client_port));
    wait_for_tcp(client_addr).await;

    // Eight simultaneous logical streams, held open together.
    let mut streams = Vec::new();
    for _ in 0..8 {
        let mut stream = socks_connect(client_addr, "127.0.0.1", origin.port())
            .await
            .unwrap();
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        streams.push(stream);
    }
    for stream in &mut streams {
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("response in time")
            .unwrap();
        assert!(n > 0);
    }

    let conns = underlying.load(Ordering::SeqCst);
    assert!(conns >= 1, "mux must open at least one session");
    assert!(
        conns <= 2,
        "8 streams at concurrency 4 need at most 2 sessions, saw {conns}"
    );

    root.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_is_idempotent_and_unblocks() {
    let root = CancellationToken::new();
    let origin = spawn_static_origin(b"x").await;

    let cert = make_cert("shutdown");
    let server_port = free_port().await;
    let proxy = Arc::new(
        build_proxy(&server_config(server_port, &cert, origin.port()), &root)
            .await
            .unwrap(),
    );
    let runner = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.run().await })
    };
    wait_for_tcp(SocketAddr::from(([127, 0, 0, 1], server_port))).await;

    proxy.close();
    proxy.close(); // second close is a no-op

    tokio::time::timeout(Duration::from_secs(1), runner)
        .await
        .expect("run() returns within a second of close")
        .unwrap();
}
