//! Stack composition and the relay engine.
//!
//! The proxy pairs every inbound flow from the source acceptors with an
//! outbound flow from the sink client: streams get a bidirectional byte
//! relay, datagram endpoints get a copy loop per direction. A single
//! process-wide cancellation token roots all lifetimes; closing is
//! idempotent and unblocks every accept loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trident_auth::{Authenticator, MemoryAuthenticator, sha224_hex, spawn_stat_flusher};
use trident_config::{Config, RunType};
use trident_core::defaults::{
    DEFAULT_RELAY_BUFFER_SIZE, DEFAULT_TCP_TIMEOUT_SECS, DEFAULT_UDP_TIMEOUT_SECS, MAX_PACKET_SIZE,
};
use trident_core::{Traffic, relay_stream};
use trident_metrics::{
    record_bytes_rx, record_bytes_tx, record_connection_close, record_connection_open,
    record_udp_packet,
};
use trident_proto::Address;
use trident_router::{DomainStrategy, GeodataLoader, Policy, RouterBuilder, RouterClient};
use trident_tunnel::adapter::Adapter;
use trident_tunnel::forward::ForwardServer;
use trident_tunnel::freedom::FreedomClient;
use trident_tunnel::mux::{MuxAcceptor, MuxConnector, MuxOptions};
use trident_tunnel::redirector::Redirector;
use trident_tunnel::shadowsocks::{Method, ShadowsocksClient, ShadowsocksServer};
use trident_tunnel::simplesocks::{SimpleSocksClient, SimpleSocksServer};
use trident_tunnel::tls::{TlsClient, TlsClientOptions, TlsServer, TlsServerOptions};
use trident_tunnel::transport::{TcpOptions, TransportClient, TransportServer};
use trident_tunnel::trojan::{TrojanClient, TrojanServer, TrojanServerOptions};
use trident_tunnel::websocket::{WebsocketClient, WebsocketOptions, WebsocketServer};
use trident_tunnel::{PacketConn, TunnelClient, TunnelError, TunnelServer};

/// The running relay: source acceptors coupled to one sink client.
pub struct Proxy {
    sources: Vec<Arc<dyn TunnelServer>>,
    sink: Arc<dyn TunnelClient>,
    shutdown: CancellationToken,
}

impl Proxy {
    pub fn new(
        sources: Vec<Arc<dyn TunnelServer>>,
        sink: Arc<dyn TunnelClient>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sources,
            sink,
            shutdown,
        }
    }

    /// Run the relay loops until the root token fires.
    pub async fn run(&self) {
        for source in &self.sources {
            tokio::spawn(relay_stream_loop(
                source.clone(),
                self.sink.clone(),
                self.shutdown.clone(),
            ));
            tokio::spawn(relay_packet_loop(
                source.clone(),
                self.sink.clone(),
                self.shutdown.clone(),
            ));
        }
        self.shutdown.cancelled().await;
        debug!("proxy shut down");
    }

    /// Cancel everything and close the stacks. Safe to call repeatedly.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.sink.close();
        for source in &self.sources {
            source.close();
        }
    }
}

/// Relay accounting sink feeding the process-wide byte counters.
struct MetricsTraffic;

impl Traffic for MetricsTraffic {
    fn add_tx(&self, bytes: u64) {
        record_bytes_tx(bytes);
    }
    fn add_rx(&self, bytes: u64) {
        record_bytes_rx(bytes);
    }
}

async fn relay_stream_loop(
    source: Arc<dyn TunnelServer>,
    sink: Arc<dyn TunnelClient>,
    shutdown: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = source.accept_stream() => match result {
                Ok(conn) => conn,
                Err(TunnelError::Closed) | Err(TunnelError::NotSupported(_)) => break,
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    warn!(error = %e, "failed to accept stream");
                    continue;
                }
            },
        };

        let sink = sink.clone();
        tokio::spawn(async move {
            let mut conn = conn;
            let target = conn.metadata().address.clone();
            let outbound = match sink.dial_stream(&target).await {
                Ok(outbound) => outbound,
                Err(e) => {
                    debug!(target = %target, error = %e, "proxy failed to dial");
                    // Entry adapters with a deferred reply report the real
                    // failure code before the connection closes.
                    conn.dial_failed(&e).await;
                    return;
                }
            };
            if let Err(e) = conn.dial_ready().await {
                debug!(target = %target, error = %e, "entry reply failed");
                return;
            }

            record_connection_open();
            let result = relay_stream(
                conn,
                outbound,
                Duration::from_secs(DEFAULT_TCP_TIMEOUT_SECS),
                DEFAULT_RELAY_BUFFER_SIZE,
                &MetricsTraffic,
            )
            .await;
            record_connection_close();

            match result {
                Ok(stats) => {
                    debug!(target = %target, tx = stats.tx, rx = stats.rx, "relay ended")
                }
                Err(e) => debug!(target = %target, error = %e, "relay ended with error"),
            }
        });
    }
    debug!("stream relay loop exiting");
}

async fn relay_packet_loop(
    source: Arc<dyn TunnelServer>,
    sink: Arc<dyn TunnelClient>,
    shutdown: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = source.accept_packet() => match result {
                Ok(conn) => conn,
                Err(TunnelError::Closed) | Err(TunnelError::NotSupported(_)) => break,
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    warn!(error = %e, "failed to accept packet conn");
                    continue;
                }
            },
        };

        let sink = sink.clone();
        tokio::spawn(async move {
            let outbound = match sink.dial_packet().await {
                Ok(outbound) => outbound,
                Err(e) => {
                    debug!(error = %e, "proxy failed to dial packet conn");
                    return;
                }
            };
            relay_packets(Arc::from(inbound), Arc::from(outbound)).await;
        });
    }
    debug!("packet relay loop exiting");
}

/// Couple two datagram endpoints until either side closes or goes idle.
async fn relay_packets(inbound: Arc<dyn PacketConn>, outbound: Arc<dyn PacketConn>) {
    let done = CancellationToken::new();

    let forward = {
        let inbound = inbound.clone();
        let outbound = outbound.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let _guard = done.clone().drop_guard();
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            let idle = Duration::from_secs(DEFAULT_UDP_TIMEOUT_SECS);
            loop {
                let read = tokio::select! {
                    _ = done.cancelled() => return,
                    read = tokio::time::timeout(idle, inbound.read_from(&mut buf)) => read,
                };
                let (n, addr) = match read {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        debug!(error = %e, "packet relay inbound ended");
                        return;
                    }
                    Err(_) => {
                        debug!("packet relay idle timeout");
                        return;
                    }
                };
                if n == 0 {
                    return;
                }
                record_udp_packet("tx");
                if let Err(e) = outbound.write_to(&buf[..n], &addr).await {
                    debug!(error = %e, "packet relay outbound write failed");
                    return;
                }
            }
        })
    };

    let backward = {
        let done = done.clone();
        tokio::spawn(async move {
            let _guard = done.clone().drop_guard();
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                let read = tokio::select! {
                    _ = done.cancelled() => return,
                    read = outbound.read_from(&mut buf) => read,
                };
                let (n, addr) = match read {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "packet relay outbound ended");
                        return;
                    }
                };
                record_udp_packet("rx");
                if let Err(e) = inbound.write_to(&buf[..n], &addr).await {
                    debug!(error = %e, "packet relay inbound write failed");
                    return;
                }
            }
        })
    };

    let _ = forward.await;
    let _ = backward.await;
    debug!("packet relay ended");
}

// ── stack composition ──

/// Build the tunnel stack and relay for the configured role.
pub async fn build_proxy(
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<Proxy, TunnelError> {
    match config.run_type {
        RunType::Server => build_server(config, shutdown).await,
        RunType::Client => build_client(config, shutdown, EntryMode::Adapter).await,
        RunType::Forward | RunType::Nat => {
            build_client(config, shutdown, EntryMode::Forward).await
        }
        RunType::Custom => Err(TunnelError::Config(
            "run_type \"custom\" is not supported".into(),
        )),
    }
}

enum EntryMode {
    Adapter,
    Forward,
}

fn tcp_options(config: &Config) -> TcpOptions {
    TcpOptions {
        no_delay: config.tcp.no_delay,
        keepalive_secs: config.tcp.keep_alive_secs,
        prefer_ipv4: config.tcp.prefer_ipv4,
    }
}

async fn build_server(config: &Config, shutdown: &CancellationToken) -> Result<Proxy, TunnelError> {
    let opts = tcp_options(config);
    let fallback = config.fallback_endpoint();
    let redirector = Redirector::new(shutdown.child_token());

    let transport: Arc<dyn TunnelServer> = Arc::new(
        TransportServer::bind(&config.local_endpoint(), opts.clone(), shutdown.child_token())
            .await?,
    );
    info!(listen = %config.local_endpoint(), "server listening");

    let tls = TlsServer::new(
        transport,
        TlsServerOptions {
            cert_path: config.ssl.cert.clone(),
            key_path: config.ssl.key.clone(),
            alpn: config.ssl.alpn.clone(),
            handshake_timeout: Duration::from_secs(
                trident_core::defaults::DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS,
            ),
            fallback: fallback.clone(),
        },
        redirector.clone(),
        shutdown,
    )?;

    let mut below_trojan: Arc<dyn TunnelServer> = tls;

    if config.websocket.enabled {
        below_trojan = WebsocketServer::new(
            below_trojan,
            WebsocketOptions {
                path: config.websocket.path.clone(),
                host: config.websocket.host.clone(),
                fallback: fallback.clone(),
            },
            redirector.clone(),
            shutdown,
        );
    }

    if config.shadowsocks.enabled {
        below_trojan = ShadowsocksServer::new(
            below_trojan,
            Method::from_name(&config.shadowsocks.method)?,
            &config.shadowsocks.password,
            shutdown,
        );
    }

    let auth: Arc<dyn Authenticator> =
        Arc::new(MemoryAuthenticator::from_passwords(&config.password));
    spawn_stat_flusher(
        auth.clone(),
        Duration::from_secs(config.stat_flush_secs),
        shutdown.child_token(),
    );
    let trojan = TrojanServer::new(
        below_trojan,
        auth,
        redirector,
        TrojanServerOptions {
            fallback,
            ..TrojanServerOptions::default()
        },
        shutdown,
    );

    // Mux-command streams always demultiplex server-side; the client
    // decides whether to use them.
    let mux = MuxAcceptor::new(trojan.clone(), shutdown);
    let simplesocks = SimpleSocksServer::new(mux, shutdown);

    let sink: Arc<dyn TunnelClient> = Arc::new(FreedomClient::new(opts, shutdown));
    let sources: Vec<Arc<dyn TunnelServer>> = vec![trojan, simplesocks];
    Ok(Proxy::new(sources, sink, shutdown.clone()))
}

async fn build_client(
    config: &Config,
    shutdown: &CancellationToken,
    entry: EntryMode,
) -> Result<Proxy, TunnelError> {
    let opts = tcp_options(config);

    let transport: Arc<dyn TunnelClient> = Arc::new(TransportClient::new(
        config.remote_endpoint(),
        opts.clone(),
        shutdown.child_token(),
    ));

    let sni = if config.ssl.sni.is_empty() {
        config.remote_addr.clone()
    } else {
        config.ssl.sni.clone()
    };
    let mut below_trojan: Arc<dyn TunnelClient> = TlsClient::new(
        transport,
        TlsClientOptions {
            sni,
            verify: config.ssl.verify,
            ca_path: (!config.ssl.cert.is_empty()).then(|| config.ssl.cert.clone()),
            alpn: config.ssl.alpn.clone(),
            fingerprint: config.ssl.fingerprint.clone(),
            cipher: config
                .ssl
                .cipher
                .split(':')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            key_log_path: config.ssl.key_log.clone(),
            reuse_session: config.ssl.reuse_session,
            ..TlsClientOptions::default()
        },
        shutdown,
    )?;

    if config.websocket.enabled {
        let host = if config.websocket.host.is_empty() {
            config.remote_addr.clone()
        } else {
            config.websocket.host.clone()
        };
        below_trojan = WebsocketClient::new(
            below_trojan,
            WebsocketOptions {
                path: config.websocket.path.clone(),
                host,
                fallback: None,
            },
            shutdown,
        );
    }

    if config.shadowsocks.enabled {
        below_trojan = ShadowsocksClient::new(
            below_trojan,
            Method::from_name(&config.shadowsocks.method)?,
            &config.shadowsocks.password,
            shutdown,
        );
    }

    let password = config
        .password
        .first()
        .ok_or_else(|| TunnelError::Config("client requires a password".into()))?;
    let trojan = TrojanClient::new(below_trojan, sha224_hex(password), shutdown);

    let mut sink: Arc<dyn TunnelClient> = if config.tcp.mux.enabled {
        let mux = MuxConnector::new(
            trojan,
            MuxOptions {
                concurrency: config.tcp.mux.concurrency,
                idle_timeout: Duration::from_secs(config.tcp.mux.idle_timeout),
            },
            shutdown,
        );
        SimpleSocksClient::new(mux, shutdown)
    } else {
        trojan
    };

    if config.router.enabled {
        sink = build_router(config, sink, shutdown)?;
    }

    let source: Arc<dyn TunnelServer> = match entry {
        EntryMode::Adapter => {
            let adapter = Adapter::bind(&config.local_endpoint(), opts, shutdown).await?;
            info!(listen = %adapter.local_addr(), "local entry listening");
            adapter
        }
        EntryMode::Forward => {
            let target = forward_target(config)?;
            info!(listen = %config.local_endpoint(), target = %target, "forward entry listening");
            ForwardServer::bind(&config.local_endpoint(), target, opts, shutdown).await?
        }
    };

    Ok(Proxy::new(vec![source], sink, shutdown.clone()))
}

fn forward_target(config: &Config) -> Result<Address, TunnelError> {
    let (host, port) = (&config.target_addr, config.target_port);
    if host.is_empty() || port == 0 {
        return Err(TunnelError::Config(
            "forward mode requires target_addr and target_port".into(),
        ));
    }
    if let Ok(ip) = host.parse() {
        return Ok(Address::from_ip(ip, port));
    }
    Address::domain(host.clone(), port).map_err(TunnelError::Proto)
}

fn build_router(
    config: &Config,
    proxy: Arc<dyn TunnelClient>,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn TunnelClient>, TunnelError> {
    let default_policy = Policy::from_name(&config.router.default_policy)
        .map_err(|e| TunnelError::Config(e.to_string()))?;
    let strategy = DomainStrategy::from_name(&config.router.domain_strategy)
        .map_err(|e| TunnelError::Config(e.to_string()))?;

    let mut geodata = GeodataLoader::new(config.router.geoip.clone(), config.router.geosite.clone());
    let mut builder = RouterBuilder::new(default_policy, strategy);
    builder
        .add_rules(Policy::Block, &config.router.block, &mut geodata)
        .map_err(|e| TunnelError::Config(e.to_string()))?;
    builder
        .add_rules(Policy::Bypass, &config.router.bypass, &mut geodata)
        .map_err(|e| TunnelError::Config(e.to_string()))?;
    builder
        .add_rules(Policy::Proxy, &config.router.proxy, &mut geodata)
        .map_err(|e| TunnelError::Config(e.to_string()))?;
    let router = Arc::new(builder.build());
    info!(default = ?default_policy, "router enabled");

    let direct = Arc::new(FreedomClient::new(tcp_options(config), shutdown));
    Ok(RouterClient::new(router, proxy, direct, shutdown))
}
