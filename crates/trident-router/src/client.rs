//! Routing tunnel client: dispatches each flow to the proxy, a direct
//! dialer, or nowhere.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trident_metrics::record_router_blocked;
use trident_proto::Address;
use trident_tunnel::freedom::FreedomClient;
use trident_tunnel::{BoxPacketConn, PacketConn, StreamConn, TunnelClient, TunnelError};

use crate::rule::Policy;
use crate::router::Router;

/// Wraps the proxy client; selected destinations go direct or are dropped.
pub struct RouterClient {
    router: Arc<Router>,
    proxy: Arc<dyn TunnelClient>,
    direct: Arc<FreedomClient>,
    shutdown: CancellationToken,
}

impl RouterClient {
    pub fn new(
        router: Arc<Router>,
        proxy: Arc<dyn TunnelClient>,
        direct: Arc<FreedomClient>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            proxy,
            direct,
            shutdown: parent.child_token(),
        })
    }
}

#[async_trait]
impl TunnelClient for RouterClient {
    async fn dial_stream(&self, addr: &Address) -> Result<StreamConn, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        match self.router.route(addr).await {
            Policy::Proxy => self.proxy.dial_stream(addr).await,
            Policy::Bypass => self.direct.dial_stream(addr).await,
            Policy::Block => {
                record_router_blocked();
                debug!(target = %addr, "blocked by router");
                Err(TunnelError::Blocked(addr.clone()))
            }
        }
    }

    async fn dial_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let proxy = self.proxy.dial_packet().await?;
        let direct = self.direct.dial_packet().await?;
        Ok(Box::new(RoutedPacketConn {
            router: self.router.clone(),
            proxy,
            direct,
        }))
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.proxy.close();
        self.direct.close();
    }
}

/// Datagram endpoint dispatching per-datagram by policy. Both legs are
/// dialed up front so replies from either side can be awaited together.
struct RoutedPacketConn {
    router: Arc<Router>,
    proxy: BoxPacketConn,
    direct: BoxPacketConn,
}

#[async_trait]
impl PacketConn for RoutedPacketConn {
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Address), TunnelError> {
        // Replies may arrive on either leg. Each leg reads into its own
        // scratch buffer so both futures can be polled concurrently; the
        // winner's bytes are copied into the caller's buffer.
        let mut proxy_buf = vec![0u8; buf.len()];
        let mut direct_buf = vec![0u8; buf.len()];
        let (n, addr) = tokio::select! {
            result = self.proxy.read_from(&mut proxy_buf) => {
                let (n, addr) = result?;
                buf[..n].copy_from_slice(&proxy_buf[..n]);
                (n, addr)
            }
            result = self.direct.read_from(&mut direct_buf) => {
                let (n, addr) = result?;
                buf[..n].copy_from_slice(&direct_buf[..n]);
                (n, addr)
            }
        };
        Ok((n, addr))
    }

    async fn write_to(&self, buf: &[u8], addr: &Address) -> Result<usize, TunnelError> {
        match self.router.route(addr).await {
            Policy::Proxy => self.proxy.write_to(buf, addr).await,
            Policy::Bypass => self.direct.write_to(buf, addr).await,
            Policy::Block => {
                record_router_blocked();
                debug!(target = %addr, "datagram blocked by router");
                Ok(buf.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodata::GeodataLoader;
    use crate::router::RouterBuilder;
    use crate::rule::DomainStrategy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trident_proto::Metadata;

    /// Counts dial attempts; never actually connects anywhere.
    struct CountingClient {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl TunnelClient for CountingClient {
        async fn dial_stream(&self, addr: &Address) -> Result<StreamConn, TunnelError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (near, _far) = tokio::io::duplex(64);
            Ok(StreamConn::new(near, Metadata::connect(addr.clone())))
        }

        async fn dial_packet(&self) -> Result<BoxPacketConn, TunnelError> {
            Err(TunnelError::NotSupported("packets"))
        }

        fn close(&self) {}
    }

    fn blocked_router() -> Arc<Router> {
        let mut builder = RouterBuilder::new(Policy::Proxy, DomainStrategy::AsIs);
        let mut geodata = GeodataLoader::new("/nonexistent", "/nonexistent");
        builder
            .add_rules(Policy::Block, &["domain:blocked.test"], &mut geodata)
            .unwrap();
        Arc::new(builder.build())
    }

    #[tokio::test]
    async fn blocked_destination_never_dials() {
        let root = CancellationToken::new();
        let proxy = Arc::new(CountingClient {
            dials: AtomicUsize::new(0),
        });
        let direct = Arc::new(FreedomClient::new(Default::default(), &root));
        let client = RouterClient::new(blocked_router(), proxy.clone(), direct, &root);

        let blocked = Address::domain("blocked.test", 443).unwrap();
        let result = client.dial_stream(&blocked).await;
        assert!(matches!(result, Err(TunnelError::Blocked(_))));
        assert_eq!(proxy.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn default_policy_dials_the_proxy() {
        let root = CancellationToken::new();
        let proxy = Arc::new(CountingClient {
            dials: AtomicUsize::new(0),
        });
        let direct = Arc::new(FreedomClient::new(Default::default(), &root));
        let client = RouterClient::new(blocked_router(), proxy.clone(), direct, &root);

        let allowed = Address::domain("other.test", 443).unwrap();
        client.dial_stream(&allowed).await.unwrap();
        assert_eq!(proxy.dials.load(Ordering::SeqCst), 1);
    }
}
