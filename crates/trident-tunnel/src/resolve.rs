//! Outbound name resolution.

use std::net::SocketAddr;

use trident_proto::{Address, Host};

use crate::TunnelError;

/// Resolve a `host:port` endpoint string.
///
/// When `prefer_ipv4` is set, an IPv4 result wins over the first result.
pub async fn resolve_endpoint(target: &str, prefer_ipv4: bool) -> Result<SocketAddr, TunnelError> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(target)
        .await
        .map_err(|_| TunnelError::Resolve(target.to_string()))?
        .collect();
    if prefer_ipv4 {
        if let Some(v4) = addrs.iter().find(|a| a.is_ipv4()) {
            return Ok(*v4);
        }
    }
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| TunnelError::Resolve(target.to_string()))
}

/// Resolve a tunnel [`Address`] to a socket address.
pub async fn resolve_address(
    address: &Address,
    prefer_ipv4: bool,
) -> Result<SocketAddr, TunnelError> {
    match &address.host {
        Host::Ipv4(ip) => Ok(SocketAddr::from((*ip, address.port))),
        Host::Ipv6(ip) => Ok(SocketAddr::from((*ip, address.port))),
        Host::Domain(domain) => {
            resolve_endpoint(&format!("{}:{}", domain, address.port), prefer_ipv4).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_addresses_skip_dns() {
        let addr = resolve_endpoint("127.0.0.1:8080", false).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());

        let addr = resolve_endpoint("[::1]:443", false).await.unwrap();
        assert_eq!(addr, "[::1]:443".parse().unwrap());
    }

    #[tokio::test]
    async fn ip_addresses_resolve_directly() {
        let address = Address::from_ip([10, 0, 0, 1].into(), 80);
        let addr = resolve_address(&address, false).await.unwrap();
        assert_eq!(addr, "10.0.0.1:80".parse().unwrap());
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let address = Address::domain("localhost", 80).unwrap();
        let addr = resolve_address(&address, true).await.unwrap();
        assert_eq!(addr.port(), 80);
        assert!(addr.ip().is_loopback());
    }
}
