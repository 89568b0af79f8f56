//! Configuration type definitions.
//!
//! Key names follow the deployed trojan configuration format so existing
//! files keep working.

use serde::{Deserialize, Serialize};

use crate::defaults::*;

/// What role this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Client,
    Server,
    Forward,
    Nat,
    Custom,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunType::Client => "client",
            RunType::Server => "server",
            RunType::Forward => "forward",
            RunType::Nat => "nat",
            RunType::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub run_type: RunType,
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    pub local_port: u16,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub remote_port: u16,
    /// Forward/nat modes: the fixed destination every local flow targets.
    #[serde(default)]
    pub target_addr: String,
    #[serde(default)]
    pub target_port: u16,
    /// Accepted (server) or presented (client) passwords.
    #[serde(default)]
    pub password: Vec<String>,
    /// 0=debug 1=info 2=warn 3=error 4=fatal 5=off.
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    /// Append log destination; stdout when unset.
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(default)]
    pub shadowsocks: ShadowsocksConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Traffic counter flush interval in seconds.
    #[serde(default = "default_stat_flush_secs")]
    pub stat_flush_secs: u64,
}

/// TLS settings for both sides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SslConfig {
    /// TLS SNI; defaults to `remote_addr` on the client.
    #[serde(default)]
    pub sni: String,
    /// Server certificate chain (PEM). On the client, an extra root CA.
    #[serde(default)]
    pub cert: String,
    /// Server private key (PEM).
    #[serde(default)]
    pub key: String,
    /// Client-side certificate verification toggle.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// ClientHello profile: `firefox | chrome | ios | ""`.
    #[serde(default)]
    pub fingerprint: String,
    /// Preferred cipher suites as a colon-separated list; empty keeps the
    /// library defaults.
    #[serde(default)]
    pub cipher: String,
    /// ALPN protocols to offer/advertise.
    #[serde(default)]
    pub alpn: Vec<String>,
    /// Reuse TLS session tickets on the client.
    #[serde(default = "default_true")]
    pub reuse_session: bool,
    /// Redirection endpoint for failed handshakes / failed authentication.
    #[serde(default)]
    pub fallback_addr: String,
    #[serde(default)]
    pub fallback_port: u16,
    /// TLS key log file for debugging; unset disables.
    #[serde(default)]
    pub key_log: Option<String>,
}

/// TCP socket options plus the mux block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_true")]
    pub no_delay: bool,
    /// Keepalive interval in seconds (0 = disabled).
    #[serde(default = "default_keepalive_secs")]
    pub keep_alive_secs: u64,
    /// Prefer IPv4 when resolving outbound names.
    #[serde(default)]
    pub prefer_ipv4: bool,
    #[serde(default)]
    pub mux: MuxConfig,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            keep_alive_secs: default_keepalive_secs(),
            prefer_ipv4: false,
            mux: MuxConfig::default(),
        }
    }
}

/// Stream multiplexing over a single tunnel connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Logical streams per underlying session.
    #[serde(default = "default_mux_concurrency")]
    pub concurrency: usize,
    /// Seconds before an idle session is torn down.
    #[serde(default = "default_mux_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: default_mux_concurrency(),
            idle_timeout: default_mux_idle_timeout(),
        }
    }
}

/// Optional WebSocket framing for CDN-friendly deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ws_path")]
    pub path: String,
    /// Host header; defaults to the SNI / remote address.
    #[serde(default)]
    pub host: String,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_ws_path(),
            host: String::new(),
        }
    }
}

/// Optional AEAD layer stacked with the trojan framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowsocksConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `aes-128-gcm | aes-256-gcm | chacha20-ietf-poly1305`.
    #[serde(default = "default_ss_method")]
    pub method: String,
    #[serde(default)]
    pub password: String,
}

impl Default for ShadowsocksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: default_ss_method(),
            password: String::new(),
        }
    }
}

/// Client-side policy router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `proxy | bypass | block`.
    #[serde(default = "default_router_policy")]
    pub default_policy: String,
    /// `as_is | ip_if_non_match | ip_on_demand`.
    #[serde(default = "default_domain_strategy")]
    pub domain_strategy: String,
    #[serde(default)]
    pub proxy: Vec<String>,
    #[serde(default)]
    pub bypass: Vec<String>,
    #[serde(default)]
    pub block: Vec<String>,
    #[serde(default = "default_geoip_path")]
    pub geoip: String,
    #[serde(default = "default_geosite_path")]
    pub geosite: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_policy: default_router_policy(),
            domain_strategy: default_domain_strategy(),
            proxy: Vec::new(),
            bypass: Vec::new(),
            block: Vec::new(),
            geoip: default_geoip_path(),
            geosite: default_geosite_path(),
        }
    }
}

/// Management endpoint; exposes the Prometheus metrics exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_addr")]
    pub api_addr: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_addr: default_api_addr(),
            api_port: default_api_port(),
        }
    }
}

impl Config {
    /// `local_addr:local_port` as a single endpoint string.
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_addr, self.local_port)
    }

    /// `remote_addr:remote_port` as a single endpoint string.
    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.remote_addr, self.remote_port)
    }

    /// `fallback_addr:fallback_port`, or `None` when no fallback is set.
    pub fn fallback_endpoint(&self) -> Option<String> {
        if self.ssl.fallback_port == 0 {
            return None;
        }
        let host = if self.ssl.fallback_addr.is_empty() {
            "127.0.0.1"
        } else {
            &self.ssl.fallback_addr
        };
        Some(format!("{}:{}", host, self.ssl.fallback_port))
    }
}
