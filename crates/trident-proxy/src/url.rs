//! Share-URL mode: build a client configuration from a `trojan://` link.
//!
//! Recognized link shape:
//!
//! ```text
//! trojan://password@host:port?sni=...&type=ws&host=...&path=...&encryption=ss;method:password#name
//! ```
//!
//! Extra knobs ride in the `-url-option` list (`k=v;k=v`): `mux=true|false`,
//! `listen=host:port`, `api=host:port`.

use trident_config::{Config, ConfigError, RunType};

/// Parse a trojan share URL plus url-options into a client config.
pub fn parse_share_url(url: &str, options: &str) -> Result<Config, ConfigError> {
    let rest = url
        .strip_prefix("trojan-go://")
        .or_else(|| url.strip_prefix("trojan://"))
        .ok_or_else(|| ConfigError::Invalid(format!("not a trojan url: {url:?}")))?;

    // Strip the display-name fragment, then split off the query.
    let rest = rest.split('#').next().unwrap_or(rest);
    let (authority, query) = match rest.split_once('?') {
        Some((a, q)) => (a, Some(q)),
        None => (rest, None),
    };

    let (password, endpoint) = authority
        .rsplit_once('@')
        .ok_or_else(|| ConfigError::Invalid("url is missing the password".into()))?;
    let password = percent_decode(password)?;
    if password.is_empty() {
        return Err(ConfigError::Invalid("url has an empty password".into()));
    }

    let (host, port) = split_endpoint(endpoint, 443)?;

    let mut config: Config = default_client_config();
    config.remote_addr = host;
    config.remote_port = port;
    config.password = vec![password];

    if let Some(query) = query {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = percent_decode(value)?;
            match key {
                "sni" => config.ssl.sni = value,
                "type" => {
                    if value == "ws" {
                        config.websocket.enabled = true;
                    }
                }
                "host" => config.websocket.host = value,
                "path" => config.websocket.path = value,
                "encryption" => {
                    if let Some(spec) = value.strip_prefix("ss;") {
                        let (method, password) =
                            spec.split_once(':').ok_or_else(|| {
                                ConfigError::Invalid(format!("bad encryption spec {value:?}"))
                            })?;
                        config.shadowsocks.enabled = true;
                        config.shadowsocks.method = method.to_string();
                        config.shadowsocks.password = password.to_string();
                    }
                }
                _ => {}
            }
        }
    }

    for pair in options.split(';').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::Invalid(format!("bad url option {pair:?}")))?;
        match key {
            "mux" => {
                config.tcp.mux.enabled = value
                    .parse()
                    .map_err(|_| ConfigError::Invalid(format!("bad mux value {value:?}")))?;
            }
            "listen" => {
                let (host, port) = split_endpoint(value, 1080)?;
                config.local_addr = host;
                config.local_port = port;
            }
            "api" => {
                let (host, port) = split_endpoint(value, 0)?;
                config.api.enabled = true;
                config.api.api_addr = host;
                config.api.api_port = port;
            }
            other => {
                return Err(ConfigError::Invalid(format!("unknown url option {other:?}")));
            }
        }
    }

    Ok(config)
}

fn default_client_config() -> Config {
    // The smallest valid client config; flags and options fill the rest.
    serde_json::from_value(serde_json::json!({
        "run_type": "client",
        "local_addr": "127.0.0.1",
        "local_port": 1080,
    }))
    .expect("static default config")
}

fn split_endpoint(endpoint: &str, default_port: u16) -> Result<(String, u16), ConfigError> {
    if let Some(stripped) = endpoint.strip_prefix('[') {
        let Some(end) = stripped.find(']') else {
            return Err(ConfigError::Invalid(format!("bad endpoint {endpoint:?}")));
        };
        let host = stripped[..end].to_string();
        let port = match stripped[end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("bad port in {endpoint:?}")))?,
            None => default_port,
        };
        return Ok((host, port));
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) => Ok((
            host.to_string(),
            port.parse()
                .map_err(|_| ConfigError::Invalid(format!("bad port in {endpoint:?}")))?,
        )),
        None => Ok((endpoint.to_string(), default_port)),
    }
}

fn percent_decode(input: &str) -> Result<String, ConfigError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = input
                    .get(i + 1..i + 3)
                    .ok_or_else(|| ConfigError::Invalid(format!("bad escape in {input:?}")))?;
                let value = u8::from_str_radix(hex, 16)
                    .map_err(|_| ConfigError::Invalid(format!("bad escape in {input:?}")))?;
                out.push(value);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| ConfigError::Invalid(format!("bad utf-8 in {input:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_url() {
        let cfg = parse_share_url("trojan://hunter2@example.com:443", "").unwrap();
        assert_eq!(cfg.run_type, RunType::Client);
        assert_eq!(cfg.remote_endpoint(), "example.com:443");
        assert_eq!(cfg.password, vec!["hunter2"]);
        assert_eq!(cfg.local_endpoint(), "127.0.0.1:1080");
        assert!(!cfg.tcp.mux.enabled);
    }

    #[test]
    fn url_with_query_and_fragment() {
        let cfg = parse_share_url(
            "trojan-go://p%40ss@example.com:8443?sni=cdn.example.com&type=ws&host=cdn.example.com&path=/stream#my-node",
            "",
        )
        .unwrap();
        assert_eq!(cfg.password, vec!["p@ss"]);
        assert_eq!(cfg.remote_port, 8443);
        assert_eq!(cfg.ssl.sni, "cdn.example.com");
        assert!(cfg.websocket.enabled);
        assert_eq!(cfg.websocket.path, "/stream");
        assert_eq!(cfg.websocket.host, "cdn.example.com");
    }

    #[test]
    fn url_options() {
        let cfg = parse_share_url(
            "trojan://hunter2@example.com:443",
            "mux=true;listen=0.0.0.0:7070;api=127.0.0.1:9000",
        )
        .unwrap();
        assert!(cfg.tcp.mux.enabled);
        assert_eq!(cfg.local_endpoint(), "0.0.0.0:7070");
        assert!(cfg.api.enabled);
        assert_eq!(cfg.api.api_port, 9000);
    }

    #[test]
    fn shadowsocks_encryption_spec() {
        let cfg = parse_share_url(
            "trojan://p@example.com:443?encryption=ss%3Baes-128-gcm%3Asecret",
            "",
        )
        .unwrap();
        assert!(cfg.shadowsocks.enabled);
        assert_eq!(cfg.shadowsocks.method, "aes-128-gcm");
        assert_eq!(cfg.shadowsocks.password, "secret");
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(parse_share_url("http://example.com", "").is_err());
        assert!(parse_share_url("trojan://example.com:443", "").is_err());
        assert!(parse_share_url("trojan://p@example.com:443", "bogus").is_err());
        assert!(parse_share_url("trojan://p@example.com:443", "mux=perhaps").is_err());
    }
}
