//! Startup validation.
//!
//! Everything here is fatal: a config that fails validation never reaches
//! the stack builder.

use crate::{Config, ConfigError, RunType};

/// Validate a loaded configuration for the role it declares.
pub fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    match cfg.run_type {
        RunType::Server => {
            if cfg.ssl.cert.is_empty() || cfg.ssl.key.is_empty() {
                return Err(ConfigError::Invalid(
                    "server requires ssl.cert and ssl.key".into(),
                ));
            }
            if cfg.password.is_empty() {
                return Err(ConfigError::Invalid(
                    "server requires at least one password".into(),
                ));
            }
        }
        RunType::Client | RunType::Forward | RunType::Nat => {
            if cfg.remote_addr.is_empty() || cfg.remote_port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{} requires remote_addr and remote_port",
                    cfg.run_type
                )));
            }
            if cfg.password.is_empty() {
                return Err(ConfigError::Invalid(
                    "client requires at least one password".into(),
                ));
            }
            if matches!(cfg.run_type, RunType::Forward | RunType::Nat)
                && (cfg.target_addr.is_empty() || cfg.target_port == 0)
            {
                return Err(ConfigError::Invalid(format!(
                    "{} requires target_addr and target_port",
                    cfg.run_type
                )));
            }
        }
        RunType::Custom => {
            return Err(ConfigError::Invalid(
                "run_type \"custom\" is not supported by this build".into(),
            ));
        }
    }

    if cfg.log_level > 5 {
        return Err(ConfigError::Invalid(format!(
            "log_level {} out of range 0..=5",
            cfg.log_level
        )));
    }

    if !matches!(cfg.ssl.fingerprint.as_str(), "" | "firefox" | "chrome" | "ios") {
        return Err(ConfigError::Invalid(format!(
            "unknown ssl.fingerprint {:?}",
            cfg.ssl.fingerprint
        )));
    }

    if cfg.shadowsocks.enabled {
        match cfg.shadowsocks.method.as_str() {
            "aes-128-gcm" | "aes-256-gcm" | "chacha20-ietf-poly1305" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown shadowsocks.method {other:?}"
                )));
            }
        }
        if cfg.shadowsocks.password.is_empty() {
            return Err(ConfigError::Invalid(
                "shadowsocks.enabled requires shadowsocks.password".into(),
            ));
        }
    }

    if cfg.router.enabled {
        match cfg.router.default_policy.as_str() {
            "proxy" | "bypass" | "block" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown router.default_policy {other:?}"
                )));
            }
        }
        match cfg.router.domain_strategy.as_str() {
            "as_is" | "ip_if_non_match" | "ip_on_demand" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown router.domain_strategy {other:?}"
                )));
            }
        }
    }

    if cfg.tcp.mux.enabled && cfg.tcp.mux.concurrency == 0 {
        return Err(ConfigError::Invalid(
            "tcp.mux.concurrency must be at least 1".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn base(run_type: RunType) -> Config {
        Config {
            run_type,
            local_addr: "127.0.0.1".into(),
            local_port: 1080,
            remote_addr: "example.com".into(),
            remote_port: 443,
            target_addr: String::new(),
            target_port: 0,
            password: vec!["hunter2".into()],
            log_level: 1,
            log_file: None,
            ssl: SslConfig {
                cert: "server.crt".into(),
                key: "server.key".into(),
                ..SslConfig::default()
            },
            tcp: TcpConfig::default(),
            websocket: WebsocketConfig::default(),
            shadowsocks: ShadowsocksConfig::default(),
            router: RouterConfig::default(),
            api: ApiConfig::default(),
            stat_flush_secs: 30,
        }
    }

    #[test]
    fn valid_client_and_server_pass() {
        assert!(validate_config(&base(RunType::Client)).is_ok());
        assert!(validate_config(&base(RunType::Server)).is_ok());
    }

    #[test]
    fn forward_requires_target() {
        let mut cfg = base(RunType::Forward);
        assert!(validate_config(&cfg).is_err());
        cfg.target_addr = "10.0.0.1".into();
        cfg.target_port = 5353;
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn custom_run_type_is_rejected() {
        assert!(validate_config(&base(RunType::Custom)).is_err());
    }

    #[test]
    fn server_without_cert_fails() {
        let mut cfg = base(RunType::Server);
        cfg.ssl.cert.clear();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn client_without_remote_fails() {
        let mut cfg = base(RunType::Client);
        cfg.remote_addr.clear();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn unknown_fingerprint_fails() {
        let mut cfg = base(RunType::Client);
        cfg.ssl.fingerprint = "safari".into();
        assert!(validate_config(&cfg).is_err());
        cfg.ssl.fingerprint = "firefox".into();
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn shadowsocks_needs_password_and_known_method() {
        let mut cfg = base(RunType::Client);
        cfg.shadowsocks.enabled = true;
        assert!(validate_config(&cfg).is_err());
        cfg.shadowsocks.password = "secret".into();
        assert!(validate_config(&cfg).is_ok());
        cfg.shadowsocks.method = "rc4-md5".into();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn router_policy_names_are_checked() {
        let mut cfg = base(RunType::Client);
        cfg.router.enabled = true;
        cfg.router.default_policy = "reject".into();
        assert!(validate_config(&cfg).is_err());
        cfg.router.default_policy = "block".into();
        assert!(validate_config(&cfg).is_ok());
    }
}
