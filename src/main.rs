//! trident entry point.
//!
//! One of four input modes selects the configuration: a config file, a
//! share URL, standard input, or the "easy" one-shot flags. Startup errors
//! exit with status 1; a clean shutdown exits 0.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use trident_config::{Config, StdinFormat, load_config, load_stdin, validate_config};
use trident_proxy::logging;
use trident_proxy::proxy::build_proxy;
use trident_proxy::url::parse_share_url;

/// A Trojan-protocol tunnel: TLS-camouflaged proxy client and server.
#[derive(Parser, Debug)]
#[command(name = "trident", version, about)]
struct Cli {
    /// Run from a configuration file (.json / .yaml / .yml).
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Easy mode: run a server.
    #[arg(long)]
    server: bool,

    /// Easy mode: run a client.
    #[arg(long)]
    client: bool,

    /// Easy mode: the password.
    #[arg(long)]
    password: Option<String>,

    /// Easy mode: remote endpoint (host:port).
    #[arg(long)]
    remote: Option<String>,

    /// Easy mode: local endpoint (host:port).
    #[arg(long)]
    local: Option<String>,

    /// Easy mode server: certificate chain file (PEM).
    #[arg(long)]
    cert: Option<String>,

    /// Easy mode server: private key file (PEM).
    #[arg(long)]
    key: Option<String>,

    /// Run a client from a trojan share URL.
    #[arg(long)]
    url: Option<String>,

    /// Options for --url as `k=v;k=v` (mux=, listen=, api=).
    #[arg(long = "url-option", default_value = "")]
    url_option: String,

    /// Read the configuration from standard input (json | yaml).
    #[arg(long = "stdin-format")]
    stdin_format: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = resolve_config(&cli).map_err(|e| e.to_string())?;
    validate_config(&config).map_err(|e| e.to_string())?;

    logging::init(config.log_level, config.log_file.as_deref());
    info!(
        run_type = %config.run_type,
        version = trident_core::VERSION,
        "starting"
    );

    if config.api.enabled {
        let listen = format!("{}:{}", config.api.api_addr, config.api.api_port);
        trident_metrics::init_prometheus(&listen)?;
        info!(listen = %listen, "metrics endpoint enabled");
    }

    let root = CancellationToken::new();
    let proxy = build_proxy(&config, &root).await.map_err(|e| e.to_string())?;

    let shutdown = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    proxy.run().await;
    proxy.close();
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<Config, trident_config::ConfigError> {
    if let Some(url) = &cli.url {
        return parse_share_url(url, &cli.url_option);
    }
    if let Some(path) = &cli.config {
        return load_config(path);
    }
    if let Some(format) = &cli.stdin_format {
        return load_stdin(format.parse::<StdinFormat>()?);
    }
    if cli.server || cli.client {
        return easy_config(cli);
    }
    Err(trident_config::ConfigError::Invalid(
        "no configuration given: use --config, --url, --stdin-format, or --server/--client".into(),
    ))
}

/// Assemble a config from the easy-mode flags, no file needed.
fn easy_config(cli: &Cli) -> Result<Config, trident_config::ConfigError> {
    if cli.server && cli.client {
        return Err(trident_config::ConfigError::Invalid(
            "--server and --client are mutually exclusive".into(),
        ));
    }
    let password = cli.password.clone().ok_or_else(|| {
        trident_config::ConfigError::Invalid("easy mode requires --password".into())
    })?;

    let (local_default, remote_default) = if cli.server {
        ("0.0.0.0:443", "127.0.0.1:80")
    } else {
        ("127.0.0.1:1080", "")
    };
    let local = cli.local.as_deref().unwrap_or(local_default);
    let remote = match (&cli.remote, cli.server) {
        (Some(remote), _) => remote.clone(),
        (None, true) => remote_default.to_string(),
        (None, false) => {
            return Err(trident_config::ConfigError::Invalid(
                "easy client mode requires --remote".into(),
            ));
        }
    };

    let (local_addr, local_port) = split_endpoint(local)?;
    let (remote_addr, remote_port) = split_endpoint(&remote)?;

    let mut value = serde_json::json!({
        "run_type": if cli.server { "server" } else { "client" },
        "local_addr": local_addr,
        "local_port": local_port,
        "remote_addr": remote_addr.clone(),
        "remote_port": remote_port,
        "password": [password],
    });
    if cli.server {
        let cert = cli.cert.clone().ok_or_else(|| {
            trident_config::ConfigError::Invalid("easy server mode requires --cert".into())
        })?;
        let key = cli.key.clone().ok_or_else(|| {
            trident_config::ConfigError::Invalid("easy server mode requires --key".into())
        })?;
        value["ssl"] = serde_json::json!({
            "cert": cert,
            "key": key,
            "fallback_addr": remote_addr,
            "fallback_port": remote_port,
        });
    }

    serde_json::from_value(value).map_err(|e| trident_config::ConfigError::Parse(e.to_string()))
}

fn split_endpoint(endpoint: &str) -> Result<(String, u16), trident_config::ConfigError> {
    endpoint
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host.to_string(), port.parse().ok()?)))
        .ok_or_else(|| {
            trident_config::ConfigError::Invalid(format!("bad endpoint {endpoint:?}"))
        })
}
