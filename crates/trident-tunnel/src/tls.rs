//! TLS layer: terminates inbound TLS on the server, initiates it on the
//! client.
//!
//! The server preserves probe indistinguishability at this layer too: when
//! a handshake fails and a fallback endpoint is configured, the raw TCP
//! stream is handed to the redirector with every byte read so far replayed
//! in front, so the decoy origin sees exactly what the prober sent.
//!
//! Reclaiming the stream after a failed handshake works through a salvage
//! cell: the handshake runs over a [`RecordingStream`] that buffers what it
//! reads; if the stream is dropped mid-handshake (failure or timeout), the
//! wrapper stashes the inner stream and the recorded bytes into the shared
//! cell for the accept task to pick up.

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex, mpsc};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trident_core::PrefixedStream;
use trident_core::defaults::{ACCEPT_QUEUE_SIZE, DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS};
use trident_proto::Address;

use crate::queue::recv_or_closed;
use crate::redirector::{Redirection, Redirector};
use crate::{BoxPacketConn, BoxStream, StreamConn, TunnelClient, TunnelError, TunnelServer};

/// Server-side TLS settings.
#[derive(Debug, Clone)]
pub struct TlsServerOptions {
    /// Certificate chain file (PEM).
    pub cert_path: String,
    /// Private key file (PEM).
    pub key_path: String,
    /// ALPN protocols to advertise.
    pub alpn: Vec<String>,
    /// Handshake deadline.
    pub handshake_timeout: Duration,
    /// Redirection endpoint for failed handshakes.
    pub fallback: Option<String>,
}

/// Client-side TLS settings.
#[derive(Debug, Clone)]
pub struct TlsClientOptions {
    /// SNI to present; callers default this to the remote host.
    pub sni: String,
    /// Verify the server certificate chain.
    pub verify: bool,
    /// Extra root CA file (PEM); the webpki roots are used otherwise.
    pub ca_path: Option<String>,
    /// ALPN protocols to offer.
    pub alpn: Vec<String>,
    /// ClientHello profile: `firefox | chrome | ios | ""`.
    pub fingerprint: String,
    /// Preferred cipher suites by name; empty keeps the provider order.
    pub cipher: Vec<String>,
    /// TLS key log destination for traffic debugging.
    pub key_log_path: Option<String>,
    /// Offer and reuse session tickets.
    pub reuse_session: bool,
    /// Handshake deadline.
    pub handshake_timeout: Duration,
}

impl Default for TlsClientOptions {
    fn default() -> Self {
        Self {
            sni: String::new(),
            verify: true,
            ca_path: None,
            alpn: Vec::new(),
            fingerprint: String::new(),
            cipher: Vec::new(),
            key_log_path: None,
            reuse_session: true,
            handshake_timeout: Duration::from_secs(DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS),
        }
    }
}

// ── salvage cell ──

/// Shared cell a dropped [`RecordingStream`] stashes its parts into.
pub(crate) struct Salvage<S> {
    cell: Arc<StdMutex<Option<(BytesMut, S)>>>,
}

impl<S> Clone for Salvage<S> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<S> Salvage<S> {
    pub(crate) fn new() -> Self {
        Self {
            cell: Arc::new(StdMutex::new(None)),
        }
    }

    pub(crate) fn take(&self) -> Option<(BytesMut, S)> {
        self.cell.lock().expect("salvage lock").take()
    }
}

/// Stream wrapper that records everything read until told to stop, and on
/// drop-while-recording returns the inner stream plus the recorded bytes
/// through its [`Salvage`] cell.
pub(crate) struct RecordingStream<S> {
    inner: Option<S>,
    recorded: BytesMut,
    recording: bool,
    salvage: Salvage<S>,
}

impl<S> RecordingStream<S> {
    pub(crate) fn new(inner: S, salvage: Salvage<S>) -> Self {
        Self {
            inner: Some(inner),
            recorded: BytesMut::new(),
            recording: true,
            salvage,
        }
    }

    /// The handshake completed: nothing to replay anymore.
    pub(crate) fn stop_recording(&mut self) {
        self.recording = false;
        self.recorded = BytesMut::new();
    }
}

impl<S> Drop for RecordingStream<S> {
    fn drop(&mut self) {
        if self.recording {
            if let Some(inner) = self.inner.take() {
                let recorded = std::mem::take(&mut self.recorded);
                *self.salvage.cell.lock().expect("salvage lock") = Some((recorded, inner));
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RecordingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        let inner = this.inner.as_mut().expect("stream taken");
        let before = buf.filled().len();
        match Pin::new(inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if this.recording {
                    this.recorded.extend_from_slice(&buf.filled()[before..]);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RecordingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(self.inner.as_mut().expect("stream taken")).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.inner.as_mut().expect("stream taken")).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.inner.as_mut().expect("stream taken")).poll_shutdown(cx)
    }
}

// ── server ──

/// TLS server layer.
pub struct TlsServer {
    inner: Arc<dyn TunnelServer>,
    streams: Mutex<mpsc::Receiver<StreamConn>>,
    shutdown: CancellationToken,
}

impl TlsServer {
    /// Build over `inner` and start the accept loop. Each accepted stream
    /// handshakes in its own task so one slow peer cannot stall the stack.
    pub fn new(
        inner: Arc<dyn TunnelServer>,
        opts: TlsServerOptions,
        redirector: Redirector,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, TunnelError> {
        let config = build_server_config(&opts)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let shutdown = parent.child_token();
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);

        let server = Arc::new(Self {
            inner: inner.clone(),
            streams: Mutex::new(rx),
            shutdown: shutdown.clone(),
        });

        let timeout = opts.handshake_timeout;
        let fallback = opts.fallback.clone();
        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = inner.accept_stream() => match result {
                        Ok(conn) => conn,
                        Err(TunnelError::Closed) => break,
                        Err(e) => {
                            if shutdown.is_cancelled() {
                                break;
                            }
                            warn!(error = %e, "tls failed to accept from transport");
                            continue;
                        }
                    },
                };

                let acceptor = acceptor.clone();
                let redirector = redirector.clone();
                let fallback = fallback.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (stream, metadata) = conn.into_parts();
                    let salvage: Salvage<BoxStream> = Salvage::new();
                    let recording = RecordingStream::new(stream, salvage.clone());

                    match tokio::time::timeout(timeout, acceptor.accept(recording)).await {
                        Ok(Ok(mut tls)) => {
                            tls.get_mut().0.stop_recording();
                            let _ = tx.send(StreamConn::new(tls, metadata)).await;
                        }
                        Ok(Err(e)) => {
                            debug!(peer = %metadata.address, error = %e, "tls handshake failed");
                            redirect_failed(&redirector, &fallback, &salvage);
                        }
                        Err(_) => {
                            debug!(peer = %metadata.address, "tls handshake timed out");
                            redirect_failed(&redirector, &fallback, &salvage);
                        }
                    }
                });
            }
            debug!("tls accept loop exiting");
        });

        Ok(server)
    }
}

fn redirect_failed(redirector: &Redirector, fallback: &Option<String>, salvage: &Salvage<BoxStream>) {
    let Some(target) = fallback else { return };
    let Some((recorded, raw)) = salvage.take() else {
        return;
    };
    redirector.submit(Redirection {
        inbound: Box::new(PrefixedStream::new(recorded.freeze(), raw)),
        target: target.clone(),
        dial: None,
    });
}

#[async_trait]
impl TunnelServer for TlsServer {
    async fn accept_stream(&self) -> Result<StreamConn, TunnelError> {
        recv_or_closed(&self.streams, &self.shutdown).await
    }

    async fn accept_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        Err(TunnelError::NotSupported("packets"))
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.inner.close();
    }
}

// ── client ──

/// TLS client layer.
pub struct TlsClient {
    inner: Arc<dyn TunnelClient>,
    connector: TlsConnector,
    sni: ServerName<'static>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
}

impl TlsClient {
    pub fn new(
        inner: Arc<dyn TunnelClient>,
        opts: TlsClientOptions,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, TunnelError> {
        let config = build_client_config(&opts)?;
        let sni = ServerName::try_from(opts.sni.clone())
            .map_err(|e| TunnelError::Config(format!("invalid SNI hostname: {e}")))?;
        Ok(Arc::new(Self {
            inner,
            connector: TlsConnector::from(Arc::new(config)),
            sni,
            handshake_timeout: opts.handshake_timeout,
            shutdown: parent.child_token(),
        }))
    }
}

#[async_trait]
impl TunnelClient for TlsClient {
    async fn dial_stream(&self, addr: &Address) -> Result<StreamConn, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let (stream, metadata) = self.inner.dial_stream(addr).await?.into_parts();
        let tls = tokio::time::timeout(
            self.handshake_timeout,
            self.connector.connect(self.sni.clone(), stream),
        )
        .await
        .map_err(|_| {
            TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "TLS handshake timed out",
            ))
        })??;
        Ok(StreamConn::new(tls, metadata))
    }

    async fn dial_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        Err(TunnelError::NotSupported("packets"))
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.inner.close();
    }
}

// ── config building ──

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TunnelError> {
    let data = std::fs::read(path)
        .map_err(|e| TunnelError::Config(format!("failed to read certificate {path}: {e}")))?;
    rustls_pemfile::certs(&mut &data[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Config(format!("failed to parse certificate {path}: {e}")))
}

fn load_private_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>, TunnelError> {
    let data = std::fs::read(path)
        .map_err(|e| TunnelError::Config(format!("failed to read key {path}: {e}")))?;
    rustls_pemfile::private_key(&mut &data[..])
        .map_err(|e| TunnelError::Config(format!("failed to parse key {path}: {e}")))?
        .ok_or_else(|| TunnelError::Config(format!("no private key found in {path}")))
}

/// Build the rustls server configuration.
pub fn build_server_config(opts: &TlsServerOptions) -> Result<rustls::ServerConfig, TunnelError> {
    let certs = load_certs(&opts.cert_path)?;
    let key = load_private_key(&opts.key_path)?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    if !opts.alpn.is_empty() {
        config.alpn_protocols = opts.alpn.iter().map(|s| s.as_bytes().to_vec()).collect();
    }
    Ok(config)
}

/// Build the rustls client configuration, applying the verify toggle, the
/// extra root CA, the fingerprint profile and the key log destination.
pub fn build_client_config(opts: &TlsClientOptions) -> Result<rustls::ClientConfig, TunnelError> {
    let mut provider = fingerprint_provider(&opts.fingerprint)?;
    if !opts.cipher.is_empty() {
        provider = select_ciphers(provider, &opts.cipher)?;
    }

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)
        .map_err(|e| TunnelError::Config(format!("TLS version error: {e}")))?;

    let mut config = if opts.verify {
        let mut roots = rustls::RootCertStore::empty();
        if let Some(ca_path) = &opts.ca_path {
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| TunnelError::Config(format!("failed to add CA cert: {e}")))?;
            }
        } else {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    };

    config.alpn_protocols = if !opts.alpn.is_empty() {
        opts.alpn.iter().map(|s| s.as_bytes().to_vec()).collect()
    } else {
        fingerprint_alpn(&opts.fingerprint)
    };

    if !opts.reuse_session {
        config.resumption = rustls::client::Resumption::disabled();
    }

    if let Some(path) = &opts.key_log_path {
        config.key_log = Arc::new(FileKeyLog::open(path)?);
    }

    Ok(config)
}

/// Cipher-suite preference per named browser profile. True ClientHello
/// byte mimicry is out of scope; the profile selects suite ordering and
/// default ALPN so the offer is at least shaped like the named browser.
fn fingerprint_provider(
    profile: &str,
) -> Result<Arc<rustls::crypto::CryptoProvider>, TunnelError> {
    let default = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    let preference: &[&str] = match profile {
        "" => return Ok(default),
        "chrome" => &[
            "TLS13_AES_128_GCM_SHA256",
            "TLS13_AES_256_GCM_SHA384",
            "TLS13_CHACHA20_POLY1305_SHA256",
        ],
        "firefox" => &[
            "TLS13_AES_128_GCM_SHA256",
            "TLS13_CHACHA20_POLY1305_SHA256",
            "TLS13_AES_256_GCM_SHA384",
        ],
        "ios" => &[
            "TLS13_AES_256_GCM_SHA384",
            "TLS13_AES_128_GCM_SHA256",
            "TLS13_CHACHA20_POLY1305_SHA256",
        ],
        other => {
            return Err(TunnelError::Config(format!(
                "unknown tls fingerprint {other:?}"
            )));
        }
    };

    // Preferred suites first (matched by debug name), the rest keep their
    // provider order.
    let mut ordered = Vec::with_capacity(default.cipher_suites.len());
    for name in preference {
        if let Some(suite) = default
            .cipher_suites
            .iter()
            .find(|s| format!("{:?}", s.suite()).ends_with(name))
        {
            ordered.push(*suite);
        }
    }
    for suite in &default.cipher_suites {
        if !ordered.iter().any(|s| s.suite() == suite.suite()) {
            ordered.push(*suite);
        }
    }

    Ok(Arc::new(rustls::crypto::CryptoProvider {
        cipher_suites: ordered,
        kx_groups: default.kx_groups.clone(),
        signature_verification_algorithms: default.signature_verification_algorithms,
        secure_random: default.secure_random,
        key_provider: default.key_provider,
    }))
}

/// Restrict the provider to the named cipher suites, matched by the
/// suite's debug name suffix, keeping the requested order.
fn select_ciphers(
    provider: Arc<rustls::crypto::CryptoProvider>,
    names: &[String],
) -> Result<Arc<rustls::crypto::CryptoProvider>, TunnelError> {
    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim();
        match provider
            .cipher_suites
            .iter()
            .find(|s| format!("{:?}", s.suite()).ends_with(name))
        {
            Some(suite) => selected.push(*suite),
            None => warn!(cipher = %name, "unknown cipher suite, skipping"),
        }
    }
    if selected.is_empty() {
        return Err(TunnelError::Config(
            "no usable cipher suites in ssl.cipher".into(),
        ));
    }
    Ok(Arc::new(rustls::crypto::CryptoProvider {
        cipher_suites: selected,
        kx_groups: provider.kx_groups.clone(),
        signature_verification_algorithms: provider.signature_verification_algorithms,
        secure_random: provider.secure_random,
        key_provider: provider.key_provider,
    }))
}

fn fingerprint_alpn(profile: &str) -> Vec<Vec<u8>> {
    match profile {
        "chrome" | "firefox" | "ios" => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        _ => Vec::new(),
    }
}

/// Key log writer appending NSS key-log lines to a file.
struct FileKeyLog {
    file: StdMutex<std::fs::File>,
}

impl FileKeyLog {
    fn open(path: &str) -> Result<Self, TunnelError> {
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| TunnelError::Config(format!("failed to open key log {path}: {e}")))?;
        Ok(Self {
            file: StdMutex::new(file),
        })
    }
}

impl std::fmt::Debug for FileKeyLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKeyLog").finish_non_exhaustive()
    }
}

impl rustls::KeyLog for FileKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        use std::io::Write;
        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(_) => return,
        };
        let _ = writeln!(
            file,
            "{} {} {}",
            label,
            hex_encode(client_random),
            hex_encode(secret)
        );
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Certificate verifier accepting any chain, for `verify: false`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn recording_stream_salvages_on_drop() {
        let (mut peer, inner) = duplex(64);
        let salvage: Salvage<_> = Salvage::new();
        let mut recording = RecordingStream::new(inner, salvage.clone());

        peer.write_all(b"client hello bytes").await.unwrap();
        let mut buf = [0u8; 18];
        recording.read_exact(&mut buf).await.unwrap();
        drop(recording);

        let (recorded, mut raw) = salvage.take().expect("salvaged parts");
        assert_eq!(&recorded[..], b"client hello bytes");

        // The reclaimed stream still works.
        peer.write_all(b"more").await.unwrap();
        let mut buf = [0u8; 4];
        raw.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"more");
    }

    #[tokio::test]
    async fn stop_recording_prevents_salvage() {
        let (_peer, inner) = duplex(64);
        let salvage: Salvage<_> = Salvage::new();
        let mut recording = RecordingStream::new(inner, salvage.clone());
        recording.stop_recording();
        drop(recording);
        assert!(salvage.take().is_none());
    }

    #[test]
    fn unknown_fingerprint_is_config_error() {
        assert!(fingerprint_provider("safari").is_err());
        assert!(fingerprint_provider("").is_ok());
        assert!(fingerprint_provider("chrome").is_ok());
    }

    #[test]
    fn fingerprint_sets_default_alpn() {
        assert!(fingerprint_alpn("").is_empty());
        assert_eq!(
            fingerprint_alpn("firefox"),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }
}
