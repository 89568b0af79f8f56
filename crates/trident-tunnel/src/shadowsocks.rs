//! Shadowsocks AEAD layer.
//!
//! Optional second obfuscation layer against per-packet pattern analysis,
//! stacked between TLS and the trojan framing. Wire format:
//!
//! ```text
//! salt | AEAD(length) | AEAD(chunk) | AEAD(length) | AEAD(chunk) ...
//! ```
//!
//! Each direction derives its session subkey with HKDF-SHA1 over the
//! EVP_BytesToKey-derived master key and the direction's salt; nonces are
//! a little-endian counter incremented per AEAD operation; chunk payloads
//! are capped at 0x3FFF bytes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use rand::RngCore;
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use trident_proto::Address;

use crate::{BoxPacketConn, StreamConn, TunnelClient, TunnelError, TunnelServer};

/// AEAD tag length for every supported method.
const TAG_LEN: usize = 16;
/// Maximum plaintext bytes per chunk.
const MAX_CHUNK: usize = 0x3FFF;
const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Supported AEAD methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

impl Method {
    pub fn from_name(name: &str) -> Result<Self, TunnelError> {
        match name {
            "aes-128-gcm" => Ok(Method::Aes128Gcm),
            "aes-256-gcm" => Ok(Method::Aes256Gcm),
            "chacha20-ietf-poly1305" => Ok(Method::Chacha20Poly1305),
            other => Err(TunnelError::Config(format!(
                "unknown shadowsocks method {other:?}"
            ))),
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Method::Aes128Gcm => 16,
            Method::Aes256Gcm | Method::Chacha20Poly1305 => 32,
        }
    }

    /// Salt length equals key length for all supported methods.
    pub fn salt_len(self) -> usize {
        self.key_len()
    }
}

/// OpenSSL's EVP_BytesToKey with MD5, the classic shadowsocks master key
/// derivation.
pub fn derive_master_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut last = Vec::new();
    while key.len() < key_len {
        let mut md5 = Md5::new();
        md5.update(&last);
        md5.update(password.as_bytes());
        last = md5.finalize().to_vec();
        key.extend_from_slice(&last);
    }
    key.truncate(key_len);
    key
}

enum AeadCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha20(Box<ChaCha20Poly1305>),
}

/// One direction's cipher state: subkey-bound AEAD plus a counter nonce.
struct SessionCrypto {
    cipher: AeadCipher,
    nonce: [u8; 12],
}

impl SessionCrypto {
    fn new(method: Method, master_key: &[u8], salt: &[u8]) -> Result<Self, TunnelError> {
        let mut subkey = vec![0u8; method.key_len()];
        Hkdf::<Sha1>::new(Some(salt), master_key)
            .expand(SUBKEY_INFO, &mut subkey)
            .map_err(|_| TunnelError::Config("hkdf expand failed".into()))?;

        let cipher = match method {
            Method::Aes128Gcm => AeadCipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(&subkey)
                    .map_err(|_| TunnelError::Config("bad key length".into()))?,
            )),
            Method::Aes256Gcm => AeadCipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(&subkey)
                    .map_err(|_| TunnelError::Config("bad key length".into()))?,
            )),
            Method::Chacha20Poly1305 => AeadCipher::ChaCha20(Box::new(
                ChaCha20Poly1305::new_from_slice(&subkey)
                    .map_err(|_| TunnelError::Config("bad key length".into()))?,
            )),
        };
        Ok(Self {
            cipher,
            nonce: [0u8; 12],
        })
    }

    fn bump_nonce(&mut self) {
        for byte in self.nonce.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }

    fn seal(&mut self, plaintext: &[u8]) -> std::io::Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(&self.nonce);
        let sealed = match &self.cipher {
            AeadCipher::Aes128(c) => c.encrypt(nonce, plaintext),
            AeadCipher::Aes256(c) => c.encrypt(nonce, plaintext),
            AeadCipher::ChaCha20(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|_| std::io::Error::other("aead seal failed"))?;
        self.bump_nonce();
        Ok(sealed)
    }

    fn open(&mut self, ciphertext: &[u8]) -> std::io::Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(&self.nonce);
        let opened = match &self.cipher {
            AeadCipher::Aes128(c) => c.decrypt(nonce, ciphertext),
            AeadCipher::Aes256(c) => c.decrypt(nonce, ciphertext),
            AeadCipher::ChaCha20(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "aead open failed")
        })?;
        self.bump_nonce();
        Ok(opened)
    }
}

enum ReadState {
    Salt,
    Length,
    Data(usize),
}

/// AEAD-wrapped stream.
pub struct SsStream<S> {
    inner: S,
    method: Method,
    master_key: Arc<Vec<u8>>,

    read_state: ReadState,
    read_crypto: Option<SessionCrypto>,
    /// Ciphertext not yet decoded.
    net_buf: BytesMut,
    /// Plaintext decoded but not yet handed to the caller.
    plain_buf: BytesMut,
    scratch: Box<[u8]>,

    write_crypto: Option<SessionCrypto>,
    /// Ciphertext not yet written to the inner stream.
    write_buf: BytesMut,
}

impl<S> SsStream<S> {
    pub fn new(inner: S, method: Method, master_key: Arc<Vec<u8>>) -> Self {
        Self {
            inner,
            method,
            master_key,
            read_state: ReadState::Salt,
            read_crypto: None,
            net_buf: BytesMut::new(),
            plain_buf: BytesMut::new(),
            scratch: vec![0u8; 16 * 1024].into_boxed_slice(),
            write_crypto: None,
            write_buf: BytesMut::new(),
        }
    }

    /// Decode as much of `net_buf` as possible; true when progress was made.
    fn try_decode(&mut self) -> std::io::Result<bool> {
        let mut progressed = false;
        loop {
            match self.read_state {
                ReadState::Salt => {
                    let salt_len = self.method.salt_len();
                    if self.net_buf.len() < salt_len {
                        return Ok(progressed);
                    }
                    let crypto =
                        SessionCrypto::new(self.method, &self.master_key, &self.net_buf[..salt_len])
                            .map_err(|e| std::io::Error::other(e.to_string()))?;
                    self.read_crypto = Some(crypto);
                    self.net_buf.advance(salt_len);
                    self.read_state = ReadState::Length;
                    progressed = true;
                }
                ReadState::Length => {
                    if self.net_buf.len() < 2 + TAG_LEN {
                        return Ok(progressed);
                    }
                    let crypto = self.read_crypto.as_mut().expect("crypto after salt");
                    let plain = crypto.open(&self.net_buf[..2 + TAG_LEN])?;
                    let len = (u16::from_be_bytes([plain[0], plain[1]]) as usize) & MAX_CHUNK;
                    self.net_buf.advance(2 + TAG_LEN);
                    self.read_state = ReadState::Data(len);
                    progressed = true;
                }
                ReadState::Data(len) => {
                    if self.net_buf.len() < len + TAG_LEN {
                        return Ok(progressed);
                    }
                    let crypto = self.read_crypto.as_mut().expect("crypto after salt");
                    let plain = crypto.open(&self.net_buf[..len + TAG_LEN])?;
                    self.plain_buf.extend_from_slice(&plain);
                    self.net_buf.advance(len + TAG_LEN);
                    self.read_state = ReadState::Length;
                    progressed = true;
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> SsStream<S> {
    fn poll_drain_write(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SsStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.plain_buf.is_empty() {
                let n = this.plain_buf.len().min(buf.remaining());
                buf.put_slice(&this.plain_buf[..n]);
                this.plain_buf.advance(n);
                return Poll::Ready(Ok(()));
            }

            this.try_decode()?;
            if !this.plain_buf.is_empty() {
                continue;
            }

            let mut read_buf = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                // EOF mid-frame is a truncation, not a clean close.
                if !this.net_buf.is_empty() {
                    return Poll::Ready(Err(std::io::ErrorKind::UnexpectedEof.into()));
                }
                return Poll::Ready(Ok(()));
            }
            this.net_buf.extend_from_slice(filled);
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SsStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = &mut *self;
        // Finish any previously sealed bytes before accepting new data.
        ready!(this.poll_drain_write(cx))?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.write_crypto.is_none() {
            let mut salt = vec![0u8; this.method.salt_len()];
            rand::rngs::OsRng.fill_bytes(&mut salt);
            let crypto = SessionCrypto::new(this.method, &this.master_key, &salt)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            this.write_buf.extend_from_slice(&salt);
            this.write_crypto = Some(crypto);
        }

        let chunk = &data[..data.len().min(MAX_CHUNK)];
        let crypto = this.write_crypto.as_mut().expect("crypto initialized");
        let sealed_len = crypto.seal(&(chunk.len() as u16).to_be_bytes())?;
        this.write_buf.extend_from_slice(&sealed_len);
        let sealed = crypto.seal(chunk)?;
        this.write_buf.extend_from_slice(&sealed);

        // Opportunistic drain; the chunk is committed either way.
        loop {
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_buf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    this.write_buf.advance(n);
                    if this.write_buf.is_empty() {
                        break;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain_write(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain_write(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

// ── layer wrappers ──

/// Client side: AEAD-wraps every dialed stream.
pub struct ShadowsocksClient {
    inner: Arc<dyn TunnelClient>,
    method: Method,
    master_key: Arc<Vec<u8>>,
    shutdown: CancellationToken,
}

impl ShadowsocksClient {
    pub fn new(
        inner: Arc<dyn TunnelClient>,
        method: Method,
        password: &str,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            method,
            master_key: Arc::new(derive_master_key(password, method.key_len())),
            shutdown: parent.child_token(),
        })
    }
}

#[async_trait]
impl TunnelClient for ShadowsocksClient {
    async fn dial_stream(&self, addr: &Address) -> Result<StreamConn, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let (stream, metadata) = self.inner.dial_stream(addr).await?.into_parts();
        Ok(StreamConn::new(
            SsStream::new(stream, self.method, self.master_key.clone()),
            metadata,
        ))
    }

    async fn dial_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        Err(TunnelError::NotSupported("packets"))
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.inner.close();
    }
}

/// Server side: AEAD-unwraps every accepted stream.
pub struct ShadowsocksServer {
    inner: Arc<dyn TunnelServer>,
    method: Method,
    master_key: Arc<Vec<u8>>,
    shutdown: CancellationToken,
}

impl ShadowsocksServer {
    pub fn new(
        inner: Arc<dyn TunnelServer>,
        method: Method,
        password: &str,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            method,
            master_key: Arc::new(derive_master_key(password, method.key_len())),
            shutdown: parent.child_token(),
        })
    }
}

#[async_trait]
impl TunnelServer for ShadowsocksServer {
    async fn accept_stream(&self) -> Result<StreamConn, TunnelError> {
        let (stream, metadata) = self.inner.accept_stream().await?.into_parts();
        Ok(StreamConn::new(
            SsStream::new(stream, self.method, self.master_key.clone()),
            metadata,
        ))
    }

    async fn accept_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        Err(TunnelError::NotSupported("packets"))
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.inner.close();
    }
}
