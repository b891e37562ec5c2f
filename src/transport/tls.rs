//! # TLS Transport Layer
//!
//! Wraps any non-blocking [`Channel`] in TLS and exposes the result as a plain
//! byte channel ([`SslChannel`]).
//!
//! The rustls engine is driven sans-IO: ciphertext moves between the engine and
//! the raw channel through local scratch buffers, so the layer never blocks the
//! worker thread and works over TCP and in-memory pipes alike.
//!
//! ## States
//! ```text
//! HANDSHAKE -> VERIFY -> OPEN -> CLOSING -> CLOSED
//! ```
//! States only move forward; CLOSED is absorbing.
//!
//! - **HANDSHAKE**: engine records are exchanged as soon as the engine wants them
//! - **VERIFY**: the engine accepted the chain; the [`TrustManager`] now decides
//!   on a blocking task. While that task is pending the engine is not driven.
//! - **OPEN**: application bytes are encrypted and decrypted through the engine
//! - **CLOSING**: close_notify queued, CLOSED once it has been written
//!
//! Failures force CLOSED. A trust failure surfaces on the next `process()`
//! call; [`ProtocolError::UntrustedCertificate`] keeps the presented chain so the
//! caller can implement trust on first use.
//!
//! ## Certificate material
//! [`TlsContext`] builds rustls configs whose verifiers defer every decision to
//! the trust manager. Handshake signatures are still checked by rustls.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::server::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    Certificate, ClientConfig, ClientConnection, Connection, DistinguishedName, PrivateKey,
    ServerConfig, ServerConnection, ServerName,
};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::io::Interest;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::core::channel::{closed_error, Channel};
use crate::error::{constants, ProtocolError, Result};
use crate::transport::trust::{PeerSession, TrustManager};
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::timeout::TLS_CLOSE_TIMEOUT;

/// Initial size of the inbound ciphertext scratch buffer
const INBOUND_CHUNK: usize = 16 * 1024;

/// Ciphertext buffered from the raw channel per step before reading stops
const INBOUND_LIMIT: usize = 64 * 1024;

/// Decrypted bytes the engine may hold before it is fed more ciphertext.
/// rustls refuses `read_tls` once its plaintext buffer passes 16 KiB.
const PLAINTEXT_LIMIT: usize = 16 * 1024;

/// TLS record header: type(1) version(2) length(2)
const RECORD_HEADER_LEN: usize = 5;

/// Encrypted bytes buffered before `write` stops accepting plaintext
const OUTBOUND_HIGH_WATER: usize = 256 * 1024;

/// TLS session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsState {
    Handshake,
    Verify,
    Open,
    Closing,
    Closed,
}

/// Server certificate verifier that accepts any chain; trust is decided in VERIFY.
struct DeferredServerVerifier;

impl ServerCertVerifier for DeferredServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Client certificate verifier that requests, but does not require, a certificate.
struct DeferredClientVerifier;

impl ClientCertVerifier for DeferredClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn client_auth_root_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _now: SystemTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }
}

/// Certificate material and rustls configuration for both roles
#[derive(Clone)]
pub struct TlsContext {
    server: Option<Arc<ServerConfig>>,
    client: Arc<ClientConfig>,
    certificate: Option<Vec<u8>>,
}

impl TlsContext {
    /// Build a context from a DER chain (leaf first) and a PKCS#8 DER key.
    ///
    /// The same identity is presented when acting as a client.
    pub fn new(chain: Vec<Vec<u8>>, key: Vec<u8>) -> Result<Self> {
        if chain.is_empty() {
            return Err(ProtocolError::TlsError("No certificates found".into()));
        }
        let leaf = chain[0].clone();
        let chain: Vec<Certificate> = chain.into_iter().map(Certificate).collect();
        let key = PrivateKey(key);

        let server = ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(Arc::new(DeferredClientVerifier))
            .with_single_cert(chain.clone(), key.clone())
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))?;

        let client = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(DeferredServerVerifier))
            .with_client_auth_cert(chain, key)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to set client certificate: {e}")))?;

        Ok(Self {
            server: Some(Arc::new(server)),
            client: Arc::new(client),
            certificate: Some(leaf),
        })
    }

    /// A context that can only dial out and presents no certificate.
    pub fn client_only() -> Self {
        let client = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(DeferredServerVerifier))
            .with_no_client_auth();

        Self {
            server: None,
            client: Arc::new(client),
            certificate: None,
        }
    }

    /// Load a PEM certificate chain and PKCS#8 PEM key from disk
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
        let mut cert_reader = BufReader::new(cert_file);
        let chain = certs(&mut cert_reader)
            .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?;

        let key_file = File::open(key_path.as_ref())
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))?;
        let mut key_reader = BufReader::new(key_file);
        let mut keys = pkcs8_private_keys(&mut key_reader)
            .map_err(|_| ProtocolError::TlsError("Failed to parse private key".into()))?;

        if keys.is_empty() {
            return Err(ProtocolError::TlsError("No private keys found".into()));
        }

        Self::new(chain, keys.swap_remove(0))
    }

    /// Mint a throwaway self-signed identity for `names`
    pub fn self_signed(names: Vec<String>) -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(names)
            .map_err(|e| ProtocolError::TlsError(format!("Certificate generation error: {e}")))?;
        Self::new(
            vec![certified.cert.der().to_vec()],
            certified.signing_key.serialize_der(),
        )
    }

    /// DER encoding of the leaf certificate this context presents
    pub fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref()
    }

    pub fn can_serve(&self) -> bool {
        self.server.is_some()
    }

    fn engine(&self, address: &str, client_mode: bool) -> Result<Connection> {
        if client_mode {
            let name = server_name(address)?;
            let conn = ClientConnection::new(self.client.clone(), name)
                .map_err(|e| ProtocolError::TlsError(e.to_string()))?;
            Ok(conn.into())
        } else {
            let config = self.server.clone().ok_or_else(|| {
                ProtocolError::TlsError("Context has no server certificate".into())
            })?;
            let conn =
                ServerConnection::new(config).map_err(|e| ProtocolError::TlsError(e.to_string()))?;
            Ok(conn.into())
        }
    }
}

/// SNI name for `address`, accepting "host" or "host:port"
fn server_name(address: &str) -> Result<ServerName> {
    if let Ok(name) = ServerName::try_from(address) {
        return Ok(name);
    }
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host.trim_matches(&['[', ']'][..]),
        _ => address,
    };
    ServerName::try_from(host).map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
}

/// Wrap `raw` in TLS. The handshake runs as the channel is processed.
pub fn new_ssl_channel<C: Channel>(
    trust: Arc<dyn TrustManager>,
    address: &str,
    raw: C,
    context: &TlsContext,
    client_mode: bool,
) -> Result<SslChannel<C>> {
    let engine = context.engine(address, client_mode)?;
    global_metrics().handshake_attempt();
    trace!(%address, client_mode, "TLS handshake starting");
    Ok(SslChannel {
        raw,
        engine,
        state: TlsState::Handshake,
        address: address.to_string(),
        client_mode,
        trust,
        inbound: vec![0; INBOUND_CHUNK],
        inbound_len: 0,
        outbound: Vec::new(),
        outbound_pos: 0,
        pending_tasks: Arc::new(AtomicUsize::new(0)),
        verdict: Arc::new(Mutex::new(None)),
        task: None,
        task_done: Arc::new(Notify::new()),
        plaintext_pending: 0,
        raw_eof: false,
        peer_closed: false,
        bytes_read: AtomicU64::new(0),
        bytes_written: AtomicU64::new(0),
    })
}

/// TLS over any [`Channel`]
pub struct SslChannel<C: Channel> {
    raw: C,
    engine: Connection,
    state: TlsState,
    address: String,
    client_mode: bool,
    trust: Arc<dyn TrustManager>,
    inbound: Vec<u8>,
    inbound_len: usize,
    outbound: Vec<u8>,
    outbound_pos: usize,
    pending_tasks: Arc<AtomicUsize>,
    verdict: Arc<Mutex<Option<Result<()>>>>,
    task: Option<JoinHandle<()>>,
    task_done: Arc<Notify>,
    plaintext_pending: usize,
    raw_eof: bool,
    peer_closed: bool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl<C: Channel> SslChannel<C> {
    pub fn state(&self) -> TlsState {
        self.state
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_client(&self) -> bool {
        self.client_mode
    }

    pub fn raw(&self) -> &C {
        &self.raw
    }

    /// Delegated verification tasks still running
    pub fn pending_tasks(&self) -> usize {
        self.pending_tasks.load(Ordering::Acquire)
    }

    /// Ciphertext bytes read from the raw channel
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Ciphertext bytes written to the raw channel
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// What the peer presented, available from VERIFY onwards
    pub fn peer_session(&self) -> PeerSession {
        PeerSession {
            certificates: self
                .engine
                .peer_certificates()
                .map(|chain| chain.iter().map(|c| c.0.clone()).collect())
                .unwrap_or_default(),
            protocol_version: self.engine.protocol_version().map(|v| format!("{v:?}")),
            cipher_suite: self
                .engine
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
        }
    }

    /// Drive the state machine one step. Returns whether anything moved.
    ///
    /// The first failure is returned once; afterwards the channel is CLOSED and
    /// this returns `Ok(false)`.
    pub fn process(&mut self) -> Result<bool> {
        if self.state == TlsState::Closed {
            return Ok(false);
        }
        match self.step() {
            Ok(progress) => Ok(progress),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Process until OPEN, suspending on the raw channel in between.
    pub async fn handshake(&mut self) -> Result<()> {
        let _timer = Timer::start("tls_handshake");
        loop {
            let progress = self.process()?;
            match self.state {
                TlsState::Open => return Ok(()),
                TlsState::Closing | TlsState::Closed => return Err(ProtocolError::ConnectionClosed),
                _ if progress => continue,
                _ => self.wait(Interest::READABLE).await?,
            }
        }
    }

    /// Queue a close_notify. OPEN (or earlier) moves to CLOSING.
    pub fn request_close(&mut self) {
        if self.state >= TlsState::Closing {
            return;
        }
        self.abort_task();
        self.engine.send_close_notify();
        self.state = TlsState::Closing;
        debug!(address=%self.address, "TLS close requested");
    }

    fn step(&mut self) -> Result<bool> {
        let mut progress = self.flush_tls()?;

        // Engine is not reentrant while delegated work is outstanding
        if self.pending_tasks() > 0 {
            return Ok(progress);
        }

        match self.state {
            TlsState::Handshake => {
                progress |= self.read_tls()?;
                progress |= self.flush_tls()?;
                if self.raw_eof {
                    return Err(ProtocolError::ConnectionClosed);
                }
                if !self.engine.is_handshaking() {
                    self.begin_verify();
                    progress = true;
                }
            }
            TlsState::Verify => {
                let verdict = self
                    .verdict
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                self.task = None;
                match verdict {
                    Some(Ok(())) => {
                        self.state = TlsState::Open;
                        global_metrics().handshake_success();
                        info!(
                            address=%self.address,
                            client = self.client_mode,
                            "TLS session open"
                        );
                        progress = true;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(ProtocolError::TlsError(
                            constants::ERR_VERIFICATION_ABORTED.into(),
                        ))
                    }
                }
            }
            TlsState::Open => {
                progress |= self.read_tls()?;
                progress |= self.flush_tls()?;
            }
            TlsState::Closing => {
                if self.engine.wants_write() || self.outbound_pos < self.outbound.len() {
                    return Ok(progress);
                }
                self.state = TlsState::Closed;
                debug!(address=%self.address, "TLS session closed");
                progress = true;
            }
            TlsState::Closed => {}
        }
        Ok(progress)
    }

    /// Hand the presented chain to the trust manager on a blocking task.
    fn begin_verify(&mut self) {
        self.state = TlsState::Verify;
        let session = self.peer_session();
        let trust = self.trust.clone();
        let address = self.address.clone();
        let is_client = self.client_mode;
        let verdict = self.verdict.clone();
        let pending = self.pending_tasks.clone();
        let done = self.task_done.clone();

        pending.fetch_add(1, Ordering::AcqRel);
        self.task = Some(tokio::task::spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                trust.verify_session(&address, &session, is_client)
            }))
            .unwrap_or_else(|_| {
                Err(ProtocolError::TlsError(
                    constants::ERR_VERIFICATION_ABORTED.into(),
                ))
            });
            *verdict.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(result);
            pending.fetch_sub(1, Ordering::AcqRel);
            done.notify_one();
        }));
    }

    /// Pull ciphertext from the raw channel into the engine.
    ///
    /// At most `INBOUND_LIMIT` bytes are buffered per step; whatever the engine
    /// cannot take yet stays in `inbound` until the reader drains plaintext.
    fn read_tls(&mut self) -> Result<bool> {
        let mut progress = false;
        while !self.raw_eof && self.inbound_len < INBOUND_LIMIT {
            if self.inbound_len == self.inbound.len() {
                let grown = (self.inbound.len() * 2).min(INBOUND_LIMIT);
                self.inbound.resize(grown, 0);
            }
            let n = match self.raw.read(&mut self.inbound[self.inbound_len..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.raw_eof = true;
                    break;
                }
                Err(e) => return Err(ProtocolError::from_io(e)),
            };
            self.inbound_len += n;
            self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
            progress = true;
        }

        progress |= self.feed_engine()?;
        Ok(progress)
    }

    /// Hand buffered ciphertext to the engine while its plaintext buffer has room.
    fn feed_engine(&mut self) -> Result<bool> {
        let mut progress = false;
        while self.inbound_len > 0 && self.plaintext_pending < PLAINTEXT_LIMIT {
            let consumed = match self.engine.read_tls(&mut &self.inbound[..self.inbound_len]) {
                Ok(n) => n,
                // Plaintext buffer full; resume once the reader drains it
                Err(e) if e.kind() == io::ErrorKind::Other && self.plaintext_pending > 0 => break,
                Err(e) => return Err(ProtocolError::from_io(e)),
            };
            if consumed == 0 {
                break;
            }
            self.inbound.copy_within(consumed..self.inbound_len, 0);
            self.inbound_len -= consumed;
            progress = true;

            match self.engine.process_new_packets() {
                Ok(io_state) => {
                    self.plaintext_pending = io_state.plaintext_bytes_to_read();
                    if io_state.peer_has_closed() {
                        self.peer_closed = true;
                    }
                }
                Err(e) => {
                    // Best effort: let the peer see our alert
                    let _ = self.flush_tls();
                    return Err(ProtocolError::TlsError(e.to_string()));
                }
            }
        }
        Ok(progress)
    }

    /// Whether `inbound` holds at least one complete record the engine has not seen
    fn inbound_has_record(&self) -> bool {
        if self.inbound_len < RECORD_HEADER_LEN {
            return false;
        }
        let body = u16::from_be_bytes([self.inbound[3], self.inbound[4]]) as usize;
        self.inbound_len >= RECORD_HEADER_LEN + body
    }

    /// Move engine output to the raw channel as far as it accepts it.
    fn flush_tls(&mut self) -> Result<bool> {
        while self.engine.wants_write() {
            self.engine.write_tls(&mut self.outbound)?;
        }

        let mut progress = false;
        while self.outbound_pos < self.outbound.len() {
            let n = self
                .raw
                .write(&self.outbound[self.outbound_pos..])
                .map_err(ProtocolError::from_io)?;
            if n == 0 {
                break;
            }
            self.outbound_pos += n;
            self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
            progress = true;
        }
        if self.outbound_pos == self.outbound.len() {
            self.outbound.clear();
            self.outbound_pos = 0;
        }
        Ok(progress)
    }

    async fn wait(&mut self, interest: Interest) -> io::Result<()> {
        match self.state {
            TlsState::Closed => return Err(closed_error()),
            TlsState::Verify => {
                if self.pending_tasks() > 0 {
                    self.task_done.notified().await;
                }
                return Ok(());
            }
            TlsState::Open => {
                // Buffered records need no raw readiness, which may already be spent
                if interest.is_readable()
                    && (self.plaintext_pending > 0
                        || self.inbound_has_record()
                        || self.peer_closed
                        || self.raw_eof)
                {
                    return Ok(());
                }
            }
            TlsState::Handshake | TlsState::Closing => {}
        }

        // Before OPEN only handshake records matter, whatever the caller wants
        let mut wanted = if self.state == TlsState::Open {
            interest
        } else {
            Interest::READABLE
        };
        if self.outbound_pos < self.outbound.len() {
            wanted = wanted | Interest::WRITABLE;
        }
        self.raw.ready(wanted).await
    }

    async fn drive_close(&mut self) {
        loop {
            match self.process() {
                Ok(_) if self.state == TlsState::Closed => return,
                Ok(true) => continue,
                Ok(false) => {
                    if self.raw.ready(Interest::WRITABLE).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }

    fn fail(&mut self, error: &ProtocolError) {
        let was_open = self.state >= TlsState::Open;
        self.state = TlsState::Closed;
        self.abort_task();
        if !was_open {
            global_metrics().handshake_failed();
            warn!(address=%self.address, error=%error, "TLS handshake failed");
        } else {
            debug!(address=%self.address, error=%error, "TLS session failed");
        }
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<C: Channel> Channel for SslChannel<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.process().map_err(ProtocolError::into_io)?;
        match self.state {
            TlsState::Open | TlsState::Closing => {}
            TlsState::Closed => return Err(closed_error()),
            TlsState::Handshake | TlsState::Verify => return Ok(0),
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match self.engine.reader().read(buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => {
                    self.plaintext_pending = self.plaintext_pending.saturating_sub(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.plaintext_pending = 0;
                    // Drained; ciphertext held back while the buffer was full goes in now
                    let fed = match self.feed_engine() {
                        Ok(fed) => fed,
                        Err(e) => {
                            self.fail(&e);
                            return Err(e.into_io());
                        }
                    };
                    if fed {
                        continue;
                    }
                    return if self.raw_eof && !self.inbound_has_record() {
                        Err(io::Error::from(io::ErrorKind::UnexpectedEof))
                    } else {
                        Ok(0)
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.process().map_err(ProtocolError::into_io)?;
        match self.state {
            TlsState::Open => {}
            TlsState::Handshake | TlsState::Verify => return Ok(0),
            TlsState::Closing | TlsState::Closed => return Err(closed_error()),
        }
        if self.outbound.len() - self.outbound_pos >= OUTBOUND_HIGH_WATER {
            return Ok(0);
        }

        let n = self.engine.writer().write(buf)?;
        self.flush_tls().map_err(ProtocolError::into_io)?;
        Ok(n)
    }

    async fn ready(&mut self, interest: Interest) -> io::Result<()> {
        self.wait(interest).await
    }

    fn is_open(&self) -> bool {
        self.state < TlsState::Closing && self.raw.is_open()
    }

    #[instrument(skip(self), level = "debug")]
    async fn close(&mut self) -> io::Result<()> {
        if self.state < TlsState::Closed {
            self.request_close();
            if tokio::time::timeout(TLS_CLOSE_TIMEOUT, self.drive_close())
                .await
                .is_err()
            {
                debug!("close_notify not drained before timeout");
            }
            self.state = TlsState::Closed;
        }
        self.abort_task();
        self.raw.close().await
    }
}

impl<C: Channel> Drop for SslChannel<C> {
    fn drop(&mut self) {
        self.abort_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::{pipe, PipeChannel};
    use crate::transport::trust::{AcceptAll, PinnedTrust};

    fn pair(
        server_trust: Arc<dyn TrustManager>,
        client_trust: Arc<dyn TrustManager>,
    ) -> (SslChannel<PipeChannel>, SslChannel<PipeChannel>, TlsContext) {
        let ctx = TlsContext::self_signed(vec!["localhost".into()]).unwrap();
        let (a, b) = pipe();
        let server = new_ssl_channel(server_trust, "localhost", a, &ctx, false).unwrap();
        let client = new_ssl_channel(client_trust, "localhost", b, &ctx, true).unwrap();
        (server, client, ctx)
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn test_handshake_and_exchange() {
        let (mut server, mut client, _) = pair(Arc::new(AcceptAll), Arc::new(AcceptAll));
        let (s, c) = tokio::join!(server.handshake(), client.handshake());
        s.unwrap();
        c.unwrap();
        assert_eq!(server.state(), TlsState::Open);

        assert_eq!(client.write(b"hello tls").unwrap(), 9);
        let mut buf = [0u8; 32];
        let mut read = 0;
        while read < 9 {
            server.ready(Interest::READABLE).await.unwrap();
            read += server.read(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf[..read], b"hello tls");
        assert!(!client.peer_session().certificates.is_empty());
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn test_untrusted_chain_surfaces_certificate() {
        let (mut server, mut client, ctx) =
            pair(Arc::new(AcceptAll), Arc::new(PinnedTrust::new()));
        let (_, c) = tokio::join!(server.handshake(), client.handshake());
        match c {
            Err(ProtocolError::UntrustedCertificate { chain }) => {
                assert_eq!(chain[0], ctx.certificate().unwrap());
            }
            other => panic!("expected untrusted certificate, got {other:?}"),
        }
        assert_eq!(client.state(), TlsState::Closed);
        assert!(client.process().is_ok());
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn test_close_is_idempotent_and_monotonic() {
        let (mut server, mut client, _) = pair(Arc::new(AcceptAll), Arc::new(AcceptAll));
        let (s, c) = tokio::join!(server.handshake(), client.handshake());
        s.unwrap();
        c.unwrap();

        client.close().await.unwrap();
        assert_eq!(client.state(), TlsState::Closed);
        client.close().await.unwrap();
        client.request_close();
        assert_eq!(client.state(), TlsState::Closed);
        assert!(client.write(b"late").is_err());

        let mut buf = [0u8; 8];
        let mut saw_eof = false;
        for _ in 0..16 {
            match server.read(&mut buf) {
                Ok(0) => server.ready(Interest::READABLE).await.unwrap(),
                Ok(_) => continue,
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
                    saw_eof = true;
                    break;
                }
            }
        }
        assert!(saw_eof);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_context_from_pem_files() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let dir = std::env::temp_dir().join(format!("bundle-net-pem-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.signing_key.serialize_pem()).unwrap();

        let ctx = TlsContext::from_pem_files(&cert_path, &key_path).unwrap();
        assert!(ctx.can_serve());
        assert_eq!(ctx.certificate().unwrap(), certified.cert.der().as_ref());

        assert!(TlsContext::from_pem_files(&dir.join("missing.pem"), &key_path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_server_name_strips_port() {
        assert!(server_name("localhost:9000").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("").is_err());
    }

    #[test]
    fn test_state_order() {
        assert!(TlsState::Handshake < TlsState::Verify);
        assert!(TlsState::Open < TlsState::Closing);
        assert!(TlsState::Closing < TlsState::Closed);
    }
}
