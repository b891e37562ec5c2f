//! # Peer Trust
//!
//! Certificate trust decisions are delegated to a [`TrustManager`] capability
//! supplied at construction. The TLS engine itself accepts any well-formed chain
//! (signatures over the handshake are still checked); once the handshake
//! completes, the TLS layer hands the presented chain to the trust manager and
//! only opens the session if it agrees.
//!
//! A trust manager that wants the application to decide later (trust on first
//! use) returns [`ProtocolError::UntrustedCertificate`] carrying the chain.

use std::collections::HashSet;
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{constants, ProtocolError, Result};

/// What the peer presented during the handshake
#[derive(Debug, Clone, Default)]
pub struct PeerSession {
    /// DER certificates, leaf first; empty when the peer sent none
    pub certificates: Vec<Vec<u8>>,
    /// Negotiated protocol version, e.g. "TLSv1_3"
    pub protocol_version: Option<String>,
    /// Negotiated cipher suite name
    pub cipher_suite: Option<String>,
}

impl PeerSession {
    pub fn leaf(&self) -> Option<&[u8]> {
        self.certificates.first().map(Vec::as_slice)
    }
}

/// Pluggable peer verification
pub trait TrustManager: Send + Sync + 'static {
    /// Decide whether the session with `address` may open.
    ///
    /// Runs off the worker thread; it may block.
    fn verify_session(&self, address: &str, session: &PeerSession, is_client: bool) -> Result<()>;
}

/// Calculate the SHA-256 fingerprint of a DER certificate
pub fn fingerprint(certificate: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(certificate);
    hasher.finalize().into()
}

/// Accepts every peer. Development and tests only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl TrustManager for AcceptAll {
    fn verify_session(&self, address: &str, _session: &PeerSession, is_client: bool) -> Result<()> {
        debug!(%address, is_client, "Accepting peer without verification");
        Ok(())
    }
}

/// Trusts peers whose leaf certificate fingerprint is on an allow-list.
///
/// Unknown chains are reported as [`ProtocolError::UntrustedCertificate`] so the
/// caller can ask the user and [`PinnedTrust::pin`] the certificate afterwards.
#[derive(Debug, Default)]
pub struct PinnedTrust {
    pinned: RwLock<HashSet<[u8; 32]>>,
    /// Whether a peer without any certificate is acceptable
    allow_anonymous: bool,
}

impl PinnedTrust {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept peers that present no certificate at all (typical for clients)
    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    /// Trust the certificate with this DER encoding
    pub fn pin(&self, certificate: &[u8]) {
        self.pin_fingerprint(fingerprint(certificate));
    }

    pub fn pin_fingerprint(&self, hash: [u8; 32]) {
        if let Ok(mut pinned) = self.pinned.write() {
            pinned.insert(hash);
        }
    }

    pub fn is_pinned(&self, certificate: &[u8]) -> bool {
        self.pinned
            .read()
            .map(|pinned| pinned.contains(&fingerprint(certificate)))
            .unwrap_or(false)
    }
}

impl TrustManager for PinnedTrust {
    fn verify_session(&self, address: &str, session: &PeerSession, is_client: bool) -> Result<()> {
        let Some(leaf) = session.leaf() else {
            if self.allow_anonymous {
                return Ok(());
            }
            return Err(ProtocolError::TlsError(constants::ERR_NO_PEER_CERTIFICATE.into()));
        };

        if self.is_pinned(leaf) {
            return Ok(());
        }

        warn!(%address, is_client, "Peer certificate is not pinned");
        Err(ProtocolError::UntrustedCertificate {
            chain: session.certificates.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(certs: &[&[u8]]) -> PeerSession {
        PeerSession {
            certificates: certs.iter().map(|c| c.to_vec()).collect(),
            ..PeerSession::default()
        }
    }

    #[test]
    fn test_pinned_trust_flow() {
        let trust = PinnedTrust::new();
        let chain = session(&[b"leaf", b"root"]);

        match trust.verify_session("peer", &chain, true) {
            Err(ProtocolError::UntrustedCertificate { chain }) => {
                assert_eq!(chain, vec![b"leaf".to_vec(), b"root".to_vec()]);
            }
            other => panic!("expected untrusted certificate, got {other:?}"),
        }

        trust.pin(b"leaf");
        assert!(trust.verify_session("peer", &chain, true).is_ok());
    }

    #[test]
    fn test_anonymous_peer() {
        let strict = PinnedTrust::new();
        assert!(matches!(
            strict.verify_session("peer", &PeerSession::default(), false),
            Err(ProtocolError::TlsError(_))
        ));

        let lenient = PinnedTrust::new().allow_anonymous(true);
        assert!(lenient
            .verify_session("peer", &PeerSession::default(), false)
            .is_ok());
    }

    #[test]
    fn test_fingerprint_is_sha256() {
        let hash = fingerprint(b"");
        assert_eq!(hash[..4], [0xe3, 0xb0, 0xc4, 0x42]);
    }
}
