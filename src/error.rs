//! # Error Types
//!
//! Error handling for the connection layer.
//!
//! Every layer (channel, TLS, bundle framing, control panel protocol, workers)
//! reports failures through [`ProtocolError`]. Lower layers never retry on their
//! own; a returned error means the connection is finished and should be torn down.
//!
//! ## Error Categories
//! - **Transport**: I/O failures, peer closed, reset
//! - **Protocol**: oversized or malformed bundles, bad connection header,
//!   decompression failure, malformed command envelopes
//! - **Authentication**: challenge-response mismatch (distinguished close)
//! - **TLS**: handshake failures and untrusted certificate chains
//! - **Timeout**: watchdog cancellation
//!
//! ## Example Usage
//! ```rust
//! use bundle_net::error::{ProtocolError, Result};
//! use tracing::{info, warn};
//!
//! fn report(result: Result<()>) {
//!     match result {
//!         Ok(()) => {}
//!         Err(e) if e.is_expected_disconnect() => info!(error=%e, "Disconnected"),
//!         Err(e) => warn!(error=%e, "Connection terminated"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Envelope errors
    pub const ERR_MISSING_COMMAND: &str = "Command envelope is missing 'Command'";
    pub const ERR_MISSING_PAYLOAD: &str = "Command envelope is missing 'Payload'";

    /// Authentication errors
    pub const ERR_UNKNOWN_IDENTITY: &str = "Unknown identity";
    pub const ERR_CHALLENGE_MISMATCH: &str = "Challenge response mismatch";
    pub const ERR_CHALLENGE_UNREADABLE: &str = "Unable to decrypt challenge";
    pub const ERR_UNEXPECTED_AUTH_MESSAGE: &str = "Unexpected authentication message";
    pub const ERR_CREDENTIAL_KIND: &str = "Credential kind does not match challenge";

    /// TLS errors
    pub const ERR_VERIFICATION_ABORTED: &str = "Peer verification task aborted";
    pub const ERR_NO_PEER_CERTIFICATE: &str = "Peer presented no certificate";

    /// Misc
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
    pub const ERR_WORKER_GONE: &str = "Worker is no longer running";
}

/// ProtocolError is the primary error type for all connection-layer operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Bundle too large: {0} bytes")]
    OversizedBundle(usize),

    #[error("Invalid connection header")]
    InvalidHeader,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Untrusted certificate chain ({} certificates)", chain.len())]
    UntrustedCertificate {
        /// DER encoded chain presented by the peer, leaf first
        chain: Vec<Vec<u8>>,
    },

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Disconnects that happen in normal operation: peer went away, timeouts, shutdown.
    pub fn is_expected_disconnect(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed
            | ProtocolError::Timeout
            | ProtocolError::Cancelled => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// The peer broke the wire protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::OversizedBundle(_)
                | ProtocolError::InvalidHeader
                | ProtocolError::DecompressionFailure
                | ProtocolError::MalformedEnvelope(_)
                | ProtocolError::DeserializeError(_)
        )
    }

    /// Authentication mismatch, logged separately from protocol violations.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, ProtocolError::AuthenticationFailed(_))
    }

    /// Carry this error through an `io::Error` boundary (e.g. [`crate::core::channel::Channel`]).
    pub fn into_io(self) -> io::Error {
        match self {
            ProtocolError::Io(e) => e,
            other => io::Error::other(other),
        }
    }

    /// Recover an error tunnelled with [`ProtocolError::into_io`]; plain I/O errors
    /// become [`ProtocolError::Io`].
    pub fn from_io(error: io::Error) -> Self {
        let tunnelled = error
            .get_ref()
            .is_some_and(|inner| inner.is::<ProtocolError>());
        if !tunnelled {
            return ProtocolError::Io(error);
        }
        match error.into_inner().map(|inner| inner.downcast::<ProtocolError>()) {
            Some(Ok(inner)) => *inner,
            _ => ProtocolError::Custom("unrecoverable tunnelled error".into()),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(ProtocolError::ConnectionClosed.is_expected_disconnect());
        assert!(ProtocolError::Timeout.is_expected_disconnect());
        assert!(
            ProtocolError::Io(io::Error::from(io::ErrorKind::UnexpectedEof))
                .is_expected_disconnect()
        );
        assert!(!ProtocolError::InvalidHeader.is_expected_disconnect());

        assert!(ProtocolError::OversizedBundle(1 << 27).is_protocol_violation());
        assert!(!ProtocolError::Timeout.is_protocol_violation());

        let auth = ProtocolError::AuthenticationFailed(constants::ERR_CHALLENGE_MISMATCH.into());
        assert!(auth.is_authentication_failure());
        assert!(!auth.is_protocol_violation());
    }

    #[test]
    fn test_io_tunnel_roundtrip() {
        let err = ProtocolError::UntrustedCertificate { chain: vec![vec![9]] };
        match ProtocolError::from_io(err.into_io()) {
            ProtocolError::UntrustedCertificate { chain } => assert_eq!(chain, vec![vec![9]]),
            other => panic!("unexpected {other:?}"),
        }

        let plain = io::Error::from(io::ErrorKind::BrokenPipe);
        assert!(matches!(
            ProtocolError::from_io(plain),
            ProtocolError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe
        ));
    }

    #[test]
    fn test_untrusted_certificate_message() {
        let err = ProtocolError::UntrustedCertificate {
            chain: vec![vec![1, 2, 3], vec![4, 5]],
        };
        assert_eq!(err.to_string(), "Untrusted certificate chain (2 certificates)");
    }
}
