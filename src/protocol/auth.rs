//! Challenge-response authentication for the control panel.
//!
//! ## Flow
//! 1. client -> server: `Hello { identity }`
//! 2. server -> client: `Challenge` holding 32 random bytes encrypted with
//!    XChaCha20-Poly1305 under a key only the rightful client can derive
//! 3. client -> server: `Response` with the decrypted challenge
//! 4. server -> client: `Accepted`, or `Rejected` followed by a close
//!
//! ## Key derivation
//! - **Password**: SHA-256 over a fresh per-session salt and the shared password.
//!   A server without the password cannot produce a decryptable challenge, so
//!   both sides are authenticated.
//! - **Keypair**: x25519 between a fresh server ephemeral key and the client's
//!   static key (ECIES). Only the client is authenticated here; the server is
//!   authenticated by TLS.

use std::collections::HashMap;
use std::fmt;

use rand_core::OsRng;
use tracing::{debug, instrument, warn};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::envelope::AuthMessage;
use crate::utils::crypto::{derive_password_key, derive_shared_key, random_bytes, Crypto};

/// Challenge length in bytes
pub const CHALLENGE_LEN: usize = 32;

/// Salt length for password credentials
pub const SALT_LEN: usize = 16;

/// What a client proves it holds
pub enum Secret {
    Password(Zeroizing<String>),
    Keypair(StaticSecret),
}

impl Secret {
    pub fn password(password: impl Into<String>) -> Self {
        Secret::Password(Zeroizing::new(password.into()))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Password(_) => f.write_str("Secret::Password(..)"),
            Secret::Keypair(_) => f.write_str("Secret::Keypair(..)"),
        }
    }
}

/// What a server checks a client against
#[derive(Clone)]
pub enum Verifier {
    Password(Zeroizing<String>),
    PublicKey(PublicKey),
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verifier::Password(_) => f.write_str("Verifier::Password(..)"),
            Verifier::PublicKey(key) => write!(f, "Verifier::PublicKey({:02x?})", &key.as_bytes()[..4]),
        }
    }
}

/// Server-side credential lookup
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, identity: &str) -> Option<Verifier>;
}

/// In-memory identity table
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    entries: HashMap<String, Verifier>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(mut self, identity: impl Into<String>, password: impl Into<String>) -> Self {
        self.entries
            .insert(identity.into(), Verifier::Password(Zeroizing::new(password.into())));
        self
    }

    pub fn with_public_key(mut self, identity: impl Into<String>, key: PublicKey) -> Self {
        self.entries.insert(identity.into(), Verifier::PublicKey(key));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CredentialStore for StaticCredentials {
    fn lookup(&self, identity: &str) -> Option<Verifier> {
        self.entries.get(identity).cloned()
    }
}

/// Server half of one login, created per connection
pub struct ServerChallenge {
    identity: String,
    expected: Zeroizing<Vec<u8>>,
}

impl ServerChallenge {
    /// Answer a `Hello` with a fresh challenge.
    #[instrument(skip(store, message))]
    pub fn issue(store: &dyn CredentialStore, message: AuthMessage) -> Result<(Self, AuthMessage)> {
        let AuthMessage::Hello { identity } = message else {
            return Err(ProtocolError::AuthenticationFailed(
                constants::ERR_UNEXPECTED_AUTH_MESSAGE.into(),
            ));
        };
        let verifier = store.lookup(&identity).ok_or_else(|| {
            ProtocolError::AuthenticationFailed(constants::ERR_UNKNOWN_IDENTITY.into())
        })?;

        let challenge = Zeroizing::new(random_bytes(CHALLENGE_LEN));
        let nonce = Crypto::generate_nonce();
        let (key, salt, ephemeral) = match verifier {
            Verifier::Password(password) => {
                let salt = random_bytes(SALT_LEN);
                (Zeroizing::new(derive_password_key(&password, &salt)), Some(salt), None)
            }
            Verifier::PublicKey(recipient) => {
                let secret = EphemeralSecret::random_from_rng(OsRng);
                let public = PublicKey::from(&secret);
                let shared = secret.diffie_hellman(&recipient);
                let key = derive_shared_key(shared.as_bytes(), public.as_bytes(), recipient.as_bytes());
                (Zeroizing::new(key), None, Some(public.as_bytes().to_vec()))
            }
        };
        let ciphertext = Crypto::new(&key).encrypt(&challenge, &nonce)?;
        debug!(%identity, "Challenge issued");

        Ok((
            Self {
                identity,
                expected: challenge,
            },
            AuthMessage::Challenge {
                nonce: nonce.to_vec(),
                ciphertext,
                salt,
                ephemeral,
            },
        ))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Check the client's `Response`. Returns the authenticated identity.
    pub fn verify(self, message: AuthMessage) -> Result<String> {
        let AuthMessage::Response { challenge } = message else {
            return Err(ProtocolError::AuthenticationFailed(
                constants::ERR_UNEXPECTED_AUTH_MESSAGE.into(),
            ));
        };
        if !constant_time_eq(&challenge, &self.expected) {
            warn!(identity=%self.identity, "Challenge response mismatch");
            return Err(ProtocolError::AuthenticationFailed(
                constants::ERR_CHALLENGE_MISMATCH.into(),
            ));
        }
        Ok(self.identity)
    }
}

/// Client half: decrypt a `Challenge` into the matching `Response`.
pub fn answer_challenge(secret: &Secret, message: AuthMessage) -> Result<AuthMessage> {
    let (nonce, ciphertext, salt, ephemeral) = match message {
        AuthMessage::Challenge {
            nonce,
            ciphertext,
            salt,
            ephemeral,
        } => (nonce, ciphertext, salt, ephemeral),
        other => return Err(rejection(other)),
    };
    let nonce: [u8; 24] = nonce
        .as_slice()
        .try_into()
        .map_err(|_| ProtocolError::AuthenticationFailed(constants::ERR_CHALLENGE_UNREADABLE.into()))?;

    let key = match (secret, salt, ephemeral) {
        (Secret::Password(password), Some(salt), None) => {
            Zeroizing::new(derive_password_key(password, &salt))
        }
        (Secret::Keypair(static_secret), None, Some(ephemeral)) => {
            let ephemeral: [u8; 32] = ephemeral.as_slice().try_into().map_err(|_| {
                ProtocolError::AuthenticationFailed(constants::ERR_CHALLENGE_UNREADABLE.into())
            })?;
            let own = PublicKey::from(static_secret);
            let shared = static_secret.diffie_hellman(&PublicKey::from(ephemeral));
            Zeroizing::new(derive_shared_key(shared.as_bytes(), &ephemeral, own.as_bytes()))
        }
        _ => {
            return Err(ProtocolError::AuthenticationFailed(
                constants::ERR_CREDENTIAL_KIND.into(),
            ))
        }
    };

    let challenge = Crypto::new(&key)
        .decrypt(&ciphertext, &nonce)
        .map_err(|_| ProtocolError::AuthenticationFailed(constants::ERR_CHALLENGE_UNREADABLE.into()))?;
    Ok(AuthMessage::Response { challenge })
}

/// Client half: interpret the server's verdict.
pub fn check_verdict(message: AuthMessage) -> Result<()> {
    match message {
        AuthMessage::Accepted => Ok(()),
        other => Err(rejection(other)),
    }
}

fn rejection(message: AuthMessage) -> ProtocolError {
    match message {
        AuthMessage::Rejected { reason } => ProtocolError::AuthenticationFailed(reason),
        _ => ProtocolError::AuthenticationFailed(constants::ERR_UNEXPECTED_AUTH_MESSAGE.into()),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
