//! XChaCha20-Poly1305 AEAD wrapper and key derivation helpers.

use crate::error::{ProtocolError, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Authenticated cipher bound to one 256-bit key
pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Fresh random 24-byte nonce
    pub fn generate_nonce() -> [u8; 24] {
        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; 24]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; 24]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

/// Fill a new buffer of `len` random bytes from the OS RNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Derive a symmetric key from a shared password and a per-session salt.
pub fn derive_password_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"bundle-net password");
    hasher.update((salt.len() as u32).to_be_bytes());
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Derive a symmetric key from an x25519 shared secret and both public halves.
pub fn derive_shared_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut material = *shared;
    let mut hasher = Sha256::new();
    hasher.update(b"bundle-net keypair");
    hasher.update(material);
    hasher.update(ephemeral);
    hasher.update(recipient);
    material.zeroize();
    hasher.finalize().into()
}
