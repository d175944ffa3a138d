//! Post-handshake AEAD cipher state.
//!
//! One [`CipherState`] per direction, built from a raw Noise split key.
//! The nonce is derived from the wire sequence number (four zero bytes,
//! then the sequence big-endian) and the 16-byte wire header rides as
//! associated data, so a datagram authenticates its own routing fields.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::Zeroize;

use crate::core::{CryptoError, AEAD_NONCE_SIZE};

/// AEAD state for one direction of one session.
pub struct CipherState {
    cipher: ChaCha20Poly1305,
}

impl CipherState {
    /// Build from a raw 32-byte split key. The key material is wiped after
    /// the cipher is scheduled.
    pub fn new(mut key: [u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Self { cipher }
    }

    /// Encrypt `plaintext` under the sequence-derived nonce with `ad` as
    /// associated data.
    pub fn encrypt(&self, seq: u64, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(
                Nonce::from_slice(&Self::nonce(seq)),
                Payload {
                    msg: plaintext,
                    aad: ad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt and authenticate `ciphertext`.
    pub fn decrypt(&self, seq: u64, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(
                Nonce::from_slice(&Self::nonce(seq)),
                Payload {
                    msg: ciphertext,
                    aad: ad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn nonce(seq: u64) -> [u8; AEAD_NONCE_SIZE] {
        let mut nonce = [0u8; AEAD_NONCE_SIZE];
        nonce[4..].copy_from_slice(&seq.to_be_bytes());
        nonce
    }
}
