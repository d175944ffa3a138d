//! X25519 static keys and the network pre-shared key.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::core::{PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};

use super::noise::NOISE_PATTERN;

/// A static X25519 keypair for long-term node identity.
///
/// The private key is zeroized on drop.
#[derive(Clone)]
pub struct StaticKeypair {
    private: [u8; PRIVATE_KEY_SIZE],
    public: [u8; PUBLIC_KEY_SIZE],
}

impl StaticKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        // Use snow's keypair generation for proper X25519 keys
        let builder = snow::Builder::new(NOISE_PATTERN.parse().unwrap());
        let keypair = builder.generate_keypair().unwrap();

        let mut private = [0u8; PRIVATE_KEY_SIZE];
        let mut public = [0u8; PUBLIC_KEY_SIZE];
        private.copy_from_slice(&keypair.private);
        public.copy_from_slice(&keypair.public);

        Self { private, public }
    }

    /// Create a keypair from existing key material. The caller must ensure
    /// the private key is valid X25519 key material.
    pub fn from_bytes(private: [u8; PRIVATE_KEY_SIZE], public: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self { private, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Get the private key. Handle with care.
    pub fn private_key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.private
    }
}

impl Drop for StaticKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

/// The network-wide pre-shared key mixed into every handshake at psk
/// position 0. Zeroized on drop.
#[derive(Clone)]
pub struct PresharedKey([u8; 32]);

impl PresharedKey {
    /// Use existing key material.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Default for PresharedKey {
    /// The all-zero key: the open network, for deployments that rely on
    /// certificates alone.
    fn default() -> Self {
        Self([0u8; 32])
    }
}

impl Drop for PresharedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}
