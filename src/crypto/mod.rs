//! Crypto layer: the Noise IX-psk0 handshake, the per-direction AEAD
//! cipher states it yields, and the per-session [`ConnectionState`] that
//! owns both plus the sequence counter and replay window.

mod cipher;
mod connection;
mod keys;
mod noise;

pub use cipher::CipherState;
pub use connection::ConnectionState;
pub use keys::{PresharedKey, StaticKeypair};
pub use noise::{NoiseIx, SplitKeys, NOISE_PATTERN};
