//! Noise IX handshake wrapper.
//!
//! Burrow uses the IX pattern with a network pre-shared key at position 0:
//!
//! ```text
//! Noise_IXpsk0(s, rs):
//!   -> psk, e, s             # Initiator sends ephemeral + static
//!   <- e, ee, se, s, es      # Responder authenticates, completes DH
//! ```
//!
//! Neither side needs the other's static key in advance; both statics
//! travel in the clear-ish first flight and are bound to the certificate
//! carried in the payload. The terminal message yields the two split
//! cipher keys, one per direction.

use snow::{Builder, HandshakeState};

use crate::core::CryptoError;

use super::keys::{PresharedKey, StaticKeypair};

/// Noise protocol pattern for Burrow.
pub const NOISE_PATTERN: &str = "Noise_IXpsk0_25519_ChaChaPoly_BLAKE2s";

/// Raw split cipher keys produced by the terminal handshake message, in
/// transcript order: (initiator-to-responder, responder-to-initiator).
pub struct SplitKeys {
    /// Key protecting initiator → responder traffic.
    pub initiator_to_responder: [u8; 32],
    /// Key protecting responder → initiator traffic.
    pub responder_to_initiator: [u8; 32],
}

/// An in-flight IX handshake, one per connection attempt.
pub struct NoiseIx {
    state: HandshakeState,
}

impl NoiseIx {
    /// Create the handshake state for one side.
    ///
    /// # Arguments
    /// * `local_keypair` - This node's static keypair
    /// * `psk` - The network pre-shared key (psk0 placement)
    /// * `initiator` - Which side of the pattern we play
    pub fn new(
        local_keypair: &StaticKeypair,
        psk: &PresharedKey,
        initiator: bool,
    ) -> Result<Self, CryptoError> {
        let builder = Builder::new(NOISE_PATTERN.parse().unwrap())
            .local_private_key(local_keypair.private_key())
            .psk(0, psk.as_bytes());

        let state = if initiator {
            builder.build_initiator()
        } else {
            builder.build_responder()
        }
        .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;

        Ok(Self { state })
    }

    /// Advance the handshake by writing the next message.
    ///
    /// Returns the message bytes and, on the terminal message, the split
    /// keys.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<(Vec<u8>, Option<SplitKeys>), CryptoError> {
        let mut buf = vec![0u8; 65535];
        let len = self
            .state
            .write_message(payload, &mut buf)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        buf.truncate(len);
        Ok((buf, self.split_if_finished()))
    }

    /// Advance the handshake by reading the peer's next message.
    ///
    /// Returns the decrypted payload and, on the terminal message, the
    /// split keys.
    pub fn read_message(&mut self, message: &[u8]) -> Result<(Vec<u8>, Option<SplitKeys>), CryptoError> {
        let mut payload = vec![0u8; 65535];
        let len = self
            .state
            .read_message(message, &mut payload)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        payload.truncate(len);
        Ok((payload, self.split_if_finished()))
    }

    /// The peer's static public key, once the transcript has carried it.
    pub fn remote_static(&self) -> Option<&[u8]> {
        self.state.get_remote_static()
    }

    fn split_if_finished(&mut self) -> Option<SplitKeys> {
        if !self.state.is_handshake_finished() {
            return None;
        }
        let (initiator_to_responder, responder_to_initiator) =
            self.state.dangerously_get_raw_split();
        Some(SplitKeys {
            initiator_to_responder,
            responder_to_initiator,
        })
    }
}
