//! Per-session connection state.
//!
//! A [`ConnectionState`] is created when a handshake attempt starts and
//! sealed when it completes: the Noise state is consumed, the split keys
//! become the two direction ciphers, and from then on nothing in it is
//! ever replaced. A rehandshake builds a whole new ConnectionState (and
//! HostInfo) rather than mutating a live one.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cert::Certificate;
use crate::core::{CryptoError, HANDSHAKE_SEQUENCES};
use crate::replay::ReplayWindow;

use super::cipher::CipherState;
use super::keys::{PresharedKey, StaticKeypair};
use super::noise::{NoiseIx, SplitKeys};

/// Crypto state for one session: the in-flight Noise handshake, then the
/// sealed transport keys, the outbound sequence counter, and the inbound
/// replay window.
pub struct ConnectionState {
    noise: Option<NoiseIx>,
    initiator: bool,
    ready: bool,
    e_key: Option<CipherState>,
    d_key: Option<CipherState>,
    message_counter: AtomicU64,
    /// Inbound replay window. Accessed only under the owning HostInfo
    /// lock; its counters may be sampled concurrently.
    pub window: ReplayWindow,
    peer_cert: Option<Certificate>,
}

impl ConnectionState {
    /// Start a fresh session in handshake phase.
    pub fn new(
        local_keypair: &StaticKeypair,
        psk: &PresharedKey,
        initiator: bool,
        window_size: u64,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            noise: Some(NoiseIx::new(local_keypair, psk, initiator)?),
            initiator,
            ready: false,
            e_key: None,
            d_key: None,
            message_counter: AtomicU64::new(0),
            window: ReplayWindow::new(window_size),
            peer_cert: None,
        })
    }

    /// Which side of the handshake we play.
    pub fn initiator(&self) -> bool {
        self.initiator
    }

    /// Has the handshake completed and the session been marked live?
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Seal the session as live. Called once, after the terminal
    /// handshake message is processed and the HostInfo moves to the main
    /// map.
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    /// Dispense the next outbound sequence number. Strictly increasing
    /// across concurrent senders.
    pub fn next_sequence(&self) -> u64 {
        self.message_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Write the next handshake flight. Terminal flights also return the
    /// split keys.
    pub fn write_handshake_message(
        &mut self,
        payload: &[u8],
    ) -> Result<(Vec<u8>, Option<SplitKeys>), CryptoError> {
        match self.noise.as_mut() {
            Some(noise) => noise.write_message(payload),
            None => Err(CryptoError::HandshakeFailed("handshake already consumed".into())),
        }
    }

    /// Read the peer's next handshake flight. Terminal flights also return
    /// the split keys.
    pub fn read_handshake_message(
        &mut self,
        message: &[u8],
    ) -> Result<(Vec<u8>, Option<SplitKeys>), CryptoError> {
        match self.noise.as_mut() {
            Some(noise) => noise.read_message(message),
            None => Err(CryptoError::HandshakeFailed("handshake already consumed".into())),
        }
    }

    /// The peer's static key as learned from the Noise transcript.
    pub fn remote_static(&self) -> Option<&[u8]> {
        self.noise.as_ref().and_then(|n| n.remote_static())
    }

    /// Install the split keys for this session's role and close out the
    /// handshake state.
    ///
    /// The outbound counter is normalized past the two handshake
    /// sequences so data traffic starts at the same point on both sides.
    pub fn install_keys(&mut self, keys: SplitKeys) {
        let (e_key, d_key) = if self.initiator {
            (keys.initiator_to_responder, keys.responder_to_initiator)
        } else {
            (keys.responder_to_initiator, keys.initiator_to_responder)
        };
        self.e_key = Some(CipherState::new(e_key));
        self.d_key = Some(CipherState::new(d_key));
        self.message_counter.store(HANDSHAKE_SEQUENCES, Ordering::Relaxed);
        self.noise = None;
    }

    /// Record the peer's validated certificate.
    pub fn set_peer_cert(&mut self, cert: Certificate) {
        self.peer_cert = Some(cert);
    }

    /// The peer's validated certificate, once known.
    pub fn peer_cert(&self) -> Option<&Certificate> {
        self.peer_cert.as_ref()
    }

    /// Encrypt outbound data under this session's send key.
    pub fn encrypt(&self, seq: u64, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &self.e_key {
            Some(key) => key.encrypt(seq, ad, plaintext),
            None => Err(CryptoError::NotReady),
        }
    }

    /// Decrypt inbound data under this session's receive key.
    pub fn decrypt(&self, seq: u64, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &self.d_key {
            Some(key) => key.decrypt(seq, ad, ciphertext),
            None => Err(CryptoError::NotReady),
        }
    }
}
