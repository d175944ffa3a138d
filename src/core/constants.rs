//! Protocol constants.
//!
//! These values are fixed by the wire protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed wire header length: version, type, subtype, reserved, remote
/// index (4), sequence (8).
pub const HEADER_LEN: usize = 16;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// ChaCha20-Poly1305 nonce size.
pub const AEAD_NONCE_SIZE: usize = 12;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Ed25519 certificate signature size.
pub const SIGNATURE_SIZE: usize = 64;

/// SHA-256 certificate fingerprint size.
pub const FINGERPRINT_SIZE: usize = 32;

/// Recommended maximum datagram size.
pub const MTU: usize = 1300;

// =============================================================================
// SESSIONS
// =============================================================================

/// Replay window size in sequence numbers for established tunnels.
pub const REPLAY_WINDOW_SIZE: u64 = 1024;

/// Sequence numbers reserved for the two handshake flights; data traffic
/// starts immediately after in both directions.
pub const HANDSHAKE_SEQUENCES: u64 = 2;

/// Maximum plaintext packets queued while a handshake is in flight.
pub const PACKET_STORE_LIMIT: usize = 64;

/// How many times a random local index allocation may collide before the
/// attempt is abandoned.
pub const INDEX_ALLOC_RETRIES: u32 = 32;

// =============================================================================
// HANDSHAKE TIMING
// =============================================================================

/// Interval between stage-0 retransmissions.
pub const HANDSHAKE_TRY_INTERVAL: Duration = Duration::from_millis(100);

/// Stage-0 retransmissions before a pending handshake is abandoned.
pub const HANDSHAKE_RETRIES: u32 = 20;
