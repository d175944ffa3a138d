//! Error types for the Burrow protocol.

use thiserror::Error;

/// Errors decoding or encoding wire structures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than the structure it should contain.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Unsupported wire protocol version.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown message type byte.
    #[error("unknown message type: {0}")]
    UnknownType(u8),

    /// Unknown message subtype byte for the given type.
    #[error("unknown message subtype: {0}")]
    UnknownSubType(u8),

    /// A length field exceeds the data that follows it.
    #[error("invalid length field")]
    InvalidLength,
}

/// Errors in the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Noise handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The handshake did not arrive at transport keys.
    #[error("noise did not arrive at a key")]
    NoKeyMaterial,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed")]
    DecryptionFailed,

    /// Encrypt or decrypt was called before keys were derived.
    #[error("cipher state not ready")]
    NotReady,
}

/// Errors validating peer certificates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CertError {
    /// Certificate bytes did not decode.
    #[error("malformed certificate: {0}")]
    Malformed(#[from] WireError),

    /// Signature did not verify against any trusted CA.
    #[error("certificate signature did not match any trusted CA")]
    UntrustedSignature,

    /// The embedded public key is not a valid key.
    #[error("invalid public key in certificate")]
    InvalidPublicKey,

    /// The certificate names our own VPN IP.
    #[error("refusing to handshake with myself")]
    SelfReference,
}

/// Errors surfaced by the handshake manager and host registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Duplicate completed handshake; the cached response was resent.
    #[error("handshake already seen")]
    AlreadySeen,

    /// A tunnel for this VPN IP already exists and we lost the race.
    #[error("existing tunnel wins the handshake race")]
    ExistingHostInfo,

    /// Random local index allocation kept colliding.
    #[error("local index collision")]
    LocalIndexCollision,

    /// Malformed header or ciphertext; dropped silently.
    #[error("invalid packet")]
    InvalidPacket,

    /// Pending handshake aged out before completing.
    #[error("handshake timed out")]
    Timeout,
}

/// Errors constructing an [`crate::interface::Interface`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required collaborator or parameter was not supplied.
    #[error("missing configuration: {0}")]
    Missing(&'static str),

    /// A parameter is out of its valid range.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Top-level Burrow errors.
#[derive(Debug, Error)]
pub enum BurrowError {
    /// Wire codec error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Certificate error.
    #[error("certificate error: {0}")]
    Cert(#[from] CertError),

    /// Handshake error.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
