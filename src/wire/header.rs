//! Wire header encoding and decoding.
//!
//! Every datagram starts with a fixed 16-byte header:
//!
//! ```text
//! 0        1        2        3        4                8                       16
//! +--------+--------+--------+--------+----------------+-----------------------+
//! | version| type   | subtype|reserved| remote index   | sequence              |
//! |        |        |        |        | (u32, BE)      | (u64, BE)             |
//! +--------+--------+--------+--------+----------------+-----------------------+
//! ```
//!
//! The remote index is the *receiver's* connection identifier, letting the
//! dispatcher demultiplex sessions without address matching. The sequence
//! doubles as the AEAD nonce for encrypted payloads.

use crate::core::{WireError, HEADER_LEN, PROTOCOL_VERSION};

/// Top-level message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    /// Handshake flight.
    Handshake,
    /// AEAD-encrypted application data.
    Message,
    /// The sender did not recognize the remote index we used.
    RecvError,
    /// Lighthouse (peer discovery) traffic.
    LightHouse,
    /// Encrypted liveness probe.
    Test,
    /// Authenticated tunnel teardown.
    CloseTunnel,
}

impl MsgType {
    fn to_u8(self) -> u8 {
        match self {
            MsgType::Handshake => 0,
            MsgType::Message => 1,
            MsgType::RecvError => 2,
            MsgType::LightHouse => 3,
            MsgType::Test => 4,
            MsgType::CloseTunnel => 5,
        }
    }

    fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(MsgType::Handshake),
            1 => Ok(MsgType::Message),
            2 => Ok(MsgType::RecvError),
            3 => Ok(MsgType::LightHouse),
            4 => Ok(MsgType::Test),
            5 => Ok(MsgType::CloseTunnel),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// Message subtype, meaningful per type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgSubType {
    /// No subtype.
    None,
    /// Noise IX with psk0 placement (type = handshake).
    IxPsk0,
    /// Probe request (type = test).
    TestRequest,
    /// Probe echo (type = test).
    TestReply,
}

impl MsgSubType {
    fn to_u8(self) -> u8 {
        match self {
            MsgSubType::None => 0,
            MsgSubType::IxPsk0 => 0,
            MsgSubType::TestRequest => 0,
            MsgSubType::TestReply => 1,
        }
    }

    fn from_u8(t: MsgType, v: u8) -> Result<Self, WireError> {
        match (t, v) {
            (MsgType::Handshake, 0) => Ok(MsgSubType::IxPsk0),
            (MsgType::Test, 0) => Ok(MsgSubType::TestRequest),
            (MsgType::Test, 1) => Ok(MsgSubType::TestReply),
            (_, 0) => Ok(MsgSubType::None),
            (_, other) => Err(WireError::UnknownSubType(other)),
        }
    }
}

/// A decoded wire header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Wire protocol version.
    pub version: u8,
    /// Message type.
    pub msg_type: MsgType,
    /// Message subtype.
    pub subtype: MsgSubType,
    /// The receiver's connection index (0 when not yet known).
    pub remote_index: u32,
    /// Sequence number; nonce for encrypted payloads.
    pub sequence: u64,
}

impl Header {
    /// Build a header for the current protocol version.
    pub fn new(msg_type: MsgType, subtype: MsgSubType, remote_index: u32, sequence: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            subtype,
            remote_index,
            sequence,
        }
    }

    /// Encode into the fixed 16-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut b = [0u8; HEADER_LEN];
        b[0] = self.version;
        b[1] = self.msg_type.to_u8();
        b[2] = self.subtype.to_u8();
        b[3] = 0; // reserved
        b[4..8].copy_from_slice(&self.remote_index.to_be_bytes());
        b[8..16].copy_from_slice(&self.sequence.to_be_bytes());
        b
    }

    /// Decode from the front of a datagram.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::UnexpectedEof);
        }
        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let msg_type = MsgType::from_u8(data[1])?;
        let subtype = MsgSubType::from_u8(msg_type, data[2])?;
        let remote_index = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&data[8..16]);
        Ok(Self {
            version,
            msg_type,
            subtype,
            remote_index,
            sequence: u64::from_be_bytes(seq),
        })
    }
}
