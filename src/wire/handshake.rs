//! The handshake payload record.
//!
//! Carried inside the Noise messages of both flights. Encoding is
//! deterministic: the same record always produces the same bytes, which the
//! handshake manager relies on to recognize retransmitted stage-0 packets.
//!
//! ```text
//! initiator_index (u32, BE)
//! responder_index (u32, BE)   0 in the first flight
//! time            (u64, BE)   unix seconds at the initiator
//! cert_len        (u16, BE)
//! cert            (bytes)     sender's certificate, static key omitted
//! ```

use crate::core::WireError;

/// The record exchanged inside the Noise handshake payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeDetails {
    /// The initiator's randomly chosen connection index.
    pub initiator_index: u32,
    /// The responder's connection index; 0 until the second flight.
    pub responder_index: u32,
    /// Unix seconds at the initiator when the handshake started.
    pub time: u64,
    /// The sender's certificate without its static public key. The key is
    /// recovered from the Noise transcript on receipt.
    pub cert: Vec<u8>,
}

impl HandshakeDetails {
    /// Encode to the deterministic wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18 + self.cert.len());
        out.extend_from_slice(&self.initiator_index.to_be_bytes());
        out.extend_from_slice(&self.responder_index.to_be_bytes());
        out.extend_from_slice(&self.time.to_be_bytes());
        out.extend_from_slice(&(self.cert.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.cert);
        out
    }

    /// Decode from the wire form.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 18 {
            return Err(WireError::UnexpectedEof);
        }
        let initiator_index = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let responder_index = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let mut t = [0u8; 8];
        t.copy_from_slice(&data[8..16]);
        let time = u64::from_be_bytes(t);
        let cert_len = usize::from(u16::from_be_bytes([data[16], data[17]]));
        if data.len() < 18 + cert_len {
            return Err(WireError::InvalidLength);
        }
        Ok(Self {
            initiator_index,
            responder_index,
            time,
            cert: data[18..18 + cert_len].to_vec(),
        })
    }
}
