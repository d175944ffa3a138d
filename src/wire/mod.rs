//! Wire formats: the fixed datagram header and the handshake payload
//! record. Everything here is hand-encoded big-endian so both sides agree
//! byte for byte.

mod handshake;
mod header;

pub use handshake::HandshakeDetails;
pub use header::{Header, MsgSubType, MsgType};
