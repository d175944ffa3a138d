//! The Noise IX handshake: stage machinery, the pending registry, race
//! arbitration, and the retransmission timer.

pub(crate) mod ix;
mod manager;

pub use manager::{CheckError, HandshakeConfig, HandshakeManager};
