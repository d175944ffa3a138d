//! # Burrow Protocol
//!
//! The session core of a peer-to-peer overlay VPN: how two nodes go from
//! mutual ignorance to an authenticated, key-agreed, full-duplex encrypted
//! tunnel, and how each side then validates every inbound datagram.
//!
//! Three subsystems carry the weight:
//!
//! - A **Noise IX handshake** (two flights, mutual authentication, network
//!   pre-shared key) with race avoidance for simultaneous initiators and
//!   recovery when the wrong peer answers.
//! - A **host registry**: pending and main maps, each indexed by VPN IP,
//!   by our random connection index, and by the peer's.
//! - A **sliding-window replay filter** classifying every inbound sequence
//!   as fresh, duplicate, or out-of-window, with loss accounting.
//!
//! The [`interface::Interface`] ties them together and talks to the world
//! only through injected collaborators (UDP, TUN, lighthouse, metrics,
//! clock), so any number of nodes can run and be tested in one process.
//! [`runtime::Node`] supplies a tokio shell for the real network.
//!
//! ## Modules
//!
//! - [`core`]: addressing, constants, errors, collaborator traits
//! - [`wire`]: datagram header and handshake record codecs
//! - [`cert`]: peer certificates and CA validation
//! - [`replay`]: the sliding replay window
//! - [`crypto`]: Noise IX, AEAD cipher states, per-session state
//! - [`host`]: per-peer records and the triple-indexed registries
//! - [`handshake`]: stage machinery, race arbitration, retry timing
//! - [`interface`]: the dispatcher
//! - [`runtime`]: tokio driver
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use burrow_protocol::prelude::*;
//!
//! # async fn example() -> Result<(), BurrowError> {
//! let ca_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
//! let static_key = StaticKeypair::generate();
//! let cert = Certificate::sign(
//!     CertDetails {
//!         name: "laptop".into(),
//!         vpn_ip: VpnIp::from_octets(10, 42, 0, 1),
//!         subnets: Vec::new(),
//!         public_key: *static_key.public_key(),
//!     },
//!     &ca_key,
//! );
//!
//! let node = Node::bind(
//!     "0.0.0.0:4242".parse().unwrap(),
//!     Interface::builder()
//!         .inside(Arc::new(MyTun))
//!         .ca(CaPool::new([ca_key.verifying_key()]))
//!         .cert(CertState::new(cert))
//!         .static_key(static_key)
//!         .psk(PresharedKey::generate()),
//! )
//! .await?;
//! node.run().await?;
//! # Ok(())
//! # }
//! # struct MyTun;
//! # impl TunWriter for MyTun {
//! #     fn write(&self, _packet: &[u8]) -> std::io::Result<()> { Ok(()) }
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cert;
pub mod core;
pub mod crypto;
pub mod handshake;
pub mod host;
pub mod interface;
pub mod replay;
pub mod runtime;
pub mod wire;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cert::{CaPool, CertDetails, CertState, Certificate};
    pub use crate::core::{
        BurrowError, Clock, HandshakeError, Lighthouse, Metrics, Subnet4, TunWriter, UdpSender,
        VpnIp,
    };
    pub use crate::crypto::{ConnectionState, PresharedKey, StaticKeypair};
    pub use crate::handshake::{HandshakeConfig, HandshakeManager};
    pub use crate::host::{HostInfo, HostMap};
    pub use crate::interface::{Interface, InterfaceBuilder};
    pub use crate::replay::ReplayWindow;
    pub use crate::runtime::Node;
    pub use crate::wire::{Header, MsgSubType, MsgType};
}

// Re-export commonly used items at crate root
pub use crate::core::{BurrowError, VpnIp};
pub use crate::interface::Interface;
pub use crate::replay::ReplayWindow;
