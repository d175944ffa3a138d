//! Core types: addressing, constants, errors, and the collaborator traits
//! injected into the dispatcher.

mod addr;
pub mod constants;
mod error;
mod traits;

pub use addr::{Subnet4, VpnIp};
pub use constants::*;
pub use error::{BurrowError, CertError, ConfigError, CryptoError, HandshakeError, WireError};
pub use traits::{Clock, Lighthouse, Metrics, NoLighthouse, NoMetrics, SystemClock, TunWriter, UdpSender};
