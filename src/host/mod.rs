//! Per-peer records and the triple-indexed registries that hold them.

mod info;
mod map;

pub use info::{CachedPacket, HostInfo, HostState};
pub use map::HostMap;
