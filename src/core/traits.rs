//! Collaborator traits injected into the dispatcher.
//!
//! The core never talks to a socket, a TUN device, a discovery service or a
//! metrics sink directly. Each is a trait object supplied at construction,
//! so multiple nodes can run in one process and tests can substitute
//! in-memory fakes.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::core::addr::VpnIp;
use crate::wire::{MsgSubType, MsgType};

/// The outside (underlay) packet writer. Sends are fire-and-forget from
/// the core's view; failures are reported to metrics, never unwound into
/// the session state.
pub trait UdpSender: Send + Sync {
    /// Send one datagram to the given underlay address.
    fn send_to(&self, packet: &[u8], addr: SocketAddr) -> io::Result<()>;
}

/// The inside (overlay) packet writer, i.e. the platform TUN device.
pub trait TunWriter: Send + Sync {
    /// Deliver one decrypted packet to the local stack.
    fn write(&self, packet: &[u8]) -> io::Result<()>;
}

/// Peer discovery. Queried when a handshake starts with no known remote;
/// may block the caller.
pub trait Lighthouse: Send + Sync {
    /// Look up candidate underlay addresses for a VPN IP.
    fn query(&self, vpn_ip: VpnIp) -> Vec<SocketAddr>;
}

/// A lighthouse that knows nothing. Useful when remotes are provisioned
/// statically.
pub struct NoLighthouse;

impl Lighthouse for NoLighthouse {
    fn query(&self, _vpn_ip: VpnIp) -> Vec<SocketAddr> {
        Vec::new()
    }
}

/// Metrics sink. All methods default to no-ops so implementors only
/// observe what they care about.
pub trait Metrics: Send + Sync {
    /// A packet of the given type was sent.
    fn tx(&self, t: MsgType, st: MsgSubType) {
        let _ = (t, st);
    }

    /// A packet of the given type was received and dispatched.
    fn rx(&self, t: MsgType, st: MsgSubType) {
        let _ = (t, st);
    }

    /// A handshake reached completion.
    fn handshake_completed(&self, elapsed: Duration) {
        let _ = elapsed;
    }

    /// A packet was dropped; the reason is a short static label.
    fn dropped_packet(&self, reason: &'static str) {
        let _ = reason;
    }
}

/// The default metrics sink: discards everything.
pub struct NoMetrics;

impl Metrics for NoMetrics {}

/// Time source. Injected so handshake-timeout behavior is testable with a
/// mock clock.
pub trait Clock: Send + Sync {
    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Wall-clock seconds since the unix epoch, for handshake timestamps.
    fn unix_now(&self) -> u64;
}

/// The real time source.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
