//! Per-peer session record.
//!
//! A [`HostInfo`] exists per peer per attempt: created when a local flow
//! needs a tunnel or a stage-1 packet arrives, registered in the pending
//! map, moved wholesale to the main map on completion, and dropped when
//! the tunnel is replaced or times out. One exclusive lock covers every
//! mutable field; the maps and the retry timer only ever hold `Arc`s.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::core::{Subnet4, VpnIp, PACKET_STORE_LIMIT};
use crate::crypto::ConnectionState;
use crate::wire::{MsgSubType, MsgType};

/// A plaintext packet queued while its tunnel is still handshaking.
#[derive(Clone, Debug)]
pub struct CachedPacket {
    /// Type it will be sent as once the tunnel is up.
    pub msg_type: MsgType,
    /// Subtype it will be sent as.
    pub subtype: MsgSubType,
    /// The plaintext payload.
    pub payload: Vec<u8>,
}

/// Shared per-peer record. Lock order: a HostInfo lock may be taken while
/// no map lock is held, and map locks may be taken while holding it —
/// never the other way around.
pub struct HostInfo {
    state: Mutex<HostState>,
}

/// The mutable fields of a [`HostInfo`], all behind its one lock.
pub struct HostState {
    /// The peer's overlay address. Rewritten only by wrong-peer recovery.
    pub host_id: VpnIp,
    /// Our randomly chosen connection index; 0 until allocated.
    pub local_index_id: u32,
    /// The peer's connection index; 0 until learned.
    pub remote_index_id: u32,
    /// The underlay address currently in use.
    pub remote: Option<SocketAddr>,
    /// Candidate underlay addresses, in preference order.
    pub remotes: Vec<SocketAddr>,
    /// Addresses proven faulty during a prior attempt; never re-added.
    pub bad_remotes: Vec<SocketAddr>,
    /// Raw handshake datagrams by stage (0 and 2), kept for idempotent
    /// retransmission.
    pub handshake_packet: HashMap<u8, Vec<u8>>,
    /// Plaintext queued while the handshake is incomplete.
    pub packet_store: VecDeque<CachedPacket>,
    /// The session crypto state.
    pub connection: ConnectionState,
    /// A stage-0 packet has been built and may be (re)sent.
    pub handshake_ready: bool,
    /// The handshake finished and this record lives in the main map.
    pub handshake_complete: bool,
    /// When the attempt started.
    pub handshake_start: Instant,
    /// Next scheduled stage-0 retransmission.
    pub next_handshake_try: Instant,
    /// Stage-0 transmissions so far.
    pub handshake_attempts: u32,
    /// Source subnets the peer's certificate authorizes.
    pub remote_cidr: Vec<Subnet4>,
}

impl HostInfo {
    /// Create a record for a peer in handshake phase.
    pub fn new(host_id: VpnIp, connection: ConnectionState, now: Instant) -> Self {
        Self {
            state: Mutex::new(HostState {
                host_id,
                local_index_id: 0,
                remote_index_id: 0,
                remote: None,
                remotes: Vec::new(),
                bad_remotes: Vec::new(),
                handshake_packet: HashMap::new(),
                packet_store: VecDeque::new(),
                connection,
                handshake_ready: false,
                handshake_complete: false,
                handshake_start: now,
                next_handshake_try: now,
                handshake_attempts: 0,
                remote_cidr: Vec::new(),
            }),
        }
    }

    /// Take the exclusive lock. Poisoning is unrecoverable state
    /// corruption, so it propagates as a panic.
    pub fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("hostinfo lock poisoned")
    }
}

impl HostState {
    /// Append a candidate address unless it is already known or was
    /// previously proven bad. The first address also becomes current.
    pub fn add_remote(&mut self, addr: SocketAddr) {
        if self.bad_remotes.contains(&addr) || self.remotes.contains(&addr) {
            return;
        }
        self.remotes.push(addr);
        if self.remote.is_none() {
            self.remote = Some(addr);
        }
    }

    /// Pin the current address, learning it if new.
    pub fn set_remote(&mut self, addr: SocketAddr) {
        self.add_remote(addr);
        self.remote = Some(addr);
    }

    /// Mark an address as faulty: it is removed from the candidates and
    /// never re-added.
    pub fn block_remote(&mut self, addr: SocketAddr) {
        if !self.bad_remotes.contains(&addr) {
            self.bad_remotes.push(addr);
        }
        self.remotes.retain(|r| *r != addr);
        if self.remote == Some(addr) {
            self.remote = self.remotes.first().copied();
        }
    }

    /// Reorder candidates so the first match of each preferred range rises
    /// to the head, remaining candidates keeping insertion order, and make
    /// the new head current.
    pub fn force_promote_best(&mut self, preferred_ranges: &[Subnet4]) {
        let mut head: Vec<SocketAddr> = Vec::new();
        for range in preferred_ranges {
            if let Some(addr) = self
                .remotes
                .iter()
                .find(|r| range.contains_addr(r) && !head.contains(r))
            {
                head.push(*addr);
            }
        }
        let rest: Vec<SocketAddr> = self
            .remotes
            .iter()
            .filter(|r| !head.contains(r))
            .copied()
            .collect();
        head.extend(rest);
        self.remotes = head;
        if let Some(first) = self.remotes.first() {
            self.remote = Some(*first);
        }
    }

    /// Rotate to the next candidate address, for retry sweeps across a
    /// multi-homed peer.
    pub fn rotate_remote(&mut self) {
        if self.remotes.len() > 1 {
            self.remotes.rotate_left(1);
            self.remote = self.remotes.first().copied();
        }
    }

    /// Cache the raw datagram for a handshake stage.
    pub fn cache_handshake_packet(&mut self, stage: u8, packet: Vec<u8>) {
        self.handshake_packet.insert(stage, packet);
    }

    /// Queue a plaintext packet until the handshake completes. Returns
    /// false if the bounded store evicted its oldest entry to make room.
    pub fn queue_packet(&mut self, packet: CachedPacket) -> bool {
        let mut fit = true;
        if self.packet_store.len() >= PACKET_STORE_LIMIT {
            self.packet_store.pop_front();
            fit = false;
        }
        self.packet_store.push_back(packet);
        fit
    }

    /// Seal the handshake: the connection goes live and retransmission
    /// stops.
    pub fn handshake_finished(&mut self) {
        self.handshake_complete = true;
        self.handshake_ready = false;
        self.connection.mark_ready();
    }
}
