//! Handshake bookkeeping: the pending registry, index allocation,
//! completion into the main registry, and the retransmission timer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::core::{HandshakeError, HANDSHAKE_RETRIES, HANDSHAKE_TRY_INTERVAL, INDEX_ALLOC_RETRIES};
use crate::host::{HostInfo, HostMap, HostState};
use crate::interface::Interface;
use crate::wire::{MsgSubType, MsgType};

/// Retry pacing for in-flight handshakes.
#[derive(Clone, Copy, Debug)]
pub struct HandshakeConfig {
    /// Interval between stage-0 retransmissions.
    pub try_interval: Duration,
    /// Stage-0 transmissions before a pending attempt is abandoned.
    pub retries: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            try_interval: HANDSHAKE_TRY_INTERVAL,
            retries: HANDSHAKE_RETRIES,
        }
    }
}

/// Outcome of [`HandshakeManager::check_and_complete`] when the tunnel was
/// not installed.
pub enum CheckError {
    /// Byte-identical handshake already completed; the existing record
    /// holds the cached response.
    AlreadySeen(Arc<HostInfo>),
    /// An established tunnel exists and we lost the race.
    ExistingHostInfo(Arc<HostInfo>),
    /// Our freshly allocated local index collided with a live session.
    LocalIndexCollision,
}

impl CheckError {
    /// The corresponding error kind.
    pub fn kind(&self) -> HandshakeError {
        match self {
            CheckError::AlreadySeen(_) => HandshakeError::AlreadySeen,
            CheckError::ExistingHostInfo(_) => HandshakeError::ExistingHostInfo,
            CheckError::LocalIndexCollision => HandshakeError::LocalIndexCollision,
        }
    }
}

/// Drives handshakes from stage 0 through completion: owns the pending
/// registry and the retry schedule, and arbitrates installation into the
/// main registry.
pub struct HandshakeManager {
    pending: HostMap,
    main: Arc<HostMap>,
    config: HandshakeConfig,
}

impl HandshakeManager {
    /// Create a manager feeding completed tunnels into `main`.
    pub fn new(main: Arc<HostMap>, config: HandshakeConfig) -> Self {
        Self {
            pending: HostMap::new("pending", main.preferred_ranges().to_vec()),
            main,
            config,
        }
    }

    /// The attempts-in-progress registry.
    pub fn pending(&self) -> &HostMap {
        &self.pending
    }

    /// Allocate a random local index, unique across pending and main and
    /// never zero. A bounded number of collisions is tolerated before
    /// giving up.
    pub fn allocate_index(&self) -> Result<u32, HandshakeError> {
        for _ in 0..INDEX_ALLOC_RETRIES {
            let index = OsRng.next_u32();
            if index == 0 {
                continue;
            }
            if !self.pending.index_in_use(index) && !self.main.index_in_use(index) {
                return Ok(index);
            }
        }
        Err(HandshakeError::LocalIndexCollision)
    }

    /// Allocate and record a local index for a pending attempt. The caller
    /// holds the host's lock.
    pub fn add_index_host_info(
        &self,
        hi: &Arc<HostInfo>,
        st: &mut HostState,
    ) -> Result<(), HandshakeError> {
        let index = self.allocate_index()?;
        st.local_index_id = index;
        self.pending.add_local_index(hi, index);
        Ok(())
    }

    /// Arbitrate installing a responder-side tunnel into the main
    /// registry. The caller holds `st`.
    ///
    /// A byte-identical cached stage-`stage` packet on the existing entry
    /// means a retransmit ([`CheckError::AlreadySeen`]); a different one is
    /// a race, resolved by `overwrite`.
    pub fn check_and_complete(
        &self,
        hi: &Arc<HostInfo>,
        st: &mut HostState,
        stage: u8,
        overwrite: bool,
    ) -> Result<(), CheckError> {
        if let Some(existing) = self.main.query_vpn_ip(st.host_id) {
            if !Arc::ptr_eq(&existing, hi) {
                let existing_st = existing.lock();
                let same_packet = match (
                    st.handshake_packet.get(&stage),
                    existing_st.handshake_packet.get(&stage),
                ) {
                    (Some(ours), Some(theirs)) => ours == theirs,
                    _ => false,
                };
                drop(existing_st);
                if same_packet {
                    return Err(CheckError::AlreadySeen(existing));
                }
                if !overwrite {
                    return Err(CheckError::ExistingHostInfo(existing));
                }
            }
        }

        if let Some(collision) = self.main.query_index(st.local_index_id) {
            if !Arc::ptr_eq(&collision, hi) {
                return Err(CheckError::LocalIndexCollision);
            }
        }

        self.install(hi, st);
        Ok(())
    }

    /// Move a completed initiator-side handshake from pending to main,
    /// replacing any existing tunnel for the VPN IP. The caller holds
    /// `st`, seals it, and flushes the packet store afterwards.
    pub fn complete(&self, hi: &Arc<HostInfo>, st: &mut HostState) {
        self.pending.delete_host_info(hi, st);
        self.install(hi, st);
    }

    /// Cancel a pending attempt.
    pub fn delete_pending(&self, hi: &Arc<HostInfo>, st: &HostState) {
        self.pending.delete_host_info(hi, st);
    }

    fn install(&self, hi: &Arc<HostInfo>, st: &mut HostState) {
        if let Some(evicted) = self.main.add_host_info(hi, st) {
            // Purge the displaced record's stale index entries; the
            // by-VPN-IP slot already points at the new tunnel.
            let evicted_st = evicted.lock();
            self.main.delete_host_info(&evicted, &evicted_st);
            info!(vpn_ip = %st.host_id, "replaced existing tunnel");
        }
    }

    /// Drive retransmissions and expiry. Called on a timer; tolerates
    /// entries deleted between the snapshot and their turn.
    pub fn handle_tick(&self, iface: &Interface, now: Instant) {
        for hi in self.pending.hosts() {
            let mut st = hi.lock();
            if !st.handshake_ready || st.handshake_complete {
                continue;
            }
            if now < st.next_handshake_try {
                continue;
            }
            if st.handshake_attempts >= self.config.retries {
                info!(
                    vpn_ip = %st.host_id,
                    attempts = st.handshake_attempts,
                    "handshake timed out, giving up"
                );
                iface.metrics().dropped_packet("handshake_timeout");
                self.pending.delete_host_info(&hi, &st);
                continue;
            }
            if st.handshake_attempts > 0 {
                st.rotate_remote();
            }
            self.transmit_stage0(iface, &mut st, now);
        }
    }

    /// Send (or resend) the cached stage-0 packet and schedule the next
    /// attempt. The caller holds `st`.
    pub fn transmit_stage0(&self, iface: &Interface, st: &mut HostState, now: Instant) {
        st.handshake_attempts += 1;
        st.next_handshake_try = now + self.config.try_interval;

        let Some(packet) = st.handshake_packet.get(&0) else {
            warn!(vpn_ip = %st.host_id, "no cached stage 0 packet to send");
            return;
        };
        let Some(remote) = st.remote else {
            debug!(vpn_ip = %st.host_id, "no remote for handshake, waiting on lighthouse");
            return;
        };

        iface.send_outside(packet, remote, MsgType::Handshake, MsgSubType::IxPsk0);
        debug!(
            vpn_ip = %st.host_id,
            udp_addr = %remote,
            attempt = st.handshake_attempts,
            stage = 0,
            style = "ix_psk0",
            "handshake message sent"
        );
    }
}
