//! The packet dispatcher.
//!
//! One [`Interface`] per node. Inbound datagrams are decoded and routed to
//! the handshake stages or the data path; outbound overlay packets are
//! encrypted through an established tunnel or queued behind a fresh
//! handshake. All I/O goes through the injected collaborators, so nodes
//! are fully testable in-process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cert::{CaPool, CertState};
use crate::core::{
    Clock, ConfigError, CryptoError, Lighthouse, Metrics, NoLighthouse, NoMetrics, Subnet4,
    SystemClock, TunWriter, UdpSender, VpnIp, HEADER_LEN, REPLAY_WINDOW_SIZE,
};
use crate::crypto::{ConnectionState, PresharedKey, StaticKeypair};
use crate::handshake::{ix, HandshakeConfig, HandshakeManager};
use crate::host::{CachedPacket, HostInfo, HostMap, HostState};
use crate::wire::{Header, MsgSubType, MsgType};

/// The per-node dispatcher: owns the main host registry, the handshake
/// manager, the node's key material, and the injected collaborators.
pub struct Interface {
    outside: Arc<dyn UdpSender>,
    inside: Arc<dyn TunWriter>,
    lighthouse: Arc<dyn Lighthouse>,
    metrics: Arc<dyn Metrics>,
    clock: Arc<dyn Clock>,
    ca: CaPool,
    cert_state: CertState,
    static_key: StaticKeypair,
    psk: PresharedKey,
    main: Arc<HostMap>,
    manager: HandshakeManager,
    replay_window_size: u64,
}

impl Interface {
    /// Start building an interface.
    pub fn builder() -> InterfaceBuilder {
        InterfaceBuilder::default()
    }

    /// Our node certificate material.
    pub fn cert_state(&self) -> &CertState {
        &self.cert_state
    }

    /// The trusted CA pool.
    pub fn ca(&self) -> &CaPool {
        &self.ca
    }

    /// The injected clock.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The injected metrics sink.
    pub fn metrics(&self) -> &dyn Metrics {
        self.metrics.as_ref()
    }

    /// The injected lighthouse.
    pub fn lighthouse(&self) -> &dyn Lighthouse {
        self.lighthouse.as_ref()
    }

    /// The established-tunnels registry.
    pub fn main_hostmap(&self) -> &Arc<HostMap> {
        &self.main
    }

    /// The handshake manager.
    pub fn handshake_manager(&self) -> &HandshakeManager {
        &self.manager
    }

    /// Build a fresh session crypto state with this node's identity.
    pub(crate) fn new_connection_state(
        &self,
        initiator: bool,
    ) -> Result<ConnectionState, CryptoError> {
        ConnectionState::new(&self.static_key, &self.psk, initiator, self.replay_window_size)
    }

    /// Process one inbound datagram from the underlay. Never blocks on the
    /// network and never panics on malformed input.
    pub fn outside_packet(&self, data: &[u8], addr: SocketAddr) {
        let h = match Header::decode(data) {
            Ok(h) => h,
            Err(e) => {
                debug!(udp_addr = %addr, error = %e, "dropping undecodable datagram");
                self.metrics.dropped_packet("invalid_header");
                return;
            }
        };
        self.metrics.rx(h.msg_type, h.subtype);

        match h.msg_type {
            MsgType::Handshake => self.handshake_packet(&h, data, addr),
            MsgType::Message | MsgType::Test | MsgType::CloseTunnel => {
                self.encrypted_packet(&h, data, addr)
            }
            MsgType::RecvError => self.recv_error_packet(&h, addr),
            MsgType::LightHouse => {
                debug!(udp_addr = %addr, "lighthouse packet ignored by the session core");
            }
        }
    }

    fn handshake_packet(&self, h: &Header, data: &[u8], addr: SocketAddr) {
        // Stage 1 packets carry no remote index yet; anything else names
        // our own pending attempt.
        if h.remote_index == 0 {
            ix::handshake_stage1(self, addr, data, h);
            return;
        }
        match self.manager.pending().query_index(h.remote_index) {
            Some(hi) => {
                if ix::handshake_stage2(self, addr, &hi, data, h) {
                    let st = hi.lock();
                    self.manager.delete_pending(&hi, &st);
                }
            }
            None => {
                debug!(
                    udp_addr = %addr,
                    remote_index = h.remote_index,
                    "stage 2 packet for unknown attempt"
                );
                self.metrics.dropped_packet("unknown_handshake");
            }
        }
    }

    fn encrypted_packet(&self, h: &Header, data: &[u8], addr: SocketAddr) {
        let Some(hi) = self.main.query_index(h.remote_index) else {
            debug!(udp_addr = %addr, remote_index = h.remote_index, "packet for unknown index");
            self.metrics.dropped_packet("unknown_index");
            self.send_recv_error(h.remote_index, addr);
            return;
        };

        let mut st = hi.lock();
        if !st.connection.ready() {
            self.metrics.dropped_packet("tunnel_not_ready");
            return;
        }

        // Cheap replay prefilter before paying for the AEAD.
        if !st.connection.window.check(h.sequence) {
            let _ = st.connection.window.update(h.sequence);
            self.metrics.dropped_packet("replay");
            return;
        }

        let plaintext = match st
            .connection
            .decrypt(h.sequence, &data[..HEADER_LEN], &data[HEADER_LEN..])
        {
            Ok(pt) => pt,
            Err(_) => {
                // Forged or corrupt; a live tunnel is never torn down for
                // a packet that fails to authenticate.
                debug!(vpn_ip = %st.host_id, udp_addr = %addr, "failed to decrypt packet");
                self.metrics.dropped_packet("decrypt_failure");
                return;
            }
        };

        if !st.connection.window.update(h.sequence) {
            self.metrics.dropped_packet("replay");
            return;
        }

        match h.msg_type {
            MsgType::Message => {
                if let Err(e) = self.inside.write(&plaintext) {
                    warn!(vpn_ip = %st.host_id, error = %e, "tun write failed");
                    self.metrics.dropped_packet("tun_write");
                }
            }
            MsgType::Test => match h.subtype {
                MsgSubType::TestRequest => {
                    self.send_via(&mut st, MsgType::Test, MsgSubType::TestReply, &plaintext);
                }
                _ => {
                    debug!(vpn_ip = %st.host_id, "test reply received");
                }
            },
            MsgType::CloseTunnel => {
                info!(vpn_ip = %st.host_id, udp_addr = %addr, "close tunnel received");
                self.main.delete_host_info(&hi, &st);
            }
            _ => {}
        }
    }

    fn recv_error_packet(&self, h: &Header, addr: SocketAddr) {
        // The peer no longer recognizes the session behind this index;
        // drop our side so the next send rebuilds it.
        let Some(hi) = self.main.query_reverse_index(h.remote_index) else {
            return;
        };
        let st = hi.lock();
        if st.remote != Some(addr) {
            // Not from where the tunnel actually runs; ignore the claim.
            return;
        }
        info!(vpn_ip = %st.host_id, udp_addr = %addr, "peer lost our session, dropping tunnel");
        self.main.delete_host_info(&hi, &st);
    }

    /// Send an overlay data packet to a peer, starting a handshake and
    /// queueing the plaintext when no tunnel is up yet. Returns true if
    /// the packet went out encrypted immediately.
    pub fn send(&self, vpn_ip: VpnIp, plaintext: &[u8]) -> bool {
        self.send_to_vpn_ip(MsgType::Message, MsgSubType::None, vpn_ip, plaintext)
    }

    /// Typed variant of [`Interface::send`], also used for probes.
    pub fn send_to_vpn_ip(
        &self,
        msg_type: MsgType,
        subtype: MsgSubType,
        vpn_ip: VpnIp,
        plaintext: &[u8],
    ) -> bool {
        if let Some(hi) = self.main.query_vpn_ip(vpn_ip) {
            let mut st = hi.lock();
            if st.connection.ready() {
                self.send_via(&mut st, msg_type, subtype, plaintext);
                return true;
            }
        }

        let Some(hi) = self.get_or_handshake(vpn_ip) else {
            self.metrics.dropped_packet("no_tunnel");
            return false;
        };
        let mut st = hi.lock();
        if st.connection.ready() {
            self.send_via(&mut st, msg_type, subtype, plaintext);
            return true;
        }
        if !st.queue_packet(CachedPacket {
            msg_type,
            subtype,
            payload: plaintext.to_vec(),
        }) {
            self.metrics.dropped_packet("packet_store_full");
        }
        false
    }

    /// The ready tunnel for a VPN IP, or the pending attempt toward it,
    /// starting one (stage 0 plus first transmission) when neither exists.
    pub fn get_or_handshake(&self, vpn_ip: VpnIp) -> Option<Arc<HostInfo>> {
        if let Some(hi) = self.main.query_vpn_ip(vpn_ip) {
            if hi.lock().connection.ready() {
                return Some(hi);
            }
        }
        if let Some(hi) = self.manager.pending().query_vpn_ip(vpn_ip) {
            return Some(hi);
        }
        self.start_handshake(vpn_ip)
    }

    /// Explicitly (re)start a handshake toward a peer, superseding any
    /// pending attempt. The fresh session replaces an established tunnel
    /// when it completes.
    pub fn handshake(&self, vpn_ip: VpnIp) -> Option<Arc<HostInfo>> {
        if let Some(prior) = self.manager.pending().query_vpn_ip(vpn_ip) {
            let st = prior.lock();
            self.manager.delete_pending(&prior, &st);
        }
        self.start_handshake(vpn_ip)
    }

    /// Create a pending attempt, build its stage-0 packet, and send the
    /// first copy.
    fn start_handshake(&self, vpn_ip: VpnIp) -> Option<Arc<HostInfo>> {
        self.start_handshake_prepared(vpn_ip, |_| {})
    }

    /// Like [`Interface::get_or_handshake`]'s create path, but runs
    /// `prepare` on the fresh record before stage 0 consults the
    /// lighthouse or anything is sent. Wrong-peer recovery uses this to
    /// block known-bad addresses so the new attempt cannot chase them.
    pub(crate) fn start_handshake_prepared(
        &self,
        vpn_ip: VpnIp,
        prepare: impl FnOnce(&mut HostState),
    ) -> Option<Arc<HostInfo>> {
        let conn = match self.new_connection_state(true) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(vpn_ip = %vpn_ip, error = %e, "failed to build initiator state");
                return None;
            }
        };
        let candidate = Arc::new(HostInfo::new(vpn_ip, conn, self.clock.now()));
        let (hi, created) = self.manager.pending().get_or_insert_vpn_ip(vpn_ip, candidate);
        if created {
            let mut st = hi.lock();
            prepare(&mut st);
            ix::handshake_stage0(self, vpn_ip, &hi, &mut st);
            if st.handshake_ready {
                self.manager.transmit_stage0(self, &mut st, self.clock.now());
            }
        }
        Some(hi)
    }

    /// Drive handshake retransmission and expiry. Call on a timer.
    pub fn handshake_tick(&self, now: Instant) {
        self.manager.handle_tick(self, now);
    }

    /// Encrypt and send through an established session. The caller holds
    /// `st`.
    pub(crate) fn send_via(
        &self,
        st: &mut HostState,
        msg_type: MsgType,
        subtype: MsgSubType,
        plaintext: &[u8],
    ) {
        let Some(remote) = st.remote else {
            self.metrics.dropped_packet("no_remote");
            return;
        };
        let seq = st.connection.next_sequence();
        let header = Header::new(msg_type, subtype, st.remote_index_id, seq);
        let header_bytes = header.encode();
        let ciphertext = match st.connection.encrypt(seq, &header_bytes, plaintext) {
            Ok(ct) => ct,
            Err(e) => {
                warn!(vpn_ip = %st.host_id, error = %e, "failed to encrypt packet");
                self.metrics.dropped_packet("encrypt_failure");
                return;
            }
        };
        let mut packet = header_bytes.to_vec();
        packet.extend_from_slice(&ciphertext);
        self.send_outside(&packet, remote, msg_type, subtype);
    }

    /// Empty the handshake-era packet queue through the now-ready session.
    /// The caller holds `st`.
    pub(crate) fn flush_packet_store(&self, st: &mut HostState) {
        let queued: Vec<CachedPacket> = st.packet_store.drain(..).collect();
        if queued.is_empty() {
            return;
        }
        info!(vpn_ip = %st.host_id, count = queued.len(), "flushing queued packets");
        for p in queued {
            self.send_via(st, p.msg_type, p.subtype, &p.payload);
        }
    }

    /// Hand a raw datagram to the underlay. Failures count against
    /// metrics and are otherwise ignored.
    pub(crate) fn send_outside(
        &self,
        packet: &[u8],
        addr: SocketAddr,
        msg_type: MsgType,
        subtype: MsgSubType,
    ) {
        self.metrics.tx(msg_type, subtype);
        if let Err(e) = self.outside.send_to(packet, addr) {
            warn!(udp_addr = %addr, error = %e, "udp send failed");
            self.metrics.dropped_packet("udp_send");
        }
    }

    fn send_recv_error(&self, index: u32, addr: SocketAddr) {
        let header = Header::new(MsgType::RecvError, MsgSubType::None, index, 0);
        self.send_outside(&header.encode(), addr, MsgType::RecvError, MsgSubType::None);
    }
}

/// Builder for [`Interface`]. Collaborators without a sensible default
/// (socket, TUN, CA pool, certificate, static key) are required.
#[derive(Default)]
pub struct InterfaceBuilder {
    outside: Option<Arc<dyn UdpSender>>,
    inside: Option<Arc<dyn TunWriter>>,
    lighthouse: Option<Arc<dyn Lighthouse>>,
    metrics: Option<Arc<dyn Metrics>>,
    clock: Option<Arc<dyn Clock>>,
    ca: Option<CaPool>,
    cert_state: Option<CertState>,
    static_key: Option<StaticKeypair>,
    psk: Option<PresharedKey>,
    preferred_ranges: Vec<Subnet4>,
    replay_window_size: Option<u64>,
    handshake_config: Option<HandshakeConfig>,
}

impl InterfaceBuilder {
    /// Set the underlay packet writer.
    pub fn outside(mut self, outside: Arc<dyn UdpSender>) -> Self {
        self.outside = Some(outside);
        self
    }

    /// Set the TUN writer.
    pub fn inside(mut self, inside: Arc<dyn TunWriter>) -> Self {
        self.inside = Some(inside);
        self
    }

    /// Set the lighthouse. Defaults to one that knows nothing.
    pub fn lighthouse(mut self, lighthouse: Arc<dyn Lighthouse>) -> Self {
        self.lighthouse = Some(lighthouse);
        self
    }

    /// Set the metrics sink. Defaults to a no-op sink.
    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the clock. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the trusted CA pool.
    pub fn ca(mut self, ca: CaPool) -> Self {
        self.ca = Some(ca);
        self
    }

    /// Set this node's certificate.
    pub fn cert(mut self, cert_state: CertState) -> Self {
        self.cert_state = Some(cert_state);
        self
    }

    /// Set this node's Noise static keypair.
    pub fn static_key(mut self, static_key: StaticKeypair) -> Self {
        self.static_key = Some(static_key);
        self
    }

    /// Set the network pre-shared key. Defaults to the all-zero key.
    pub fn psk(mut self, psk: PresharedKey) -> Self {
        self.psk = Some(psk);
        self
    }

    /// Ranges used to rank candidate remotes.
    pub fn preferred_ranges(mut self, ranges: Vec<Subnet4>) -> Self {
        self.preferred_ranges = ranges;
        self
    }

    /// Replay window size per session direction.
    pub fn replay_window_size(mut self, size: u64) -> Self {
        self.replay_window_size = Some(size);
        self
    }

    /// Handshake retry pacing.
    pub fn handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.handshake_config = Some(config);
        self
    }

    /// Validate and build the interface.
    pub fn build(self) -> Result<Interface, ConfigError> {
        let outside = self.outside.ok_or(ConfigError::Missing("outside writer"))?;
        let inside = self.inside.ok_or(ConfigError::Missing("inside writer"))?;
        let ca = self.ca.ok_or(ConfigError::Missing("ca pool"))?;
        let cert_state = self.cert_state.ok_or(ConfigError::Missing("certificate"))?;
        let static_key = self.static_key.ok_or(ConfigError::Missing("static key"))?;

        if &cert_state.certificate.details.public_key != static_key.public_key() {
            return Err(ConfigError::Invalid("certificate does not match static key"));
        }
        let replay_window_size = self.replay_window_size.unwrap_or(REPLAY_WINDOW_SIZE);
        if replay_window_size == 0 {
            return Err(ConfigError::Invalid("replay window size must be nonzero"));
        }

        let main = Arc::new(HostMap::new("main", self.preferred_ranges));
        let manager = HandshakeManager::new(
            Arc::clone(&main),
            self.handshake_config.unwrap_or_default(),
        );

        Ok(Interface {
            outside,
            inside,
            lighthouse: self.lighthouse.unwrap_or_else(|| Arc::new(NoLighthouse)),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoMetrics)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            ca,
            cert_state,
            static_key,
            psk: self.psk.unwrap_or_default(),
            main,
            manager,
            replay_window_size,
        })
    }
}
