//! The Noise IX-psk0 handshake stages.
//!
//! Stage 0 builds the initiator's first flight (the manager sends and
//! resends it), stage 1 is the responder processing that flight and
//! answering, stage 2 is the initiator consuming the answer. The responder
//! is done after stage 1, the initiator after stage 2.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::cert::recombine_and_validate;
use crate::core::{VpnIp, HEADER_LEN};
use crate::host::{HostInfo, HostState};
use crate::interface::Interface;
use crate::wire::{HandshakeDetails, Header, MsgSubType, MsgType};

use super::manager::CheckError;

/// Build the stage-0 packet for a fresh initiator attempt. Does not send;
/// the handshake manager owns (re)transmission. The caller holds `st`.
pub(crate) fn handshake_stage0(
    iface: &Interface,
    vpn_ip: VpnIp,
    hi: &Arc<HostInfo>,
    st: &mut HostState,
) {
    // Ask the lighthouse when we have no idea where the peer lives.
    if st.remote.is_none() {
        for addr in iface.lighthouse().query(vpn_ip) {
            st.add_remote(addr);
        }
        st.force_promote_best(iface.main_hostmap().preferred_ranges());
    }

    if let Err(e) = iface.handshake_manager().add_index_host_info(hi, st) {
        error!(vpn_ip = %vpn_ip, error = %e, stage = 0, style = "ix_psk0", "failed to generate index");
        return;
    }

    let details = HandshakeDetails {
        initiator_index: st.local_index_id,
        responder_index: 0,
        time: iface.clock().unix_now(),
        cert: iface.cert_state().raw_no_key.clone(),
    };

    let header = Header::new(MsgType::Handshake, MsgSubType::IxPsk0, 0, 1);
    st.connection.next_sequence();

    let (msg, _) = match st.connection.write_handshake_message(&details.encode()) {
        Ok(v) => v,
        Err(e) => {
            error!(vpn_ip = %vpn_ip, error = %e, stage = 0, style = "ix_psk0", "failed to call noise write");
            return;
        }
    };

    // We send sequence 1, so the responder will never send it to us;
    // reserve the slot so it is not reported missing.
    st.connection.window.update(1);

    let mut packet = header.encode().to_vec();
    packet.extend_from_slice(&msg);
    st.cache_handshake_packet(0, packet);

    st.handshake_ready = true;
    st.handshake_start = iface.clock().now();
    st.next_handshake_try = st.handshake_start;
}

/// Responder: process an inbound stage-0 flight and answer it.
pub(crate) fn handshake_stage1(iface: &Interface, addr: SocketAddr, packet: &[u8], h: &Header) {
    let mut ci = match iface.new_connection_state(false) {
        Ok(ci) => ci,
        Err(e) => {
            warn!(udp_addr = %addr, error = %e, stage = 1, style = "ix_psk0", "failed to build responder state");
            return;
        }
    };
    // We will never be sent sequence 1; reserve the slot so it is not
    // reported missing.
    ci.window.update(1);

    let body = &packet[HEADER_LEN..];
    let (payload, _) = match ci.read_handshake_message(body) {
        Ok(v) => v,
        Err(e) => {
            // Could be garbage or a probe; nothing to tear down, drop it.
            debug!(udp_addr = %addr, error = %e, stage = 1, style = "ix_psk0", "failed to call noise read");
            return;
        }
    };

    let details = match HandshakeDetails::decode(&payload) {
        Ok(d) => d,
        Err(e) => {
            debug!(udp_addr = %addr, error = %e, stage = 1, style = "ix_psk0", "failed to decode handshake payload");
            return;
        }
    };

    let Some(remote_static) = ci.remote_static().map(<[u8]>::to_vec) else {
        debug!(udp_addr = %addr, stage = 1, style = "ix_psk0", "no static key in transcript");
        return;
    };
    let remote_cert = match recombine_and_validate(&remote_static, &details.cert, iface.ca()) {
        Ok(c) => c,
        Err(e) => {
            info!(udp_addr = %addr, error = %e, stage = 1, style = "ix_psk0", "invalid certificate from host");
            return;
        }
    };
    let vpn_ip = remote_cert.details.vpn_ip;
    let cert_name = remote_cert.details.name.clone();
    let fingerprint = remote_cert.fingerprint_hex();

    if vpn_ip == iface.cert_state().vpn_ip() {
        error!(
            vpn_ip = %vpn_ip,
            udp_addr = %addr,
            cert_name = %cert_name,
            fingerprint = %fingerprint,
            stage = 1,
            style = "ix_psk0",
            "refusing to handshake with myself"
        );
        return;
    }

    let my_index = match iface.handshake_manager().allocate_index() {
        Ok(i) => i,
        Err(e) => {
            error!(vpn_ip = %vpn_ip, udp_addr = %addr, error = %e, stage = 1, style = "ix_psk0", "failed to generate index");
            return;
        }
    };

    info!(
        vpn_ip = %vpn_ip,
        udp_addr = %addr,
        cert_name = %cert_name,
        fingerprint = %fingerprint,
        initiator_index = details.initiator_index,
        responder_index = my_index,
        remote_index = h.remote_index,
        stage = 1,
        style = "ix_psk0",
        "handshake message received"
    );

    let reply = HandshakeDetails {
        initiator_index: details.initiator_index,
        responder_index: my_index,
        time: details.time,
        cert: iface.cert_state().raw_no_key.clone(),
    };
    let reply_header = Header::new(MsgType::Handshake, MsgSubType::IxPsk0, details.initiator_index, 2);

    let (msg, keys) = match ci.write_handshake_message(&reply.encode()) {
        Ok(v) => v,
        Err(e) => {
            error!(vpn_ip = %vpn_ip, udp_addr = %addr, error = %e, stage = 1, style = "ix_psk0", "failed to call noise write");
            return;
        }
    };
    let Some(keys) = keys else {
        error!(vpn_ip = %vpn_ip, udp_addr = %addr, stage = 1, style = "ix_psk0", "noise did not arrive at a key");
        return;
    };

    // We send sequence 2, so the initiator will never send it to us.
    ci.window.update(2);
    ci.set_peer_cert(remote_cert.clone());
    ci.install_keys(keys);

    let mut response = reply_header.encode().to_vec();
    response.extend_from_slice(&msg);

    let hi = Arc::new(HostInfo::new(vpn_ip, ci, iface.clock().now()));
    let mut st = hi.lock();
    st.local_index_id = my_index;
    st.remote_index_id = details.initiator_index;
    st.cache_handshake_packet(0, body.to_vec());
    st.cache_handshake_packet(2, response.clone());
    st.add_remote(addr);
    st.force_promote_best(iface.main_hostmap().preferred_ranges());
    st.set_remote(addr);
    st.remote_cidr = remote_cert.details.subnets.clone();

    // Only overwrite an existing tunnel if we win the handshake race.
    let overwrite = iface.cert_state().vpn_ip() > vpn_ip;
    match iface.handshake_manager().check_and_complete(&hi, &mut st, 0, overwrite) {
        Ok(()) => {
            iface.send_outside(&response, addr, MsgType::Handshake, MsgSubType::IxPsk0);
            info!(
                vpn_ip = %vpn_ip,
                udp_addr = %addr,
                initiator_index = details.initiator_index,
                responder_index = my_index,
                stage = 2,
                style = "ix_psk0",
                "handshake message sent"
            );
            st.handshake_finished();
        }
        Err(CheckError::AlreadySeen(existing)) => {
            // A retransmit of a flight we already answered; replay the
            // cached response so the initiator can finish.
            let cached = existing.lock().handshake_packet.get(&2).cloned();
            if let Some(cached) = cached {
                iface.send_outside(&cached, addr, MsgType::Handshake, MsgSubType::IxPsk0);
                info!(
                    vpn_ip = %vpn_ip,
                    udp_addr = %addr,
                    cached = true,
                    stage = 2,
                    style = "ix_psk0",
                    "handshake message sent"
                );
            }
        }
        Err(CheckError::ExistingHostInfo(_)) => {
            info!(
                vpn_ip = %vpn_ip,
                udp_addr = %addr,
                initiator_index = details.initiator_index,
                stage = 1,
                style = "ix_psk0",
                "prevented a handshake race"
            );
            // Probe the tunnel we kept to suss out any lingering issues.
            drop(st);
            iface.send_to_vpn_ip(MsgType::Test, MsgSubType::TestRequest, vpn_ip, b"");
        }
        Err(CheckError::LocalIndexCollision) => {
            // Let the initiator's retransmit try again with fresh luck.
            error!(
                vpn_ip = %vpn_ip,
                udp_addr = %addr,
                local_index = my_index,
                stage = 1,
                style = "ix_psk0",
                "local index collision, dropping handshake"
            );
        }
    }
}

/// Initiator: process the responder's stage-2 answer. Returns true when
/// the pending attempt is beyond saving and must be torn down.
pub(crate) fn handshake_stage2(
    iface: &Interface,
    addr: SocketAddr,
    hi: &Arc<HostInfo>,
    packet: &[u8],
    h: &Header,
) -> bool {
    let mut st = hi.lock();

    if st.connection.ready() {
        // A late retransmit; the tunnel already stands.
        info!(vpn_ip = %st.host_id, udp_addr = %addr, stage = 2, style = "ix_psk0", "handshake is already complete");
        return false;
    }

    let body = &packet[HEADER_LEN..];
    let (payload, keys) = match st.connection.read_handshake_message(body) {
        Ok(v) => v,
        Err(e) => {
            // Could be an attacker poking at us; keep the attempt alive so
            // a genuine response can still land.
            debug!(vpn_ip = %st.host_id, udp_addr = %addr, error = %e, stage = 2, style = "ix_psk0", "failed to call noise read");
            return false;
        }
    };
    let Some(keys) = keys else {
        // Impossible in IX, and unrecoverable if it happens.
        error!(vpn_ip = %st.host_id, udp_addr = %addr, stage = 2, style = "ix_psk0", "noise did not arrive at a key");
        return true;
    };

    let details = match HandshakeDetails::decode(&payload) {
        Ok(d) => d,
        Err(e) => {
            error!(vpn_ip = %st.host_id, udp_addr = %addr, error = %e, stage = 2, style = "ix_psk0", "failed to decode handshake payload");
            return true;
        }
    };

    let Some(remote_static) = st.connection.remote_static().map(<[u8]>::to_vec) else {
        error!(vpn_ip = %st.host_id, udp_addr = %addr, stage = 2, style = "ix_psk0", "no static key in transcript");
        return true;
    };
    let remote_cert = match recombine_and_validate(&remote_static, &details.cert, iface.ca()) {
        Ok(c) => c,
        Err(e) => {
            error!(vpn_ip = %st.host_id, udp_addr = %addr, error = %e, stage = 2, style = "ix_psk0", "invalid certificate from host");
            return true;
        }
    };
    let vpn_ip = remote_cert.details.vpn_ip;
    let cert_name = remote_cert.details.name.clone();
    let fingerprint = remote_cert.fingerprint_hex();
    let manager = iface.handshake_manager();

    if vpn_ip != st.host_id {
        info!(
            intended_vpn_ip = %st.host_id,
            have_vpn_ip = %vpn_ip,
            udp_addr = %addr,
            cert_name = %cert_name,
            stage = 2,
            style = "ix_psk0",
            "incorrect host responded to handshake"
        );

        // Any pending attempt toward the actual responder is obsolete: we
        // are about to stand up a tunnel to it right here.
        if let Some(other) = manager.pending().query_vpn_ip(vpn_ip) {
            if !Arc::ptr_eq(&other, hi) {
                let other_st = other.lock();
                manager.delete_pending(&other, &other_st);
            }
        }

        // This attempt no longer targets its original host; release it
        // from pending before the identity swap.
        manager.delete_pending(hi, &st);

        // The address that answered belongs to someone else, and any
        // addresses that burned this attempt stay burned. The fresh
        // attempt must know all of that before its stage 0 runs, or it
        // would chase the same bad address the lighthouse handed us.
        let mut bad_remotes = st.bad_remotes.clone();
        if !bad_remotes.contains(&addr) {
            bad_remotes.push(addr);
        }
        let queued: Vec<_> = st.packet_store.drain(..).collect();

        let intended = st.host_id;
        let blocked = bad_remotes.clone();
        if let Some(new_hi) = iface.start_handshake_prepared(intended, move |new_st| {
            for bad in &blocked {
                new_st.block_remote(*bad);
            }
        }) {
            if !Arc::ptr_eq(&new_hi, hi) {
                let mut new_st = new_hi.lock();
                // The attempt may have already existed; make sure it is
                // just as wary.
                for bad in &bad_remotes {
                    new_st.block_remote(*bad);
                }
                new_st.force_promote_best(iface.main_hostmap().preferred_ranges());
                info!(
                    vpn_ip = %intended,
                    blocked_udp_addrs = ?new_st.bad_remotes,
                    remotes = ?new_st.remotes,
                    "blocked addresses for handshakes"
                );

                // The queued plaintext was meant for the intended host.
                for p in queued {
                    new_st.queue_packet(p);
                }
            }
        }

        st.host_id = vpn_ip;
    }

    // We were sent sequence 2 as the handshake reply; reserve the slot so
    // it is not reported missing.
    st.connection.window.update(2);

    let elapsed = iface.clock().now().saturating_duration_since(st.handshake_start);
    info!(
        vpn_ip = %vpn_ip,
        udp_addr = %addr,
        cert_name = %cert_name,
        fingerprint = %fingerprint,
        initiator_index = details.initiator_index,
        responder_index = details.responder_index,
        remote_index = h.remote_index,
        duration_ms = elapsed.as_millis() as u64,
        stage = 2,
        style = "ix_psk0",
        "handshake message received"
    );

    st.remote_index_id = details.responder_index;
    st.connection.set_peer_cert(remote_cert.clone());
    st.connection.install_keys(keys);
    st.set_remote(addr);
    st.remote_cidr = remote_cert.details.subnets.clone();

    // This replaces any existing tunnel for the VPN IP.
    manager.complete(hi, &mut st);
    st.handshake_finished();
    iface.metrics().handshake_completed(elapsed);
    iface.flush_packet_store(&mut st);

    false
}
