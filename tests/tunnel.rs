//! End-to-end session tests: several nodes in one process, wired through
//! an in-memory packet network pumped deterministically, with a mock
//! clock driving handshake retries.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use burrow_protocol::cert::{CaPool, CertDetails, CertState, Certificate};
use burrow_protocol::core::{Clock, Lighthouse, TunWriter, UdpSender, VpnIp};
use burrow_protocol::crypto::{PresharedKey, StaticKeypair};
use burrow_protocol::handshake::HandshakeConfig;
use burrow_protocol::interface::Interface;
use burrow_protocol::wire::{MsgSubType, MsgType};

/// In-memory underlay: a queue of (from, to, datagram) plus the node
/// table to deliver into.
#[derive(Default)]
struct Net {
    queue: Mutex<VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>>,
    nodes: Mutex<HashMap<SocketAddr, Arc<Interface>>>,
}

impl Net {
    /// Deliver queued datagrams until the network is quiet. Returns how
    /// many were delivered.
    fn pump(&self) -> usize {
        self.pump_n(usize::MAX)
    }

    /// Deliver at most `limit` queued datagrams, in order.
    fn pump_n(&self, limit: usize) -> usize {
        let mut delivered = 0;
        while delivered < limit {
            let next = self.queue.lock().unwrap().pop_front();
            let Some((from, to, packet)) = next else {
                break;
            };
            let target = self.nodes.lock().unwrap().get(&to).cloned();
            if let Some(iface) = target {
                iface.outside_packet(&packet, from);
            }
            delivered += 1;
        }
        delivered
    }

    /// Throw away everything currently in flight.
    fn drop_in_flight(&self) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let n = queue.len();
        queue.clear();
        n
    }

    /// Pop a single in-flight datagram.
    fn pop(&self) -> Option<(SocketAddr, SocketAddr, Vec<u8>)> {
        self.queue.lock().unwrap().pop_front()
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, packet: &[u8]) {
        let target = self.nodes.lock().unwrap().get(&to).cloned();
        if let Some(iface) = target {
            iface.outside_packet(packet, from);
        }
    }
}

struct NetSender {
    net: Arc<Net>,
    local: SocketAddr,
}

impl UdpSender for NetSender {
    fn send_to(&self, packet: &[u8], addr: SocketAddr) -> std::io::Result<()> {
        self.net
            .queue
            .lock()
            .unwrap()
            .push_back((self.local, addr, packet.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
struct VecTun {
    got: Mutex<Vec<Vec<u8>>>,
}

impl TunWriter for VecTun {
    fn write(&self, packet: &[u8]) -> std::io::Result<()> {
        self.got.lock().unwrap().push(packet.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct MapLighthouse {
    entries: Mutex<HashMap<VpnIp, Vec<SocketAddr>>>,
}

impl Lighthouse for MapLighthouse {
    fn query(&self, vpn_ip: VpnIp) -> Vec<SocketAddr> {
        self.entries
            .lock()
            .unwrap()
            .get(&vpn_ip)
            .cloned()
            .unwrap_or_default()
    }
}

struct MockClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl MockClock {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    fn advance(&self, d: Duration) {
        *self.offset.lock().unwrap() += d;
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }

    fn unix_now(&self) -> u64 {
        1_700_000_000 + self.offset.lock().unwrap().as_secs()
    }
}

struct TestNode {
    iface: Arc<Interface>,
    vpn_ip: VpnIp,
    addr: SocketAddr,
    tun: Arc<VecTun>,
    clock: Arc<MockClock>,
}

impl TestNode {
    fn tun_packets(&self) -> Vec<Vec<u8>> {
        self.tun.got.lock().unwrap().clone()
    }

    fn tick(&self) {
        self.iface.handshake_tick(self.clock.now());
    }
}

struct TestLab {
    net: Arc<Net>,
    ca: SigningKey,
    psk: PresharedKey,
    lighthouse: Arc<MapLighthouse>,
}

impl TestLab {
    fn new() -> Self {
        Self {
            net: Arc::new(Net::default()),
            ca: SigningKey::generate(&mut OsRng),
            psk: PresharedKey::generate(),
            lighthouse: Arc::new(MapLighthouse::default()),
        }
    }

    fn node(&self, name: &str, vpn_ip: VpnIp, addr: &str) -> TestNode {
        let addr: SocketAddr = addr.parse().unwrap();
        let static_key = StaticKeypair::generate();
        let cert = Certificate::sign(
            CertDetails {
                name: name.into(),
                vpn_ip,
                subnets: Vec::new(),
                public_key: *static_key.public_key(),
            },
            &self.ca,
        );
        let tun = Arc::new(VecTun::default());
        let clock = Arc::new(MockClock::new());
        let iface = Arc::new(
            Interface::builder()
                .outside(Arc::new(NetSender {
                    net: Arc::clone(&self.net),
                    local: addr,
                }))
                .inside(Arc::clone(&tun) as Arc<dyn TunWriter>)
                .ca(CaPool::new([self.ca.verifying_key()]))
                .cert(CertState::new(cert))
                .static_key(static_key)
                .psk(self.psk.clone())
                .lighthouse(Arc::clone(&self.lighthouse) as Arc<dyn Lighthouse>)
                .clock(Arc::clone(&clock) as Arc<dyn Clock>)
                .handshake_config(HandshakeConfig {
                    try_interval: Duration::from_millis(100),
                    retries: 5,
                })
                .build()
                .unwrap(),
        );
        self.net.nodes.lock().unwrap().insert(addr, Arc::clone(&iface));
        TestNode {
            iface,
            vpn_ip,
            addr,
            tun,
            clock,
        }
    }

    fn announce(&self, node: &TestNode) {
        self.lighthouse
            .entries
            .lock()
            .unwrap()
            .entry(node.vpn_ip)
            .or_default()
            .push(node.addr);
    }

    /// Point a VPN IP at an arbitrary address, for misdirection tests.
    fn announce_addr(&self, vpn_ip: VpnIp, addr: SocketAddr) {
        self.lighthouse
            .entries
            .lock()
            .unwrap()
            .entry(vpn_ip)
            .or_default()
            .push(addr);
    }
}

fn established(a: &TestNode, b: &TestNode) -> bool {
    let a_ok = a
        .iface
        .main_hostmap()
        .query_vpn_ip(b.vpn_ip)
        .map(|hi| hi.lock().connection.ready())
        .unwrap_or(false);
    let b_ok = b
        .iface
        .main_hostmap()
        .query_vpn_ip(a.vpn_ip)
        .map(|hi| hi.lock().connection.ready())
        .unwrap_or(false);
    a_ok && b_ok
}

#[test]
fn test_handshake_and_first_packet() {
    let lab = TestLab::new();
    let a = lab.node("a", VpnIp::from_octets(10, 0, 0, 1), "192.0.2.1:4242");
    let b = lab.node("b", VpnIp::from_octets(10, 0, 0, 2), "192.0.2.2:4242");
    lab.announce(&b);

    // The first send has no tunnel: it starts the handshake and queues.
    assert!(!a.iface.send(b.vpn_ip, b"first packet"));
    lab.net.pump();

    assert!(established(&a, &b));
    assert!(a.iface.handshake_manager().pending().is_empty());

    // The queued packet was flushed through the fresh tunnel.
    assert_eq!(b.tun_packets(), vec![b"first packet".to_vec()]);

    // And the tunnel is immediately usable both ways.
    assert!(b.iface.send(a.vpn_ip, b"reply"));
    lab.net.pump();
    assert_eq!(a.tun_packets(), vec![b"reply".to_vec()]);

    // Clean counters on both inbound windows.
    let a_host = b.iface.main_hostmap().query_vpn_ip(a.vpn_ip).unwrap();
    let st = a_host.lock();
    assert_eq!(st.connection.window.dupes(), 0);
    assert_eq!(st.connection.window.out_of_window(), 0);
}

#[test]
fn test_duplicate_datagram_is_dropped() {
    let lab = TestLab::new();
    let a = lab.node("a", VpnIp::from_octets(10, 0, 0, 1), "192.0.2.1:4242");
    let b = lab.node("b", VpnIp::from_octets(10, 0, 0, 2), "192.0.2.2:4242");
    lab.announce(&b);

    a.iface.send(b.vpn_ip, b"seed");
    lab.net.pump();
    assert!(established(&a, &b));

    // Capture one data packet and deliver it twice.
    assert!(a.iface.send(b.vpn_ip, b"payload"));
    let (from, to, packet) = lab.net.pop().expect("data packet in flight");
    lab.net.deliver(from, to, &packet);
    lab.net.deliver(from, to, &packet);

    let packets = b.tun_packets();
    assert_eq!(packets.len(), 2); // seed + one copy of payload
    assert_eq!(packets[1], b"payload".to_vec());

    let host = b.iface.main_hostmap().query_vpn_ip(a.vpn_ip).unwrap();
    assert_eq!(host.lock().connection.window.dupes(), 1);
}

#[test]
fn test_retransmitted_stage0_gets_identical_cached_reply() {
    let lab = TestLab::new();
    let a = lab.node("a", VpnIp::from_octets(10, 0, 0, 1), "192.0.2.1:4242");
    let b = lab.node("b", VpnIp::from_octets(10, 0, 0, 2), "192.0.2.2:4242");
    lab.announce(&b);

    a.iface.send(b.vpn_ip, b"queued");
    let (from, to, stage0) = lab.net.pop().expect("stage 0 in flight");

    // First copy: the responder installs the tunnel and answers.
    lab.net.deliver(from, to, &stage0);
    let (_, _, reply1) = lab.net.pop().expect("stage 2 reply");

    // A retransmitted, byte-identical stage 0 gets the cached reply.
    lab.net.deliver(from, to, &stage0);
    let (_, _, reply2) = lab.net.pop().expect("cached stage 2 reply");
    assert_eq!(reply1, reply2);

    // Either copy completes the initiator.
    lab.net.deliver(b.addr, a.addr, &reply1);
    lab.net.pump();
    assert!(established(&a, &b));
    assert_eq!(b.tun_packets(), vec![b"queued".to_vec()]);
}

#[test]
fn test_simultaneous_initiation_converges() {
    let lab = TestLab::new();
    let a = lab.node("a", VpnIp::from_octets(10, 0, 0, 1), "192.0.2.1:4242");
    let b = lab.node("b", VpnIp::from_octets(10, 0, 0, 2), "192.0.2.2:4242");
    lab.announce(&a);
    lab.announce(&b);

    // Both sides initiate before anything is delivered.
    a.iface.send(b.vpn_ip, b"from a");
    b.iface.send(a.vpn_ip, b"from b");

    // Deliver exactly the two crossing stage-0 flights: after both sides
    // process the peer's first flight, each holds exactly one tunnel,
    // pointing at the peer.
    assert_eq!(lab.net.pump_n(2), 2);
    assert_eq!(a.iface.main_hostmap().len(), 1);
    assert_eq!(b.iface.main_hostmap().len(), 1);
    assert!(a.iface.main_hostmap().query_vpn_ip(b.vpn_ip).is_some());
    assert!(b.iface.main_hostmap().query_vpn_ip(a.vpn_ip).is_some());

    // Let the rest of the crossfire land. A perfectly symmetric race can
    // leave the sides on mismatched sessions; the recv-error path tears
    // those down and the next sender rebuilds. Keep nudging until traffic
    // flows both ways.
    lab.net.pump();
    let mut a_heard = false;
    let mut b_heard = false;
    for round in 0..10 {
        a.iface.send(b.vpn_ip, format!("a round {round}").as_bytes());
        a.clock.advance(Duration::from_millis(150));
        b.clock.advance(Duration::from_millis(150));
        a.tick();
        b.tick();
        lab.net.pump();
        b.iface.send(a.vpn_ip, format!("b round {round}").as_bytes());
        lab.net.pump();
        a_heard = !a.tun_packets().is_empty();
        b_heard = !b.tun_packets().is_empty();
        if a_heard && b_heard {
            break;
        }
    }
    assert!(a_heard && b_heard, "race did not converge to a working pair");
    assert_eq!(a.iface.main_hostmap().len(), 1);
    assert_eq!(b.iface.main_hostmap().len(), 1);
}

#[test]
fn test_wrong_peer_recovery() {
    let lab = TestLab::new();
    let a = lab.node("a", VpnIp::from_octets(10, 0, 0, 1), "192.0.2.1:4242");
    let b = lab.node("b", VpnIp::from_octets(10, 0, 0, 2), "192.0.2.2:4242");
    lab.announce(&b);

    // The lighthouse wrongly claims peer X lives at B's address.
    let x_ip = VpnIp::from_octets(10, 0, 0, 99);
    lab.announce_addr(x_ip, b.addr);

    assert!(!a.iface.send(x_ip, b"meant for x"));
    lab.net.pump();

    // B answered with its own certificate, so A completed a tunnel to B...
    let b_tunnel = a.iface.main_hostmap().query_vpn_ip(b.vpn_ip).expect("tunnel to actual peer");
    assert!(b_tunnel.lock().connection.ready());
    assert!(a.iface.main_hostmap().query_vpn_ip(x_ip).is_none());

    // ...while the attempt toward X lives on with B's address blocked and
    // the queued plaintext moved over.
    let x_pending = a
        .iface
        .handshake_manager()
        .pending()
        .query_vpn_ip(x_ip)
        .expect("fresh pending attempt toward intended host");
    let st = x_pending.lock();
    assert!(st.bad_remotes.contains(&b.addr));
    assert!(!st.remotes.contains(&b.addr));
    assert_eq!(st.packet_store.len(), 1);
    assert_eq!(st.packet_store[0].payload, b"meant for x".to_vec());

    // Nothing meant for X ever hit B's overlay side.
    assert!(b.tun_packets().is_empty());
}

#[test]
fn test_handshake_timeout_deletes_pending() {
    let lab = TestLab::new();
    let a = lab.node("a", VpnIp::from_octets(10, 0, 0, 1), "192.0.2.1:4242");
    let ghost_ip = VpnIp::from_octets(10, 0, 0, 66);
    lab.announce_addr(ghost_ip, "192.0.2.66:4242".parse().unwrap());

    assert!(!a.iface.send(ghost_ip, b"into the void"));
    assert!(a.iface.handshake_manager().pending().query_vpn_ip(ghost_ip).is_some());

    // Nobody answers. Drive the retry clock past the attempt budget.
    for _ in 0..8 {
        lab.net.drop_in_flight();
        a.clock.advance(Duration::from_millis(150));
        a.tick();
    }

    assert!(a.iface.handshake_manager().pending().query_vpn_ip(ghost_ip).is_none());
    assert!(a.iface.main_hostmap().is_empty());
}

#[test]
fn test_lost_stage0_is_retransmitted() {
    let lab = TestLab::new();
    let a = lab.node("a", VpnIp::from_octets(10, 0, 0, 1), "192.0.2.1:4242");
    let b = lab.node("b", VpnIp::from_octets(10, 0, 0, 2), "192.0.2.2:4242");
    lab.announce(&b);

    a.iface.send(b.vpn_ip, b"patience");
    // The first transmission vanishes.
    assert_eq!(lab.net.drop_in_flight(), 1);

    // The retry timer resends it and the handshake completes anyway.
    a.clock.advance(Duration::from_millis(150));
    a.tick();
    lab.net.pump();

    assert!(established(&a, &b));
    assert_eq!(b.tun_packets(), vec![b"patience".to_vec()]);
}

#[test]
fn test_probe_roundtrip() {
    let lab = TestLab::new();
    let a = lab.node("a", VpnIp::from_octets(10, 0, 0, 1), "192.0.2.1:4242");
    let b = lab.node("b", VpnIp::from_octets(10, 0, 0, 2), "192.0.2.2:4242");
    lab.announce(&b);

    a.iface.send(b.vpn_ip, b"seed");
    lab.net.pump();
    assert!(established(&a, &b));

    assert!(a
        .iface
        .send_to_vpn_ip(MsgType::Test, MsgSubType::TestRequest, b.vpn_ip, b"probe"));
    // Request out, reply back: two datagrams, no overlay delivery.
    assert_eq!(lab.net.pump(), 2);
    assert_eq!(b.tun_packets().len(), 1); // just the seed
    assert_eq!(a.tun_packets().len(), 0);
}

#[test]
fn test_close_tunnel() {
    let lab = TestLab::new();
    let a = lab.node("a", VpnIp::from_octets(10, 0, 0, 1), "192.0.2.1:4242");
    let b = lab.node("b", VpnIp::from_octets(10, 0, 0, 2), "192.0.2.2:4242");
    lab.announce(&b);

    a.iface.send(b.vpn_ip, b"seed");
    lab.net.pump();
    assert!(established(&a, &b));

    b.iface
        .send_to_vpn_ip(MsgType::CloseTunnel, MsgSubType::None, a.vpn_ip, b"");
    lab.net.pump();

    assert!(a.iface.main_hostmap().query_vpn_ip(b.vpn_ip).is_none());
    // B still holds its side until it times out or hears otherwise.
    assert!(b.iface.main_hostmap().query_vpn_ip(a.vpn_ip).is_some());
}

#[test]
fn test_rehandshake_replaces_tunnel() {
    let lab = TestLab::new();
    let a = lab.node("a", VpnIp::from_octets(10, 0, 0, 1), "192.0.2.1:4242");
    let b = lab.node("b", VpnIp::from_octets(10, 0, 0, 2), "192.0.2.2:4242");
    lab.announce(&b);

    a.iface.send(b.vpn_ip, b"seed");
    lab.net.pump();
    let first = a.iface.main_hostmap().query_vpn_ip(b.vpn_ip).unwrap();
    let first_index = first.lock().local_index_id;

    // An explicit fresh handshake supersedes and replaces the tunnel.
    a.iface.handshake(b.vpn_ip);
    lab.net.pump();

    let second = a.iface.main_hostmap().query_vpn_ip(b.vpn_ip).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(second.lock().local_index_id, first_index);
    assert!(second.lock().connection.ready());

    // The new tunnel carries traffic.
    assert!(a.iface.send(b.vpn_ip, b"over the new session"));
    lab.net.pump();
    assert!(b.tun_packets().contains(&b"over the new session".to_vec()));
}
