//! Tokio driver for an [`Interface`].
//!
//! The session core is synchronous; this module supplies the async shell:
//! a UDP socket feeding inbound datagrams to the dispatcher and a ticker
//! driving handshake retransmission. Outbound sends go through
//! [`UdpOutside`], which never blocks the core.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::debug;

use crate::core::{BurrowError, UdpSender, HANDSHAKE_TRY_INTERVAL};
use crate::interface::{Interface, InterfaceBuilder};

/// Non-blocking [`UdpSender`] over a tokio socket.
pub struct UdpOutside {
    socket: Arc<UdpSocket>,
}

impl UdpOutside {
    /// Wrap an already-bound socket.
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl UdpSender for UdpOutside {
    fn send_to(&self, packet: &[u8], addr: SocketAddr) -> io::Result<()> {
        // A full socket buffer is packet loss, not an error worth blocking
        // the worker for.
        match self.socket.try_send_to(packet, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(udp_addr = %addr, "socket buffer full, datagram dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// One running overlay node: a bound socket plus its dispatcher.
pub struct Node {
    iface: Arc<Interface>,
    socket: Arc<UdpSocket>,
}

impl Node {
    /// Bind a UDP socket and finish building the interface around it. The
    /// builder must carry everything except the outside writer.
    pub async fn bind(addr: SocketAddr, builder: InterfaceBuilder) -> Result<Self, BurrowError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let iface = Arc::new(
            builder
                .outside(Arc::new(UdpOutside::new(Arc::clone(&socket))))
                .build()?,
        );
        Ok(Self { iface, socket })
    }

    /// The dispatcher, for sending overlay traffic and inspection.
    pub fn interface(&self) -> &Arc<Interface> {
        &self.iface
    }

    /// The bound underlay address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Pump inbound datagrams and handshake retries until the socket
    /// fails. Each datagram is processed to completion before the next.
    pub async fn run(&self) -> io::Result<()> {
        let mut ticker = tokio::time::interval(HANDSHAKE_TRY_INTERVAL);
        let mut buf = vec![0u8; 65535];
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.iface.handshake_tick(self.iface.clock().now());
                }
                res = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = res?;
                    self.iface.outside_packet(&buf[..len], addr);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{CaPool, CertDetails, CertState, Certificate};
    use crate::core::{TunWriter, VpnIp};
    use crate::crypto::{PresharedKey, StaticKeypair};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ChannelTun {
        tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    }

    impl TunWriter for ChannelTun {
        fn write(&self, packet: &[u8]) -> io::Result<()> {
            let _ = self.tx.send(packet.to_vec());
            Ok(())
        }
    }

    struct StaticLighthouse {
        peers: Mutex<Vec<(VpnIp, SocketAddr)>>,
    }

    impl crate::core::Lighthouse for StaticLighthouse {
        fn query(&self, vpn_ip: VpnIp) -> Vec<SocketAddr> {
            self.peers
                .lock()
                .unwrap()
                .iter()
                .filter(|(ip, _)| *ip == vpn_ip)
                .map(|(_, addr)| *addr)
                .collect()
        }
    }

    fn node_builder(
        ca: &SigningKey,
        ip: VpnIp,
        name: &str,
        psk: &PresharedKey,
        lighthouse: Arc<StaticLighthouse>,
        tun: ChannelTun,
    ) -> InterfaceBuilder {
        let static_key = StaticKeypair::generate();
        let cert = Certificate::sign(
            CertDetails {
                name: name.into(),
                vpn_ip: ip,
                subnets: Vec::new(),
                public_key: *static_key.public_key(),
            },
            ca,
        );
        Interface::builder()
            .inside(Arc::new(tun))
            .ca(CaPool::new([ca.verifying_key()]))
            .cert(CertState::new(cert))
            .static_key(static_key)
            .psk(psk.clone())
            .lighthouse(lighthouse)
    }

    #[tokio::test]
    async fn test_two_nodes_over_localhost() {
        let ca = SigningKey::generate(&mut OsRng);
        let psk = PresharedKey::generate();
        let ip_a = VpnIp::from_octets(10, 9, 0, 1);
        let ip_b = VpnIp::from_octets(10, 9, 0, 2);

        let lighthouse = Arc::new(StaticLighthouse {
            peers: Mutex::new(Vec::new()),
        });
        let (tx_a, _rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = tokio::sync::mpsc::unbounded_channel();

        let node_a = Node::bind(
            "127.0.0.1:0".parse().unwrap(),
            node_builder(&ca, ip_a, "a", &psk, lighthouse.clone(), ChannelTun { tx: tx_a }),
        )
        .await
        .unwrap();
        let node_b = Node::bind(
            "127.0.0.1:0".parse().unwrap(),
            node_builder(&ca, ip_b, "b", &psk, lighthouse.clone(), ChannelTun { tx: tx_b }),
        )
        .await
        .unwrap();

        lighthouse
            .peers
            .lock()
            .unwrap()
            .push((ip_b, node_b.local_addr().unwrap()));

        let iface_a = Arc::clone(node_a.interface());
        tokio::spawn(async move { node_a.run().await });
        tokio::spawn(async move { node_b.run().await });

        // First send triggers the handshake and queues the payload.
        iface_a.send(ip_b, b"ping across the overlay");

        let got = tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .expect("tunnel came up in time")
            .expect("tun channel open");
        assert_eq!(got, b"ping across the overlay");
    }
}
