//! Peer identity certificates.
//!
//! A certificate binds a peer's overlay identity (VPN IP, name, authorized
//! subnets) to its Noise static public key, signed by a certificate
//! authority. On the wire the static key is omitted: the receiver already
//! learns it from the Noise transcript and re-attaches it before
//! verification, so a certificate can never be replayed with a different
//! key.
//!
//! Issuing and distributing certificates is the CA tooling's job; this
//! module only encodes, decodes and verifies.

use std::fmt::Write as _;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::core::{CertError, Subnet4, VpnIp, WireError, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};

/// The signed fields of a certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertDetails {
    /// Human-readable node name, at most 255 bytes.
    pub name: String,
    /// The peer's overlay address.
    pub vpn_ip: VpnIp,
    /// Source subnets this peer is authorized to originate, beyond its own
    /// VPN IP.
    pub subnets: Vec<Subnet4>,
    /// The peer's Noise static public key.
    pub public_key: [u8; PUBLIC_KEY_SIZE],
}

impl CertDetails {
    fn encode(&self, with_key: bool) -> Vec<u8> {
        let name = self.name.as_bytes();
        let name_len = name.len().min(255);
        let mut out = Vec::with_capacity(name_len + 8 + self.subnets.len() * 5 + 33);
        out.push(name_len as u8);
        out.extend_from_slice(&name[..name_len]);
        out.extend_from_slice(&self.vpn_ip.as_u32().to_be_bytes());
        out.push(self.subnets.len().min(255) as u8);
        for subnet in self.subnets.iter().take(255) {
            out.extend_from_slice(&u32::from(subnet.network()).to_be_bytes());
            out.push(subnet.bits());
        }
        if with_key {
            out.push(1);
            out.extend_from_slice(&self.public_key);
        } else {
            out.push(0);
        }
        out
    }
}

/// A CA-signed peer certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    /// The signed fields.
    pub details: CertDetails,
    /// Ed25519 signature over the with-key details encoding.
    pub signature: Vec<u8>,
}

impl Certificate {
    /// Sign details with a CA key, producing a certificate.
    pub fn sign(details: CertDetails, ca_key: &ed25519_dalek::SigningKey) -> Self {
        use ed25519_dalek::Signer;
        let signature = ca_key.sign(&details.encode(true)).to_bytes().to_vec();
        Self { details, signature }
    }

    /// Encode to the wire form. `with_key` selects whether the static
    /// public key travels along; handshakes always send the keyless form.
    pub fn encode(&self, with_key: bool) -> Vec<u8> {
        let mut out = self.details.encode(with_key);
        out.push(self.signature.len().min(255) as u8);
        out.extend_from_slice(&self.signature[..self.signature.len().min(255)]);
        out
    }

    /// Decode either wire form.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], WireError> {
            if data.len() < *pos + n {
                return Err(WireError::UnexpectedEof);
            }
            let s = &data[*pos..*pos + n];
            *pos += n;
            Ok(s)
        }

        let mut pos = 0usize;
        let name_len = usize::from(take(data, &mut pos, 1)?[0]);
        let name = String::from_utf8(take(data, &mut pos, name_len)?.to_vec())
            .map_err(|_| WireError::InvalidLength)?;
        let ip = take(data, &mut pos, 4)?;
        let vpn_ip = VpnIp(u32::from_be_bytes([ip[0], ip[1], ip[2], ip[3]]));

        let subnet_count = usize::from(take(data, &mut pos, 1)?[0]);
        let mut subnets = Vec::with_capacity(subnet_count);
        for _ in 0..subnet_count {
            let raw = take(data, &mut pos, 5)?;
            let net = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let bits = raw[4];
            if bits > 32 {
                return Err(WireError::InvalidLength);
            }
            subnets.push(Subnet4::new(std::net::Ipv4Addr::from(net), bits));
        }

        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        if take(data, &mut pos, 1)?[0] != 0 {
            public_key.copy_from_slice(take(data, &mut pos, PUBLIC_KEY_SIZE)?);
        }

        let sig_len = usize::from(take(data, &mut pos, 1)?[0]);
        let signature = take(data, &mut pos, sig_len)?.to_vec();

        Ok(Self {
            details: CertDetails {
                name,
                vpn_ip,
                subnets,
                public_key,
            },
            signature,
        })
    }

    /// SHA-256 over the full (with-key) encoding. Stable identifier for
    /// logs.
    pub fn fingerprint(&self) -> [u8; 32] {
        let digest = Sha256::digest(self.encode(true));
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    /// Hex form of [`Certificate::fingerprint`].
    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint().iter().fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
    }
}

/// The set of trusted certificate authorities.
pub struct CaPool {
    keys: Vec<VerifyingKey>,
}

impl CaPool {
    /// Build a pool from trusted CA verifying keys.
    pub fn new(keys: impl IntoIterator<Item = VerifyingKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Verify a certificate's signature against the pool.
    pub fn verify(&self, cert: &Certificate) -> Result<(), CertError> {
        if cert.signature.len() != SIGNATURE_SIZE {
            return Err(CertError::UntrustedSignature);
        }
        let signature = Signature::from_slice(&cert.signature)
            .map_err(|_| CertError::UntrustedSignature)?;
        let message = cert.details.encode(true);
        for key in &self.keys {
            if key.verify(&message, &signature).is_ok() {
                return Ok(());
            }
        }
        Err(CertError::UntrustedSignature)
    }
}

/// Reattach the Noise-learned static key to a keyless certificate and
/// verify it against the CA pool.
///
/// This is the only path by which a peer certificate enters a session: the
/// key under the signature is always the key the Noise handshake actually
/// authenticated.
pub fn recombine_and_validate(
    remote_static: &[u8],
    cert_no_key: &[u8],
    ca: &CaPool,
) -> Result<Certificate, CertError> {
    let mut cert = Certificate::decode(cert_no_key)?;
    if remote_static.len() != PUBLIC_KEY_SIZE {
        return Err(CertError::InvalidPublicKey);
    }
    cert.details.public_key.copy_from_slice(remote_static);
    ca.verify(&cert)?;
    Ok(cert)
}

/// Our own certificate material, shared across every handshake this node
/// runs.
pub struct CertState {
    /// Our certificate, static key included.
    pub certificate: Certificate,
    /// Cached keyless encoding, sent in handshake payloads.
    pub raw_no_key: Vec<u8>,
}

impl CertState {
    /// Cache the wire encodings for a node certificate.
    pub fn new(certificate: Certificate) -> Self {
        let raw_no_key = certificate.encode(false);
        Self {
            certificate,
            raw_no_key,
        }
    }

    /// Our overlay address.
    pub fn vpn_ip(&self) -> VpnIp {
        self.certificate.details.vpn_ip
    }
}
