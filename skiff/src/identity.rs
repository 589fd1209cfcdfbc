//! Node identity and TLS material.
//!
//! A node's identity is the SHA-256 digest of its TLS leaf certificate,
//! rendered as a 52-character base32 string. The certificate is
//! self-signed and generated on first run; the hash is the *only*
//! authentication token — certificate chains and names carry no
//! authority. Peers are verified after the handshake by comparing the
//! leaf hash against the configured [`NodeId`].

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::{
    self, DigitallySignedStruct, DistinguishedName, Error as TlsError, SignatureScheme,
};

/// ALPN token negotiated on every peer connection.
pub const ALPN: &[u8] = b"skiff/1";

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// RFC 4648 base32 alphabet, no padding.
const BASE32: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// A node's identity: SHA-256 of its TLS leaf certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Derive the identity from a leaf certificate in DER form.
    pub fn from_der(der: &[u8]) -> Self {
        NodeId(Sha256::digest(der).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// Supersession ties are broken by comparing the rendered form, so the
// winner matches what operators see in configs and logs.
impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 256 bits → 52 base32 chars, MSB first, final group zero-padded.
        let mut out = String::with_capacity(52);
        let mut acc: u16 = 0;
        let mut bits = 0u8;
        for &b in &self.0 {
            acc = (acc << 8) | b as u16;
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out.push(BASE32[((acc >> bits) & 0x1F) as usize] as char);
            }
        }
        if bits > 0 {
            out.push(BASE32[((acc << (5 - bits)) & 0x1F) as usize] as char);
        }
        f.write_str(&out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

/// Error parsing a base32 node ID.
#[derive(Debug, thiserror::Error)]
#[error("invalid node id")]
pub struct ParseNodeIdError;

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 52 {
            return Err(ParseNodeIdError);
        }
        let mut bytes = [0u8; 32];
        let mut acc: u16 = 0;
        let mut bits = 0u8;
        let mut i = 0;
        for c in s.bytes() {
            let v = match c {
                b'A'..=b'Z' => c - b'A',
                b'a'..=b'z' => c - b'a',
                b'2'..=b'7' => c - b'2' + 26,
                _ => return Err(ParseNodeIdError),
            };
            acc = (acc << 5) | v as u16;
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                if i < 32 {
                    bytes[i] = (acc >> bits) as u8;
                    i += 1;
                }
            }
        }
        if i != 32 {
            return Err(ParseNodeIdError);
        }
        Ok(NodeId(bytes))
    }
}

// Node IDs travel in configs (human-readable) and on the wire; the
// string form serves both.
impl serde::Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The local node's certificate, key, and derived ID.
pub struct Identity {
    pub node_id: NodeId,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Load the certificate and key from `home`, generating a
    /// self-signed pair on first run.
    pub fn load_or_generate(home: &Path) -> anyhow::Result<Self> {
        let cert_path = home.join(CERT_FILE);
        let key_path = home.join(KEY_FILE);

        if !cert_path.exists() || !key_path.exists() {
            tracing::info!(path = %home.display(), "Generating new node certificate");
            let generated = rcgen::generate_simple_self_signed(vec!["skiff".to_string()])?;
            fs::write(&cert_path, generated.cert.pem())?;
            fs::write(&key_path, generated.key_pair.serialize_pem())?;
            restrict_permissions(&key_path)?;
        }

        let cert_chain = load_certs(&cert_path)?;
        let key = load_key(&key_path)?;
        let leaf = cert_chain
            .first()
            .ok_or_else(|| anyhow::anyhow!("no certificate in {}", cert_path.display()))?;
        let node_id = NodeId::from_der(leaf.as_ref());

        Ok(Identity {
            node_id,
            cert_chain,
            key,
        })
    }

    /// TLS acceptor config: client certificate required, ALPN pinned,
    /// session resumption off. Certificate contents are not checked
    /// here — identity is the post-handshake leaf hash comparison.
    pub fn server_config(&self) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let mut cfg = rustls::ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new()))
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())?;
        cfg.alpn_protocols = vec![ALPN.to_vec()];
        cfg.session_storage = Arc::new(rustls::server::NoServerSessionStorage {});
        cfg.send_tls13_tickets = 0;
        Ok(Arc::new(cfg))
    }

    /// TLS connector config: our certificate offered, any server
    /// certificate accepted (the leaf hash is checked afterwards).
    pub fn client_config(&self) -> anyhow::Result<Arc<rustls::ClientConfig>> {
        let mut cfg = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())?;
        cfg.alpn_protocols = vec![ALPN.to_vec()];
        cfg.resumption = rustls::client::Resumption::disabled();
        cfg.enable_sni = false;
        Ok(Arc::new(cfg))
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)?;
    let certs: Result<Vec<_>, io::Error> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
    Ok(certs?)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", path.display()))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Accepts any client certificate; the connection supervisor compares
/// the leaf hash against the configured node ID after the handshake.
#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyClientCert {
    fn new() -> Self {
        Self {
            provider: provider(),
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Accepts any server certificate; see [`AcceptAnyClientCert`].
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            provider: provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
