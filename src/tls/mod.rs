//! The TLS handshake capability the prober and the plugins are built on.
//!
//! [`TlsHandshaker`] is the seam: everything above it only sees a
//! [`HandshakeRequest`] going in and a [`SecureSession`] or a classified
//! [`HandshakeFailure`] coming out. [`SocketHandshaker`] is the production
//! implementation; tests substitute scripted ones.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::errors::HandshakeFailure;

pub mod client_auth;
pub mod client_hello;
pub mod handshaker;
pub mod records;

pub use client_auth::ClientAuthenticationCredentials;
pub use handshaker::SocketHandshaker;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// SSL/TLS protocol versions the scanner knows how to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "SSLv3")]
    Ssl30,
    #[serde(rename = "TLSv1.0")]
    Tls10,
    #[serde(rename = "TLSv1.1")]
    Tls11,
    #[serde(rename = "TLSv1.2")]
    Tls12,
    #[serde(rename = "TLSv1.3")]
    Tls13,
}

impl TlsVersion {
    /// Newest to oldest; the order connectivity probing walks.
    pub const PROBE_ORDER: [TlsVersion; 5] = [
        TlsVersion::Tls13,
        TlsVersion::Tls12,
        TlsVersion::Tls11,
        TlsVersion::Tls10,
        TlsVersion::Ssl30,
    ];

    pub fn as_hex(self) -> u16 {
        match self {
            TlsVersion::Ssl30 => 0x0300,
            TlsVersion::Tls10 => 0x0301,
            TlsVersion::Tls11 => 0x0302,
            TlsVersion::Tls12 => 0x0303,
            TlsVersion::Tls13 => 0x0304,
        }
    }

    pub fn from_hex(value: u16) -> Option<Self> {
        match value {
            0x0300 => Some(TlsVersion::Ssl30),
            0x0301 => Some(TlsVersion::Tls10),
            0x0302 => Some(TlsVersion::Tls11),
            0x0303 => Some(TlsVersion::Tls12),
            0x0304 => Some(TlsVersion::Tls13),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TlsVersion::Ssl30 => "SSLv3",
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }

    /// The next older version, if any.
    pub fn downgraded(self) -> Option<Self> {
        match self {
            TlsVersion::Tls13 => Some(TlsVersion::Tls12),
            TlsVersion::Tls12 => Some(TlsVersion::Tls11),
            TlsVersion::Tls11 => Some(TlsVersion::Tls10),
            TlsVersion::Tls10 => Some(TlsVersion::Ssl30),
            TlsVersion::Ssl30 => None,
        }
    }

    pub fn is_deprecated(self) -> bool {
        self < TlsVersion::Tls12
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SSLv3" | "SSL 3.0" => Ok(TlsVersion::Ssl30),
            "TLSv1" | "TLSv1.0" | "TLS 1.0" => Ok(TlsVersion::Tls10),
            "TLSv1.1" | "TLS 1.1" => Ok(TlsVersion::Tls11),
            "TLSv1.2" | "TLS 1.2" => Ok(TlsVersion::Tls12),
            "TLSv1.3" | "TLS 1.3" => Ok(TlsVersion::Tls13),
            _ => Err(format!("unknown protocol version: {s}")),
        }
    }
}

/// An IANA cipher suite code point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CipherSuite(pub u16);

pub const TLS_FALLBACK_SCSV: CipherSuite = CipherSuite(0x5600);

const CIPHER_NAMES: &[(u16, &str)] = &[
    (0x1301, "TLS_AES_128_GCM_SHA256"),
    (0x1302, "TLS_AES_256_GCM_SHA384"),
    (0x1303, "TLS_CHACHA20_POLY1305_SHA256"),
    (0xc02b, "ECDHE-ECDSA-AES128-GCM-SHA256"),
    (0xc02c, "ECDHE-ECDSA-AES256-GCM-SHA384"),
    (0xc02f, "ECDHE-RSA-AES128-GCM-SHA256"),
    (0xc030, "ECDHE-RSA-AES256-GCM-SHA384"),
    (0xcca8, "ECDHE-RSA-CHACHA20-POLY1305"),
    (0xcca9, "ECDHE-ECDSA-CHACHA20-POLY1305"),
    (0x009e, "DHE-RSA-AES128-GCM-SHA256"),
    (0x009f, "DHE-RSA-AES256-GCM-SHA384"),
    (0x009c, "AES128-GCM-SHA256"),
    (0x009d, "AES256-GCM-SHA384"),
    (0xc009, "ECDHE-ECDSA-AES128-SHA"),
    (0xc00a, "ECDHE-ECDSA-AES256-SHA"),
    (0xc013, "ECDHE-RSA-AES128-SHA"),
    (0xc014, "ECDHE-RSA-AES256-SHA"),
    (0x0033, "DHE-RSA-AES128-SHA"),
    (0x0039, "DHE-RSA-AES256-SHA"),
    (0x002f, "AES128-SHA"),
    (0x0035, "AES256-SHA"),
    (0x000a, "DES-CBC3-SHA"),
    (0x0005, "RC4-SHA"),
    (0x0004, "RC4-MD5"),
    (0x5600, "TLS_FALLBACK_SCSV"),
];

impl CipherSuite {
    pub fn name(self) -> Option<&'static str> {
        CIPHER_NAMES
            .iter()
            .find(|(code, _)| *code == self.0)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (x{:04x})", self.0),
            None => write!(f, "x{:04x}", self.0),
        }
    }
}

const TLS13_SUITES: &[CipherSuite] = &[
    CipherSuite(0x1301),
    CipherSuite(0x1302),
    CipherSuite(0x1303),
];

const AEAD_SUITES: &[CipherSuite] = &[
    CipherSuite(0xc02b),
    CipherSuite(0xc02f),
    CipherSuite(0xc02c),
    CipherSuite(0xc030),
    CipherSuite(0xcca9),
    CipherSuite(0xcca8),
    CipherSuite(0x009e),
    CipherSuite(0x009f),
    CipherSuite(0x009c),
    CipherSuite(0x009d),
];

const ECDHE_CBC_SUITES: &[CipherSuite] = &[
    CipherSuite(0xc009),
    CipherSuite(0xc013),
    CipherSuite(0xc00a),
    CipherSuite(0xc014),
    CipherSuite(0x0033),
    CipherSuite(0x0039),
];

const RSA_LEGACY_SUITES: &[CipherSuite] = &[
    CipherSuite(0x002f),
    CipherSuite(0x0035),
    CipherSuite(0x000a),
    CipherSuite(0x0005),
    CipherSuite(0x0004),
];

/// Cipher configurations to try for a version, most preferred first.
pub fn cipher_candidates(version: TlsVersion) -> Vec<Vec<CipherSuite>> {
    match version {
        TlsVersion::Tls13 => vec![TLS13_SUITES.to_vec()],
        TlsVersion::Tls12 => vec![
            AEAD_SUITES.to_vec(),
            [ECDHE_CBC_SUITES, RSA_LEGACY_SUITES].concat(),
        ],
        TlsVersion::Tls11 | TlsVersion::Tls10 => {
            vec![ECDHE_CBC_SUITES.to_vec(), RSA_LEGACY_SUITES.to_vec()]
        }
        TlsVersion::Ssl30 => vec![RSA_LEGACY_SUITES.to_vec()],
    }
}

/// Every candidate suite for a version, in preference order.
pub fn all_cipher_suites(version: TlsVersion) -> Vec<CipherSuite> {
    cipher_candidates(version).concat()
}

/// Everything needed for one handshake attempt.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub address: SocketAddr,
    pub version: TlsVersion,
    pub cipher_suites: Vec<CipherSuite>,
    pub server_name: Option<String>,
    pub credentials: Option<ClientAuthenticationCredentials>,
    /// Signal a deliberate downgrade with TLS_FALLBACK_SCSV.
    pub fallback_scsv: bool,
    /// Keep going when the server asks for a certificate and none is configured.
    pub ignore_client_auth: bool,
    pub timeout: Duration,
}

impl HandshakeRequest {
    pub fn new(address: SocketAddr, version: TlsVersion, cipher_suites: Vec<CipherSuite>) -> Self {
        Self {
            address,
            version,
            cipher_suites,
            server_name: None,
            credentials: None,
            fallback_scsv: false,
            ignore_client_auth: false,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_server_name(mut self, server_name: Option<String>) -> Self {
        self.server_name = server_name;
        self
    }

    pub fn with_credentials(mut self, credentials: Option<ClientAuthenticationCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_fallback_scsv(mut self, enabled: bool) -> Self {
        self.fallback_scsv = enabled;
        self
    }

    pub fn ignoring_client_auth(mut self, ignore: bool) -> Self {
        self.ignore_client_auth = ignore;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Transport left behind by a successful handshake.
pub enum SessionStream {
    /// Socket positioned after the server's first flight.
    Raw(TcpStream),
    /// A completed rustls session.
    Tls(Box<TlsStream<TcpStream>>),
}

/// Outcome of a successful handshake.
pub struct SecureSession {
    pub version: TlsVersion,
    pub cipher_suite: Option<CipherSuite>,
    /// DER certificates as sent by the server, leaf first.
    pub peer_certificates: Vec<Vec<u8>>,
    pub client_auth_requested: bool,
    pub stream: Option<SessionStream>,
}

impl SecureSession {
    pub fn new(version: TlsVersion, cipher_suite: Option<CipherSuite>) -> Self {
        Self {
            version,
            cipher_suite,
            peer_certificates: Vec::new(),
            client_auth_requested: false,
            stream: None,
        }
    }

    pub async fn close(mut self) {
        match self.stream.take() {
            Some(SessionStream::Raw(mut stream)) => {
                let _ = stream.shutdown().await;
            }
            Some(SessionStream::Tls(mut stream)) => {
                let _ = stream.shutdown().await;
            }
            None => {}
        }
    }
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("version", &self.version)
            .field("cipher_suite", &self.cipher_suite)
            .field("peer_certificates", &self.peer_certificates.len())
            .field("client_auth_requested", &self.client_auth_requested)
            .field("live", &self.stream.is_some())
            .finish()
    }
}

/// Opens a transport connection and performs a handshake.
#[async_trait]
pub trait TlsHandshaker: Send + Sync {
    async fn connect_and_handshake(
        &self,
        request: &HandshakeRequest,
    ) -> Result<SecureSession, HandshakeFailure>;
}
