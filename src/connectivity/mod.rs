//! Server connectivity probing.
//!
//! Before any scan command runs against a server, [`ConnectivityProber`]
//! finds one protocol version and cipher configuration that the server
//! accepts and records it, together with the server's client-certificate
//! policy, in an immutable [`ServerConnectivityInfo`]. Plugins trust that
//! record instead of rediscovering connectivity on their own.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{ConnectivityError, HandshakeFailureKind};
use crate::tls::{
    all_cipher_suites, cipher_candidates, CipherSuite, ClientAuthenticationCredentials,
    HandshakeRequest, TlsHandshaker, TlsVersion, DEFAULT_HANDSHAKE_TIMEOUT,
};

pub mod dns;

/// A network endpoint. Says nothing about TLS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerLocation {
    pub hostname: String,
    pub ip_address: IpAddr,
    pub port: u16,
    /// Server name to send instead of the hostname.
    pub sni: Option<String>,
}

impl ServerLocation {
    pub fn new(hostname: impl Into<String>, ip_address: IpAddr, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            ip_address,
            port,
            sni: None,
        }
    }

    pub fn with_sni(mut self, sni: Option<String>) -> Self {
        self.sni = sni;
        self
    }

    pub async fn resolve(hostname: &str, port: u16) -> Result<Self, ConnectivityError> {
        let ip = dns::resolve_host(hostname).await?;
        Ok(Self::new(hostname, ip, port))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.port)
    }

    /// The SNI value to send, if any. IP literals never go into SNI.
    pub fn server_name(&self) -> Option<String> {
        match &self.sni {
            Some(sni) => Some(sni.clone()),
            None if self.hostname.parse::<IpAddr>().is_ok() => None,
            None => Some(self.hostname.clone()),
        }
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.hostname, self.port, self.ip_address)
    }
}

/// What the server does about client certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClientAuthRequirement {
    None,
    Optional,
    Required,
}

impl fmt::Display for ClientAuthRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClientAuthRequirement::None => "none",
            ClientAuthRequirement::Optional => "optional",
            ClientAuthRequirement::Required => "required",
        };
        f.write_str(label)
    }
}

/// A configuration known to work against a server at probing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConnectivityInfo {
    pub location: ServerLocation,
    pub highest_version: TlsVersion,
    pub cipher_suite: Option<CipherSuite>,
    pub client_auth: ClientAuthRequirement,
    pub credentials: Option<ClientAuthenticationCredentials>,
    /// False only when a certificate is required and none was supplied:
    /// the server got as far as asking for it, nothing more was proven.
    pub session_established: bool,
}

impl ServerConnectivityInfo {
    /// Request for a handshake at `version` reusing everything probing learned.
    pub fn handshake_request(&self, version: TlsVersion) -> HandshakeRequest {
        let mut suites = all_cipher_suites(version);
        if version == self.highest_version {
            if let Some(working) = self.cipher_suite {
                suites.retain(|s| *s != working);
                suites.insert(0, working);
            }
        }

        HandshakeRequest::new(self.location.socket_addr(), version, suites)
            .with_server_name(self.location.server_name())
            .with_credentials(self.credentials.clone())
            .ignoring_client_auth(
                self.client_auth == ClientAuthRequirement::Optional && self.credentials.is_none(),
            )
    }

    pub fn missing_client_certificate(&self) -> bool {
        self.client_auth == ClientAuthRequirement::Required && self.credentials.is_none()
    }
}

/// Finds a working TLS configuration by trial handshakes.
#[derive(Clone)]
pub struct ConnectivityProber {
    handshaker: Arc<dyn TlsHandshaker>,
    timeout: Duration,
}

impl ConnectivityProber {
    pub fn new(handshaker: Arc<dyn TlsHandshaker>) -> Self {
        Self {
            handshaker,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolves `hostname` and probes it.
    pub async fn probe_host(
        &self,
        hostname: &str,
        port: u16,
        sni: Option<String>,
        credentials: Option<&ClientAuthenticationCredentials>,
    ) -> Result<ServerConnectivityInfo, ConnectivityError> {
        let location = ServerLocation::resolve(hostname, port).await?.with_sni(sni);
        self.probe(&location, credentials).await
    }

    pub async fn probe(
        &self,
        location: &ServerLocation,
        credentials: Option<&ClientAuthenticationCredentials>,
    ) -> Result<ServerConnectivityInfo, ConnectivityError> {
        if let Some(creds) = credentials {
            creds
                .load_certificates()
                .and_then(|_| creds.load_private_key())
                .map_err(|e| ConnectivityError::InvalidCredentials(e.to_string()))?;
        }

        let addr = location.socket_addr();
        let info = |version, cipher_suite, client_auth, session_established| ServerConnectivityInfo {
            location: location.clone(),
            highest_version: version,
            cipher_suite,
            client_auth,
            credentials: credentials.cloned(),
            session_established,
        };

        for version in TlsVersion::PROBE_ORDER {
            for suites in cipher_candidates(version) {
                let request = HandshakeRequest::new(addr, version, suites)
                    .with_server_name(location.server_name())
                    .with_credentials(credentials.cloned())
                    .with_timeout(self.timeout);

                match self.handshaker.connect_and_handshake(&request).await {
                    Ok(session) => {
                        let negotiated = session.version;
                        let cipher = session.cipher_suite;
                        let requested = session.client_auth_requested;
                        session.close().await;

                        let (client_auth, _) = if requested {
                            self.client_auth_level(&request).await
                        } else {
                            (ClientAuthRequirement::None, None)
                        };
                        info!(
                            "{} accepts {} with {} (client auth: {})",
                            location,
                            negotiated,
                            cipher.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                            client_auth
                        );
                        return Ok(info(negotiated, cipher, client_auth, true));
                    }
                    Err(failure) if failure.kind == HandshakeFailureKind::ClientCertificateRequested => {
                        if credentials.is_some() {
                            return Err(ConnectivityError::ClientCredentialsRejected { addr, failure });
                        }
                        let (client_auth, cipher) = self.client_auth_level(&request).await;
                        info!("{} accepts {} and wants a client certificate ({})", location, version, client_auth);
                        return Ok(info(
                            version,
                            cipher,
                            client_auth,
                            client_auth == ClientAuthRequirement::Optional,
                        ));
                    }
                    Err(failure) if failure.kind.is_network_level() => {
                        return Err(ConnectivityError::Unreachable { addr, failure });
                    }
                    Err(failure) => {
                        debug!("{} rejected {}: {}", location, version, failure);
                    }
                }
            }
        }

        Err(ConnectivityError::NoCommonConfiguration { addr })
    }

    /// Distinguishes an optional certificate request from a mandatory one by
    /// retrying without credentials while ignoring the request.
    async fn client_auth_level(
        &self,
        request: &HandshakeRequest,
    ) -> (ClientAuthRequirement, Option<CipherSuite>) {
        let without_cert = request.clone().with_credentials(None).ignoring_client_auth(true);
        match self.handshaker.connect_and_handshake(&without_cert).await {
            Ok(session) => {
                let cipher = session.cipher_suite;
                session.close().await;
                (ClientAuthRequirement::Optional, cipher)
            }
            Err(failure) => {
                debug!("handshake without a client certificate failed: {}", failure);
                (ClientAuthRequirement::Required, None)
            }
        }
    }
}
