use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rustls::client::{ResolvesClientCert, ServerCertVerified, ServerCertVerifier};
use rustls::sign::CertifiedKey;
use rustls::{Certificate, ClientConfig, ServerName, SignatureScheme, SupportedCipherSuite};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::{HandshakeFailure, HandshakeFailureKind};

use super::client_hello::ClientHello;
use super::records::{self, FlightParse};
use super::{HandshakeRequest, SecureSession, SessionStream, TlsHandshaker, TlsVersion};

/// How long to wait for a TLS 1.3 server to object to an empty client certificate.
const SETTLE_TIMEOUT: Duration = Duration::from_millis(500);

/// Talks to real servers over TCP.
///
/// SSL 3.0 through TLS 1.2 use a hand-built ClientHello and stop after the
/// server's first flight; TLS 1.3, and TLS 1.2 servers that want a client
/// certificate we can present (or ignore), go through a full rustls handshake.
#[derive(Debug, Clone, Default)]
pub struct SocketHandshaker;

impl SocketHandshaker {
    pub fn new() -> Self {
        SocketHandshaker
    }

    async fn connect(&self, request: &HandshakeRequest) -> Result<TcpStream, HandshakeFailure> {
        match timeout(request.timeout, TcpStream::connect(request.address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                // failing to open the socket at all means the endpoint is unreachable
                let mut failure = HandshakeFailure::from_io(&e);
                if failure.kind == HandshakeFailureKind::Other {
                    failure.kind = HandshakeFailureKind::ConnectionRefused;
                }
                Err(failure)
            }
            Err(_) => Err(HandshakeFailure::new(
                HandshakeFailureKind::Timeout,
                format!("connecting to {} timed out", request.address),
            )),
        }
    }

    async fn raw_handshake(&self, request: &HandshakeRequest) -> Result<SecureSession, HandshakeFailure> {
        let mut stream = self.connect(request).await?;

        let hello = ClientHello::new(request.version, &request.cipher_suites)
            .with_server_name(request.server_name.as_deref())
            .with_fallback_scsv(request.fallback_scsv)
            .encode();
        stream.write_all(&hello).await.map_err(|e| rejected(&e))?;

        let parsed = match timeout(request.timeout, read_server_flight(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(HandshakeFailure::new(
                    HandshakeFailureKind::Timeout,
                    format!("{} did not answer the {} ClientHello", request.address, request.version),
                ));
            }
        };

        let flight = match parsed {
            FlightParse::Complete(flight) => flight,
            FlightParse::Alert { level, description } => {
                debug!(
                    "{} answered {} with alert level {} description {}",
                    request.address, request.version, level, description
                );
                return Err(records::classify_alert(description));
            }
            FlightParse::Incomplete => {
                return Err(HandshakeFailure::new(
                    HandshakeFailureKind::Other,
                    "incomplete server flight",
                ));
            }
        };

        if flight.version != Some(request.version) {
            return Err(HandshakeFailure::new(
                HandshakeFailureKind::ProtocolUnsupported,
                format!(
                    "server negotiated {} instead of {}",
                    flight.version.map(|v| v.name()).unwrap_or("an unknown version"),
                    request.version
                ),
            ));
        }

        if flight.certificate_requested {
            if request.credentials.is_none() && !request.ignore_client_auth {
                return Err(HandshakeFailure::new(
                    HandshakeFailureKind::ClientCertificateRequested,
                    "server sent a CertificateRequest",
                ));
            }
            if request.version == TlsVersion::Tls12 {
                debug!(
                    "{} requested a client certificate, completing the handshake with rustls",
                    request.address
                );
                drop(stream);
                let mut session = self.rustls_handshake(request).await?;
                session.client_auth_requested = true;
                return Ok(session);
            }
            if request.credentials.is_none() {
                return Err(HandshakeFailure::new(
                    HandshakeFailureKind::ClientCertificateRequested,
                    format!("cannot continue a {} handshake without a client certificate", request.version),
                ));
            }
        }

        Ok(SecureSession {
            version: request.version,
            cipher_suite: flight.cipher_suite,
            peer_certificates: flight.certificates,
            client_auth_requested: flight.certificate_requested,
            stream: Some(SessionStream::Raw(stream)),
        })
    }

    async fn rustls_handshake(&self, request: &HandshakeRequest) -> Result<SecureSession, HandshakeFailure> {
        let protocol = match request.version {
            TlsVersion::Tls13 => &rustls::version::TLS13,
            TlsVersion::Tls12 => &rustls::version::TLS12,
            other => {
                return Err(HandshakeFailure::new(
                    HandshakeFailureKind::ProtocolUnsupported,
                    format!("{other} is not available for full handshakes"),
                ));
            }
        };

        let certified = match &request.credentials {
            Some(creds) => Some(creds.certified_key().map_err(|e| {
                HandshakeFailure::new(
                    HandshakeFailureKind::Other,
                    format!("unusable client credentials: {e}"),
                )
            })?),
            None => None,
        };
        let resolver = Arc::new(RecordingCertResolver::new(certified));

        let mut suites: Vec<SupportedCipherSuite> = rustls::ALL_CIPHER_SUITES
            .iter()
            .copied()
            .filter(|s| {
                let code = s.suite().get_u16();
                request.cipher_suites.iter().any(|c| c.0 == code)
            })
            .collect();
        if suites.is_empty() {
            suites = rustls::DEFAULT_CIPHER_SUITES.to_vec();
        }

        let mut config = ClientConfig::builder()
            .with_cipher_suites(&suites)
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[protocol])
            .map_err(|e| HandshakeFailure::new(HandshakeFailureKind::ProtocolUnsupported, e.to_string()))?
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_client_cert_resolver(resolver.clone());
        config.enable_sni = request.server_name.is_some();

        let server_name = match request.server_name.as_deref() {
            Some(name) => ServerName::try_from(name).map_err(|_| {
                HandshakeFailure::new(HandshakeFailureKind::Other, format!("invalid server name {name}"))
            })?,
            None => ServerName::IpAddress(request.address.ip()),
        };

        let tcp = self.connect(request).await?;
        let connector = TlsConnector::from(Arc::new(config));

        let mut stream = match timeout(request.timeout, connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let failure = classify_tls_io(&e);
                if resolver.was_requested() && failure.kind != HandshakeFailureKind::Timeout {
                    return Err(HandshakeFailure::new(
                        HandshakeFailureKind::ClientCertificateRequested,
                        format!("handshake failed after a certificate request: {}", failure.message),
                    ));
                }
                return Err(failure);
            }
            Err(_) => {
                return Err(HandshakeFailure::new(
                    HandshakeFailureKind::Timeout,
                    format!("{} handshake with {} timed out", request.version, request.address),
                ));
            }
        };

        let requested = resolver.was_requested();
        if requested && request.credentials.is_none() {
            if !request.ignore_client_auth {
                return Err(HandshakeFailure::new(
                    HandshakeFailureKind::ClientCertificateRequested,
                    "server sent a CertificateRequest",
                ));
            }
            settle(&mut stream).await?;
        }

        let (_, conn) = stream.get_ref();
        let version = conn
            .protocol_version()
            .and_then(|v| TlsVersion::from_hex(v.get_u16()))
            .unwrap_or(request.version);
        let cipher_suite = conn
            .negotiated_cipher_suite()
            .map(|s| super::CipherSuite(s.suite().get_u16()));
        let peer_certificates = conn
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.0.clone()).collect())
            .unwrap_or_default();

        Ok(SecureSession {
            version,
            cipher_suite,
            peer_certificates,
            client_auth_requested: requested,
            stream: Some(SessionStream::Tls(Box::new(stream))),
        })
    }
}

#[async_trait]
impl TlsHandshaker for SocketHandshaker {
    async fn connect_and_handshake(
        &self,
        request: &HandshakeRequest,
    ) -> Result<SecureSession, HandshakeFailure> {
        debug!(
            "handshake {} {} scsv={} sni={:?}",
            request.address, request.version, request.fallback_scsv, request.server_name
        );
        match request.version {
            TlsVersion::Tls13 => self.rustls_handshake(request).await,
            _ => self.raw_handshake(request).await,
        }
    }
}

async fn read_server_flight(stream: &mut TcpStream) -> Result<FlightParse, HandshakeFailure> {
    let mut data = Vec::with_capacity(8192);
    let mut buf = [0u8; 8192];

    loop {
        let n = stream.read(&mut buf).await.map_err(|e| rejected(&e))?;
        if n == 0 {
            return Err(HandshakeFailure::new(
                HandshakeFailureKind::ProtocolUnsupported,
                "server closed the connection during the handshake",
            ));
        }
        data.extend_from_slice(&buf[..n]);

        match records::parse_server_flight(&data)? {
            FlightParse::Incomplete => continue,
            parsed => return Ok(parsed),
        }
    }
}

/// Waits briefly for a server to object to a session without a client certificate.
async fn settle(stream: &mut TlsStream<TcpStream>) -> Result<(), HandshakeFailure> {
    let mut probe = [0u8; 1];
    match timeout(SETTLE_TIMEOUT, stream.read(&mut probe)).await {
        Err(_) => Ok(()),
        Ok(Ok(0)) => Err(HandshakeFailure::new(
            HandshakeFailureKind::ClientCertificateRequested,
            "server closed the session without a client certificate",
        )),
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(HandshakeFailure::new(
            HandshakeFailureKind::ClientCertificateRequested,
            format!("server rejected the session without a client certificate: {e}"),
        )),
    }
}

/// Socket errors once the ClientHello is on the wire mean the server refused it.
fn rejected(err: &io::Error) -> HandshakeFailure {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe => HandshakeFailure::new(
            HandshakeFailureKind::ProtocolUnsupported,
            format!("handshake rejected: {err}"),
        ),
        _ => HandshakeFailure::from_io(err),
    }
}

fn classify_tls_io(err: &io::Error) -> HandshakeFailure {
    if let Some(tls_err) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        return match tls_err {
            rustls::Error::AlertReceived(alert) => records::classify_alert(alert.get_u8()),
            rustls::Error::PeerIncompatible(_) => HandshakeFailure::new(
                HandshakeFailureKind::ProtocolUnsupported,
                tls_err.to_string(),
            ),
            other => HandshakeFailure::new(HandshakeFailureKind::Other, other.to_string()),
        };
    }
    rejected(err)
}

/// Scanning must see every server, trusted or not.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Hands out the configured certificate (if any) and remembers being asked.
struct RecordingCertResolver {
    certified: Option<Arc<CertifiedKey>>,
    requested: AtomicBool,
}

impl RecordingCertResolver {
    fn new(certified: Option<Arc<CertifiedKey>>) -> Self {
        Self {
            certified,
            requested: AtomicBool::new(false),
        }
    }

    fn was_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for RecordingCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingCertResolver")
            .field("has_certs", &self.certified.is_some())
            .field("requested", &self.was_requested())
            .finish()
    }
}

impl ResolvesClientCert for RecordingCertResolver {
    fn resolve(
        &self,
        _acceptable_issuers: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.requested.store(true, Ordering::SeqCst);
        self.certified.clone()
    }

    fn has_certs(&self) -> bool {
        self.certified.is_some()
    }
}
