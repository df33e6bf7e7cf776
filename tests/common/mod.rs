// Shared fakes for the integration tests: a scripted TLS server model and a
// handful of plugins with predictable behaviour.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_tlsaudit::errors::Result;
use rust_tlsaudit::scanner::FallbackScsvResult;
use rust_tlsaudit::{
    ClientAuthRequirement, ClientAuthenticationCredentials, CommandId, HandshakeFailure,
    HandshakeFailureKind, HandshakeRequest, Plugin, ScanCommand, ScanResult, SecureSession,
    ServerConnectivityInfo, ServerLocation, TlsHandshaker, TlsVersion,
};

/// How a simulated server reacts to handshakes.
#[derive(Debug, Clone)]
pub struct ServerModel {
    pub versions: BTreeSet<TlsVersion>,
    pub client_auth: ClientAuthRequirement,
    pub enforces_fallback_scsv: bool,
    /// Every attempt fails with this kind instead.
    pub network_failure: Option<HandshakeFailureKind>,
    /// Credentials are refused even when supplied.
    pub rejects_credentials: bool,
    /// Attempts at these versions time out.
    pub dropping: BTreeSet<TlsVersion>,
}

impl ServerModel {
    pub fn new(versions: &[TlsVersion]) -> Self {
        Self {
            versions: versions.iter().copied().collect(),
            client_auth: ClientAuthRequirement::None,
            enforces_fallback_scsv: false,
            network_failure: None,
            rejects_credentials: false,
            dropping: BTreeSet::new(),
        }
    }

    pub fn silently_dropping(mut self, version: TlsVersion) -> Self {
        self.dropping.insert(version);
        self
    }

    pub fn enforcing_fallback_scsv(mut self) -> Self {
        self.enforces_fallback_scsv = true;
        self
    }

    pub fn with_client_auth(mut self, client_auth: ClientAuthRequirement) -> Self {
        self.client_auth = client_auth;
        self
    }

    pub fn rejecting_credentials(mut self) -> Self {
        self.rejects_credentials = true;
        self
    }

    pub fn unreachable(kind: HandshakeFailureKind) -> Self {
        Self {
            network_failure: Some(kind),
            ..Self::new(&[])
        }
    }

    fn answer(&self, request: &HandshakeRequest) -> std::result::Result<SecureSession, HandshakeFailure> {
        if let Some(kind) = self.network_failure {
            return Err(HandshakeFailure::new(kind, "scripted network failure"));
        }
        if self.dropping.contains(&request.version) {
            return Err(HandshakeFailure::new(
                HandshakeFailureKind::Timeout,
                format!("{} hello dropped", request.version),
            ));
        }
        if !self.versions.contains(&request.version) {
            return Err(HandshakeFailure::new(
                HandshakeFailureKind::ProtocolUnsupported,
                format!("{} disabled", request.version),
            ));
        }
        let best = self.versions.iter().next_back().copied();
        if request.fallback_scsv && self.enforces_fallback_scsv && Some(request.version) < best {
            return Err(HandshakeFailure::new(
                HandshakeFailureKind::DowngradeDetected,
                "inappropriate_fallback",
            ));
        }

        let requested = self.client_auth != ClientAuthRequirement::None;
        if requested {
            let cert_missing = match (&request.credentials, self.client_auth) {
                (Some(_), _) => self.rejects_credentials,
                (None, ClientAuthRequirement::Required) => true,
                (None, _) => !request.ignore_client_auth,
            };
            if cert_missing {
                return Err(HandshakeFailure::new(
                    HandshakeFailureKind::ClientCertificateRequested,
                    "certificate_required",
                ));
            }
        }

        let mut session = SecureSession::new(request.version, request.cipher_suites.first().copied());
        session.client_auth_requested = requested;
        Ok(session)
    }
}

/// A [`TlsHandshaker`] that answers from a [`ServerModel`] and records every request.
pub struct ScriptedHandshaker {
    model: ServerModel,
    requests: Mutex<Vec<HandshakeRequest>>,
}

impl ScriptedHandshaker {
    pub fn new(model: ServerModel) -> Arc<Self> {
        Arc::new(Self {
            model,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HandshakeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TlsHandshaker for ScriptedHandshaker {
    async fn connect_and_handshake(
        &self,
        request: &HandshakeRequest,
    ) -> std::result::Result<SecureSession, HandshakeFailure> {
        self.requests.lock().unwrap().push(request.clone());
        self.model.answer(request)
    }
}

pub fn location() -> ServerLocation {
    ServerLocation::new("scan.test", IpAddr::from([127, 0, 0, 1]), 443)
}

pub fn info(
    highest_version: TlsVersion,
    client_auth: ClientAuthRequirement,
    credentials: Option<ClientAuthenticationCredentials>,
) -> ServerConnectivityInfo {
    let session_established =
        client_auth != ClientAuthRequirement::Required || credentials.is_some();
    ServerConnectivityInfo {
        location: location(),
        highest_version,
        cipher_suite: None,
        client_auth,
        credentials,
        session_established,
    }
}

fn canned_result() -> ScanResult {
    ScanResult::FallbackScsv(FallbackScsvResult {
        supports_fallback_scsv: true,
    })
}

/// Answers immediately.
pub struct EchoPlugin(pub CommandId);

#[async_trait]
impl Plugin for EchoPlugin {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn commands(&self) -> &'static [CommandId] {
        match self.0 {
            CommandId::FallbackScsv => &[CommandId::FallbackScsv],
            CommandId::ProtocolVersions => &[CommandId::ProtocolVersions],
            CommandId::CertificateInfo => &[CommandId::CertificateInfo],
            CommandId::HttpHeaders => &[CommandId::HttpHeaders],
        }
    }

    async fn process(
        &self,
        _info: &ServerConnectivityInfo,
        _command: &ScanCommand,
        _tls: &dyn TlsHandshaker,
    ) -> Result<ScanResult> {
        Ok(canned_result())
    }
}

/// Sleeps before answering.
pub struct SlowPlugin(pub Duration);

#[async_trait]
impl Plugin for SlowPlugin {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn commands(&self) -> &'static [CommandId] {
        &[CommandId::CertificateInfo]
    }

    async fn process(
        &self,
        _info: &ServerConnectivityInfo,
        _command: &ScanCommand,
        _tls: &dyn TlsHandshaker,
    ) -> Result<ScanResult> {
        tokio::time::sleep(self.0).await;
        Ok(canned_result())
    }
}

/// Panics on every job.
pub struct PanickingPlugin;

#[async_trait]
impl Plugin for PanickingPlugin {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn commands(&self) -> &'static [CommandId] {
        &[CommandId::ProtocolVersions]
    }

    async fn process(
        &self,
        _info: &ServerConnectivityInfo,
        _command: &ScanCommand,
        _tls: &dyn TlsHandshaker,
    ) -> Result<ScanResult> {
        panic!("plugin blew up");
    }
}

/// Blocks its thread outside the runtime, counting how many run at once.
#[derive(Default)]
pub struct BlockingPlugin {
    pub block_for: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl BlockingPlugin {
    pub fn new(block_for: Duration) -> Arc<Self> {
        Arc::new(Self {
            block_for,
            ..Self::default()
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for BlockingPlugin {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn commands(&self) -> &'static [CommandId] {
        &[CommandId::CertificateInfo]
    }

    async fn process(
        &self,
        _info: &ServerConnectivityInfo,
        _command: &ScanCommand,
        _tls: &dyn TlsHandshaker,
    ) -> Result<ScanResult> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.block_for);
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(canned_result())
    }
}
