use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use trust_dns_resolver::error::ResolveError;

/// Classification of a single failed handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeFailureKind {
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    ProtocolUnsupported,
    ClientCertificateRequested,
    DowngradeDetected,
    Other,
}

impl HandshakeFailureKind {
    /// Failures that say the endpoint is unreachable rather than incompatible.
    pub fn is_network_level(self) -> bool {
        matches!(
            self,
            HandshakeFailureKind::Timeout
                | HandshakeFailureKind::ConnectionReset
                | HandshakeFailureKind::ConnectionRefused
        )
    }
}

impl fmt::Display for HandshakeFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandshakeFailureKind::Timeout => "timeout",
            HandshakeFailureKind::ConnectionReset => "connection reset",
            HandshakeFailureKind::ConnectionRefused => "connection refused",
            HandshakeFailureKind::ProtocolUnsupported => "protocol or cipher unsupported",
            HandshakeFailureKind::ClientCertificateRequested => "client certificate requested",
            HandshakeFailureKind::DowngradeDetected => "downgrade detected",
            HandshakeFailureKind::Other => "handshake failed",
        };
        f.write_str(label)
    }
}

/// One handshake attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct HandshakeFailure {
    pub kind: HandshakeFailureKind,
    pub message: String,
}

impl HandshakeFailure {
    pub fn new(kind: HandshakeFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => HandshakeFailureKind::Timeout,
            ErrorKind::ConnectionRefused => HandshakeFailureKind::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                HandshakeFailureKind::ConnectionReset
            }
            _ => HandshakeFailureKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// The prober could not establish any working configuration for a server.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("DNS resolution failed for {hostname}: {reason}")]
    DnsResolution { hostname: String, reason: String },

    #[error("{addr} is unreachable: {failure}")]
    Unreachable {
        addr: SocketAddr,
        failure: HandshakeFailure,
    },

    #[error("no protocol version and cipher configuration completed a handshake with {addr}")]
    NoCommonConfiguration { addr: SocketAddr },

    #[error("{addr} rejected the supplied client credentials: {failure}")]
    ClientCredentialsRejected {
        addr: SocketAddr,
        failure: HandshakeFailure,
    },

    #[error("invalid client credentials: {0}")]
    InvalidCredentials(String),
}

impl ConnectivityError {
    pub fn dns(hostname: &str, err: ResolveError) -> Self {
        ConnectivityError::DnsResolution {
            hostname: hostname.to_string(),
            reason: err.to_string(),
        }
    }
}

/// A plugin could not produce a result.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {plugin} cannot execute scan command {command}")]
    UnsupportedCommand {
        plugin: &'static str,
        command: String,
    },

    #[error("invalid scan command parameters: {0}")]
    InvalidParameters(String),

    #[error("server requested a client certificate but none was configured")]
    ClientCertificateRequested,

    #[error(transparent)]
    Handshake(#[from] HandshakeFailure),

    #[error("{0}")]
    Failed(String),
}

impl From<reqwest::Error> for PluginError {
    fn from(err: reqwest::Error) -> Self {
        PluginError::Failed(format!("HTTP request failed: {err}"))
    }
}

/// Why a scan job did not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "handshake", rename_all = "snake_case")]
pub enum ScanErrorKind {
    ClientCertificateRequested,
    Handshake(HandshakeFailureKind),
    Plugin,
    Timeout,
    WorkerCrashed,
    Cancelled,
}

impl fmt::Display for ScanErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanErrorKind::ClientCertificateRequested => f.write_str("client certificate requested"),
            ScanErrorKind::Handshake(kind) => write!(f, "handshake failure ({kind})"),
            ScanErrorKind::Plugin => f.write_str("plugin error"),
            ScanErrorKind::Timeout => f.write_str("timeout"),
            ScanErrorKind::WorkerCrashed => f.write_str("worker crashed"),
            ScanErrorKind::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl From<&PluginError> for ScanErrorKind {
    fn from(err: &PluginError) -> Self {
        match err {
            PluginError::ClientCertificateRequested => ScanErrorKind::ClientCertificateRequested,
            PluginError::Handshake(failure)
                if failure.kind == HandshakeFailureKind::ClientCertificateRequested =>
            {
                ScanErrorKind::ClientCertificateRequested
            }
            PluginError::Handshake(failure) => ScanErrorKind::Handshake(failure.kind),
            PluginError::UnsupportedCommand { .. }
            | PluginError::InvalidParameters(_)
            | PluginError::Failed(_) => ScanErrorKind::Plugin,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("the scanner is draining and no longer accepts jobs")]
    Draining,
}

/// Encoding or decoding across the worker boundary failed.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(serde_json::Error),

    #[error("wire format version {found} is not supported (expected {expected})")]
    VersionMismatch { expected: u16, found: u16 },
}

pub type Result<T> = std::result::Result<T, PluginError>;
