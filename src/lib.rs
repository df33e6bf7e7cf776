//! Concurrent TLS server auditing.
//!
//! Probe a server once with [`ConnectivityProber`], then fan scan commands
//! out over a [`ConcurrentScanner`]; each command is executed by the
//! [`Plugin`] registered for it in a [`PluginRegistry`].

pub mod config;
pub mod connectivity;
pub mod errors;
pub mod output;
pub mod scanner;
pub mod scheduler;
pub mod tls;
pub mod wire;

pub use connectivity::{ClientAuthRequirement, ConnectivityProber, ServerConnectivityInfo, ServerLocation};
pub use errors::{ConnectivityError, HandshakeFailure, HandshakeFailureKind, PluginError, ScanErrorKind};
pub use scanner::{CommandId, Plugin, PluginRegistry, ScanCommand, ScanResult};
pub use scheduler::{ConcurrentScanner, IsolationMode, ScanError, ScanJob, ScanOutcome, ScanOutcomes, ScannerOptions};
pub use tls::{ClientAuthenticationCredentials, HandshakeRequest, SecureSession, SocketHandshaker, TlsHandshaker, TlsVersion};
