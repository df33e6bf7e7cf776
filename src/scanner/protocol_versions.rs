use async_trait::async_trait;
use colored::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connectivity::ServerConnectivityInfo;
use crate::errors::{HandshakeFailureKind, PluginError, Result};
use crate::tls::{CipherSuite, TlsHandshaker, TlsVersion};

use super::{make_title, CommandId, Plugin, ScanCommand, ScanResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionSupport {
    pub version: TlsVersion,
    pub accepted: bool,
    /// Suite the server picked when it accepted the version.
    pub cipher_suite: Option<CipherSuite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolVersionsResult {
    /// Oldest first.
    pub versions: Vec<VersionSupport>,
}

impl ProtocolVersionsResult {
    pub fn accepted(&self) -> impl Iterator<Item = TlsVersion> + '_ {
        self.versions.iter().filter(|v| v.accepted).map(|v| v.version)
    }

    pub fn as_text(&self) -> Vec<String> {
        let mut lines = vec![make_title("Testing protocols via sockets")];

        for support in &self.versions {
            let status = match (support.accepted, support.version.is_deprecated()) {
                (true, true) => format!("{} ({})", "offered".red(), "NOT ok".red()),
                (true, false) => format!("{} ({})", "offered".green(), "OK".green()),
                (false, true) => format!("{} ({})", "not offered".green(), "OK".green()),
                (false, false) => "not offered".yellow().to_string(),
            };
            let cipher = support
                .cipher_suite
                .map(|c| format!(": {c}"))
                .unwrap_or_default();
            lines.push(format!("     {:10} {}{}", support.version.name(), status, cipher));
        }

        lines
    }
}

/// Checks every protocol version independently of the one probing settled on.
pub struct ProtocolVersionsPlugin;

#[async_trait]
impl Plugin for ProtocolVersionsPlugin {
    fn name(&self) -> &'static str {
        "protocol_versions"
    }

    fn commands(&self) -> &'static [CommandId] {
        &[CommandId::ProtocolVersions]
    }

    async fn process(
        &self,
        info: &ServerConnectivityInfo,
        command: &ScanCommand,
        tls: &dyn TlsHandshaker,
    ) -> Result<ScanResult> {
        if *command != ScanCommand::ProtocolVersions {
            return Err(PluginError::UnsupportedCommand {
                plugin: self.name(),
                command: command.to_string(),
            });
        }

        let mut versions = Vec::new();
        for version in TlsVersion::PROBE_ORDER.into_iter().rev() {
            let request = info.handshake_request(version);
            let support = match tls.connect_and_handshake(&request).await {
                Ok(session) => {
                    let cipher_suite = session.cipher_suite;
                    session.close().await;
                    VersionSupport {
                        version,
                        accepted: true,
                        cipher_suite,
                    }
                }
                // The server answered with a ServerHello before asking for a
                // certificate, so the version itself is accepted.
                Err(failure) if failure.kind == HandshakeFailureKind::ClientCertificateRequested => {
                    VersionSupport {
                        version,
                        accepted: true,
                        cipher_suite: None,
                    }
                }
                // Losing the version that connectivity settled on means the
                // server is gone; older versions are often silently dropped.
                Err(failure) if failure.kind.is_network_level() => {
                    if version == info.highest_version {
                        return Err(PluginError::Handshake(failure));
                    }
                    warn!("{} dropped the {} handshake: {}", info.location, version, failure);
                    VersionSupport {
                        version,
                        accepted: false,
                        cipher_suite: None,
                    }
                }
                Err(failure) => {
                    debug!("{} rejected {}: {}", info.location, version, failure);
                    VersionSupport {
                        version,
                        accepted: false,
                        cipher_suite: None,
                    }
                }
            };
            versions.push(support);
        }

        Ok(ScanResult::ProtocolVersions(ProtocolVersionsResult { versions }))
    }
}
