//! TLS_FALLBACK_SCSV support (RFC 7507).
//!
//! Connects one version below the best version the server accepts and
//! announces the downgrade. A server that enforces the mechanism aborts with
//! an `inappropriate_fallback` alert.

use async_trait::async_trait;
use colored::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connectivity::ServerConnectivityInfo;
use crate::errors::{HandshakeFailureKind, PluginError, Result};
use crate::tls::TlsHandshaker;

use super::{field, make_title, CommandId, Plugin, ScanCommand, ScanResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackScsvResult {
    pub supports_fallback_scsv: bool,
}

impl FallbackScsvResult {
    pub fn as_text(&self) -> Vec<String> {
        let verdict = if self.supports_fallback_scsv {
            "OK - Supported".green()
        } else {
            "VULNERABLE - Signaling cipher suite not supported".red()
        };
        vec![
            make_title("Downgrade Attacks"),
            field("TLS_FALLBACK_SCSV:", verdict),
        ]
    }
}

pub struct FallbackScsvPlugin;

#[async_trait]
impl Plugin for FallbackScsvPlugin {
    fn name(&self) -> &'static str {
        "fallback_scsv"
    }

    fn commands(&self) -> &'static [CommandId] {
        &[CommandId::FallbackScsv]
    }

    async fn process(
        &self,
        info: &ServerConnectivityInfo,
        command: &ScanCommand,
        tls: &dyn TlsHandshaker,
    ) -> Result<ScanResult> {
        if *command != ScanCommand::FallbackScsv {
            return Err(PluginError::UnsupportedCommand {
                plugin: self.name(),
                command: command.to_string(),
            });
        }

        let version = info.highest_version.downgraded().ok_or_else(|| {
            PluginError::InvalidParameters(format!(
                "{} is the best version {} accepts; there is nothing to downgrade to",
                info.highest_version, info.location
            ))
        })?;

        let request = info.handshake_request(version).with_fallback_scsv(true);
        let supports_fallback_scsv = match tls.connect_and_handshake(&request).await {
            Ok(session) => {
                session.close().await;
                false
            }
            Err(failure) => match failure.kind {
                HandshakeFailureKind::DowngradeDetected => true,
                HandshakeFailureKind::ClientCertificateRequested => {
                    return Err(PluginError::ClientCertificateRequested);
                }
                _ => {
                    debug!("{} downgrade to {} failed: {}", info.location, version, failure);
                    false
                }
            },
        };

        Ok(ScanResult::FallbackScsv(FallbackScsvResult {
            supports_fallback_scsv,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_names_the_verdict() {
        let good = FallbackScsvResult {
            supports_fallback_scsv: true,
        }
        .as_text();
        assert!(good[0].contains("Downgrade Attacks"));
        assert!(good[1].contains("OK - Supported"));

        let bad = FallbackScsvResult {
            supports_fallback_scsv: false,
        }
        .as_text();
        assert!(bad[1].contains("VULNERABLE"));
    }
}
