//! Scan commands, their results, and the plugins that execute them.

use std::fmt;
use std::iter;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::connectivity::ServerConnectivityInfo;
use crate::errors::Result;
use crate::tls::TlsHandshaker;

pub mod certificate_info;
pub mod fallback_scsv;
pub mod http_headers;
pub mod protocol_versions;
pub mod registry;

pub use certificate_info::{CertificateInfoPlugin, CertificateInfoResult};
pub use fallback_scsv::{FallbackScsvPlugin, FallbackScsvResult};
pub use http_headers::{HttpHeadersPlugin, HttpHeadersResult};
pub use protocol_versions::{ProtocolVersionsPlugin, ProtocolVersionsResult};
pub use registry::PluginRegistry;

/// Names a kind of scan, without its parameters. Registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandId {
    FallbackScsv,
    ProtocolVersions,
    CertificateInfo,
    HttpHeaders,
}

impl CommandId {
    pub const ALL: [CommandId; 4] = [
        CommandId::ProtocolVersions,
        CommandId::CertificateInfo,
        CommandId::FallbackScsv,
        CommandId::HttpHeaders,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CommandId::FallbackScsv => "fallback",
            CommandId::ProtocolVersions => "protocols",
            CommandId::CertificateInfo => "certinfo",
            CommandId::HttpHeaders => "http_headers",
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CommandId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CommandId::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = CommandId::ALL.iter().map(|id| id.name()).collect();
                format!("unknown scan command '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

/// A scan to run against one server, with its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ScanCommand {
    FallbackScsv,
    ProtocolVersions,
    CertificateInfo,
    HttpHeaders { path: String },
}

impl ScanCommand {
    pub fn id(&self) -> CommandId {
        match self {
            ScanCommand::FallbackScsv => CommandId::FallbackScsv,
            ScanCommand::ProtocolVersions => CommandId::ProtocolVersions,
            ScanCommand::CertificateInfo => CommandId::CertificateInfo,
            ScanCommand::HttpHeaders { .. } => CommandId::HttpHeaders,
        }
    }

    /// The command with default parameters.
    pub fn from_id(id: CommandId) -> Self {
        match id {
            CommandId::FallbackScsv => ScanCommand::FallbackScsv,
            CommandId::ProtocolVersions => ScanCommand::ProtocolVersions,
            CommandId::CertificateInfo => ScanCommand::CertificateInfo,
            CommandId::HttpHeaders => ScanCommand::HttpHeaders { path: "/".to_string() },
        }
    }
}

impl fmt::Display for ScanCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanCommand::HttpHeaders { path } => write!(f, "{} @ {}", self.id(), path),
            other => write!(f, "{}", other.id()),
        }
    }
}

/// Outcome of one successful scan command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "result", rename_all = "snake_case")]
pub enum ScanResult {
    FallbackScsv(FallbackScsvResult),
    ProtocolVersions(ProtocolVersionsResult),
    CertificateInfo(CertificateInfoResult),
    HttpHeaders(HttpHeadersResult),
}

impl ScanResult {
    pub fn command_id(&self) -> CommandId {
        match self {
            ScanResult::FallbackScsv(_) => CommandId::FallbackScsv,
            ScanResult::ProtocolVersions(_) => CommandId::ProtocolVersions,
            ScanResult::CertificateInfo(_) => CommandId::CertificateInfo,
            ScanResult::HttpHeaders(_) => CommandId::HttpHeaders,
        }
    }

    /// Human-readable lines, title first.
    pub fn as_text(&self) -> Vec<String> {
        match self {
            ScanResult::FallbackScsv(r) => r.as_text(),
            ScanResult::ProtocolVersions(r) => r.as_text(),
            ScanResult::CertificateInfo(r) => r.as_text(),
            ScanResult::HttpHeaders(r) => r.as_text(),
        }
    }

    pub fn as_structured(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            json!({ "command": self.command_id(), "error": e.to_string() })
        })
    }
}

/// Executes one or more scan commands against a probed server.
///
/// Implementations only open their own connections through `tls` (or their
/// own HTTP client) and never touch the connectivity info beyond reading it.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn commands(&self) -> &'static [CommandId];

    async fn process(
        &self,
        info: &ServerConnectivityInfo,
        command: &ScanCommand,
        tls: &dyn TlsHandshaker,
    ) -> Result<ScanResult>;
}

pub(crate) fn make_title(text: &str) -> String {
    let underline = iter::repeat('_').take(text.len()).collect::<String>();
    format!(" {}\n {}", text, underline)
}

/// Left-aligned label column used by every text rendering.
pub(crate) fn field(label: &str, value: impl fmt::Display) -> String {
    format!("     {:<32} {}", label, value)
}
