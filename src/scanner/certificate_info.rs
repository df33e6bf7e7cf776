//! Certificate chain retrieval and analysis.

use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use colored::*;
use rustls::client::{ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, OwnedTrustAnchor, RootCertStore, ServerName};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::connectivity::ServerConnectivityInfo;
use crate::errors::{HandshakeFailureKind, PluginError, Result};
use crate::tls::TlsHandshaker;

use super::{field, make_title, CommandId, Plugin, ScanCommand, ScanResult};

const OID_PKIX_OCSP: &str = "1.3.6.1.5.5.7.48.1";
const OID_MUST_STAPLE: &str = "1.3.6.1.5.5.7.1.24";
const OID_CT_PRECERT_SCTS: &str = "1.3.6.1.4.1.11129.2.4.2";

const SIGNATURE_ALGORITHMS: &[(&str, &str)] = &[
    ("1.2.840.113549.1.1.5", "SHA1 with RSA"),
    ("1.2.840.113549.1.1.11", "SHA256 with RSA"),
    ("1.2.840.113549.1.1.12", "SHA384 with RSA"),
    ("1.2.840.113549.1.1.13", "SHA512 with RSA"),
    ("1.2.840.113549.1.1.10", "RSASSA-PSS"),
    ("1.2.840.10045.4.3.2", "ECDSA with SHA256"),
    ("1.2.840.10045.4.3.3", "ECDSA with SHA384"),
    ("1.2.840.10045.4.3.4", "ECDSA with SHA512"),
    ("1.3.101.112", "Ed25519"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateSummary {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject_alt_names: Vec<String>,
    pub signature_algorithm: String,
    pub public_key: String,
    pub sha1_fingerprint: String,
    pub sha256_fingerprint: String,
    pub ocsp_uri: Option<String>,
    pub must_staple: bool,
    pub embedded_scts: bool,
}

impl CertificateSummary {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PluginError::Failed(format!("unparseable certificate: {e}")))?;

        let mut summary = CertificateSummary {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            not_before: convert_datetime(cert.validity().not_before),
            not_after: convert_datetime(cert.validity().not_after),
            subject_alt_names: Vec::new(),
            signature_algorithm: signature_algorithm_name(&cert),
            public_key: public_key_description(&cert),
            sha1_fingerprint: fingerprint::<Sha1>(der),
            sha256_fingerprint: fingerprint::<Sha256>(der),
            ocsp_uri: None,
            must_staple: false,
            embedded_scts: false,
        };

        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::SubjectAlternativeName(san) => {
                    summary.subject_alt_names = san
                        .general_names
                        .iter()
                        .filter_map(|name| match name {
                            GeneralName::DNSName(dns) => Some(dns.to_string()),
                            GeneralName::IPAddress(ip) => Some(format_ip(ip)),
                            _ => None,
                        })
                        .collect();
                }
                ParsedExtension::AuthorityInfoAccess(aia) => {
                    summary.ocsp_uri = aia
                        .accessdescs
                        .iter()
                        .filter(|desc| desc.access_method.to_id_string() == OID_PKIX_OCSP)
                        .find_map(|desc| match &desc.access_location {
                            GeneralName::URI(uri) => Some(uri.to_string()),
                            _ => None,
                        });
                }
                _ => {}
            }

            let oid = ext.oid.to_id_string();
            if oid == OID_MUST_STAPLE {
                summary.must_staple = true;
            } else if oid == OID_CT_PRECERT_SCTS {
                summary.embedded_scts = true;
            }
        }

        Ok(summary)
    }

    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateInfoResult {
    /// Name the chain was validated against.
    pub server_name: String,
    /// Leaf first, as sent by the server.
    pub chain: Vec<CertificateSummary>,
    pub trusted: bool,
    pub validation_error: Option<String>,
}

impl CertificateInfoResult {
    pub fn as_text(&self) -> Vec<String> {
        let mut lines = vec![make_title("Certificate Information")];
        let now = Utc::now();

        if let Some(leaf) = self.chain.first() {
            let days = leaf.days_remaining(now);
            let validity = if days < 0 {
                "expired".red()
            } else if days < 30 {
                format!("expires in {days} days").yellow()
            } else {
                format!("{days} days left").green()
            };

            lines.push(field("Subject", &leaf.subject));
            lines.push(field("subjectAltName (SAN)", leaf.subject_alt_names.join(" ")));
            lines.push(field("Issuer", &leaf.issuer));
            lines.push(field("Serial", &leaf.serial));
            lines.push(field("Signature Algorithm", &leaf.signature_algorithm));
            lines.push(field("Server key", &leaf.public_key));
            lines.push(field("Fingerprints", format!("SHA1 {}", leaf.sha1_fingerprint)));
            lines.push(field("", format!("SHA256 {}", leaf.sha256_fingerprint)));
            lines.push(field(
                "Certificate Validity (UTC)",
                format!(
                    "{} ({} --> {})",
                    validity,
                    leaf.not_before.format("%Y-%m-%d %H:%M"),
                    leaf.not_after.format("%Y-%m-%d %H:%M")
                ),
            ));
            lines.push(field("OCSP URI", leaf.ocsp_uri.as_deref().unwrap_or("--")));
            lines.push(field(
                "OCSP must staple extension",
                if leaf.must_staple { "yes" } else { "--" },
            ));
            lines.push(field(
                "Certificate Transparency",
                if leaf.embedded_scts { "yes (certificate extension)" } else { "--" },
            ));
        }

        let trust = if self.trusted {
            "Ok".green().to_string()
        } else {
            format!(
                "{} ({})",
                "NOT ok".red(),
                self.validation_error.as_deref().unwrap_or("unknown reason")
            )
        };
        lines.push(field(&format!("Trust ({})", self.server_name), trust));
        lines.push(field("Certificates provided", self.chain.len()));

        for (i, cert) in self.chain.iter().enumerate().skip(1) {
            let days = cert.days_remaining(now);
            let status = if days > 40 {
                "ok > 40 days".green()
            } else {
                "warning < 40 days".yellow()
            };
            lines.push(field(
                if i == 1 { "Intermediate cert validity" } else { "" },
                format!(
                    "#{}: {} ({}). {} <-- {}",
                    i,
                    status,
                    cert.not_after.format("%Y-%m-%d %H:%M"),
                    cert.subject,
                    cert.issuer
                ),
            ));
        }

        lines
    }
}

pub struct CertificateInfoPlugin;

#[async_trait]
impl Plugin for CertificateInfoPlugin {
    fn name(&self) -> &'static str {
        "certificate_info"
    }

    fn commands(&self) -> &'static [CommandId] {
        &[CommandId::CertificateInfo]
    }

    async fn process(
        &self,
        info: &ServerConnectivityInfo,
        command: &ScanCommand,
        tls: &dyn TlsHandshaker,
    ) -> Result<ScanResult> {
        if *command != ScanCommand::CertificateInfo {
            return Err(PluginError::UnsupportedCommand {
                plugin: self.name(),
                command: command.to_string(),
            });
        }

        let request = info.handshake_request(info.highest_version);
        let session = tls.connect_and_handshake(&request).await.map_err(|failure| {
            if failure.kind == HandshakeFailureKind::ClientCertificateRequested {
                PluginError::ClientCertificateRequested
            } else {
                PluginError::Handshake(failure)
            }
        })?;
        let ders = session.peer_certificates.clone();
        session.close().await;

        if ders.is_empty() {
            return Err(PluginError::Failed(format!(
                "{} did not send a certificate",
                info.location
            )));
        }

        let chain = ders
            .iter()
            .map(|der| CertificateSummary::from_der(der))
            .collect::<Result<Vec<_>>>()?;

        let server_name = info
            .location
            .server_name()
            .unwrap_or_else(|| info.location.ip_address.to_string());
        let validation_error = verify_chain(&ders, &server_name).err();

        Ok(ScanResult::CertificateInfo(CertificateInfoResult {
            server_name,
            chain,
            trusted: validation_error.is_none(),
            validation_error,
        }))
    }
}

fn get_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    root_store
}

/// Validates the chain against the Mozilla roots for `server_name`.
fn verify_chain(ders: &[Vec<u8>], server_name: &str) -> std::result::Result<(), String> {
    let (leaf, intermediates) = ders
        .split_first()
        .ok_or_else(|| "empty certificate chain".to_string())?;
    let intermediates: Vec<Certificate> = intermediates.iter().cloned().map(Certificate).collect();
    let name = ServerName::try_from(server_name).map_err(|e| e.to_string())?;

    let verifier = WebPkiVerifier::new(get_root_store(), None);
    verifier
        .verify_server_cert(
            &Certificate(leaf.clone()),
            &intermediates,
            &name,
            &mut std::iter::empty::<&[u8]>(),
            &[],
            SystemTime::now(),
        )
        .map(|_| ())
        .map_err(|e| e.to_string())
}

fn convert_datetime(time: ASN1Time) -> DateTime<Utc> {
    Utc.timestamp_opt(time.timestamp(), 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_nanos(0))
}

fn signature_algorithm_name(cert: &X509Certificate<'_>) -> String {
    let oid = cert.signature_algorithm.algorithm.to_id_string();
    SIGNATURE_ALGORITHMS
        .iter()
        .find(|(known, _)| *known == oid)
        .map(|(_, name)| name.to_string())
        .unwrap_or(oid)
}

fn public_key_description(cert: &X509Certificate<'_>) -> String {
    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => format!("RSA {} bits", rsa.key_size()),
        Ok(PublicKey::EC(ec)) => format!("EC {} bits", ec.key_size()),
        Ok(PublicKey::DSA(_)) => "DSA".to_string(),
        Ok(_) => cert.public_key().algorithm.algorithm.to_id_string(),
        Err(_) => "unknown".to_string(),
    }
}

fn fingerprint<D: Digest>(der: &[u8]) -> String {
    D::digest(der)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}

fn format_ip(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3]),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => format!("{bytes:02x?}"),
    }
}
