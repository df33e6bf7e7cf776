use async_trait::async_trait;
use colored::*;
use reqwest::header::{HeaderMap, HeaderName, LOCATION, SERVER, SET_COOKIE, STRICT_TRANSPORT_SECURITY};
use reqwest::{Client, Identity};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connectivity::ServerConnectivityInfo;
use crate::errors::{PluginError, Result};
use crate::tls::{TlsHandshaker, DEFAULT_HANDSHAKE_TIMEOUT};

use super::{field, make_title, CommandId, Plugin, ScanCommand, ScanResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrictTransportSecurity {
    pub max_age: Option<u64>,
    pub include_subdomains: bool,
    pub preload: bool,
}

impl StrictTransportSecurity {
    pub fn parse(value: &str) -> Self {
        let mut hsts = StrictTransportSecurity {
            max_age: None,
            include_subdomains: false,
            preload: false,
        };

        for directive in value.split(';').map(str::trim) {
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (directive, None),
            };
            if name.eq_ignore_ascii_case("max-age") {
                hsts.max_age = arg.and_then(|a| a.parse().ok());
            } else if name.eq_ignore_ascii_case("includeSubDomains") {
                hsts.include_subdomains = true;
            } else if name.eq_ignore_ascii_case("preload") {
                hsts.preload = true;
            }
        }

        hsts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpHeadersResult {
    pub path: String,
    pub status: u16,
    pub strict_transport_security: Option<StrictTransportSecurity>,
    pub server_banner: Option<String>,
    pub redirect_location: Option<String>,
    pub cookies: Vec<String>,
}

impl HttpHeadersResult {
    fn from_headers(path: &str, status: u16, headers: &HeaderMap) -> Self {
        let header = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        HttpHeadersResult {
            path: path.to_string(),
            status,
            strict_transport_security: header(STRICT_TRANSPORT_SECURITY)
                .map(|v| StrictTransportSecurity::parse(&v)),
            server_banner: header(SERVER),
            redirect_location: header(LOCATION),
            cookies: headers
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|c| c.to_str().ok())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn as_text(&self) -> Vec<String> {
        let mut lines = vec![
            make_title(&format!("Testing HTTP header response @ \"{}\"", self.path)),
            field("HTTP Status Code", self.status),
        ];

        if let Some(location) = &self.redirect_location {
            lines.push(field("Redirect", location));
        }

        let sts = match &self.strict_transport_security {
            Some(hsts) => {
                let mut parts = vec![match hsts.max_age {
                    Some(age) => format!("{} days={} s", age / 86_400, age),
                    None => "max-age missing".red().to_string(),
                }];
                if hsts.include_subdomains {
                    parts.push("includeSubDomains".to_string());
                }
                if hsts.preload {
                    parts.push("preload".to_string());
                }
                parts.join(", ").green().to_string()
            }
            None => "not offered".yellow().to_string(),
        };
        lines.push(field("Strict Transport Security", sts));
        lines.push(field(
            "Server banner",
            self.server_banner.as_deref().unwrap_or("--"),
        ));

        if self.cookies.is_empty() {
            lines.push(field(
                "Cookie(s)",
                format!("(none issued at \"{}\")", self.path),
            ));
        } else {
            lines.push(field("Cookie(s)", format!("{} issued", self.cookies.len())));
            for cookie in &self.cookies {
                lines.push(field("", cookie));
            }
        }

        lines
    }
}

/// Fetches one page over HTTPS and reports its security-relevant headers.
pub struct HttpHeadersPlugin;

impl HttpHeadersPlugin {
    fn client(&self, info: &ServerConnectivityInfo) -> Result<Client> {
        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .timeout(DEFAULT_HANDSHAKE_TIMEOUT * 2);

        if let Some(host) = info.location.server_name() {
            builder = builder.resolve(&host, info.location.socket_addr());
        }
        if let Some(creds) = &info.credentials {
            let pem = creds
                .identity_pem()
                .map_err(|e| PluginError::InvalidParameters(e.to_string()))?;
            builder = builder.identity(Identity::from_pem(&pem)?);
        }

        Ok(builder.build()?)
    }
}

#[async_trait]
impl Plugin for HttpHeadersPlugin {
    fn name(&self) -> &'static str {
        "http_headers"
    }

    fn commands(&self) -> &'static [CommandId] {
        &[CommandId::HttpHeaders]
    }

    async fn process(
        &self,
        info: &ServerConnectivityInfo,
        command: &ScanCommand,
        _tls: &dyn TlsHandshaker,
    ) -> Result<ScanResult> {
        let ScanCommand::HttpHeaders { path } = command else {
            return Err(PluginError::UnsupportedCommand {
                plugin: self.name(),
                command: command.to_string(),
            });
        };
        if !path.starts_with('/') {
            return Err(PluginError::InvalidParameters(format!(
                "HTTP path must start with '/': {path}"
            )));
        }
        if info.missing_client_certificate() {
            return Err(PluginError::ClientCertificateRequested);
        }

        let url = match info.location.server_name() {
            Some(host) => format!("https://{}:{}{}", host, info.location.port, path),
            None => format!("https://{}{}", info.location.socket_addr(), path),
        };
        debug!("GET {}", url);

        let response = self.client(info)?.get(&url).send().await?;
        Ok(ScanResult::HttpHeaders(HttpHeadersResult::from_headers(
            path,
            response.status().as_u16(),
            response.headers(),
        )))
    }
}
