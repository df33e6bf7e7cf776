use std::net::IpAddr;

use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;
use tracing::debug;

use crate::errors::ConnectivityError;

/// Resolves a hostname to its first address; IP literals are returned as-is.
pub async fn resolve_host(hostname: &str) -> Result<IpAddr, ConnectivityError> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(ip);
    }

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        .map_err(|e| ConnectivityError::dns(hostname, e))?;

    let ip = resolver
        .lookup_ip(hostname)
        .await
        .map_err(|e| ConnectivityError::dns(hostname, e))?
        .iter()
        .next()
        .ok_or_else(|| ConnectivityError::DnsResolution {
            hostname: hostname.to_string(),
            reason: "no address found".to_string(),
        })?;

    debug!("resolved {} to {}", hostname, ip);
    Ok(ip)
}

/// Best-effort PTR lookup for the banner.
pub async fn reverse_lookup(ip: IpAddr) -> Option<String> {
    let resolver =
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()).ok()?;
    resolver
        .reverse_lookup(ip)
        .await
        .ok()?
        .iter()
        .next()
        .map(|name| name.to_string())
}
