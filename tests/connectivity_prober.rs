// Connectivity probing against scripted servers

mod common;

use std::io::Write;

use common::{location, ScriptedHandshaker, ServerModel};
use rust_tlsaudit::tls::{cipher_candidates, CipherSuite};
use rust_tlsaudit::{
    ClientAuthRequirement, ClientAuthenticationCredentials, ConnectivityError, ConnectivityProber,
    HandshakeFailureKind, TlsVersion,
};
use tempfile::NamedTempFile;

const ALL: &[TlsVersion] = &[
    TlsVersion::Tls10,
    TlsVersion::Tls11,
    TlsVersion::Tls12,
    TlsVersion::Tls13,
];

fn pem_file(label: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "-----BEGIN {label}-----\nMIIBAA==\n-----END {label}-----").unwrap();
    file
}

#[tokio::test]
async fn picks_the_newest_accepted_version() {
    let tls = ScriptedHandshaker::new(ServerModel::new(&[TlsVersion::Tls11, TlsVersion::Tls12]));
    let prober = ConnectivityProber::new(tls.clone());

    let info = prober.probe(&location(), None).await.unwrap();
    assert_eq!(info.highest_version, TlsVersion::Tls12);
    assert_eq!(info.cipher_suite, Some(cipher_candidates(TlsVersion::Tls12)[0][0]));
    assert_eq!(info.client_auth, ClientAuthRequirement::None);
    assert!(info.session_established);

    let versions: Vec<TlsVersion> = tls.requests().iter().map(|r| r.version).collect();
    assert_eq!(versions, vec![TlsVersion::Tls13, TlsVersion::Tls12]);
}

#[tokio::test]
async fn probing_twice_gives_the_same_answer() {
    let tls = ScriptedHandshaker::new(ServerModel::new(ALL));
    let prober = ConnectivityProber::new(tls);

    let first = prober.probe(&location(), None).await.unwrap();
    let second = prober.probe(&location(), None).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn sni_override_is_sent() {
    let tls = ScriptedHandshaker::new(ServerModel::new(ALL));
    let prober = ConnectivityProber::new(tls.clone());
    let target = location().with_sni(Some("virtual.test".to_string()));

    let info = prober.probe(&target, None).await.unwrap();
    assert_eq!(info.location.sni.as_deref(), Some("virtual.test"));
    assert_eq!(tls.requests()[0].server_name.as_deref(), Some("virtual.test"));
}

#[tokio::test]
async fn refused_connection_stops_probing() {
    let tls = ScriptedHandshaker::new(ServerModel::unreachable(HandshakeFailureKind::ConnectionRefused));
    let prober = ConnectivityProber::new(tls.clone());

    let err = prober.probe(&location(), None).await.unwrap_err();
    match err {
        ConnectivityError::Unreachable { addr, failure } => {
            assert_eq!(addr, location().socket_addr());
            assert_eq!(failure.kind, HandshakeFailureKind::ConnectionRefused);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(tls.requests().len(), 1);
}

#[tokio::test]
async fn timeout_is_unreachable() {
    let tls = ScriptedHandshaker::new(ServerModel::unreachable(HandshakeFailureKind::Timeout));
    let prober = ConnectivityProber::new(tls);

    let err = prober.probe(&location(), None).await.unwrap_err();
    assert!(matches!(err, ConnectivityError::Unreachable { .. }));
}

#[tokio::test]
async fn every_configuration_rejected() {
    let tls = ScriptedHandshaker::new(ServerModel::new(&[]));
    let prober = ConnectivityProber::new(tls.clone());

    let err = prober.probe(&location(), None).await.unwrap_err();
    assert!(matches!(err, ConnectivityError::NoCommonConfiguration { .. }));

    let expected: usize = TlsVersion::PROBE_ORDER
        .iter()
        .map(|v| cipher_candidates(*v).len())
        .sum();
    assert_eq!(tls.requests().len(), expected);
}

#[tokio::test]
async fn required_client_certificate_without_credentials() {
    let model = ServerModel::new(ALL).with_client_auth(ClientAuthRequirement::Required);
    let tls = ScriptedHandshaker::new(model);
    let prober = ConnectivityProber::new(tls.clone());

    let info = prober.probe(&location(), None).await.unwrap();
    assert_eq!(info.highest_version, TlsVersion::Tls13);
    assert_eq!(info.client_auth, ClientAuthRequirement::Required);
    assert!(!info.session_established);
    assert!(info.missing_client_certificate());

    let requests = tls.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].ignore_client_auth);
}

#[tokio::test]
async fn optional_client_certificate_without_credentials() {
    let model = ServerModel::new(ALL).with_client_auth(ClientAuthRequirement::Optional);
    let tls = ScriptedHandshaker::new(model);
    let prober = ConnectivityProber::new(tls);

    let info = prober.probe(&location(), None).await.unwrap();
    assert_eq!(info.client_auth, ClientAuthRequirement::Optional);
    assert!(info.session_established);
    assert_eq!(info.cipher_suite, Some(CipherSuite(0x1301)));
    assert!(!info.missing_client_certificate());
}

#[tokio::test]
async fn accepted_credentials_are_recorded() {
    let cert = pem_file("CERTIFICATE");
    let key = pem_file("PRIVATE KEY");
    let creds = ClientAuthenticationCredentials::new(cert.path(), key.path());

    let model = ServerModel::new(ALL).with_client_auth(ClientAuthRequirement::Required);
    let tls = ScriptedHandshaker::new(model);
    let prober = ConnectivityProber::new(tls);

    let info = prober.probe(&location(), Some(&creds)).await.unwrap();
    assert_eq!(info.client_auth, ClientAuthRequirement::Required);
    assert_eq!(info.credentials, Some(creds));
    assert!(info.session_established);
}

#[tokio::test]
async fn rejected_credentials_are_reported() {
    let cert = pem_file("CERTIFICATE");
    let key = pem_file("PRIVATE KEY");
    let creds = ClientAuthenticationCredentials::new(cert.path(), key.path());

    let model = ServerModel::new(ALL)
        .with_client_auth(ClientAuthRequirement::Required)
        .rejecting_credentials();
    let tls = ScriptedHandshaker::new(model);
    let prober = ConnectivityProber::new(tls);

    let err = prober.probe(&location(), Some(&creds)).await.unwrap_err();
    assert!(matches!(err, ConnectivityError::ClientCredentialsRejected { .. }));
}

#[tokio::test]
async fn unreadable_credentials_fail_before_any_handshake() {
    let creds = ClientAuthenticationCredentials::new("/nonexistent/client.pem", "/nonexistent/client.key");
    let tls = ScriptedHandshaker::new(ServerModel::new(ALL));
    let prober = ConnectivityProber::new(tls.clone());

    let err = prober.probe(&location(), Some(&creds)).await.unwrap_err();
    assert!(matches!(err, ConnectivityError::InvalidCredentials(_)));
    assert!(tls.requests().is_empty());
}
