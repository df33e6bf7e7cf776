// Client certificate credentials for servers that demand mutual TLS.
//
// Only the file paths are carried around (and across the worker boundary);
// key material is read when a handshake needs it and dropped with it.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::sign::CertifiedKey;
use rustls::{Certificate, PrivateKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("unsupported private key: {0}")]
    UnsupportedKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientAuthenticationCredentials {
    pub certificate_chain_path: PathBuf,
    pub private_key_path: PathBuf,
}

impl ClientAuthenticationCredentials {
    pub fn new(certificate_chain_path: impl Into<PathBuf>, private_key_path: impl Into<PathBuf>) -> Self {
        Self {
            certificate_chain_path: certificate_chain_path.into(),
            private_key_path: private_key_path.into(),
        }
    }

    pub fn load_certificates(&self) -> Result<Vec<Certificate>, CredentialsError> {
        let path = &self.certificate_chain_path;
        let mut reader = open(path)?;
        let certs = rustls_pemfile::certs(&mut reader).map_err(|source| CredentialsError::Io {
            path: path.clone(),
            source,
        })?;
        if certs.is_empty() {
            return Err(CredentialsError::NoCertificate(path.clone()));
        }
        Ok(certs.into_iter().map(Certificate).collect())
    }

    pub fn load_private_key(&self) -> Result<PrivateKey, CredentialsError> {
        let path = &self.private_key_path;
        let mut reader = open(path)?;
        let items = rustls_pemfile::read_all(&mut reader).map_err(|source| CredentialsError::Io {
            path: path.clone(),
            source,
        })?;

        items
            .into_iter()
            .find_map(|item| match item {
                rustls_pemfile::Item::PKCS8Key(key)
                | rustls_pemfile::Item::RSAKey(key)
                | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
                _ => None,
            })
            .ok_or_else(|| CredentialsError::NoPrivateKey(path.clone()))
    }

    /// Certificate chain and signing key, ready for a rustls client.
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, CredentialsError> {
        let certs = self.load_certificates()?;
        let key = self.load_private_key()?;
        let signing_key = rustls::sign::any_supported_type(&key)
            .map_err(|e| CredentialsError::UnsupportedKey(e.to_string()))?;
        Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
    }

    /// Certificate chain followed by the key, as one PEM buffer.
    pub fn identity_pem(&self) -> Result<Vec<u8>, CredentialsError> {
        let mut pem = read(&self.certificate_chain_path)?;
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend(read(&self.private_key_path)?);
        Ok(pem)
    }
}

fn open(path: &Path) -> Result<BufReader<File>, CredentialsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CredentialsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn read(path: &Path) -> Result<Vec<u8>, CredentialsError> {
    std::fs::read(path).map_err(|source| CredentialsError::Io {
        path: path.to_path_buf(),
        source,
    })
}
