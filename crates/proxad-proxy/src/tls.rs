//! TLS termination and initiation.
//!
//! Thin wrappers turning certificate files into a server-side
//! [`TlsAcceptor`] (terminate the client connection) or a client-side
//! [`TlsConnector`] (initiate towards the upstream). The engines never see
//! TLS: the listener applies these at the moment a connection enters a
//! flow and hands the engines a plaintext stream either way.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::ProxyError;

/// Server-side termination: certificate chain + key, optional ALPN.
#[derive(Debug, Clone)]
pub struct TlsServerSettings {
    pub cert_chain: PathBuf,
    pub private_key: PathBuf,
    pub alpn: Vec<Vec<u8>>,
}

impl TlsServerSettings {
    pub fn acceptor(&self) -> Result<TlsAcceptor, ProxyError> {
        let certs = load_certs(&self.cert_chain)?;
        let key = load_key(&self.private_key)?;
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| ProxyError::TlsSetup(err.to_string()))?;
        config.alpn_protocols = self.alpn.clone();
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Client-side initiation towards the upstream: trust roots + optional
/// ALPN. The server name is derived from the upstream address.
#[derive(Debug, Clone)]
pub struct TlsClientSettings {
    pub ca_bundle: PathBuf,
    pub alpn: Vec<Vec<u8>>,
}

impl TlsClientSettings {
    pub fn connector(&self) -> Result<TlsConnector, ProxyError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&self.ca_bundle)? {
            roots
                .add(cert)
                .map_err(|err| ProxyError::TlsSetup(err.to_string()))?;
        }
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = self.alpn.clone();
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

/// SNI / verification name for an `host:port` upstream address.
pub(crate) fn upstream_server_name(upstream: &str) -> Result<ServerName<'static>, ProxyError> {
    let host = upstream
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(upstream);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_owned())
        .map_err(|err| ProxyError::TlsSetup(format!("invalid upstream name {host:?}: {err}")))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = File::open(path)
        .map_err(|err| ProxyError::TlsSetup(format!("{}: {err}", path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|err| ProxyError::TlsSetup(format!("{}: {err}", path.display())))?;
    if certs.is_empty() {
        return Err(ProxyError::TlsSetup(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = File::open(path)
        .map_err(|err| ProxyError::TlsSetup(format!("{}: {err}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| ProxyError::TlsSetup(format!("{}: {err}", path.display())))?
        .ok_or_else(|| ProxyError::TlsSetup(format!("{}: no private key found", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_strips_port_and_brackets() {
        assert!(upstream_server_name("service.internal:8080").is_ok());
        assert!(upstream_server_name("127.0.0.1:80").is_ok());
        assert!(upstream_server_name("[::1]:80").is_ok());
    }

    #[test]
    fn missing_files_are_config_errors() {
        let settings = TlsServerSettings {
            cert_chain: "/nonexistent/cert.pem".into(),
            private_key: "/nonexistent/key.pem".into(),
            alpn: vec![],
        };
        let err = match settings.acceptor() {
            Ok(_) => panic!("expected acceptor() to fail for missing files"),
            Err(err) => err,
        };
        assert!(err.is_config());
    }
}
