//! TLS acceptor built from secure host configs.
//!
//! Each [`SecureHostConfig`] contributes one certificate, selected by the
//! SNI name of the client hello: exact name, then `*.parent` wildcard, then
//! the default config (`_default_`, or the first one listed). When any host
//! names a client CA, client certificates are required and verified against
//! the union of those CAs.

use crate::config::SecureHostConfig;
use crate::error::ServerError;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Picks a certificate by SNI name.
#[derive(Debug, Default)]
pub struct SniResolver {
    hosts: HashMap<String, Arc<CertifiedKey>>,
    default: Option<Arc<CertifiedKey>>,
}

impl SniResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` for `host_name`. The default host name, or the
    /// first host added, also serves clients without a matching name.
    pub fn add(&mut self, host_name: &str, key: Arc<CertifiedKey>) {
        if host_name == SecureHostConfig::DEFAULT_HOST_NAME {
            self.default = Some(key);
            return;
        }
        if self.default.is_none() {
            self.default = Some(Arc::clone(&key));
        }
        self.hosts.insert(host_name.to_ascii_lowercase(), key);
    }

    /// Number of named (non-default) hosts.
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name();
        let selected = select(&self.hosts, self.default.as_ref(), name).cloned();
        if selected.is_none() {
            tracing::warn!("no certificate for SNI name {:?}", name);
        }
        selected
    }
}

fn select<'a, T>(
    hosts: &'a HashMap<String, T>,
    default: Option<&'a T>,
    name: Option<&str>,
) -> Option<&'a T> {
    let Some(name) = name else {
        return default;
    };
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    if let Some(found) = hosts.get(&name) {
        return Some(found);
    }
    if let Some((_, parent)) = name.split_once('.') {
        if let Some(found) = hosts.get(&format!("*.{}", parent)) {
            return Some(found);
        }
    }
    default
}

/// Loads every host's certificate and creates a TLS acceptor.
pub fn create_tls_acceptor(hosts: &[SecureHostConfig]) -> Result<TlsAcceptor, ServerError> {
    if hosts.is_empty() {
        return Err(ServerError::TlsConfig("no secure host configs".into()));
    }
    // Validate configuration before loading files
    for host in hosts {
        host.validate()
            .map_err(|e| ServerError::TlsConfig(e.to_string()))?;
    }

    let provider = CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    let mut resolver = SniResolver::new();
    let mut client_roots = RootCertStore::empty();
    for host in hosts {
        let certs = load_certs(&host.cert_path)?;
        let key = load_private_key(&host.key_path)?;
        let signing_key = provider.key_provider.load_private_key(key).map_err(|e| {
            ServerError::TlsConfig(format!("invalid key for host '{}': {}", host.host_name, e))
        })?;
        resolver.add(&host.host_name, Arc::new(CertifiedKey::new(certs, signing_key)));

        if let Some(ref ca_path) = host.client_ca_path {
            for cert in load_certs(ca_path)? {
                client_roots.add(cert).map_err(|e| {
                    ServerError::TlsConfig(format!("invalid client CA cert: {}", e))
                })?;
            }
        }
    }

    let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::TlsConfig(format!("unsupported protocol versions: {}", e)))?;

    let server_config = if client_roots.is_empty() {
        builder
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver))
    } else {
        // mTLS: require and verify client certificates
        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(client_roots), provider)
                .build()
                .map_err(|e| {
                    ServerError::TlsConfig(format!("failed to build client verifier: {}", e))
                })?;
        builder
            .with_client_cert_verifier(client_verifier)
            .with_cert_resolver(Arc::new(resolver))
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ServerError::TlsConfig(format!(
            "no certificate found in {:?}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| ServerError::TlsConfig(format!("no private key found in {:?}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_invalid_cert_path() {
        let result = load_certs(Path::new("/nonexistent/cert.pem"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cannot open"));
    }

    #[test]
    fn test_load_invalid_key_path() {
        let result = load_private_key(Path::new("/nonexistent/key.pem"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cannot open"));
    }

    #[test]
    fn test_load_empty_key_file() {
        let mut key_file = NamedTempFile::new().unwrap();
        key_file.write_all(b"not a valid key").unwrap();

        let result = load_private_key(key_file.path());
        assert!(result.unwrap_err().to_string().contains("no private key"));
    }

    #[test]
    fn test_load_cert_file_without_certs() {
        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(b"plain text").unwrap();

        let result = load_certs(cert_file.path());
        assert!(result.unwrap_err().to_string().contains("no certificate"));
    }

    #[test]
    fn test_create_acceptor_without_hosts() {
        match create_tls_acceptor(&[]) {
            Err(e) => assert!(e.to_string().contains("no secure host configs")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_create_acceptor_missing_paths() {
        let host = SecureHostConfig::new("shop.example.com", "", "/some/key.pem");
        match create_tls_acceptor(&[host]) {
            Err(e) => assert!(e.to_string().contains("cert_path not set")),
            Ok(_) => panic!("expected error"),
        }

        let host = SecureHostConfig::new("shop.example.com", "/nonexistent/cert.pem", "/k.pem");
        match create_tls_acceptor(&[host]) {
            Err(e) => assert!(e.to_string().contains("cannot open cert file")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_sni_selection() {
        let hosts: HashMap<String, &str> = [
            ("shop.example.com".to_string(), "shop"),
            ("*.example.com".to_string(), "wildcard"),
        ]
        .into_iter()
        .collect();
        let default = "default";

        assert_eq!(select(&hosts, Some(&default), Some("shop.example.com")), Some(&"shop"));
        assert_eq!(select(&hosts, Some(&default), Some("SHOP.Example.com.")), Some(&"shop"));
        assert_eq!(select(&hosts, Some(&default), Some("api.example.com")), Some(&"wildcard"));
        // Wildcards cover one label only.
        assert_eq!(select(&hosts, Some(&default), Some("a.b.example.com")), Some(&"default"));
        assert_eq!(select(&hosts, Some(&default), None), Some(&"default"));
        assert_eq!(select(&hosts, None, Some("other.org")), None);
    }
}
