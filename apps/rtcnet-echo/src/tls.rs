use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use native_tls::{Identity, TlsAcceptor, TlsConnector};

pub fn acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let cert_pem = fs::read(cert).with_context(|| format!("reading certificate {}", cert.display()))?;
    let key_pem = fs::read(key).with_context(|| format!("reading key {}", key.display()))?;
    let identity = Identity::from_pkcs8(&cert_pem, &key_pem).context("parsing PEM identity")?;
    TlsAcceptor::new(identity).context("building TLS acceptor")
}

/// `insecure` accepts self-signed certificates and mismatched hostnames.
pub fn connector(insecure: bool) -> Result<TlsConnector> {
    TlsConnector::builder()
        .danger_accept_invalid_certs(insecure)
        .danger_accept_invalid_hostnames(insecure)
        .build()
        .context("building TLS connector")
}
