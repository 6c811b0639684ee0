//! TLS setup for the coordinator listener.

use anyhow::{bail, Context};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

/// Build a rustls server config from PEM cert chain and private key.
pub fn create_server_config(cert_pem: &str, key_pem: &str) -> anyhow::Result<ServerConfig> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_key_from_pem(key_pem)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS server config")?;
    Ok(config)
}

fn load_certs_from_pem(pem: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .filter_map(|c| c.ok())
        .collect();
    if certs.is_empty() {
        bail!("no certificates found in PEM input");
    }
    Ok(certs)
}

fn load_key_from_pem(pem: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .context("parse private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in PEM input"))
}
