use std::fs::File;
use std::io::BufReader;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};

/// Build the rustls server config from a PEM certificate chain and a PKCS#8
/// private key.
pub fn init_rustls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let cert_reader = &mut BufReader::new(File::open(cert_path)?);
    let key_reader = &mut BufReader::new(File::open(key_path)?);

    let cert_chain: Vec<CertificateDer<'static>> = certs(cert_reader).collect::<Result<Vec<_>, _>>()?;
    let mut keys = pkcs8_private_keys(key_reader).collect::<Result<Vec<_>, _>>()?;
    if cert_chain.is_empty() {
        return Err(format!("no certificate found in {}", cert_path).into());
    }
    if keys.is_empty() {
        return Err(format!("no PKCS#8 private key found in {}", key_path).into());
    }

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, PrivateKeyDer::Pkcs8(keys.remove(0)))?;
    Ok(config)
}
