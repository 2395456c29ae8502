// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! Certificates and QUIC endpoint configuration for qsocks sessions

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context as AnyhowContext, Error as AnyErr, Result};

use super::ALPN_QSOCKS_1;

/// Name presented as SNI by clients; self-signed server certificates are issued for it
pub const SESSION_SERVER_NAME: &str = "localhost";

pub struct CertifiedKey {
  pub chain: Vec<rustls::Certificate>,
  pub key: rustls::PrivateKey,
}

/// Produces an in-memory self-signed certificate for `san`
pub fn self_signed(san: &str) -> Result<CertifiedKey> {
  let cert = rcgen::generate_simple_self_signed(vec![san.to_string()])
    .context("Certificate generation failed")?;
  let der = cert
    .serialize_der()
    .context("Certificate serialization failed")?;
  Ok(CertifiedKey {
    chain: vec![rustls::Certificate(der)],
    key: rustls::PrivateKey(cert.serialize_private_key_der()),
  })
}

/// Writes a self-signed certificate pair as `<path>.pub.pem` and `<path>.priv.pem`
pub fn write_self_signed_pem(path: &Path, san: &str) -> Result<()> {
  use std::fs;
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let file_name = path
    .file_name()
    .and_then(|name| name.to_str())
    .ok_or_else(|| AnyErr::msg("Certificate path must end in a valid file name"))?;
  let cert = rcgen::generate_simple_self_signed(vec![san.to_string()])
    .context("Certificate generation failed")?;
  fs::write(
    path.with_file_name(format!("{}.pub.pem", file_name)),
    cert.serialize_pem()?,
  )
  .context("Failed writing public key")?;
  fs::write(
    path.with_file_name(format!("{}.priv.pem", file_name)),
    cert.serialize_private_key_pem(),
  )
  .context("Failed writing private key")?;
  Ok(())
}

/// Loads a certificate chain and a PKCS#8 or RSA private key from PEM files
pub fn load_pem(cert: &Path, key: &Path) -> Result<CertifiedKey> {
  let cert_pem = std::fs::read(cert).context("Failed reading cert file")?;
  let key_pem = std::fs::read(key).context("Failed reading private key file")?;
  let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
    .context("Certificate .pem parsing failed")?
    .into_iter()
    .map(rustls::Certificate)
    .collect::<Vec<_>>();
  if chain.is_empty() {
    return Err(AnyErr::msg("No certificates found in cert file"));
  }
  let key = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_slice())
    .context("PKCS#8 .pem parsing of private key failed")?
    .into_iter()
    .next()
    .map(Ok)
    .unwrap_or_else(|| {
      rustls_pemfile::rsa_private_keys(&mut key_pem.as_slice())
        .context("RSA .pem parsing of private key failed")?
        .into_iter()
        .next()
        .ok_or_else(|| AnyErr::msg("No private key found in key file"))
    })?;
  Ok(CertifiedKey {
    chain,
    key: rustls::PrivateKey(key),
  })
}

fn transport_config(keep_alive: Duration, idle_timeout: Duration) -> Result<quinn::TransportConfig> {
  let mut transport_config = quinn::TransportConfig::default();
  transport_config.keep_alive_interval(Some(keep_alive));
  transport_config.max_idle_timeout(Some(
    idle_timeout
      .try_into()
      .context("Idle timeout exceeds QUIC bounds")?,
  ));
  Ok(transport_config)
}

pub fn build_server_config(identity: CertifiedKey) -> Result<quinn::ServerConfig> {
  let mut crypto = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(identity.chain, identity.key)
    .context("Server certificate was rejected")?;
  crypto.alpn_protocols = vec![ALPN_QSOCKS_1.to_vec()];
  let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
  server_config.transport_config(Arc::new(transport_config(
    Duration::from_secs(5),
    Duration::from_secs(30),
  )?));
  Ok(server_config)
}

/// Client configuration which accepts any server certificate
///
/// Sessions authenticate nothing beyond the ALPN; servers commonly run with self-signed certificates.
pub fn build_insecure_client_config(
  keep_alive: Duration,
  idle_timeout: Duration,
) -> Result<quinn::ClientConfig> {
  let mut crypto = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
    .with_no_client_auth();
  crypto.alpn_protocols = vec![ALPN_QSOCKS_1.to_vec()];
  let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
  client_config.transport_config(Arc::new(transport_config(keep_alive, idle_timeout)?));
  Ok(client_config)
}

struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls::Certificate,
    _intermediates: &[rustls::Certificate],
    _server_name: &rustls::ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: std::time::SystemTime,
  ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::ServerCertVerified::assertion())
  }
}
