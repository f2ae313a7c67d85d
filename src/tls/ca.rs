//! Root certificate authority of the intercepting proxy.
//!
//! The root keypair is either loaded from PEM or generated on first use.
//! Leaf certificates are issued per host name, chained to the root, and
//! cached so that repeated handshakes for the same host reuse one key.

use crate::errors::{Error, Result};
use moka::sync::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::sign::CertifiedKey;

/// Leaf validity in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Leaves are dropped from the cache well before they expire
const CACHE_TTL_SECS: u64 = (LEAF_TTL_SECS / 2) as u64;
/// Backdate `not_before` to tolerate clock skew
const NOT_BEFORE_OFFSET_SECS: i64 = 60;
const CACHE_CAPACITY: u64 = 1000;

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// Root keypair plus the cache of leaves it issued.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  ca_key_pem: String,
  leaves: Cache<String, Arc<CertifiedKey>>,
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("cached_leaves", &self.leaves.entry_count())
      .finish()
  }
}

impl CertificateAuthority {
  /// Generate a fresh root valid for ten years.
  pub fn generate() -> Result<CertificateAuthority> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Interpose Root CA");
    dn.push(DnType::OrganizationName, "Interpose");
    dn.push(DnType::OrganizationalUnitName, "Intercepting Proxy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    Self::from_pem(&cert.pem(), &key_pair.serialize_pem())
  }

  /// Load a root from its PEM certificate and PEM private key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<CertificateAuthority> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::Certificate(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::Certificate(format!("failed to load CA certificate: {}", e)))?;
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::Certificate("no certificate found in PEM".to_string()))?
      .map_err(|e| Error::Certificate(format!("failed to parse PEM: {}", e)))?;
    let leaves = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL_SECS))
      .build();
    Ok(CertificateAuthority {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
      ca_key_pem: key_pem.to_string(),
      leaves,
    })
  }

  /// Load `ca_cert.pem` and `ca_key.pem` from `dir`, generating and saving
  /// them when either is missing.
  pub fn load_or_generate(dir: impl AsRef<Path>) -> Result<CertificateAuthority> {
    let dir = dir.as_ref();
    let (cert_path, key_path) = (dir.join(CA_CERT_FILE), dir.join(CA_KEY_FILE));
    if cert_path.exists() && key_path.exists() {
      let cert_pem = std::fs::read_to_string(&cert_path)?;
      let key_pem = std::fs::read_to_string(&key_path)?;
      return Self::from_pem(&cert_pem, &key_pem);
    }
    std::fs::create_dir_all(dir)?;
    let ca = Self::generate()?;
    std::fs::write(&cert_path, &ca.ca_cert_pem)?;
    std::fs::write(&key_path, &ca.ca_key_pem)?;
    tracing::debug!("generated root certificate at {}", cert_path.display());
    Ok(ca)
  }

  /// Root certificate, PEM encoded, for installation in clients.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root private key, PEM encoded.
  pub fn ca_key_pem(&self) -> &str {
    &self.ca_key_pem
  }

  /// Root certificate, DER encoded.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Leaf for `host`, from the cache when possible.
  pub fn certified_key(&self, host: &str) -> Result<Arc<CertifiedKey>> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if let Some(found) = self.leaves.get(&host) {
      return Ok(found);
    }
    let (chain, key) = self.issue(&host)?;
    let signing_key = any_supported_type(&key)?;
    let certified = Arc::new(CertifiedKey::new(chain, signing_key));
    self.leaves.insert(host, certified.clone());
    Ok(certified)
  }

  /// Issue a new leaf for `host`; the chain is `[leaf, root]`.
  pub fn issue(&self, host: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.subject_alt_names = match host.parse::<IpAddr>() {
      Ok(ip) => vec![SanType::IpAddress(ip)],
      Err(_) => vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::Certificate(format!("invalid host name: {}", host))
      })?)],
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()?;
    let cert = params.signed_by(&key_pair, &self.issuer)?;
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|e| Error::Certificate(format!("failed to serialize leaf key: {}", e)))?;
    Ok((
      vec![CertificateDer::from(cert.der().to_vec()), self.ca_cert_der.clone()],
      key,
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn leaves_are_cached_per_host() {
    let ca = CertificateAuthority::generate().unwrap();
    let a = ca.certified_key("Example.com").unwrap();
    let b = ca.certified_key("example.com.").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.cert.len(), 2);
    assert_eq!(a.cert[1], *ca.ca_cert_der());
  }

  #[test]
  fn pem_round_trip_keeps_root() {
    let ca = CertificateAuthority::generate().unwrap();
    let again = CertificateAuthority::from_pem(ca.ca_cert_pem(), ca.ca_key_pem()).unwrap();
    assert_eq!(ca.ca_cert_der(), again.ca_cert_der());
    assert!(again.issue("127.0.0.1").is_ok());
  }

  #[test]
  fn load_or_generate_persists() {
    let dir = std::env::temp_dir().join(format!("interpose-ca-{}", rand::random::<u32>()));
    let first = CertificateAuthority::load_or_generate(&dir).unwrap();
    let second = CertificateAuthority::load_or_generate(&dir).unwrap();
    assert_eq!(first.ca_cert_pem(), second.ca_cert_pem());
    std::fs::remove_dir_all(&dir).ok();
  }
}
