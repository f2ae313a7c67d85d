use crate::errors::{Error, Result};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls;

/// A private key and certificate chain presented to origins that ask for a
/// client certificate.
pub struct Identity {
  key: PrivateKeyDer<'static>,
  certs: Vec<CertificateDer<'static>>,
}

impl Clone for Identity {
  fn clone(&self) -> Self {
    Identity {
      key: self.key.clone_key(),
      certs: self.certs.clone(),
    }
  }
}

impl std::fmt::Debug for Identity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Identity")
      .field("certs", &self.certs.len())
      .finish()
  }
}

impl Identity {
  /// Parses PEM encoded private key and certificate.
  ///
  /// The input should contain a PEM encoded private key
  /// and at least one PEM encoded certificate.
  ///
  /// Note: The private key must be in RSA, SEC1 Elliptic Curve or PKCS#8 format.
  pub fn from_pem(buf: &[u8]) -> Result<Identity> {
    use rustls_pemfile::Item;
    use std::io::Cursor;

    let mut pem = Cursor::new(buf);
    let mut keys = Vec::<PrivateKeyDer>::new();
    let mut certs = Vec::<CertificateDer>::new();
    for item in rustls_pemfile::read_all(&mut pem) {
      match item {
        Ok(Item::X509Certificate(cert)) => certs.push(cert),
        Ok(Item::Pkcs1Key(key)) => keys.push(key.into()),
        Ok(Item::Pkcs8Key(key)) => keys.push(key.into()),
        Ok(Item::Sec1Key(key)) => keys.push(key.into()),
        Ok(_) => continue,
        Err(_) => {
          return Err(Error::Tls(rustls::Error::General(String::from(
            "Invalid identity PEM file",
          ))))
        }
      }
    }
    match (keys.pop(), certs.is_empty()) {
      (Some(key), false) => Ok(Identity { key, certs }),
      _ => Err(Error::Tls(rustls::Error::General(String::from(
        "private key or certificate not found",
      )))),
    }
  }

  /// Certificates of the chain, leaf first.
  pub fn certificates(&self) -> &[CertificateDer<'static>] {
    &self.certs
  }

  pub(crate) fn add_to_tls(
    self,
    config_builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
  ) -> Result<rustls::ClientConfig> {
    Ok(config_builder.with_client_auth_cert(self.certs, self.key)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn identity_needs_key_and_cert() {
    assert!(Identity::from_pem(b"").is_err());
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["client.test".to_string()])
      .unwrap()
      .self_signed(&key)
      .unwrap();
    let pem = format!("{}{}", cert.pem(), key.serialize_pem());
    let id = Identity::from_pem(pem.as_bytes()).unwrap();
    assert_eq!(id.certificates().len(), 1);
    assert!(Identity::from_pem(cert.pem().as_bytes()).is_err());
  }
}
