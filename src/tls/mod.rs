//! TLS socket factories.
//!
//! Two trust domains meet here. Towards origins the proxy is a client that
//! trusts every certificate, optionally presenting a user-selected client
//! identity. Towards intercepted clients it is a server whose certificates
//! are issued on the fly by [`CertificateAuthority`].
mod ca;
mod identity;
mod verifier;

use crate::errors::{builder, new_io_error, Error, Result};
use crate::socket::{Socket, StreamWrapper};
pub use ca::CertificateAuthority;
pub use identity::Identity;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use verifier::NoVerifier;

/// Host name the proxy's own listening socket presents when the client sends
/// no SNI.
pub const DEFAULT_SERVER_NAME: &str = "localhost";

/// Process-scoped TLS configuration, built once and shared by reference.
pub struct TlsProvider {
  provider: Arc<rustls::crypto::CryptoProvider>,
  client: TlsConnector,
  identity_client: RwLock<Option<TlsConnector>>,
  client_cert_enabled: AtomicBool,
  ca: Arc<CertificateAuthority>,
}

impl std::fmt::Debug for TlsProvider {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TlsProvider")
      .field("client_cert_enabled", &self.is_client_cert_enabled())
      .field("ca", &self.ca)
      .finish()
  }
}

impl TlsProvider {
  /// Build the provider around a root certificate authority.
  pub fn new(ca: CertificateAuthority) -> Result<TlsProvider> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let client = TlsConnector::from(Arc::new(
      client_builder(&provider)?.with_no_client_auth(),
    ));
    Ok(TlsProvider {
      provider,
      client,
      identity_client: RwLock::new(None),
      client_cert_enabled: AtomicBool::new(false),
      ca: Arc::new(ca),
    })
  }

  /// Build the provider with a freshly generated root.
  pub fn with_generated_ca() -> Result<TlsProvider> {
    Self::new(CertificateAuthority::generate()?)
  }

  /// The root behind every intercepted session.
  pub fn certificate_authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Use `identity` for origins that request a client certificate. `None`
  /// forgets the identity and disables client-certificate mode.
  pub fn set_client_identity(&self, identity: Option<Identity>) -> Result<()> {
    let connector = match identity {
      Some(identity) => Some(TlsConnector::from(Arc::new(
        identity.add_to_tls(client_builder(&self.provider)?)?,
      ))),
      None => None,
    };
    if connector.is_none() {
      self.set_client_cert_enabled(false);
    }
    if let Ok(mut slot) = self.identity_client.write() {
      *slot = connector;
    }
    Ok(())
  }

  /// Switch client-certificate mode on or off.
  pub fn set_client_cert_enabled(&self, enabled: bool) {
    self.client_cert_enabled.store(enabled, Ordering::SeqCst);
  }

  /// Client-certificate mode is on.
  pub fn is_client_cert_enabled(&self) -> bool {
    self.client_cert_enabled.load(Ordering::SeqCst)
  }

  /// The connector used for the next outbound handshake.
  pub fn client_connector(&self) -> TlsConnector {
    if self.is_client_cert_enabled() {
      if let Some(connector) = self
        .identity_client
        .read()
        .ok()
        .and_then(|slot| slot.clone())
      {
        return connector;
      }
    }
    self.client.clone()
  }

  /// Handshake as a client over a connected stream.
  pub async fn create_client_socket(&self, socket: Socket, domain: &str) -> Result<Socket> {
    let name = ServerName::try_from(domain.trim_start_matches('[').trim_end_matches(']').to_owned())
      .map_err(builder)?;
    let (read_timeout, write_timeout) = (socket.read_timeout(), socket.write_timeout());
    let tcp = match socket.into_inner() {
      StreamWrapper::Tcp(tcp) => tcp,
      _ => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidInput,
          "socket is already encrypted",
        ))
      }
    };
    let stream = self.client_connector().connect(name, tcp).await?;
    Ok(Socket::new(
      StreamWrapper::ClientTls(Box::new(stream)),
      read_timeout,
      write_timeout,
    ))
  }

  fn acceptor(&self, fallback: &str) -> Result<TlsAcceptor> {
    let resolver = LeafResolver {
      ca: self.ca.clone(),
      fallback: fallback.to_string(),
    };
    let mut config = rustls::ServerConfig::builder_with_provider(self.provider.clone())
      .with_protocol_versions(rustls::ALL_VERSIONS)?
      .with_no_client_auth()
      .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
  }

  /// Turn an accepted plaintext connection (after `CONNECT`) into a
  /// server-side TLS socket and complete the handshake now. The leaf is
  /// chosen by SNI, or by `host` when the client sends none.
  pub async fn create_tunnel_server_socket(
    &self,
    stream: TcpStream,
    host: Option<&str>,
  ) -> Result<Socket> {
    let peer = stream.peer_addr().ok();
    let acceptor = self.acceptor(host.unwrap_or(DEFAULT_SERVER_NAME))?;
    match acceptor.accept(stream).await {
      Ok(tls) => Ok(Socket::new(
        StreamWrapper::ServerTls(Box::new(tls)),
        None,
        None,
      )),
      Err(e) => {
        tracing::error!("tls handshake with {:?} failed: {}", peer, e);
        Err(e.into())
      }
    }
  }

  /// Bind the proxy's own TLS listening socket.
  pub async fn bind_server<A: ToSocketAddrs>(&self, addr: A) -> Result<TlsListener> {
    Ok(TlsListener {
      listener: TcpListener::bind(addr).await?,
      acceptor: self.acceptor(DEFAULT_SERVER_NAME)?,
    })
  }
}

fn client_builder(
  provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>> {
  Ok(
    rustls::ClientConfig::builder_with_provider(provider.clone())
      .with_protocol_versions(rustls::ALL_VERSIONS)?
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier::new(provider.clone()))),
  )
}

/// Picks a leaf by SNI, else by the configured fallback host.
#[derive(Debug)]
struct LeafResolver {
  ca: Arc<CertificateAuthority>,
  fallback: String,
}

impl ResolvesServerCert for LeafResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    let host = client_hello.server_name().unwrap_or(&self.fallback);
    match self.ca.certified_key(host) {
      Ok(key) => Some(key),
      Err(e) => {
        tracing::error!("failed to issue certificate for {}: {}", host, e);
        None
      }
    }
  }
}

/// A listening socket whose accepted connections are already decrypted.
pub struct TlsListener {
  listener: TcpListener,
  acceptor: TlsAcceptor,
}

impl TlsListener {
  /// Accept the next connection and complete the server handshake.
  pub async fn accept(&self) -> Result<(Socket, SocketAddr)> {
    let (stream, addr) = self.listener.accept().await?;
    let tls = self.acceptor.accept(stream).await.map_err(|e| {
      tracing::error!("tls handshake with {} failed: {}", addr, e);
      Error::from(e)
    })?;
    Ok((
      Socket::new(StreamWrapper::ServerTls(Box::new(tls)), None, None),
      addr,
    ))
  }

  /// Address the listener is bound to.
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }
}
