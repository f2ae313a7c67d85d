use crate::config::ConnectionParam;
use crate::errors::{new_io_error, Result};
use crate::header::RequestHeader;
use crate::proxy::{send_connect, ProxyChain};
use crate::socket::{Socket, StreamWrapper};
use crate::tls::TlsProvider;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;

/// Where a request has to be delivered.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
  /// target host
  pub host: String,
  /// target port
  pub port: u16,
  /// TLS to the target
  pub secure: bool,
}

impl Endpoint {
  /// The target of `header`.
  pub fn of(header: &RequestHeader) -> Endpoint {
    Endpoint {
      host: header.host().to_string(),
      port: header.port(),
      secure: header.is_secure(),
    }
  }
  /// Pool key, `scheme://host:port`.
  pub fn key(&self) -> String {
    let scheme = if self.secure { "https" } else { "http" };
    format!("{}://{}:{}", scheme, self.host.to_ascii_lowercase(), self.port)
  }
  fn authority(&self) -> String {
    if self.host.contains(':') && !self.host.starts_with('[') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.key())
  }
}

/// How an opened connection reaches its endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
  /// straight to the origin
  Direct,
  /// plain HTTP handed to the chain proxy, absolute-form request target
  Forward,
  /// TLS inside a `CONNECT` tunnel through the chain proxy
  Tunnel,
}

/// Opens TCP connections, directly or through the proxy chain, and upgrades
/// them to TLS.
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  tls: Arc<TlsProvider>,
}

impl fmt::Debug for Connector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .finish()
  }
}

impl Connector {
  /// Connector for `param`, handshaking through `tls`.
  pub fn new(param: &ConnectionParam, tls: Arc<TlsProvider>) -> Connector {
    Connector {
      connect_timeout: param.get_connect_timeout(),
      nodelay: param.is_nodelay(),
      keepalive: param.is_keepalive(),
      read_timeout: param.get_read_timeout(),
      write_timeout: param.get_write_timeout(),
      tls,
    }
  }
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    // 阻塞才能设置超时，异步的读写超时由 Socket 负责
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(
      StreamWrapper::Tcp(s),
      self.read_timeout,
      self.write_timeout,
    ))
  }
  /// Resolve `host` and connect to the first address that answers.
  pub async fn connect_host(&self, host: &str, port: u16) -> Result<Socket> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut last_error = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(e) => {
          tracing::debug!("connect {} failed: {}", addr, e);
          last_error = Some(e);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(ErrorKind::NotFound, &format!("no address for {}", host))
    }))
  }
  /// A `Connector` will use transport layer security (TLS) by default to connect to destinations.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    self.tls.create_client_socket(stream, domain).await
  }
  /// Open a connection to `endpoint`, through `chain` when one applies.
  pub async fn open(
    &self,
    endpoint: &Endpoint,
    chain: Option<&ProxyChain>,
  ) -> Result<(Socket, Route)> {
    match chain {
      None => {
        let socket = self.connect_host(&endpoint.host, endpoint.port).await?;
        let socket = if endpoint.secure {
          self.upgrade_to_tls(socket, &endpoint.host).await?
        } else {
          socket
        };
        Ok((socket, Route::Direct))
      }
      Some(chain) if !endpoint.secure => Ok((
        self.connect_host(chain.host(), chain.port()).await?,
        Route::Forward,
      )),
      Some(chain) => {
        let socket = self.tunnel(endpoint, chain).await?;
        Ok((
          self.upgrade_to_tls(socket, &endpoint.host).await?,
          Route::Tunnel,
        ))
      }
    }
  }

  async fn tunnel(&self, endpoint: &Endpoint, chain: &ProxyChain) -> Result<Socket> {
    let target = endpoint.authority();
    let mut socket = self.connect_host(chain.host(), chain.port()).await?;
    let reply = send_connect(&mut socket, &target, None).await?;
    if reply.status_code() == 200 {
      return Ok(socket);
    }
    if reply.status_code() == 407 {
      let challenges = reply.headers(crate::header::names::PROXY_AUTHENTICATE);
      if let Some(authorization) = chain.authorization_for(&challenges) {
        // 代理通常会在 407 之后关闭连接，重新建立
        let mut socket = self.connect_host(chain.host(), chain.port()).await?;
        let reply = send_connect(&mut socket, &target, Some(&authorization)).await?;
        if reply.status_code() == 200 {
          return Ok(socket);
        }
        return Err(tunnel_refused(&target, reply.status_code()));
      }
    }
    Err(tunnel_refused(&target, reply.status_code()))
  }
}

fn tunnel_refused(target: &str, status: u16) -> crate::errors::Error {
  new_io_error(
    ErrorKind::NotConnected,
    &format!("proxy refused CONNECT {}: {}", target, status),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn endpoint_key() {
    let header = RequestHeader::parse("GET https://Ex.com:8443/a HTTP/1.1\r\n\r\n").unwrap();
    let endpoint = Endpoint::of(&header);
    assert_eq!(endpoint.key(), "https://ex.com:8443");
    assert!(endpoint.secure);
    let v6 = Endpoint {
      host: "::1".into(),
      port: 80,
      secure: false,
    };
    assert_eq!(v6.authority(), "[::1]:80");
  }
}
