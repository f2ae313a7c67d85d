use std::future::Future;
use std::io::Error;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// A connection left open after `101 Switching Protocols`, with whatever the
/// reader had already buffered.
pub type UpgradedConnection = Arc<tokio::sync::Mutex<BufReader<Socket>>>;

/// A TCP stream, plain or wrapped in TLS, with optional read and write
/// timeouts.
#[derive(Debug)]
pub struct Socket {
  inner: StreamWrapper,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

impl Socket {
  pub(crate) fn new(
    inner: StreamWrapper,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self {
      inner,
      read_timeout,
      write_timeout,
    }
  }
  /// Wrap an accepted or connected stream without timeouts.
  pub fn plain(stream: TcpStream) -> Self {
    Self::new(StreamWrapper::Tcp(stream), None, None)
  }
  /// Give up the timeouts and the stream.
  pub fn into_inner(self) -> StreamWrapper {
    self.inner
  }
  /// The stream is encrypted.
  pub fn is_tls(&self) -> bool {
    !matches!(self.inner, StreamWrapper::Tcp(_))
  }
  /// DER certificate the peer presented, if any.
  pub fn peer_certificate(&self) -> Option<Vec<u8>> {
    let certs = match &self.inner {
      StreamWrapper::Tcp(_) => None,
      StreamWrapper::ClientTls(s) => s.get_ref().1.peer_certificates(),
      StreamWrapper::ServerTls(s) => s.get_ref().1.peer_certificates(),
    };
    certs.and_then(|c| c.first()).map(|c| c.to_vec())
  }
  /// SNI name sent by a client to an intercepting server socket.
  pub fn server_name(&self) -> Option<String> {
    match &self.inner {
      StreamWrapper::ServerTls(s) => s.get_ref().1.server_name().map(str::to_string),
      _ => None,
    }
  }
}

/// Plain TCP, or TLS in either direction.
#[derive(Debug)]
pub enum StreamWrapper {
  /// TCP
  Tcp(TcpStream),
  /// TLS towards an origin or upstream proxy
  ClientTls(Box<client::TlsStream<TcpStream>>),
  /// TLS terminated for an intercepted client
  ServerTls(Box<server::TlsStream<TcpStream>>),
}

impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl AsyncRead for StreamWrapper {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      StreamWrapper::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      StreamWrapper::ClientTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
      StreamWrapper::ServerTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for StreamWrapper {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      StreamWrapper::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      StreamWrapper::ClientTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
      StreamWrapper::ServerTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      StreamWrapper::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      StreamWrapper::ClientTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
      StreamWrapper::ServerTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      StreamWrapper::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      StreamWrapper::ClientTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
      StreamWrapper::ServerTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

async fn timed<F, O>(timeout: Option<Duration>, fut: F) -> std::io::Result<O>
where
  F: Future<Output = std::io::Result<O>>,
{
  match timeout {
    None => fut.await,
    Some(t) => tokio::time::timeout(t, fut).await?,
  }
}

impl Socket {
  /// Read some bytes, bounded by the read timeout.
  pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    timed(self.read_timeout, self.inner.read(buf)).await
  }
  /// Fill `buf` completely, bounded by the read timeout.
  pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    timed(self.read_timeout, self.inner.read_exact(buf)).await
  }
  /// Write all of `buf`, bounded by the write timeout.
  pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
    timed(self.write_timeout, self.inner.write_all(buf)).await
  }
  /// Flush buffered TLS records or TCP data.
  pub async fn flush(&mut self) -> std::io::Result<()> {
    timed(self.write_timeout, self.inner.flush()).await
  }
  /// Close the write half, sending `close_notify` on TLS streams.
  pub async fn shutdown(&mut self) -> std::io::Result<()> {
    timed(self.write_timeout, self.inner.shutdown()).await
  }
  pub(crate) fn read_timeout(&self) -> Option<Duration> {
    self.read_timeout
  }
  pub(crate) fn write_timeout(&self) -> Option<Duration> {
    self.write_timeout
  }
}
