use crate::body::MAX_PREALLOCATION;
use crate::errors::{malformed, new_io_error, Result};
use crate::header::{Method, ResponseHeader};
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Upper bound for a status line plus headers.
const MAX_HEADER_SIZE: usize = 256 * 1024;
/// Upper bound for a chunk size line, extensions included.
const MAX_CHUNK_LINE: usize = 4096;

/// A response as read from the wire.
#[derive(Debug)]
pub(crate) struct WireResponse {
  pub(crate) header: ResponseHeader,
  pub(crate) body: Vec<u8>,
  /// The body ended with the connection, it cannot be reused.
  pub(crate) until_close: bool,
}

/// Reads one response for a request sent with `method`.
pub(crate) struct ResponseReader<'a, T> {
  reader: &'a mut BufReader<T>,
  method: Method,
  timeout: Option<Duration>,
}

impl<'a, T: AsyncRead + Unpin> ResponseReader<'a, T> {
  pub(crate) fn new(reader: &'a mut BufReader<T>, method: Method, timeout: Option<Duration>) -> Self {
    ResponseReader {
      reader,
      method,
      timeout,
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

  /// Read up to and including `\n`, but never more than `limit` bytes.
  async fn read_line(&mut self, line: &mut Vec<u8>, limit: usize) -> Result<usize> {
    let timeout = self.timeout;
    let mut limited = (&mut *self.reader).take(limit as u64);
    Ok(Self::timed(timeout, limited.read_until(b'\n', line)).await?)
  }

  async fn read_header(&mut self) -> Result<ResponseHeader> {
    let mut raw = Vec::new();
    let mut consumed = 0;
    loop {
      let mut line = Vec::new();
      let n = self.read_line(&mut line, MAX_HEADER_SIZE - consumed).await?;
      if n == 0 {
        if consumed >= MAX_HEADER_SIZE {
          return Err(malformed("response header too large"));
        }
        if raw.is_empty() {
          return Err(new_io_error(
            ErrorKind::UnexpectedEof,
            "connection closed before the response",
          ));
        }
        break;
      }
      consumed += n;
      if !line.ends_with(b"\n") && consumed >= MAX_HEADER_SIZE {
        return Err(malformed("response header too large"));
      }
      // 跳过状态行前的空行
      if raw.is_empty() && (line == b"\r\n" || line == b"\n") {
        continue;
      }
      raw.extend_from_slice(&line);
      if line == b"\r\n" || line == b"\n" {
        break;
      }
    }
    ResponseHeader::parse(&String::from_utf8_lossy(&raw))
  }

  fn has_body(&self, header: &ResponseHeader) -> bool {
    let status = header.status_code();
    !(self.method == Method::Head || (100..200).contains(&status) || status == 204 || status == 304)
  }

  async fn read_chunked_body(&mut self) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let timeout = self.timeout;
    loop {
      let mut line = Vec::new();
      if self.read_line(&mut line, MAX_CHUNK_LINE).await? == 0 {
        return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunked body"));
      }
      if !line.ends_with(b"\n") {
        return Err(new_io_error(ErrorKind::InvalidData, "chunk size line too long"));
      }
      let text = String::from_utf8_lossy(&line);
      let size = text.split(';').next().unwrap_or_default().trim();
      if size.is_empty() {
        continue;
      }
      let size = u64::from_str_radix(size, 16)
        .map_err(|_| new_io_error(ErrorKind::InvalidData, "invalid chunk size"))?;
      if size == 0 {
        break;
      }
      let expected = (body.len() as u64)
        .checked_add(size)
        .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "chunk size overflows"))?;
      // 按实际到达的数据增长，不按对端声明的大小预分配
      body.reserve(std::cmp::min(size, MAX_PREALLOCATION as u64) as usize);
      let mut limited = (&mut *self.reader).take(size);
      Self::timed(timeout, limited.read_to_end(&mut body)).await?;
      if body.len() as u64 != expected {
        return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunk"));
      }
    }
    // trailers
    let mut consumed = 0;
    loop {
      let mut line = Vec::new();
      let n = self.read_line(&mut line, MAX_HEADER_SIZE - consumed).await?;
      consumed += n;
      if n == 0 || line == b"\r\n" || line == b"\n" {
        break;
      }
      if consumed >= MAX_HEADER_SIZE {
        return Err(malformed("chunked trailer too large"));
      }
    }
    Ok(body)
  }

  async fn read_sized_body(&mut self, length: u64) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(std::cmp::min(length as usize, MAX_PREALLOCATION));
    let timeout = self.timeout;
    let mut limited = (&mut *self.reader).take(length);
    loop {
      let mut buffer = [0u8; 8192];
      let n = Self::timed(timeout, limited.read(&mut buffer)).await?;
      if n == 0 {
        break;
      }
      body.extend_from_slice(&buffer[..n]);
    }
    if (body.len() as u64) < length {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed before the whole body arrived",
      ));
    }
    Ok(body)
  }

  async fn read_to_close(&mut self) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let timeout = self.timeout;
    Self::timed(timeout, self.reader.read_to_end(&mut body)).await?;
    Ok(body)
  }

  /// Read the status line, headers and body. Interim `1xx` responses other
  /// than `101` are skipped.
  pub(crate) async fn read(mut self) -> Result<WireResponse> {
    let mut header = self.read_header().await?;
    while (100..200).contains(&header.status_code()) && header.status_code() != 101 {
      header = self.read_header().await?;
    }
    if !self.has_body(&header) {
      return Ok(WireResponse {
        header,
        body: Vec::new(),
        until_close: false,
      });
    }
    if header.is_transfer_encoding_chunked() {
      let body = self.read_chunked_body().await?;
      return Ok(WireResponse {
        header,
        body,
        until_close: false,
      });
    }
    match header.declared_content_length() {
      Some(length) => {
        let body = self.read_sized_body(length).await?;
        Ok(WireResponse {
          header,
          body,
          until_close: false,
        })
      }
      None => {
        let body = self.read_to_close().await?;
        Ok(WireResponse {
          header,
          body,
          until_close: true,
        })
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn read(raw: &[u8], method: Method) -> Result<WireResponse> {
    let mut reader = BufReader::new(raw);
    ResponseReader::new(&mut reader, method, None).read().await
  }

  #[tokio::test]
  async fn content_length_body() {
    let r = read(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOKextra", Method::Get)
      .await
      .unwrap();
    assert_eq!(r.header.status_code(), 200);
    assert_eq!(r.body, b"OK");
    assert!(!r.until_close);
  }

  #[tokio::test]
  async fn chunked_body_with_trailer() {
    let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n";
    let r = read(raw, Method::Get).await.unwrap();
    assert_eq!(r.body, b"Wikipedia");
  }

  #[tokio::test]
  async fn bare_lf_and_read_to_close() {
    let r = read(b"HTTP/1.0 200 OK\nServer: x\n\nhello", Method::Get)
      .await
      .unwrap();
    assert_eq!(r.header.header("server"), Some("x"));
    assert_eq!(r.body, b"hello");
    assert!(r.until_close);
  }

  #[tokio::test]
  async fn no_body_for_head_and_304() {
    let r = read(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n", Method::Head)
      .await
      .unwrap();
    assert!(r.body.is_empty());
    let r = read(b"HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n", Method::Get)
      .await
      .unwrap();
    assert!(r.body.is_empty());
  }

  #[tokio::test]
  async fn skips_continue() {
    let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n";
    let r = read(raw, Method::Post).await.unwrap();
    assert_eq!(r.header.status_code(), 201);
  }

  #[tokio::test]
  async fn malformed_status_line() {
    let err = read(b"garbage\r\n\r\n", Method::Get).await.unwrap_err();
    assert!(err.is_malformed_header());
    let err = read(b"", Method::Get).await.unwrap_err();
    assert!(err.is_io());
  }

  #[tokio::test]
  async fn huge_chunk_size_is_an_error() {
    let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffff\r\nab\r\n0\r\n\r\n";
    let err = read(raw, Method::Get).await.unwrap_err();
    assert!(err.is_io());
    let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\nffffffffffffffff\r\nb\r\n";
    let err = read(raw, Method::Get).await.unwrap_err();
    assert!(err.is_io());
  }

  #[tokio::test]
  async fn endless_header_line_is_capped() {
    let mut raw = b"HTTP/1.1 200 OK\r\nX-Long: ".to_vec();
    raw.extend(std::iter::repeat(b'a').take(MAX_HEADER_SIZE + 16));
    let err = read(&raw, Method::Get).await.unwrap_err();
    assert!(err.is_malformed_header());
  }

  #[tokio::test]
  async fn endless_chunk_line_is_rejected() {
    let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    raw.extend(std::iter::repeat(b'1').take(MAX_CHUNK_LINE + 1));
    let err = read(&raw, Method::Get).await.unwrap_err();
    assert!(err.is_io());
  }

  #[tokio::test]
  async fn truncated_body_is_io_error() {
    let err = read(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort", Method::Get)
      .await
      .unwrap_err();
    assert!(err.is_io());
  }
}
