use super::{HeaderBlock, HTTP10, HTTP11};
use crate::errors::{malformed, Result};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// A parsed response header: status line plus fields.
///
/// The default value is the empty header of a message that was not sent yet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeader {
  block: HeaderBlock,
  status_code: u16,
  reason: String,
}

impl ResponseHeader {
  /// Parse a response header, failing on a malformed block.
  pub fn parse(data: &str) -> Result<ResponseHeader> {
    let header = Self::parse_lenient(data);
    match header.malformed_reason() {
      Some(reason) => Err(malformed(reason)),
      None => Ok(header),
    }
  }
  /// Parse without failing. Problems only set the malformed flag.
  pub fn parse_lenient(data: &str) -> ResponseHeader {
    let mut header = ResponseHeader {
      block: HeaderBlock::parse_lenient(data),
      ..Default::default()
    };
    if let Err(reason) = header.parse_status_line() {
      if !header.block.is_malformed_header() {
        header.block.set_malformed(reason);
      }
    }
    header
  }
  /// A header with only a status line, e.g. `HTTP/1.1 200 OK`.
  pub fn with_status(version: &str, status_code: u16) -> ResponseHeader {
    let mut header = ResponseHeader::default();
    header.block.set_version_text(version.to_ascii_uppercase());
    header.set_status_code(status_code);
    header
  }

  fn parse_status_line(&mut self) -> std::result::Result<(), String> {
    let line = self.block.start_line().to_string();
    let (version, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
    let version = version.to_ascii_uppercase();
    if version != HTTP10 && version != HTTP11 {
      return Err(format!("unsupported http version: {}", line));
    }
    let rest = rest.trim_start();
    let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
      return Err(format!("invalid status code: {}", line));
    }
    self.status_code = code.parse().map_err(|_| format!("invalid status code: {}", line))?;
    self.reason = reason.trim().to_string();
    self.block.set_version_text(version);
    Ok(())
  }

  fn regenerate_start_line(&mut self) {
    let line = if self.reason.is_empty() {
      format!("{} {}", self.block.version(), self.status_code)
    } else {
      format!("{} {} {}", self.block.version(), self.status_code, self.reason)
    };
    self.block.set_start_line(line);
  }
}

impl ResponseHeader {
  /// Three-digit status code, 0 for an empty header.
  pub fn status_code(&self) -> u16 {
    self.status_code
  }
  /// Reason phrase, possibly empty.
  pub fn reason_phrase(&self) -> &str {
    &self.reason
  }
  /// Status is one of 301, 302, 303, 307 or 308.
  pub fn is_redirect(&self) -> bool {
    matches!(self.status_code, 301 | 302 | 303 | 307 | 308)
  }
  /// Content length as seen by callers.
  ///
  /// 1xx, 204 and 304 never carry a body, so they report 0. Other 2xx
  /// report the parsed header as-is. Everything else reports the parsed
  /// value when positive and 0 otherwise.
  pub fn content_length(&self) -> Option<u64> {
    match self.status_code {
      100..=199 | 204 | 304 => Some(0),
      200..=299 => self.declared_content_length(),
      _ => Some(self.declared_content_length().filter(|l| *l > 0).unwrap_or(0)),
    }
  }
  /// Set the status code, with its canonical reason phrase.
  pub fn set_status_code(&mut self, status_code: u16) {
    self.status_code = status_code;
    self.reason = http::StatusCode::from_u16(status_code)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or_default()
      .to_string();
    if self.block.version().is_empty() {
      self.block.set_version_text(HTTP11.to_string());
    }
    self.regenerate_start_line();
  }
  /// Replace the reason phrase.
  pub fn set_reason_phrase(&mut self, reason: &str) {
    self.reason = reason.trim().to_string();
    self.regenerate_start_line();
  }
}

impl Deref for ResponseHeader {
  type Target = HeaderBlock;

  fn deref(&self) -> &Self::Target {
    &self.block
  }
}

impl DerefMut for ResponseHeader {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.block
  }
}

impl fmt::Display for ResponseHeader {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.block, f)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_line() {
    let h = ResponseHeader::parse("HTTP/1.1 404 Not Found\r\nA: b\r\n\r\n").unwrap();
    assert_eq!(h.status_code(), 404);
    assert_eq!(h.reason_phrase(), "Not Found");
    let h = ResponseHeader::parse("HTTP/1.0 200\r\n\r\n").unwrap();
    assert_eq!(h.reason_phrase(), "");
    assert_eq!(h.version(), "HTTP/1.0");
  }

  #[test]
  fn bad_status_lines() {
    assert!(ResponseHeader::parse("HTTP/2 200 OK\r\n\r\n").is_err());
    assert!(ResponseHeader::parse("HTTP/1.1 2x0 OK\r\n\r\n").is_err());
    assert!(ResponseHeader::parse("HTTP/1.1 2000 OK\r\n\r\n").is_err());
    assert!(ResponseHeader::parse_lenient("garbage").is_malformed_header());
  }

  #[test]
  fn bodiless_statuses_report_zero_length() {
    for code in [100, 101, 150, 204, 304] {
      let h = ResponseHeader::parse(&format!("HTTP/1.1 {} X\r\nContent-Length: 50\r\n\r\n", code)).unwrap();
      assert_eq!(h.content_length(), Some(0), "status {}", code);
    }
  }

  #[test]
  fn other_statuses_content_length() {
    let ok = ResponseHeader::parse("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();
    assert_eq!(ok.content_length(), Some(0));
    let ok = ResponseHeader::parse("HTTP/1.1 200 OK\r\n\r\n").unwrap();
    assert_eq!(ok.content_length(), None);
    let missing = ResponseHeader::parse("HTTP/1.1 404 Not Found\r\n\r\n").unwrap();
    assert_eq!(missing.content_length(), Some(0));
    let err = ResponseHeader::parse("HTTP/1.1 500 Oops\r\nContent-Length: 7\r\n\r\n").unwrap();
    assert_eq!(err.content_length(), Some(7));
  }

  #[test]
  fn set_status_code_rewrites_line() {
    let mut h = ResponseHeader::with_status("HTTP/1.1", 302);
    assert!(h.is_redirect());
    assert_eq!(h.start_line(), "HTTP/1.1 302 Found");
    h.set_status_code(200);
    h.set_reason_phrase("Fine");
    assert_eq!(h.to_string(), "HTTP/1.1 200 Fine\r\n\r\n");
    assert!(!ResponseHeader::default().is_redirect());
    assert!(ResponseHeader::default().is_empty());
  }
}
