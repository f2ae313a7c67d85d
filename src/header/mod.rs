//! Raw HTTP/1.x header blocks.
//!
//! A header block keeps two views of the same data: the canonical raw text
//! (one `name: value` line per field, joined with the block's delimiter) and
//! an ordered, case-insensitive [`FieldMap`]. Every mutation goes through the
//! raw text first and then rebuilds the map, so both views always agree.
mod fields;
mod method;
mod request;
mod response;

use crate::errors::{malformed, Result};
pub use fields::{FieldMap, FieldName, HeaderField};
pub use method::Method;
pub use request::RequestHeader;
pub use response::ResponseHeader;
use std::fmt;

/// Header names recognised by the protocol core.
pub mod names {
  /// Content-Length
  pub const CONTENT_LENGTH: &str = "Content-Length";
  /// Transfer-Encoding
  pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
  /// Content-Encoding
  pub const CONTENT_ENCODING: &str = "Content-Encoding";
  /// Content-Type
  pub const CONTENT_TYPE: &str = "Content-Type";
  /// Connection
  pub const CONNECTION: &str = "Connection";
  /// Proxy-Connection
  pub const PROXY_CONNECTION: &str = "Proxy-Connection";
  /// Proxy-Authenticate
  pub const PROXY_AUTHENTICATE: &str = "Proxy-Authenticate";
  /// Proxy-Authorization
  pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
  /// Cache-Control
  pub const CACHE_CONTROL: &str = "Cache-Control";
  /// Pragma
  pub const PRAGMA: &str = "Pragma";
  /// Location
  pub const LOCATION: &str = "Location";
  /// Host
  pub const HOST: &str = "Host";
  /// User-Agent
  pub const USER_AGENT: &str = "User-Agent";
  /// Cookie
  pub const COOKIE: &str = "Cookie";
  /// Set-Cookie
  pub const SET_COOKIE: &str = "Set-Cookie";
  /// Set-Cookie2
  pub const SET_COOKIE2: &str = "Set-Cookie2";
  /// Upgrade
  pub const UPGRADE: &str = "Upgrade";
}

/// HTTP/0.9
pub const HTTP09: &str = "HTTP/0.9";
/// HTTP/1.0
pub const HTTP10: &str = "HTTP/1.0";
/// HTTP/1.1
pub const HTTP11: &str = "HTTP/1.1";

/// `application/x-www-form-urlencoded`
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Line terminator of a header block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Delimiter {
  /// `\r\n`
  #[default]
  CrLf,
  /// bare `\n`, accepted when parsing
  Lf,
}

impl Delimiter {
  /// The terminator text.
  pub fn as_str(&self) -> &'static str {
    match self {
      Delimiter::CrLf => "\r\n",
      Delimiter::Lf => "\n",
    }
  }
  /// Pick the terminator of the first line: CRLF when the first `\n` is
  /// preceded by `\r`, bare LF otherwise, none if there is no `\n`.
  pub fn detect(data: &str) -> Option<Delimiter> {
    let lf = data.find('\n')?;
    if lf > 0 && data.as_bytes()[lf - 1] == b'\r' {
      Some(Delimiter::CrLf)
    } else {
      Some(Delimiter::Lf)
    }
  }
}

/// The part of a request or response header that both variants share.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderBlock {
  start_line: String,
  raw: String,
  fields: FieldMap,
  malformed: Option<String>,
  delimiter: Delimiter,
  content_length: Option<u64>,
  version: String,
}

impl HeaderBlock {
  /// Split `data` into start line and fields. Problems are recorded in the
  /// malformed flag instead of aborting so the caller can still inspect what
  /// was parsed.
  pub(crate) fn parse_lenient(data: &str) -> HeaderBlock {
    let mut block = HeaderBlock::default();
    let Some(delimiter) = Delimiter::detect(data) else {
      block.start_line = data.trim().to_string();
      block.malformed = Some("no line delimiter found".to_string());
      return block;
    };
    block.delimiter = delimiter;
    let (start, rest) = data.split_once(delimiter.as_str()).unwrap_or((data, ""));
    block.start_line = start.trim().to_string();
    block.load_fields(rest);
    block
  }

  fn load_fields(&mut self, text: &str) {
    let delimiter = self.delimiter.as_str();
    let mut raw = String::with_capacity(text.len());
    let mut fields = FieldMap::default();
    let mut content_length = None;
    for line in text.split(delimiter) {
      let line = line.trim_end_matches('\r');
      if line.trim().is_empty() {
        continue;
      }
      let Some((name, value)) = line.split_once(':') else {
        self.malformed = Some(format!("header line without colon: {}", line));
        continue;
      };
      let (name, value) = (name.trim(), value.trim());
      if name.eq_ignore_ascii_case(names::CONTENT_LENGTH) {
        // a non-numeric value leaves the cache untouched
        if let Ok(length) = value.parse::<u64>() {
          content_length = Some(length);
        }
      }
      raw.push_str(name);
      raw.push_str(": ");
      raw.push_str(value);
      raw.push_str(delimiter);
      fields.append(name, value);
    }
    self.raw = raw;
    self.fields = fields;
    self.content_length = content_length;
  }

  fn resync(&mut self) {
    let raw = std::mem::take(&mut self.raw);
    self.load_fields(&raw);
  }

  pub(crate) fn into_checked(self) -> Result<HeaderBlock> {
    match &self.malformed {
      Some(reason) => Err(malformed(reason.clone())),
      None => Ok(self),
    }
  }

  pub(crate) fn set_malformed<S: Into<String>>(&mut self, reason: S) {
    self.malformed = Some(reason.into());
  }

  pub(crate) fn set_start_line(&mut self, line: String) {
    self.start_line = line;
  }

  pub(crate) fn set_version_text(&mut self, version: String) {
    self.version = version;
  }
}

impl HeaderBlock {
  /// The request or status line, without terminator.
  pub fn start_line(&self) -> &str {
    &self.start_line
  }
  /// The canonical header lines, each one terminated by the delimiter.
  pub fn raw_headers(&self) -> &str {
    &self.raw
  }
  /// Ordered view of every field.
  pub fn fields(&self) -> &FieldMap {
    &self.fields
  }
  /// Iterate over the fields in the order they appear.
  pub fn header_fields(&self) -> impl Iterator<Item = &HeaderField> {
    self.fields.iter()
  }
  /// First value of `name`, ignoring case.
  pub fn header(&self, name: &str) -> Option<&str> {
    self.fields.first(name)
  }
  /// Every value of `name`, ignoring case, in original order.
  pub fn headers(&self, name: &str) -> Vec<&str> {
    self.fields.all(name)
  }
  /// Whether the block failed delimiter, grammar or version checks.
  pub fn is_malformed_header(&self) -> bool {
    self.malformed.is_some()
  }
  /// Why the block is malformed, if it is.
  pub fn malformed_reason(&self) -> Option<&str> {
    self.malformed.as_deref()
  }
  /// The line terminator used when serialising.
  pub fn delimiter(&self) -> Delimiter {
    self.delimiter
  }
  /// `HTTP/1.0`, `HTTP/1.1` ...
  pub fn version(&self) -> &str {
    &self.version
  }
  /// No start line: the header was never filled in.
  pub fn is_empty(&self) -> bool {
    self.start_line.is_empty()
  }
  /// Byte length of the serialised header.
  pub fn len(&self) -> usize {
    if self.is_empty() {
      return 0;
    }
    self.start_line.len() + self.raw.len() + 2 * self.delimiter.as_str().len()
  }
  /// The `Content-Length` cache as parsed, `None` when absent or not numeric.
  pub fn declared_content_length(&self) -> Option<u64> {
    self.content_length
  }

  /// Replace or remove a header.
  ///
  /// With `Some(value)` and no existing line, a new line is appended. With
  /// `Some(value)` and existing lines, every matching line is rewritten in
  /// place. With `None` every matching line is removed. Lines for other
  /// names keep their position.
  pub fn set_header(&mut self, name: &str, value: Option<&str>) {
    match value {
      Some(value) if !self.fields.contains(name) => self.add_header(name, value),
      _ => {
        self.raw = patch_lines(&self.raw, self.delimiter, name, value);
        self.resync();
      }
    }
  }
  /// Append a header line, even if the name is already present.
  pub fn add_header(&mut self, name: &str, value: &str) {
    self.raw.push_str(name);
    self.raw.push_str(": ");
    self.raw.push_str(value);
    self.raw.push_str(self.delimiter.as_str());
    self.resync();
  }
  /// Set `Content-Length` to `length`.
  pub fn set_content_length(&mut self, length: u64) {
    self.set_header(names::CONTENT_LENGTH, Some(&length.to_string()));
  }
  /// `Transfer-Encoding` lists `chunked`.
  pub fn is_transfer_encoding_chunked(&self) -> bool {
    self
      .headers(names::TRANSFER_ENCODING)
      .iter()
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
  }
  /// The `charset` parameter of `Content-Type`.
  pub fn charset(&self) -> Option<String> {
    let content_type = self.header(names::CONTENT_TYPE)?;
    let mime: mime::Mime = content_type.parse().ok()?;
    mime.get_param(mime::CHARSET).map(|c| c.as_str().to_string())
  }
  /// The body is textual according to `Content-Type`.
  pub fn is_text(&self) -> bool {
    let Some(content_type) = self.header(names::CONTENT_TYPE) else {
      return false;
    };
    let content_type = content_type.to_ascii_lowercase();
    content_type.starts_with("text")
      || ["html", "xml", "json", "javascript", FORM_URLENCODED]
        .iter()
        .any(|t| content_type.contains(t))
  }
  /// Whether the connection is to be closed after this message.
  ///
  /// HTTP/1.0 closes unless `Connection` or `Proxy-Connection` asks for
  /// keep-alive, HTTP/1.1 keeps alive unless either asks for close, and
  /// anything else (including a malformed block) closes.
  pub fn is_connection_close(&self) -> bool {
    if self.is_malformed_header() {
      return true;
    }
    let says = |token: &str| {
      [names::CONNECTION, names::PROXY_CONNECTION]
        .iter()
        .flat_map(|n| self.headers(n))
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    match self.version.to_ascii_uppercase().as_str() {
      HTTP10 => !says("keep-alive"),
      HTTP11 => says("close"),
      _ => true,
    }
  }
}

impl fmt::Display for HeaderBlock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_empty() {
      return Ok(());
    }
    let delimiter = self.delimiter.as_str();
    write!(f, "{}{}{}{}", self.start_line, delimiter, self.raw, delimiter)
  }
}

/// Name-scoped rewrite of the raw header lines used by
/// [`HeaderBlock::set_header`].
pub(crate) fn patch_lines(
  raw: &str,
  delimiter: Delimiter,
  name: &str,
  value: Option<&str>,
) -> String {
  let delimiter = delimiter.as_str();
  let mut out = String::with_capacity(raw.len());
  for line in raw.split(delimiter).filter(|l| !l.is_empty()) {
    let matches = line
      .split_once(':')
      .map(|(n, _)| n.trim().eq_ignore_ascii_case(name))
      .unwrap_or(false);
    if !matches {
      out.push_str(line);
      out.push_str(delimiter);
      continue;
    }
    if let Some(value) = value {
      out.push_str(name);
      out.push_str(": ");
      out.push_str(value);
      out.push_str(delimiter);
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn block(data: &str) -> HeaderBlock {
    let mut b = HeaderBlock::parse_lenient(data);
    b.set_version_text(HTTP11.to_string());
    b
  }

  #[test]
  fn parses_crlf_and_keeps_order() {
    let b = block("GET / HTTP/1.1\r\nHost: ex.com\r\nX-A:  1 \r\nx-a: 2\r\n\r\n");
    assert!(!b.is_malformed_header());
    assert_eq!(b.delimiter(), Delimiter::CrLf);
    assert_eq!(b.header("x-A"), Some("1"));
    assert_eq!(b.headers("X-A"), vec!["1", "2"]);
    assert_eq!(b.raw_headers(), "Host: ex.com\r\nX-A: 1\r\nx-a: 2\r\n");
    assert_eq!(
      b.to_string(),
      "GET / HTTP/1.1\r\nHost: ex.com\r\nX-A: 1\r\nx-a: 2\r\n\r\n"
    );
    assert_eq!(b.len(), b.to_string().len());
  }

  #[test]
  fn falls_back_to_lf() {
    let b = block("HTTP/1.1 200 OK\nContent-Length: 3\n\n");
    assert_eq!(b.delimiter(), Delimiter::Lf);
    assert_eq!(b.declared_content_length(), Some(3));
    assert!(b.to_string().ends_with("Content-Length: 3\n\n"));
  }

  #[test]
  fn missing_delimiter_or_colon_is_malformed() {
    assert!(block("GET / HTTP/1.1").is_malformed_header());
    let b = block("GET / HTTP/1.1\r\nHost ex.com\r\n\r\n");
    assert!(b.is_malformed_header());
    assert!(b.into_checked().is_err());
  }

  #[test]
  fn reserialising_yields_the_same_fields() {
    let b = block("GET / HTTP/1.1\r\nA: 1\r\nB: two words\r\na: 3\r\n\r\n");
    let again = block(&b.to_string());
    assert_eq!(b.fields(), again.fields());
  }

  #[test]
  fn non_numeric_content_length_is_ignored() {
    let b = block("HTTP/1.1 200 OK\r\nContent-Length: abc\r\n\r\n");
    assert!(!b.is_malformed_header());
    assert_eq!(b.declared_content_length(), None);
  }

  #[test]
  fn set_header_replaces_in_place() {
    let mut b = block("GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\na: 3\r\nC: 4\r\n\r\n");
    b.set_header("a", Some("9"));
    assert_eq!(b.raw_headers(), "a: 9\r\nB: 2\r\na: 9\r\nC: 4\r\n");
    assert_eq!(b.headers("A"), vec!["9", "9"]);
    b.set_header("D", Some("5"));
    assert_eq!(b.raw_headers(), "a: 9\r\nB: 2\r\na: 9\r\nC: 4\r\nD: 5\r\n");
  }

  #[test]
  fn set_header_rewrites_every_duplicate() {
    let mut b = block("GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nA: 3\r\n\r\n");
    b.set_header("A", Some("9"));
    assert_eq!(b.headers("A"), vec!["9", "9"]);
    assert_eq!(b.raw_headers(), "A: 9\r\nB: 2\r\nA: 9\r\n");
    let once = b.clone();
    b.set_header("A", Some("9"));
    assert_eq!(b, once);
  }

  #[test]
  fn removing_a_header_is_idempotent() {
    let mut b = block("GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nA: 3\r\n\r\n");
    b.set_header("A", None);
    assert_eq!(b.header("A"), None);
    let once = b.clone();
    b.set_header("A", None);
    assert_eq!(b, once);
    assert_eq!(b.raw_headers(), "B: 2\r\n");
  }

  #[test]
  fn content_length_cache_follows_mutation() {
    let mut b = block("POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\n");
    b.set_content_length(10);
    assert_eq!(b.declared_content_length(), Some(10));
    b.set_header(names::CONTENT_LENGTH, None);
    assert_eq!(b.declared_content_length(), None);
  }

  #[test]
  fn connection_close_rules() {
    let mut b = block("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    assert!(!b.is_connection_close());
    b.set_header("Proxy-Connection", Some("Close"));
    assert!(b.is_connection_close());

    let mut old = HeaderBlock::parse_lenient("GET / HTTP/1.0\r\nHost: a\r\n\r\n");
    old.set_version_text(HTTP10.to_string());
    assert!(old.is_connection_close());
    old.set_header("Connection", Some("keep-alive"));
    assert!(!old.is_connection_close());

    let mut bad = block("GET / HTTP/1.1\r\nbroken\r\n\r\n");
    bad.set_version_text(HTTP11.to_string());
    assert!(bad.is_connection_close());
  }

  #[test]
  fn content_type_helpers() {
    let b = block(
      "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=ISO-8859-1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
    );
    assert_eq!(b.charset().as_deref(), Some("ISO-8859-1"));
    assert!(b.is_text());
    assert!(b.is_transfer_encoding_chunked());
  }

  #[test]
  fn empty_block() {
    let b = HeaderBlock::default();
    assert!(b.is_empty());
    assert_eq!(b.len(), 0);
    assert_eq!(b.to_string(), "");
  }
}
