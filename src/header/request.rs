use super::{names, HeaderBlock, Method, FORM_URLENCODED, HTTP09, HTTP10, HTTP11};
use crate::errors::{malformed, Result};
use http::uri::{Authority, Scheme};
use http::Uri;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Characters re-encoded in a request target. `%` is handled separately so
/// that valid escapes survive untouched.
const TARGET_UNSAFE: &AsciiSet = &CONTROLS
  .add(b' ')
  .add(b'"')
  .add(b'<')
  .add(b'>')
  .add(b'`')
  .add(b'{')
  .add(b'}')
  .add(b'|')
  .add(b'\\')
  .add(b'^')
  .add(b'[')
  .add(b']');

/// A parsed request header: request line plus fields.
///
/// The URI is always absolute after parsing. Relative targets are resolved
/// against the `Host` header, and the secure flag decides between `http`
/// and `https`. A `CONNECT` target is kept as the literal `host:port` next
/// to the URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHeader {
  block: HeaderBlock,
  method: Method,
  uri: Uri,
  host: String,
  port: u16,
  secure: bool,
  connect_target: Option<String>,
  /// `OPTIONS *`: the request is about the server, not a resource.
  asterisk: bool,
}

impl Default for RequestHeader {
  fn default() -> Self {
    RequestHeader {
      block: HeaderBlock::default(),
      method: Method::Get,
      uri: Uri::default(),
      host: String::new(),
      port: 80,
      secure: false,
      connect_target: None,
      asterisk: false,
    }
  }
}

impl RequestHeader {
  /// Parse a request header received over a plain connection.
  pub fn parse(data: &str) -> Result<RequestHeader> {
    Self::parse_secure(data, false)
  }
  /// Parse a request header; `secure` marks requests read from inside a TLS
  /// tunnel so relative targets resolve to `https`.
  pub fn parse_secure(data: &str, secure: bool) -> Result<RequestHeader> {
    let header = Self::parse_lenient(data, secure);
    match header.malformed_reason() {
      Some(reason) => Err(malformed(reason)),
      None => Ok(header),
    }
  }
  /// Parse without failing. Problems only set the malformed flag.
  pub fn parse_lenient(data: &str, secure: bool) -> RequestHeader {
    let mut header = RequestHeader {
      block: HeaderBlock::parse_lenient(data),
      secure,
      ..Default::default()
    };
    if let Err(reason) = header.parse_request_line() {
      if !header.block.is_malformed_header() {
        header.block.set_malformed(reason);
      }
    }
    header
  }

  /// Build a fresh header for `method uri version`, with a `Host` line and,
  /// for POST and PUT, a form content type.
  pub fn new(method: Method, uri: &Uri, version: &str) -> Result<RequestHeader> {
    let mut header = RequestHeader {
      method,
      ..Default::default()
    };
    header.block.set_version_text(version.to_ascii_uppercase());
    header.apply_uri(uri.clone()).map_err(malformed)?;
    if header.method == Method::Connect {
      header.connect_target = Some(header.host_port());
    }
    let host = header.host_header_value();
    header.block.set_header(names::HOST, Some(&host));
    if header.method.carries_form() {
      header
        .block
        .set_header(names::CONTENT_TYPE, Some(FORM_URLENCODED));
    }
    header.regenerate_start_line();
    Ok(header)
  }

  fn parse_request_line(&mut self) -> std::result::Result<(), String> {
    let line = self.block.start_line().to_string();
    let (method, rest) = line
      .split_once(' ')
      .ok_or_else(|| format!("invalid request line: {}", line))?;
    let (target, version) = rest
      .trim()
      .rsplit_once(' ')
      .ok_or_else(|| format!("invalid request line: {}", line))?;
    let target = target.trim();
    if method.is_empty()
      || target.is_empty()
      || !method.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
      return Err(format!("invalid request line: {}", line));
    }
    let version = version.to_ascii_uppercase();
    if ![HTTP09, HTTP10, HTTP11].contains(&version.as_str()) {
      return Err(format!("unsupported http version: {}", version));
    }
    self.block.set_version_text(version);
    self.method = Method::from_token(method);
    if self.method == Method::Connect {
      let authority: Authority = target
        .parse()
        .map_err(|_| format!("invalid connect target: {}", target))?;
      let uri = Uri::builder()
        .scheme(Scheme::HTTPS)
        .authority(authority)
        .path_and_query("/")
        .build()
        .map_err(|e| e.to_string())?;
      self.secure = true;
      self.apply_uri(uri)?;
      self.connect_target = Some(target.to_string());
      return Ok(());
    }
    let normalized = normalize_target(target);
    let absolute = if is_absolute(&normalized) {
      normalized
    } else {
      let host = self
        .block
        .header(names::HOST)
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| format!("relative target without Host header: {}", target))?;
      self.asterisk = self.method == Method::Options && normalized == "*";
      let path = match normalized.as_str() {
        "*" => "/".to_string(),
        p if p.starts_with('/') => normalized,
        p => format!("/{}", p),
      };
      format!("http://{}{}", host, path)
    };
    let uri: Uri = absolute
      .parse()
      .map_err(|e: http::uri::InvalidUri| format!("{}: {}", e, absolute))?;
    self.apply_uri(uri)
  }

  fn apply_uri(&mut self, uri: Uri) -> std::result::Result<(), String> {
    let uri = match uri.scheme_str() {
      Some("https") => {
        self.secure = true;
        uri
      }
      Some("http") if self.secure => with_scheme(uri, Scheme::HTTPS)?,
      Some(_) => uri,
      None => return Err(format!("uri is not absolute: {}", uri)),
    };
    let host = uri
      .host()
      .ok_or_else(|| format!("uri without host: {}", uri))?
      .to_string();
    self.port = uri.port_u16().unwrap_or(if self.secure { 443 } else { 80 });
    self.host = host;
    self.uri = uri;
    Ok(())
  }

  fn regenerate_start_line(&mut self) {
    let target = match &self.connect_target {
      Some(target) if self.method == Method::Connect => target.clone(),
      _ if self.is_asterisk() => "*".to_string(),
      _ => self.uri.to_string(),
    };
    let line = format!("{} {} {}", self.method, target, self.block.version());
    self.block.set_start_line(line);
  }

  fn host_header_value(&self) -> String {
    let default_port = if self.secure { 443 } else { 80 };
    if self.port == default_port {
      self.host.clone()
    } else {
      self.host_port()
    }
  }
}

impl RequestHeader {
  /// Request method.
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Absolute request URI.
  pub fn uri(&self) -> &Uri {
    &self.uri
  }
  /// Target host name.
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Effective target port.
  pub fn port(&self) -> u16 {
    self.port
  }
  /// `host:port` of the target.
  pub fn host_port(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
  /// The request goes over TLS.
  pub fn is_secure(&self) -> bool {
    self.secure
  }
  /// Literal `host:port` of a CONNECT request.
  pub fn connect_target(&self) -> Option<&str> {
    self.connect_target.as_deref()
  }
  /// The target is `*` of an `OPTIONS` request.
  pub fn is_asterisk(&self) -> bool {
    self.asterisk && self.method == Method::Options
  }
  /// Path and query, as sent to an origin server.
  pub fn origin_form(&self) -> String {
    if let (Method::Connect, Some(target)) = (&self.method, &self.connect_target) {
      return target.clone();
    }
    if self.is_asterisk() {
      return "*".to_string();
    }
    self
      .uri
      .path_and_query()
      .map(|p| p.as_str().to_string())
      .unwrap_or_else(|| "/".to_string())
  }
  /// Full URI, as sent to a forward proxy.
  pub fn absolute_form(&self) -> String {
    if let (Method::Connect, Some(target)) = (&self.method, &self.connect_target) {
      return target.clone();
    }
    // 代理收到无路径的绝对形式后还原为 `*`
    if let (true, Some(scheme), Some(authority)) =
      (self.is_asterisk(), self.uri.scheme_str(), self.uri.authority())
    {
      return format!("{}://{}", scheme, authority);
    }
    self.uri.to_string()
  }
  /// `Connection` lists `upgrade`.
  pub fn is_upgrade(&self) -> bool {
    self
      .headers(names::CONNECTION)
      .iter()
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
  }

  /// Change the method and rewrite the request line.
  pub fn set_method(&mut self, method: Method) {
    if method == Method::Connect && self.connect_target.is_none() {
      self.connect_target = Some(self.host_port());
    }
    self.method = method;
    self.regenerate_start_line();
  }
  /// Point the request at another absolute URI. The `Host` line follows.
  pub fn set_uri(&mut self, uri: Uri) -> Result<()> {
    if uri.scheme_str() == Some("http") {
      self.secure = false;
    }
    self.apply_uri(uri).map_err(malformed)?;
    self.asterisk = false;
    if self.method == Method::Connect {
      self.connect_target = Some(self.host_port());
    }
    let host = self.host_header_value();
    self.block.set_header(names::HOST, Some(&host));
    self.regenerate_start_line();
    Ok(())
  }
  /// Change the protocol version.
  pub fn set_version(&mut self, version: &str) {
    self.block.set_version_text(version.to_ascii_uppercase());
    self.regenerate_start_line();
  }
  /// Switch the request between `http` and `https`.
  pub fn set_secure(&mut self, secure: bool) -> Result<()> {
    if self.secure == secure {
      return Ok(());
    }
    self.secure = secure;
    let scheme = if secure { Scheme::HTTPS } else { Scheme::HTTP };
    let uri = with_scheme(self.uri.clone(), scheme).map_err(malformed)?;
    self.apply_uri(uri).map_err(malformed)?;
    self.regenerate_start_line();
    Ok(())
  }
}

impl Deref for RequestHeader {
  type Target = HeaderBlock;

  fn deref(&self) -> &Self::Target {
    &self.block
  }
}

impl DerefMut for RequestHeader {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.block
  }
}

impl fmt::Display for RequestHeader {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.block, f)
  }
}

fn with_scheme(uri: Uri, scheme: Scheme) -> std::result::Result<Uri, String> {
  let mut parts = uri.into_parts();
  parts.scheme = Some(scheme);
  if parts.path_and_query.is_none() {
    parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
  }
  Uri::from_parts(parts).map_err(|e| e.to_string())
}

fn is_absolute(target: &str) -> bool {
  match target.find("://") {
    Some(0) | None => false,
    Some(pos) => target[..pos]
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')),
  }
}

/// Re-encode unsafe characters of a raw request target.
///
/// Spaces become `%20`, the unwise set and non-ASCII bytes are
/// percent-encoded, a `%` that does not start a valid escape becomes `%25`.
/// The authority of an absolute target is left alone so IPv6 literals keep
/// their brackets.
pub fn normalize_target(target: &str) -> String {
  let split = if is_absolute(target) {
    let start = target.find("://").map(|p| p + 3).unwrap_or(0);
    target[start..]
      .find(['/', '?'])
      .map(|e| start + e)
      .unwrap_or(target.len())
  } else {
    0
  };
  let (authority, rest) = target.split_at(split);
  let mut out = String::with_capacity(target.len());
  out.push_str(authority);
  for (i, c) in rest.char_indices() {
    if c == '%' {
      let valid = rest
        .get(i + 1..i + 3)
        .map(|h| h.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false);
      out.push_str(if valid { "%" } else { "%25" });
      continue;
    }
    let mut buf = [0u8; 4];
    out.extend(utf8_percent_encode(c.encode_utf8(&mut buf), TARGET_UNSAFE));
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn options_asterisk_is_kept() {
    let mut h = RequestHeader::parse("OPTIONS * HTTP/1.1\r\nHost: ex.com:8080\r\n\r\n").unwrap();
    assert!(h.is_asterisk());
    assert_eq!(h.host(), "ex.com");
    assert_eq!(h.port(), 8080);
    assert_eq!(h.origin_form(), "*");
    assert_eq!(h.absolute_form(), "http://ex.com:8080");
    h.set_version("HTTP/1.0");
    assert_eq!(h.start_line(), "OPTIONS * HTTP/1.0");
    h.set_method(Method::Get);
    assert!(!h.is_asterisk());
    assert_eq!(h.origin_form(), "/");
  }

  #[test]
  fn relative_target_resolves_against_host() {
    let h = RequestHeader::parse("GET /a?x=1&y=2 HTTP/1.1\r\nHost: ex.com\r\n\r\n").unwrap();
    assert_eq!(h.method(), &Method::Get);
    assert_eq!(h.host(), "ex.com");
    assert_eq!(h.port(), 80);
    assert!(!h.is_secure());
    assert_eq!(h.uri().to_string(), "http://ex.com/a?x=1&y=2");
    assert_eq!(h.origin_form(), "/a?x=1&y=2");
    assert_eq!(h.start_line(), "GET /a?x=1&y=2 HTTP/1.1");
  }

  #[test]
  fn secure_flag_upgrades_scheme() {
    let h = RequestHeader::parse_secure("get /x HTTP/1.1\r\nHost: ex.com:8443\r\n\r\n", true).unwrap();
    assert_eq!(h.uri().scheme_str(), Some("https"));
    assert_eq!(h.port(), 8443);
    let h = RequestHeader::parse_secure("GET /x HTTP/1.1\r\nHost: ex.com\r\n\r\n", true).unwrap();
    assert_eq!(h.port(), 443);
  }

  #[test]
  fn absolute_https_target_sets_secure() {
    let h = RequestHeader::parse("GET https://ex.com/p HTTP/1.1\r\n\r\n").unwrap();
    assert!(h.is_secure());
    assert_eq!(h.port(), 443);
  }

  #[test]
  fn connect_keeps_host_port() {
    let h = RequestHeader::parse("CONNECT ex.com:8443 HTTP/1.1\r\nHost: ex.com:8443\r\n\r\n").unwrap();
    assert_eq!(h.connect_target(), Some("ex.com:8443"));
    assert_eq!(h.host(), "ex.com");
    assert_eq!(h.port(), 8443);
    assert_eq!(h.origin_form(), "ex.com:8443");
  }

  #[test]
  fn unsupported_version_is_malformed() {
    let err = RequestHeader::parse("GET / HTTP/2.0\r\nHost: a\r\n\r\n").unwrap_err();
    assert!(err.is_malformed_header());
    assert!(RequestHeader::parse_lenient("GET / HTTP/2.0\r\n\r\n", false).is_malformed_header());
    assert!(RequestHeader::parse("GET /\r\nHost: a\r\n\r\n").is_err());
    assert!(RequestHeader::parse("GET / HTTP/1.0\r\n\r\n").is_err());
  }

  #[test]
  fn unsafe_target_characters_are_encoded() {
    let raw = "GET /a b<c>{d}|e^f`g\"[h]%zz%41ü HTTP/1.1\r\nHost: ex.com\r\n\r\n";
    let h = RequestHeader::parse(raw).unwrap();
    let uri = h.uri().to_string();
    for c in [' ', '<', '>', '{', '}', '|', '^', '`', '"', '[', ']'] {
      assert!(!uri.contains(c), "{} still in {}", c, uri);
    }
    assert!(uri.contains("a%20b"));
    assert!(uri.contains("%25zz%41"));
    assert!(uri.contains("%C3%BC"));
  }

  #[test]
  fn normalizing_leaves_ipv6_authority_alone() {
    assert_eq!(
      normalize_target("http://[::1]:8080/a b"),
      "http://[::1]:8080/a%20b"
    );
    assert_eq!(normalize_target("/ok%20"), "/ok%20");
  }

  #[test]
  fn new_header_has_host_and_form_type() {
    let uri: Uri = "http://ex.com:8080/p".parse().unwrap();
    let h = RequestHeader::new(Method::Post, &uri, "HTTP/1.1").unwrap();
    assert_eq!(h.header("host"), Some("ex.com:8080"));
    assert_eq!(h.header("content-type"), Some(FORM_URLENCODED));
    assert_eq!(h.start_line(), "POST http://ex.com:8080/p HTTP/1.1");
  }

  #[test]
  fn setters_rewrite_request_line() {
    let mut h = RequestHeader::parse("POST /a HTTP/1.1\r\nHost: ex.com\r\n\r\n").unwrap();
    h.set_method(Method::Get);
    h.set_uri("http://other.org/b".parse().unwrap()).unwrap();
    assert_eq!(h.start_line(), "GET http://other.org/b HTTP/1.1");
    assert_eq!(h.header("Host"), Some("other.org"));
    h.set_secure(true).unwrap();
    assert_eq!(h.uri().to_string(), "https://other.org/b");
    h.set_version("http/1.0");
    assert_eq!(h.version(), "HTTP/1.0");
  }
}
