//! Upstream proxy chain: skip list, `CONNECT` tunnelling and Basic proxy
//! authentication.
use crate::errors::{new_io_error, Result};
use crate::header::{names, ResponseHeader};
use crate::socket::Socket;
use std::io::Write;

/// Upper bound for the header of a `CONNECT` reply.
const MAX_CONNECT_REPLY: usize = 64 * 1024;

/// Credentials for the upstream proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProxyCredentials {
  /// user name
  pub username: String,
  /// password
  pub password: String,
  /// Only answer challenges for this realm, any realm when `None`.
  pub realm: Option<String>,
}

/// Hosts that bypass the chain, from a `;`-separated list of `*` globs
/// matched without regard to case.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProxySkipList {
  raw: String,
  patterns: Vec<String>,
}

impl ProxySkipList {
  /// Parse `localhost;*.internal;10.0.*`.
  pub fn parse(raw: &str) -> ProxySkipList {
    let patterns = raw
      .split(';')
      .map(|p| p.trim().to_ascii_lowercase())
      .filter(|p| !p.is_empty())
      .collect();
    ProxySkipList {
      raw: raw.to_string(),
      patterns,
    }
  }
  /// The list as configured.
  pub fn as_str(&self) -> &str {
    &self.raw
  }
  /// `host` matches one of the patterns.
  pub fn matches(&self, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    self
      .patterns
      .iter()
      .any(|p| glob_match(p.as_bytes(), host.as_bytes()))
  }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
  let (mut p, mut t) = (0, 0);
  let mut star: Option<(usize, usize)> = None;
  while t < text.len() {
    if p < pattern.len() && pattern[p] == b'*' {
      star = Some((p, t));
      p += 1;
    } else if p < pattern.len() && pattern[p] == text[t] {
      p += 1;
      t += 1;
    } else if let Some((sp, st)) = star {
      p = sp + 1;
      t = st + 1;
      star = Some((sp, st + 1));
    } else {
      return false;
    }
  }
  pattern[p..].iter().all(|c| *c == b'*')
}

/// An upstream HTTP proxy that outbound requests are routed through.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProxyChain {
  host: String,
  port: u16,
  credentials: Option<ProxyCredentials>,
  skip: ProxySkipList,
}

impl ProxyChain {
  /// A chain proxy at `host:port`.
  pub fn new<S: Into<String>>(host: S, port: u16) -> ProxyChain {
    ProxyChain {
      host: host.into(),
      port,
      credentials: None,
      skip: ProxySkipList::default(),
    }
  }
  /// Answer `407` challenges with these credentials.
  pub fn credentials(mut self, credentials: ProxyCredentials) -> ProxyChain {
    self.credentials = Some(credentials);
    self
  }
  /// Bypass the chain for hosts matching `skip`.
  pub fn skip_list(mut self, skip: &str) -> ProxyChain {
    self.skip = ProxySkipList::parse(skip);
    self
  }
  /// Proxy host.
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Proxy port.
  pub fn port(&self) -> u16 {
    self.port
  }
  /// The configured skip list.
  pub fn skip(&self) -> &ProxySkipList {
    &self.skip
  }
  /// Requests to `host` go directly.
  pub fn should_bypass(&self, host: &str) -> bool {
    self.skip.matches(host)
  }
  /// `Proxy-Authorization` value for the given `Proxy-Authenticate`
  /// challenges, when a Basic challenge matches the configured realm.
  pub fn authorization_for(&self, challenges: &[&str]) -> Option<String> {
    let credentials = self.credentials.as_ref()?;
    let accepted = challenges.iter().any(|challenge| {
      let challenge = challenge.trim();
      let is_basic = challenge
        .get(..5)
        .map(|s| s.eq_ignore_ascii_case("basic"))
        .unwrap_or(false);
      is_basic
        && match (&credentials.realm, challenge_realm(challenge)) {
          (None, _) => true,
          (Some(r), _) if r.is_empty() => true,
          (Some(r), Some(c)) => r == &c,
          (Some(_), None) => false,
        }
    });
    accepted.then(|| encode_basic_auth(&credentials.username, Some(&credentials.password)))
  }
}

fn challenge_realm(challenge: &str) -> Option<String> {
  let lower = challenge.to_ascii_lowercase();
  let start = lower.find("realm=")? + "realm=".len();
  let rest = challenge[start..].trim_start();
  let value = match rest.strip_prefix('"') {
    Some(quoted) => quoted.split('"').next().unwrap_or_default(),
    None => rest.split([',', ' ']).next().unwrap_or_default(),
  };
  Some(value.to_string())
}

/// `Basic base64(user:password)`.
pub fn encode_basic_auth<U, P>(username: U, password: Option<P>) -> String
where
  U: std::fmt::Display,
  P: std::fmt::Display,
{
  use base64::prelude::BASE64_STANDARD;
  use base64::write::EncoderWriter;

  let mut buf = b"Basic ".to_vec();
  {
    let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
    encoder
      .write_fmt(format_args!("{}:", &username))
      .unwrap_or_default();
    if let Some(password) = password {
      encoder
        .write_fmt(format_args!("{}", &password))
        .unwrap_or_default();
    }
  }
  String::from_utf8_lossy(&buf).into_owned()
}

/// Text of a `CONNECT host:port` request.
pub(crate) fn connect_request(target: &str, authorization: Option<&str>) -> String {
  // 生成隧道报文
  let mut raw = format!(
    "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n{}: Keep-Alive\r\n",
    names::PROXY_CONNECTION
  );
  if let Some(auth) = authorization {
    raw.push_str(&format!("{}: {}\r\n", names::PROXY_AUTHORIZATION, auth));
  }
  raw.push_str("\r\n");
  raw
}

/// Send `CONNECT` and read the reply header. The reply is read byte by byte
/// so nothing after the blank line is consumed before the TLS handshake.
pub(crate) async fn send_connect(
  socket: &mut Socket,
  target: &str,
  authorization: Option<&str>,
) -> Result<ResponseHeader> {
  socket
    .write_all(connect_request(target, authorization).as_bytes())
    .await?;
  socket.flush().await?;
  let mut raw = Vec::with_capacity(256);
  let mut byte = [0u8; 1];
  while !(raw.ends_with(b"\r\n\r\n") || raw.ends_with(b"\n\n")) {
    if raw.len() > MAX_CONNECT_REPLY {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "CONNECT reply header too large",
      ));
    }
    if socket.read(&mut byte).await? == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "proxy closed the connection during CONNECT",
      ));
    }
    raw.push(byte[0]);
  }
  ResponseHeader::parse(&String::from_utf8_lossy(&raw))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn skip_list_globs() {
    let skip = ProxySkipList::parse("localhost; *.Internal.corp ;10.0.*;");
    assert!(skip.matches("LOCALHOST"));
    assert!(skip.matches("api.internal.corp"));
    assert!(skip.matches("10.0.3.4"));
    assert!(!skip.matches("internal.corp.evil.com"));
    assert!(!skip.matches("example.com"));
    assert!(!ProxySkipList::parse("").matches("anything"));
    assert!(ProxySkipList::parse("*").matches("anything"));
  }

  #[test]
  fn basic_auth_encoding() {
    assert_eq!(encode_basic_auth("Aladdin", Some("open sesame")), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
  }

  #[test]
  fn realm_must_match() {
    let chain = ProxyChain::new("proxy", 8080).credentials(ProxyCredentials {
      username: "u".into(),
      password: "p".into(),
      realm: Some("corp".into()),
    });
    assert!(chain.authorization_for(&["Basic realm=\"corp\""]).is_some());
    assert!(chain.authorization_for(&["Basic realm=\"other\""]).is_none());
    assert!(chain.authorization_for(&["NTLM", "Digest realm=\"corp\""]).is_none());
    assert!(ProxyChain::new("p", 1).authorization_for(&["Basic"]).is_none());
  }

  #[test]
  fn connect_request_text() {
    let raw = connect_request("ex.com:443", Some("Basic x"));
    assert!(raw.starts_with("CONNECT ex.com:443 HTTP/1.1\r\nHost: ex.com:443\r\n"));
    assert!(raw.contains("Proxy-Authorization: Basic x\r\n"));
    assert!(raw.ends_with("\r\n\r\n"));
  }
}
