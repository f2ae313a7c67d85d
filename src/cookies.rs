//! Cookie state kept between requests of one requesting user.
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::SystemTime;

type NameMap = BTreeMap<String, Cookie<'static>>;
type PathMap = BTreeMap<String, NameMap>;
type DomainMap = BTreeMap<String, PathMap>;

/// A thread-safe cookie jar.
#[derive(Debug, Default)]
pub struct Jar(RwLock<CookieStores>);

impl Jar {
  /// Store the `Set-Cookie` values received for `url`.
  pub fn set_cookies<'a, I: IntoIterator<Item = &'a str>>(&self, values: I, url: &http::Uri) {
    let cookies = values
      .into_iter()
      .filter_map(|v| Cookie::parse(v).ok().map(Cookie::into_owned));
    if let Ok(mut w) = self.0.write() {
      w.store_response_cookies(cookies, url);
    }
  }
  /// `name=value; ...` for the cookies that apply to `url`.
  pub fn cookies(&self, url: &http::Uri) -> Option<String> {
    let s = self
      .0
      .read()
      .ok()?
      .get_request_values(url)
      .map(|(name, value)| format!("{name}={value}"))
      .collect::<Vec<_>>()
      .join("; ");
    if s.is_empty() {
      return None;
    }
    Some(s)
  }
  /// Forget every cookie.
  pub fn clear(&self) {
    if let Ok(mut w) = self.0.write() {
      w.cookies.clear();
    }
  }
  /// Number of stored cookies.
  pub fn len(&self) -> usize {
    self
      .0
      .read()
      .map(|r| {
        r.cookies
          .values()
          .flat_map(|p| p.values())
          .map(|n| n.len())
          .sum()
      })
      .unwrap_or_default()
  }
  /// The jar holds no cookie.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[derive(Debug, Clone, Default)]
struct CookieStores {
  cookies: DomainMap,
}

impl CookieStores {
  fn get_request_values(&self, url: &http::Uri) -> impl Iterator<Item = (&str, &str)> {
    self.matches(url).into_iter().map(|c| c.0.name_value())
  }
  fn insert(&mut self, cookie: Cookie<'static>, request_url: &http::Uri) {
    let domain = match cookie.domain().or_else(|| request_url.host()) {
      Some(domain) => domain.trim_start_matches('.').to_ascii_lowercase(),
      None => return,
    };
    // Domain 属性必须覆盖当前请求的主机
    if cookie.domain().is_some() && !domain_match(&domain, request_url) {
      tracing::debug!("ignoring cookie {} for foreign domain {}", cookie.name(), domain);
      return;
    }
    let path = match cookie.path() {
      Some(path) => path.to_string(),
      None => default_path(request_url.path()),
    };
    if cookie.is_expired() {
      if let Some(paths) = self.cookies.get_mut(&domain) {
        if let Some(names) = paths.get_mut(&path) {
          names.remove(cookie.name());
        }
      }
      return;
    }
    self
      .cookies
      .entry(domain)
      .or_default()
      .entry(path)
      .or_default()
      .insert(cookie.name().to_owned(), cookie);
  }
  fn store_response_cookies<I: Iterator<Item = Cookie<'static>>>(
    &mut self,
    cookies: I,
    url: &http::Uri,
  ) {
    for cookie in cookies {
      self.insert(cookie, url);
    }
  }
  fn matches(&self, request_url: &http::Uri) -> Vec<&Cookie<'static>> {
    self
      .cookies
      .iter()
      .filter(|&(d, _)| domain_match(d, request_url))
      .flat_map(|(_, dcs)| {
        dcs
          .iter()
          .filter(|&(p, _)| path_match(p, request_url))
          .flat_map(|(_, pcs)| pcs.values().filter(|c| c.matches(request_url)))
      })
      .collect()
  }
}

/// The request host is the cookie domain or one of its subdomains.
pub fn domain_match(domain: &str, request_url: &http::Uri) -> bool {
  let host = request_url.host().unwrap_or_default().to_ascii_lowercase();
  host == domain
    || (host.ends_with(domain) && host[..host.len() - domain.len()].ends_with('.'))
}

/// RFC 6265 path matching.
pub fn path_match(cookie_path: &str, request_url: &http::Uri) -> bool {
  let request_path = request_url.path();
  cookie_path == request_path
    || (request_path.starts_with(cookie_path)
      && (cookie_path.ends_with('/')
        || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')))
}

// 没有 Path 属性时取请求路径的目录部分
fn default_path(request_path: &str) -> String {
  match request_path.rfind('/') {
    Some(0) | None => "/".to_string(),
    Some(i) => request_path[..i].to_string(),
  }
}

fn is_secure(url: &http::Uri) -> bool {
  if url.scheme() == Some(&http::uri::Scheme::HTTPS) {
    return true;
  }
  if let Some(u) = url.host() {
    match IpAddr::from_str(u) {
      Ok(ip) => ip.is_loopback(),
      Err(_) => u == "localhost",
    }
  } else {
    false
  }
}

/// A parsed `Set-Cookie` value.
#[derive(Debug, Clone)]
pub struct Cookie<'a>(cookie::Cookie<'a>);

impl<'a> Cookie<'a> {
  /// Parse one `Set-Cookie` value.
  pub fn parse(value: &'a str) -> Result<Cookie<'a>, cookie::ParseError> {
    cookie::Cookie::parse(value).map(Cookie)
  }
  fn into_owned(self) -> Cookie<'static> {
    Cookie(self.0.into_owned())
  }
  /// cookie name
  pub fn name(&self) -> &str {
    self.0.name()
  }
  /// cookie value
  pub fn value(&self) -> &str {
    self.0.value()
  }
  /// `Secure` attribute
  pub fn secure(&self) -> bool {
    self.0.secure().unwrap_or(false)
  }
  /// `Path` attribute
  pub fn path(&self) -> Option<&str> {
    self.0.path()
  }
  /// `Domain` attribute
  pub fn domain(&self) -> Option<&str> {
    self.0.domain()
  }
  /// `Expires` attribute
  pub fn expires(&self) -> Option<SystemTime> {
    match self.0.expires() {
      Some(cookie::Expiration::DateTime(offset)) => Some(SystemTime::from(offset)),
      None | Some(cookie::Expiration::Session) => None,
    }
  }
  fn is_expired(&self) -> bool {
    if let Some(max_age) = self.0.max_age() {
      return max_age.is_zero() || max_age.is_negative();
    }
    self
      .expires()
      .map(|at| at <= SystemTime::now())
      .unwrap_or(false)
  }
  fn matches(&self, request_url: &http::Uri) -> bool {
    !self.secure() || is_secure(request_url)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn uri(s: &str) -> http::Uri {
    s.parse().unwrap()
  }

  #[test]
  fn stores_and_returns_cookies() {
    let jar = Jar::default();
    jar.set_cookies(
      ["sid=1; Path=/", "pref=dark; Path=/app", "tok=x; Secure"],
      &uri("http://ex.com/login"),
    );
    assert_eq!(jar.len(), 3);
    assert_eq!(jar.cookies(&uri("http://ex.com/")).as_deref(), Some("sid=1"));
    let app = jar.cookies(&uri("http://ex.com/app/x")).unwrap();
    assert!(app.contains("pref=dark") && app.contains("sid=1"));
    assert!(!app.contains("tok"));
    assert!(jar.cookies(&uri("https://ex.com/")).unwrap().contains("tok=x"));
    assert!(jar.cookies(&uri("http://other.com/")).is_none());
  }

  #[test]
  fn domain_attribute_covers_subdomains() {
    let jar = Jar::default();
    jar.set_cookies(["a=1; Domain=.ex.com; Path=/"], &uri("http://www.ex.com/"));
    assert!(jar.cookies(&uri("http://api.ex.com/")).is_some());
    assert!(jar.cookies(&uri("http://badex.com/")).is_none());
  }

  #[test]
  fn foreign_domain_attribute_is_rejected() {
    let jar = Jar::default();
    jar.set_cookies(
      ["a=1; Domain=victim.com; Path=/", "b=2; Domain=www.ex.com; Path=/"],
      &uri("http://ex.com/"),
    );
    assert!(jar.cookies(&uri("http://victim.com/")).is_none());
    assert!(jar.cookies(&uri("http://www.ex.com/")).is_none());
    jar.set_cookies(["c=3; Domain=ex.com; Path=/"], &uri("http://ex.com/"));
    assert_eq!(jar.len(), 1);
  }

  #[test]
  fn max_age_zero_deletes() {
    let jar = Jar::default();
    jar.set_cookies(["a=1; Path=/"], &uri("http://ex.com/"));
    jar.set_cookies(["a=; Path=/; Max-Age=0"], &uri("http://ex.com/"));
    assert!(jar.is_empty());
  }

  #[test]
  fn path_match_boundaries() {
    assert!(path_match("/app", &uri("http://ex.com/app/x")));
    assert!(!path_match("/app", &uri("http://ex.com/apple")));
    assert!(path_match("/", &uri("http://ex.com/anything")));
    assert_eq!(default_path("/a/b/c"), "/a/b");
    assert_eq!(default_path("/a"), "/");
  }
}
