use std::collections::BTreeSet;
use std::fmt;

/// Where a parameter was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParameterKind {
  /// query string
  Url,
  /// urlencoded request body
  Form,
  /// `Cookie` or `Set-Cookie` header
  Cookie,
}

/// A single name/value pair, kept exactly as it appeared (no percent
/// decoding).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HtmlParameter {
  /// origin of the parameter
  pub kind: ParameterKind,
  /// raw name
  pub name: String,
  /// raw value, empty when the token had no `=`
  pub value: String,
}

impl HtmlParameter {
  /// Build a parameter.
  pub fn new<N: Into<String>, V: Into<String>>(kind: ParameterKind, name: N, value: V) -> Self {
    HtmlParameter {
      kind,
      name: name.into(),
      value: value.into(),
    }
  }
}

impl fmt::Display for HtmlParameter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}={}", self.name, self.value)
  }
}

/// Split `a=1&b&c=` into pairs on `&` and the first `=`.
pub(crate) fn split_pairs(text: &str, kind: ParameterKind) -> Vec<HtmlParameter> {
  text
    .split('&')
    .filter(|token| !token.is_empty())
    .map(|token| {
      let (name, value) = token.split_once('=').unwrap_or((token, ""));
      HtmlParameter::new(kind, name, value)
    })
    .collect()
}

pub(crate) fn names(params: &[HtmlParameter]) -> BTreeSet<String> {
  params.iter().map(|p| p.name.clone()).collect()
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> &'a str {
  match line.get(..prefix.len()) {
    Some(head) if head.eq_ignore_ascii_case(prefix) => &line[prefix.len()..],
    _ => line,
  }
}

/// Pairs of a request `Cookie` value. A leading literal `Cookie:` is
/// dropped, but a cookie whose name merely starts with `Cookie` is kept.
pub(crate) fn request_cookies(value: &str) -> Vec<HtmlParameter> {
  strip_prefix_ignore_case(value.trim_start(), "cookie:")
    .split(';')
    .map(str::trim)
    .filter(|token| !token.is_empty())
    .map(|token| {
      let (name, value) = token.split_once('=').unwrap_or((token, ""));
      HtmlParameter::new(ParameterKind::Cookie, name.trim(), value.trim())
    })
    .collect()
}

/// The cookie set by one `Set-Cookie` or `Set-Cookie2` value.
pub(crate) fn response_cookie(value: &str) -> Option<HtmlParameter> {
  let line = value.trim_start();
  let line = strip_prefix_ignore_case(line, "set-cookie2:");
  let line = strip_prefix_ignore_case(line, "set-cookie:").trim();
  if line.is_empty() {
    return None;
  }
  if let Ok(c) = cookie::Cookie::parse(line) {
    return Some(HtmlParameter::new(ParameterKind::Cookie, c.name(), c.value()));
  }
  let first = line.split(';').next().unwrap_or(line).trim();
  let (name, value) = first.split_once('=').unwrap_or((first, ""));
  Some(HtmlParameter::new(ParameterKind::Cookie, name.trim(), value.trim()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pairs_split_on_first_equals() {
    let params = split_pairs("a=1&b&c=x=y&&d=", ParameterKind::Url);
    let rendered: Vec<String> = params.iter().map(|p| p.to_string()).collect();
    assert_eq!(rendered, vec!["a=1", "b=", "c=x=y", "d="]);
    assert_eq!(params[1].value, "");
    assert!(split_pairs("", ParameterKind::Form).is_empty());
  }

  #[test]
  fn values_are_not_decoded() {
    let params = split_pairs("q=a%20b+c", ParameterKind::Url);
    assert_eq!(params[0].value, "a%20b+c");
  }

  #[test]
  fn cookie_prefix_is_stripped_only_when_literal() {
    let stripped = request_cookies("Cookie: a=1; b=2");
    assert_eq!(names(&stripped), ["a", "b"].iter().map(|s| s.to_string()).collect());
    let kept = request_cookies("CookieName=1; other=2");
    assert_eq!(kept[0].name, "CookieName");
    assert_eq!(kept[0].value, "1");
    let lower = request_cookies("cookie:x=9");
    assert_eq!(lower[0].name, "x");
  }

  #[test]
  fn set_cookie_values() {
    let c = response_cookie("SID=abc; Path=/; HttpOnly").unwrap();
    assert_eq!((c.name.as_str(), c.value.as_str()), ("SID", "abc"));
    let c = response_cookie("Set-Cookie2: v2=1; Version=1").unwrap();
    assert_eq!(c.name, "v2");
    let c = response_cookie("Set-CookieToken=z").unwrap();
    assert_eq!(c.name, "Set-CookieToken");
    assert!(response_cookie("  ").is_none());
  }
}
