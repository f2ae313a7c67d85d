use std::fmt;

/// Request method.
///
/// The known verbs are matched once when the request line is parsed; anything
/// else is carried verbatim (upper-cased) in [`Method::Other`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Method {
  /// GET
  #[default]
  Get,
  /// POST
  Post,
  /// PUT
  Put,
  /// DELETE
  Delete,
  /// HEAD
  Head,
  /// OPTIONS
  Options,
  /// TRACE
  Trace,
  /// CONNECT
  Connect,
  /// PATCH
  Patch,
  /// Any other token
  Other(String),
}

impl Method {
  /// Parse a method token, ignoring case.
  pub fn from_token(token: &str) -> Method {
    let upper = token.to_ascii_uppercase();
    match upper.as_str() {
      "GET" => Method::Get,
      "POST" => Method::Post,
      "PUT" => Method::Put,
      "DELETE" => Method::Delete,
      "HEAD" => Method::Head,
      "OPTIONS" => Method::Options,
      "TRACE" => Method::Trace,
      "CONNECT" => Method::Connect,
      "PATCH" => Method::Patch,
      _ => Method::Other(upper),
    }
  }
  /// The verb as written on the request line.
  pub fn as_str(&self) -> &str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
      Method::Trace => "TRACE",
      Method::Connect => "CONNECT",
      Method::Patch => "PATCH",
      Method::Other(verb) => verb,
    }
  }
  /// Methods whose body is usually a form.
  pub fn carries_form(&self) -> bool {
    matches!(self, Method::Post | Method::Put)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl From<&str> for Method {
  fn from(value: &str) -> Self {
    Method::from_token(value)
  }
}
