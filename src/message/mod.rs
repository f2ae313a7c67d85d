//! A request paired with its optional response.
mod params;

use crate::body::Body;
use crate::errors::Result;
use crate::header::{names, Method, RequestHeader, ResponseHeader, FORM_URLENCODED};
use crate::sender::RequestingUser;
use crate::socket::UpgradedConnection;
pub use params::{HtmlParameter, ParameterKind};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// One HTTP exchange.
///
/// The request side is always present. An empty response header means the
/// request has not been sent yet.
#[derive(Clone, Default)]
pub struct Message {
  request_header: RequestHeader,
  request_body: Body,
  response_header: ResponseHeader,
  response_body: Body,
  time_sent: Option<SystemTime>,
  time_elapsed: Option<Duration>,
  tags: Vec<String>,
  note: String,
  history_ref: Option<u64>,
  requesting_user: Option<Arc<dyn RequestingUser>>,
  upgraded: Option<UpgradedConnection>,
}

impl Message {
  /// A message for `request_header` with an empty body.
  pub fn new(request_header: RequestHeader) -> Message {
    Message {
      request_header,
      ..Default::default()
    }
  }
  /// A message with both request parts.
  pub fn with_body<B: Into<Body>>(request_header: RequestHeader, body: B) -> Message {
    Message {
      request_header,
      request_body: body.into(),
      ..Default::default()
    }
  }
  /// Parse raw request header text and attach `body`.
  pub fn parse_request<B: Into<Body>>(header: &str, body: B) -> Result<Message> {
    Ok(Message::with_body(RequestHeader::parse(header)?, body))
  }
}

impl Message {
  /// Request header.
  pub fn request_header(&self) -> &RequestHeader {
    &self.request_header
  }
  /// Mutable request header.
  pub fn request_header_mut(&mut self) -> &mut RequestHeader {
    &mut self.request_header
  }
  /// Replace the request header.
  pub fn set_request_header(&mut self, header: RequestHeader) {
    self.request_header = header;
  }
  /// Request body.
  pub fn request_body(&self) -> &Body {
    &self.request_body
  }
  /// Mutable request body.
  pub fn request_body_mut(&mut self) -> &mut Body {
    &mut self.request_body
  }
  /// Replace the request body.
  pub fn set_request_body<B: Into<Body>>(&mut self, body: B) {
    self.request_body = body.into();
  }
  /// Response header, empty before the first send.
  pub fn response_header(&self) -> &ResponseHeader {
    &self.response_header
  }
  /// Mutable response header.
  pub fn response_header_mut(&mut self) -> &mut ResponseHeader {
    &mut self.response_header
  }
  /// Replace the response header. The response body follows its
  /// `Content-Type` charset and `Content-Encoding`.
  pub fn set_response_header(&mut self, header: ResponseHeader) {
    self.response_body.set_charset(header.charset());
    self
      .response_body
      .set_content_encoding(header.header(names::CONTENT_ENCODING));
    self.response_header = header;
  }
  /// Response body.
  pub fn response_body(&self) -> &Body {
    &self.response_body
  }
  /// Mutable response body.
  pub fn response_body_mut(&mut self) -> &mut Body {
    &mut self.response_body
  }
  /// Replace the response body, keeping the charset of the response header.
  pub fn set_response_body<B: Into<Body>>(&mut self, body: B) {
    let mut body = body.into();
    body.set_charset(self.response_header.charset());
    body.set_content_encoding(self.response_header.header(names::CONTENT_ENCODING));
    self.response_body = body;
  }
  /// Drop the response so the message looks unsent.
  pub fn clear_response(&mut self) {
    self.response_header = ResponseHeader::default();
    self.response_body = Body::default();
    self.upgraded = None;
  }
  /// When the send started.
  pub fn time_sent(&self) -> Option<SystemTime> {
    self.time_sent
  }
  /// Record when the send started.
  pub fn set_time_sent(&mut self, time: SystemTime) {
    self.time_sent = Some(time);
  }
  /// Duration of the whole send, redirects included.
  pub fn time_elapsed(&self) -> Option<Duration> {
    self.time_elapsed
  }
  /// Record the duration of the send.
  pub fn set_time_elapsed(&mut self, elapsed: Duration) {
    self.time_elapsed = Some(elapsed);
  }
  /// Free-form tags.
  pub fn tags(&self) -> &[String] {
    &self.tags
  }
  /// Add a tag once.
  pub fn add_tag<S: Into<String>>(&mut self, tag: S) {
    let tag = tag.into();
    if !self.tags.contains(&tag) {
      self.tags.push(tag);
    }
  }
  /// Remove a tag, returning whether it was there.
  pub fn remove_tag(&mut self, tag: &str) -> bool {
    let before = self.tags.len();
    self.tags.retain(|t| t != tag);
    before != self.tags.len()
  }
  /// Free-form note.
  pub fn note(&self) -> &str {
    &self.note
  }
  /// Replace the note.
  pub fn set_note<S: Into<String>>(&mut self, note: S) {
    self.note = note.into();
  }
  /// Opaque reference to a persisted history record.
  pub fn history_ref(&self) -> Option<u64> {
    self.history_ref
  }
  /// Attach a history reference.
  pub fn set_history_ref(&mut self, history_ref: Option<u64>) {
    self.history_ref = history_ref;
  }
  /// The identity the request is sent as.
  pub fn requesting_user(&self) -> Option<&Arc<dyn RequestingUser>> {
    self.requesting_user.as_ref()
  }
  /// Send the request as `user`.
  pub fn set_requesting_user(&mut self, user: Option<Arc<dyn RequestingUser>>) {
    self.requesting_user = user;
  }
  /// Connection left open by a `101 Switching Protocols` response.
  pub fn upgraded_connection(&self) -> Option<&UpgradedConnection> {
    self.upgraded.as_ref()
  }
  /// Take the upgraded connection out of the message.
  pub fn take_upgraded_connection(&mut self) -> Option<UpgradedConnection> {
    self.upgraded.take()
  }
  pub(crate) fn set_upgraded_connection(&mut self, connection: Option<UpgradedConnection>) {
    self.upgraded = connection;
  }
}

impl Message {
  /// The request asks to switch protocols (`Connection: Upgrade`).
  pub fn is_upgrade_request(&self) -> bool {
    self.request_header.is_upgrade()
  }

  /// Same method, host, port and path-and-query (case-insensitive), and for
  /// POST the same raw body.
  pub fn same_request(&self, other: &Message) -> bool {
    let (a, b) = (&self.request_header, &other.request_header);
    if !same_target(a, b) {
      return false;
    }
    if !path_and_query(a).eq_ignore_ascii_case(&path_and_query(b)) {
      return false;
    }
    if *a.method() == Method::Post {
      return self.request_body.as_bytes() == other.request_body.as_bytes();
    }
    true
  }

  /// Same method, host, port and path; query and POST body are compared
  /// only by their parameter names.
  pub fn same_request_type(&self, other: &Message) -> bool {
    let (a, b) = (&self.request_header, &other.request_header);
    if !same_target(a, b) || !a.uri().path().eq_ignore_ascii_case(b.uri().path()) {
      return false;
    }
    // names are folded to lower case so that same_request implies this
    let folded = |params: Vec<HtmlParameter>| -> BTreeSet<String> {
      params.into_iter().map(|p| p.name.to_ascii_lowercase()).collect()
    };
    if folded(self.url_params()) != folded(other.url_params()) {
      return false;
    }
    if *a.method() == Method::Post {
      let body = |m: &Message| params::split_pairs(m.request_body.text(), ParameterKind::Form);
      return folded(body(self)) == folded(body(other));
    }
    true
  }

  /// Query string parameters.
  pub fn url_params(&self) -> Vec<HtmlParameter> {
    self
      .request_header
      .uri()
      .query()
      .map(|q| params::split_pairs(q, ParameterKind::Url))
      .unwrap_or_default()
  }

  /// Body parameters of an urlencoded request.
  pub fn form_params(&self) -> Vec<HtmlParameter> {
    let is_form = self
      .request_header
      .header(names::CONTENT_TYPE)
      .map(|ct| ct.to_ascii_lowercase().contains(FORM_URLENCODED))
      .unwrap_or(false);
    if !is_form {
      return Vec::new();
    }
    params::split_pairs(self.request_body.text(), ParameterKind::Form)
  }

  /// Cookies sent with the request and cookies set by the response.
  pub fn cookie_params(&self) -> Vec<HtmlParameter> {
    let mut out: Vec<HtmlParameter> = self
      .request_header
      .headers(names::COOKIE)
      .into_iter()
      .flat_map(params::request_cookies)
      .collect();
    for name in [names::SET_COOKIE, names::SET_COOKIE2] {
      out.extend(
        self
          .response_header
          .headers(name)
          .into_iter()
          .filter_map(params::response_cookie),
      );
    }
    out
  }

  /// Parameter names of one kind.
  pub fn param_names(&self, kind: ParameterKind) -> BTreeSet<String> {
    let params = match kind {
      ParameterKind::Url => self.url_params(),
      ParameterKind::Form => self.form_params(),
      ParameterKind::Cookie => self.cookie_params(),
    };
    params::names(&params)
  }

  /// Change the method, moving parameters between query and body when
  /// switching between GET and a form-carrying method.
  pub fn mutate_method(&mut self, method: Method) -> Result<()> {
    let current = self.request_header.method().clone();
    if current == method {
      return Ok(());
    }
    let uri = self.request_header.uri().clone();
    if current == Method::Get && method.carries_form() {
      let query = uri.query().unwrap_or_default().to_string();
      self.request_header.set_uri(with_query(&uri, None)?)?;
      self.request_header.set_method(method);
      self
        .request_header
        .set_header(names::CONTENT_TYPE, Some(FORM_URLENCODED));
      self.request_body.set_bytes(query.into_bytes());
      self
        .request_header
        .set_content_length(self.request_body.len() as u64);
    } else if current.carries_form() && method == Method::Get {
      let body = self.request_body.text().to_string();
      let query = match (uri.query(), body.is_empty()) {
        (Some(q), false) => Some(format!("{}&{}", q, body)),
        (Some(q), true) => Some(q.to_string()),
        (None, false) => Some(body),
        (None, true) => None,
      };
      self
        .request_header
        .set_uri(with_query(&uri, query.as_deref())?)?;
      self.request_header.set_method(method);
      self.request_header.set_header(names::CONTENT_TYPE, None);
      self.request_header.set_header(names::CONTENT_LENGTH, None);
      self.request_body.clear();
    } else {
      self.request_header.set_method(method);
    }
    Ok(())
  }

  /// Copy of the request side, re-parsed from its serialised form so that
  /// nothing is shared with this message.
  pub fn clone_request(&self) -> Message {
    let header = RequestHeader::parse_lenient(
      &self.request_header.to_string(),
      self.request_header.is_secure(),
    );
    let mut body = Body::from(self.request_body.as_bytes());
    body.set_charset(self.request_body.charset_override().map(str::to_string));
    Message {
      request_header: header,
      request_body: body,
      requesting_user: self.requesting_user.clone(),
      ..Default::default()
    }
  }

  /// [`Message::clone_request`] plus a copy of the response, if any.
  pub fn clone_all(&self) -> Message {
    let mut msg = self.clone_request();
    if !self.response_header.is_empty() {
      msg.set_response_header(ResponseHeader::parse_lenient(
        &self.response_header.to_string(),
      ));
      msg.set_response_body(self.response_body.as_bytes());
    }
    msg
  }
}

impl fmt::Debug for Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Message")
      .field("request", &self.request_header.start_line())
      .field("response", &self.response_header.start_line())
      .field("time_sent", &self.time_sent)
      .field("time_elapsed", &self.time_elapsed)
      .field("tags", &self.tags)
      .field("history_ref", &self.history_ref)
      .finish()
  }
}

fn same_target(a: &RequestHeader, b: &RequestHeader) -> bool {
  a.method().as_str().eq_ignore_ascii_case(b.method().as_str())
    && a.host().eq_ignore_ascii_case(b.host())
    && a.port() == b.port()
}

fn path_and_query(h: &RequestHeader) -> String {
  h.uri()
    .path_and_query()
    .map(|p| p.as_str().to_string())
    .unwrap_or_else(|| "/".to_string())
}

fn with_query(uri: &http::Uri, query: Option<&str>) -> Result<http::Uri> {
  let mut parts = uri.clone().into_parts();
  let path = uri.path();
  let path_and_query = match query {
    Some(q) => format!("{}?{}", path, q),
    None => path.to_string(),
  };
  parts.path_and_query = Some(path_and_query.parse()?);
  Ok(http::Uri::from_parts(parts)?)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn get(target: &str) -> Message {
    Message::parse_request(&format!("GET {} HTTP/1.1\r\nHost: ex.com\r\n\r\n", target), "").unwrap()
  }

  fn post(body: &str) -> Message {
    Message::parse_request(
      "POST http://ex.com/login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n",
      body,
    )
    .unwrap()
  }

  #[test]
  fn request_line_and_parameters() {
    let msg = get("/a?x=1&y=2");
    assert_eq!(msg.request_header().method(), &Method::Get);
    assert_eq!(msg.request_header().host(), "ex.com");
    assert_eq!(msg.request_header().port(), 80);
    let names: Vec<String> = msg.param_names(ParameterKind::Url).into_iter().collect();
    assert_eq!(names, vec!["x", "y"]);
  }

  #[test]
  fn equal_type_but_not_equal() {
    let a = get("http://ex.com/p?a=1");
    let b = get("http://ex.com/p?a=2");
    assert!(a.same_request_type(&b));
    assert!(b.same_request_type(&a));
    assert!(a.same_request_type(&a));
    assert!(!a.same_request(&b));
    assert!(a.same_request(&a.clone_request()));
  }

  #[test]
  fn equality_ignores_case_of_host_and_path() {
    let a = get("http://EX.com/P?A=1");
    let b = get("http://ex.com/p?a=1");
    assert!(a.same_request(&b));
    assert!(a.same_request_type(&b));
    let c = get("http://ex.com:8080/p?a=1");
    assert!(!c.same_request(&b));
    assert!(!c.same_request_type(&b));
  }

  #[test]
  fn post_bodies() {
    let a = post("user=a&pass=b");
    let b = post("user=c&pass=d");
    let c = post("user=c");
    assert!(!a.same_request(&b));
    assert!(a.same_request(&post("user=a&pass=b")));
    assert!(a.same_request_type(&b));
    assert!(!a.same_request_type(&c));
    assert_eq!(a.form_params().len(), 2);
  }

  #[test]
  fn form_params_need_urlencoded_body() {
    let msg = Message::parse_request(
      "POST http://ex.com/ HTTP/1.1\r\nContent-Type: application/json\r\n\r\n",
      "a=1",
    )
    .unwrap();
    assert!(msg.form_params().is_empty());
  }

  #[test]
  fn cookie_parameters_from_both_sides() {
    let mut msg = Message::parse_request(
      "GET http://ex.com/ HTTP/1.1\r\nCookie: CookieName=1; b=2\r\nCookie: c=3\r\n\r\n",
      "",
    )
    .unwrap();
    msg.set_response_header(
      ResponseHeader::parse("HTTP/1.1 200 OK\r\nSet-Cookie: sid=x; Path=/\r\n\r\n").unwrap(),
    );
    let names: Vec<String> = msg.cookie_params().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["CookieName", "b", "c", "sid"]);
  }

  #[test]
  fn clones_share_nothing() {
    let mut msg = post("a=1");
    msg.set_response_header(
      ResponseHeader::parse("HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n").unwrap(),
    );
    msg.set_response_body("ok");
    let mut copy = msg.clone_all();
    copy.request_header_mut().set_header("X-New", Some("1"));
    copy.response_body_mut().set_bytes("changed");
    assert_eq!(msg.request_header().header("X-New"), None);
    assert_eq!(msg.response_body().text(), "ok");
    assert_eq!(copy.response_header().status_code(), 200);
    assert!(msg.clone_request().response_header().is_empty());
  }

  #[test]
  fn response_charset_follows_header() {
    let mut msg = get("/");
    msg.set_response_body(vec![0xe9]);
    msg.set_response_header(
      ResponseHeader::parse("HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=ISO-8859-1\r\n\r\n").unwrap(),
    );
    assert_eq!(msg.response_body().text(), "é");
  }

  #[test]
  fn mutate_method_moves_parameters() {
    let mut msg = get("/p?a=1&b=2");
    msg.mutate_method(Method::Post).unwrap();
    assert_eq!(msg.request_header().uri().query(), None);
    assert_eq!(msg.request_body().text(), "a=1&b=2");
    assert_eq!(msg.request_header().header("Content-Length"), Some("7"));
    msg.mutate_method(Method::Get).unwrap();
    assert_eq!(msg.request_header().uri().query(), Some("a=1&b=2"));
    assert!(msg.request_body().is_empty());
    assert_eq!(msg.request_header().header("Content-Type"), None);
  }

  #[test]
  fn tags_and_metadata() {
    let mut msg = get("/");
    msg.add_tag("x");
    msg.add_tag("x");
    assert_eq!(msg.tags(), ["x".to_string()]);
    assert!(msg.remove_tag("x"));
    msg.set_note("n");
    msg.set_history_ref(Some(7));
    assert_eq!((msg.note(), msg.history_ref()), ("n", Some(7)));
  }
}
