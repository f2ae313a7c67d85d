//! The request executor.
//!
//! [`HttpSender`] sends a [`Message`] and fills in its response. It owns two
//! connection pools (direct and through the proxy chain), applies the
//! requesting user's cookie state, retries once after re-authentication,
//! follows redirects and calls the registered listeners around every send.
mod listener;
mod pool;
mod reader;
mod user;

use crate::config::ConnectionParam;
use crate::connector::{Connector, Endpoint, Route};
use crate::errors::Result;
use crate::header::{names, Method, RequestHeader, HTTP11};
use crate::message::Message;
use crate::proxy::ProxyChain;
use crate::redirect::{
  is_redirect_status, resolve_location, rewrites_to_get, FollowAll, RedirectionValidator,
};
use crate::tls::TlsProvider;
pub use listener::{HttpSenderListener, ListenerRegistry, NestedSender};
use pool::{Connection, ConnectionPool};
use reader::{ResponseReader, WireResponse};
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::io::BufReader;
pub use user::{RequestingUser, UserState};

/// Who asked for a message to be sent. Passed to listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Initiator {
  /// traffic of an intercepted client
  Proxy,
  /// active scanner
  ActiveScanner,
  /// spider
  Spider,
  /// a request composed by hand
  ManualRequest,
  /// the login request of a requesting user, never re-authenticated
  Authentication,
  /// any other component
  Other(u32),
}

impl fmt::Display for Initiator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Initiator::Proxy => f.write_str("proxy"),
      Initiator::ActiveScanner => f.write_str("active-scanner"),
      Initiator::Spider => f.write_str("spider"),
      Initiator::ManualRequest => f.write_str("manual-request"),
      Initiator::Authentication => f.write_str("authentication"),
      Initiator::Other(id) => write!(f, "other-{}", id),
    }
  }
}

/// Per-send options of [`HttpSender::send_with_config`].
#[derive(Clone, Debug)]
pub struct RequestConfig {
  follow_redirects: bool,
  validator: Arc<dyn RedirectionValidator>,
}

impl Default for RequestConfig {
  fn default() -> Self {
    RequestConfig {
      follow_redirects: true,
      validator: Arc::new(FollowAll),
    }
  }
}

impl RequestConfig {
  /// Follow redirects or not, accepting every target.
  pub fn new(follow_redirects: bool) -> RequestConfig {
    RequestConfig {
      follow_redirects,
      ..Default::default()
    }
  }
  /// Check each redirect target with `validator`.
  pub fn validator(mut self, validator: Arc<dyn RedirectionValidator>) -> RequestConfig {
    self.validator = validator;
    self
  }
  /// Redirects are followed.
  pub fn is_follow_redirects(&self) -> bool {
    self.follow_redirects
  }
}

#[derive(Debug)]
struct SenderRef {
  param: ConnectionParam,
  connector: Connector,
  listeners: Arc<ListenerRegistry>,
  direct: ConnectionPool,
  proxied: ConnectionPool,
  global_state: Arc<UserState>,
}

/// Sends messages. Cheap to clone, clones share pools and listeners.
///
/// ```rust,no_run
/// # use interpose::{HttpSender, Message};
/// # async fn run() -> interpose::Result<()> {
/// let sender = HttpSender::builder().build()?;
/// let mut msg = Message::parse_request("GET http://example.com/ HTTP/1.1\r\n\r\n", "")?;
/// sender.send(&mut msg, true).await?;
/// println!("{}", msg.response_header().status_code());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct HttpSender {
  inner: Arc<SenderRef>,
  initiator: Initiator,
}

impl HttpSender {
  /// Constructs a new `SenderBuilder`.
  pub fn builder() -> SenderBuilder {
    SenderBuilder::default()
  }
  /// Who this sender sends for.
  pub fn initiator(&self) -> Initiator {
    self.initiator
  }
  /// The same sender, sending for `initiator`.
  pub fn with_initiator(&self, initiator: Initiator) -> HttpSender {
    HttpSender {
      inner: self.inner.clone(),
      initiator,
    }
  }
  /// Connection parameters.
  pub fn param(&self) -> &ConnectionParam {
    &self.inner.param
  }
  /// Registered listeners.
  pub fn listeners(&self) -> &Arc<ListenerRegistry> {
    &self.inner.listeners
  }
  /// State used for messages without requesting user when
  /// `use_global_http_state` is on.
  pub fn global_state(&self) -> &Arc<UserState> {
    &self.inner.global_state
  }
  /// Close every idle pooled connection.
  pub fn shutdown(&self) {
    self.inner.direct.clear();
    self.inner.proxied.clear();
  }

  /// Send `message` and store the response in it.
  ///
  /// With `follow_redirects`, a `POST` or `PUT` follows one redirect as a
  /// `GET`. Other methods follow up to the configured number of hops. The
  /// sent time and elapsed time cover the whole operation.
  pub async fn send(&self, message: &mut Message, follow_redirects: bool) -> Result<()> {
    self.send_message(message, follow_redirects, true).await
  }

  /// Send `message` with a redirect validator that scopes each hop.
  pub async fn send_with_config(&self, message: &mut Message, config: &RequestConfig) -> Result<()> {
    let started = Instant::now();
    message.set_time_sent(SystemTime::now());
    let result = if config.follow_redirects {
      self
        .follow_redirects(message, config.validator.as_ref(), true)
        .await
    } else {
      self.send_authenticated(message, true).await
    };
    message.set_time_elapsed(started.elapsed());
    result
  }

  pub(crate) async fn send_message(
    &self,
    message: &mut Message,
    follow_redirects: bool,
    notify: bool,
  ) -> Result<()> {
    let started = Instant::now();
    message.set_time_sent(SystemTime::now());
    tracing::debug!(
      "sending {} {}",
      message.request_header().method(),
      message.request_header().uri()
    );
    let result = if !follow_redirects {
      self.send_authenticated(message, notify).await
    } else if message.request_header().method().carries_form() {
      self.follow_once(message, notify).await
    } else {
      self.follow_redirects(message, &FollowAll, notify).await
    };
    message.set_time_elapsed(started.elapsed());
    tracing::debug!(
      "received {} after {:?}",
      message.response_header().status_code(),
      message.time_elapsed()
    );
    result
  }

  // POST/PUT 只跟随一次跳转
  async fn follow_once(&self, message: &mut Message, notify: bool) -> Result<()> {
    self.send_authenticated(message, notify).await?;
    let status = message.response_header().status_code();
    if !(300..400).contains(&status) || status == 304 {
      return Ok(());
    }
    let Some(location) = message.response_header().header(names::LOCATION) else {
      return Ok(());
    };
    let next_uri = resolve_location(message.request_header().uri(), location)?;
    let mut next = message.clone_request();
    let header = next.request_header_mut();
    header.set_uri(next_uri)?;
    header.set_method(Method::Get);
    header.set_header(names::CONTENT_LENGTH, None);
    next.request_body_mut().clear();
    self.send_authenticated(&mut next, notify).await?;
    adopt_response(message, next);
    Ok(())
  }

  async fn follow_redirects(
    &self,
    message: &mut Message,
    validator: &dyn RedirectionValidator,
    notify: bool,
  ) -> Result<()> {
    self.send_authenticated(message, notify).await?;
    validator.notify_received(message);
    let max_redirects = self.inner.param.get_max_redirects();
    let mut current: Option<Message> = None;
    let mut hops = 0;
    while hops < max_redirects {
      let last = current.as_ref().unwrap_or(message);
      let status = last.response_header().status_code();
      if !is_redirect_status(status) {
        break;
      }
      let Some(location) = last.response_header().header(names::LOCATION) else {
        break;
      };
      let next_uri = resolve_location(last.request_header().uri(), location)?;
      if !validator.is_valid(&next_uri) {
        tracing::warn!("redirect to {} rejected", next_uri);
        break;
      }
      let mut next = last.clone_request();
      let header = next.request_header_mut();
      header.set_uri(next_uri)?;
      if rewrites_to_get(status) {
        if !matches!(header.method(), Method::Get | Method::Head) {
          header.set_method(Method::Get);
        }
        header.set_header(names::CONTENT_TYPE, None);
        header.set_header(names::CONTENT_LENGTH, None);
        next.request_body_mut().clear();
      }
      self.send_authenticated(&mut next, notify).await?;
      validator.notify_received(&next);
      hops += 1;
      current = Some(next);
    }
    if let Some(last) = current {
      adopt_response(message, last);
    }
    Ok(())
  }

  async fn send_authenticated(&self, message: &mut Message, notify: bool) -> Result<()> {
    let user = message.requesting_user().cloned();
    if let Some(user) = &user {
      user.process_message_to_match_user(message);
    }
    self.send_notified(message, notify).await?;
    if let Some(user) = user {
      if self.initiator != Initiator::Authentication && !user.is_authenticated(message) {
        tracing::debug!("response not authenticated for {:?}, retrying once", user);
        user.queue_authentication(message).await;
        user.process_message_to_match_user(message);
        self.send_notified(message, notify).await?;
      }
    }
    Ok(())
  }

  async fn send_notified(&self, message: &mut Message, notify: bool) -> Result<()> {
    if notify {
      self.inner.listeners.notify_request(message, self).await;
    }
    self.send_with_retries(message).await?;
    if notify {
      self.inner.listeners.notify_response(message, self).await;
    }
    Ok(())
  }

  async fn send_with_retries(&self, message: &mut Message) -> Result<()> {
    let state = self.state_for(message);
    let max_retries = self.inner.param.get_max_retries();
    let mut attempt = 0;
    loop {
      match self.exchange(message, state.as_deref()).await {
        Ok(()) => break,
        Err(e) if e.is_io() && attempt < max_retries => {
          attempt += 1;
          tracing::warn!(
            "{} failed ({}), retry {}/{}",
            message.request_header().uri(),
            e,
            attempt,
            max_retries
          );
        }
        Err(e) => return Err(e),
      }
    }
    if let Some(state) = state {
      let set_cookies = message.response_header().headers(names::SET_COOKIE);
      if !set_cookies.is_empty() {
        state
          .cookie_jar()
          .set_cookies(set_cookies, message.request_header().uri());
      }
    }
    Ok(())
  }

  fn state_for(&self, message: &Message) -> Option<Arc<UserState>> {
    match message.requesting_user() {
      Some(user) => Some(user.state()),
      None if self.inner.param.is_use_global_http_state() => Some(self.inner.global_state.clone()),
      None => None,
    }
  }

  /// One request and response over a pooled or new connection.
  async fn exchange(&self, message: &mut Message, state: Option<&UserState>) -> Result<()> {
    let endpoint = Endpoint::of(message.request_header());
    let chain = self.inner.param.chain_for(&endpoint.host).cloned();
    let pool = if chain.is_some() {
      &self.inner.proxied
    } else {
      &self.inner.direct
    };
    let upgrade = message.is_upgrade_request();
    let key = endpoint.key();
    let cookie = state.and_then(|s| s.cookie_jar().cookies(message.request_header().uri()));
    let method = message.request_header().method().clone();

    let pooled = if upgrade { None } else { pool.take(&key) };
    let (mut conn, route, response) = match pooled {
      Some((mut conn, route)) => {
        let wire = self.render(message, route, cookie.as_deref(), None);
        match round_trip(&mut conn, &wire, &method).await {
          Ok(response) => (conn, route, response),
          // 复用的连接可能已被对端关闭，换新连接重发
          Err(e) if e.is_io() => {
            tracing::debug!("pooled connection to {} is stale: {}", key, e);
            self.fresh_round_trip(message, &endpoint, chain.as_ref(), cookie.as_deref()).await?
          }
          Err(e) => return Err(e),
        }
      }
      None => {
        self
          .fresh_round_trip(message, &endpoint, chain.as_ref(), cookie.as_deref())
          .await?
      }
    };

    let (conn, route, response) = match (&chain, route, response.header.status_code()) {
      (Some(chain), Route::Forward, 407)
        if message
          .request_header()
          .header(names::PROXY_AUTHORIZATION)
          .is_none() =>
      {
        let challenges = response.header.headers(names::PROXY_AUTHENTICATE);
        match chain.authorization_for(&challenges) {
          Some(auth) => {
            let wire = self.render(message, route, cookie.as_deref(), Some(&auth));
            let reusable = !response.until_close && !response.header.is_connection_close();
            if !reusable {
              let (socket, _) = self.inner.connector.open(&endpoint, Some(chain)).await?;
              conn = BufReader::new(socket);
            }
            let response = round_trip(&mut conn, &wire, &method).await?;
            (conn, route, response)
          }
          None => (conn, route, response),
        }
      }
      _ => (conn, route, response),
    };

    let WireResponse {
      header,
      body,
      until_close,
    } = response;
    let reusable = !until_close
      && !header.is_connection_close()
      && !message.request_header().is_connection_close();
    let switched = header.status_code() == 101;
    message.set_response_header(header);
    message.set_response_body(body);
    if upgrade && switched {
      message.set_upgraded_connection(Some(Arc::new(tokio::sync::Mutex::new(conn))));
    } else if reusable && !upgrade && !switched {
      pool.put(key, conn, route);
    }
    Ok(())
  }

  async fn fresh_round_trip(
    &self,
    message: &Message,
    endpoint: &Endpoint,
    chain: Option<&ProxyChain>,
    cookie: Option<&str>,
  ) -> Result<(Connection, Route, WireResponse)> {
    let (socket, route) = self.inner.connector.open(endpoint, chain).await?;
    let mut conn = BufReader::new(socket);
    let wire = self.render(message, route, cookie, None);
    let method = message.request_header().method().clone();
    let response = round_trip(&mut conn, &wire, &method).await?;
    Ok((conn, route, response))
  }

  /// The request as written to the connection.
  fn render(
    &self,
    message: &Message,
    route: Route,
    state_cookie: Option<&str>,
    proxy_authorization: Option<&str>,
  ) -> Vec<u8> {
    let header = message.request_header();
    let body = message.request_body().as_bytes();
    let param = &self.inner.param;
    let target = match route {
      Route::Forward => header.absolute_form(),
      Route::Direct | Route::Tunnel => header.origin_form(),
    };
    let version = if header.version().is_empty() {
      HTTP11
    } else {
      header.version()
    };
    let mut wire = format!("{} {} {}\r\n", header.method(), target, version);
    if header.header(names::HOST).is_none() {
      wire.push_str(&format!("{}: {}\r\n", names::HOST, host_value(header)));
    }
    let mut cookies = Vec::new();
    for field in header.header_fields() {
      if param.is_single_cookie_request_header() && field.name.matches(names::COOKIE) {
        cookies.push(field.value.as_str());
        continue;
      }
      wire.push_str(&format!("{}: {}\r\n", field.name, field.value));
    }
    if !cookies.is_empty() {
      wire.push_str(&format!("{}: {}\r\n", names::COOKIE, cookies.join("; ")));
    } else if let Some(cookie) = state_cookie.filter(|_| header.header(names::COOKIE).is_none()) {
      wire.push_str(&format!("{}: {}\r\n", names::COOKIE, cookie));
    }
    if !body.is_empty()
      && header.header(names::CONTENT_LENGTH).is_none()
      && !header.is_transfer_encoding_chunked()
    {
      wire.push_str(&format!("{}: {}\r\n", names::CONTENT_LENGTH, body.len()));
    }
    if header.header(names::USER_AGENT).is_none() && !param.get_user_agent().is_empty() {
      wire.push_str(&format!("{}: {}\r\n", names::USER_AGENT, param.get_user_agent()));
    }
    if let Some(auth) = proxy_authorization {
      wire.push_str(&format!("{}: {}\r\n", names::PROXY_AUTHORIZATION, auth));
    }
    wire.push_str("\r\n");
    let mut raw = wire.into_bytes();
    raw.extend_from_slice(body);
    raw
  }
}

fn host_value(header: &RequestHeader) -> String {
  let default_port = if header.is_secure() { 443 } else { 80 };
  if header.port() == default_port {
    header.host().to_string()
  } else {
    header.host_port()
  }
}

async fn round_trip(conn: &mut Connection, wire: &[u8], method: &Method) -> Result<WireResponse> {
  let socket = conn.get_mut();
  socket.write_all(wire).await?;
  socket.flush().await?;
  let timeout = conn.get_ref().read_timeout();
  ResponseReader::new(conn, method.clone(), timeout).read().await
}

// 把跳转后拿到的响应放回原消息
fn adopt_response(message: &mut Message, mut last: Message) {
  message.set_response_header(last.response_header().clone());
  message.set_response_body(std::mem::take(last.response_body_mut()));
  message.set_upgraded_connection(last.take_upgraded_connection());
}

/// A `SenderBuilder` can be used to create a `HttpSender` with custom
/// configuration.
#[derive(Debug)]
pub struct SenderBuilder {
  param: ConnectionParam,
  tls: Option<Arc<TlsProvider>>,
  listeners: Arc<ListenerRegistry>,
  initiator: Initiator,
}

impl Default for SenderBuilder {
  fn default() -> Self {
    SenderBuilder {
      param: ConnectionParam::default(),
      tls: None,
      listeners: Arc::new(ListenerRegistry::default()),
      initiator: Initiator::ManualRequest,
    }
  }
}

impl SenderBuilder {
  /// Connection parameters.
  pub fn param(mut self, param: ConnectionParam) -> SenderBuilder {
    self.param = param;
    self
  }
  /// Share a TLS provider. A provider with a generated root is created
  /// otherwise.
  pub fn tls(mut self, tls: Arc<TlsProvider>) -> SenderBuilder {
    self.tls = Some(tls);
    self
  }
  /// Share a listener registry.
  pub fn listeners(mut self, listeners: Arc<ListenerRegistry>) -> SenderBuilder {
    self.listeners = listeners;
    self
  }
  /// Who the sender sends for.
  pub fn initiator(mut self, initiator: Initiator) -> SenderBuilder {
    self.initiator = initiator;
    self
  }
  /// Returns a `HttpSender` that uses this `SenderBuilder` configuration.
  pub fn build(self) -> Result<HttpSender> {
    let tls = match self.tls {
      Some(tls) => tls,
      None => Arc::new(TlsProvider::with_generated_ca()?),
    };
    let param = self.param;
    let connector = Connector::new(&param, tls);
    let (per_host, total) = (param.get_max_idle_per_host(), param.get_max_idle_total());
    Ok(HttpSender {
      inner: Arc::new(SenderRef {
        connector,
        listeners: self.listeners,
        direct: ConnectionPool::new(per_host, total),
        proxied: ConnectionPool::new(per_host, total),
        global_state: Arc::new(UserState::default()),
        param,
      }),
      initiator: self.initiator,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sender(param: ConnectionParam) -> HttpSender {
    HttpSender::builder().param(param).build().unwrap()
  }

  fn wire(sender: &HttpSender, raw: &str, body: &str, route: Route) -> String {
    let msg = Message::parse_request(raw, body).unwrap();
    String::from_utf8(sender.render(&msg, route, None, None)).unwrap()
  }

  #[test]
  fn render_adds_missing_headers() {
    let s = sender(ConnectionParam::default().user_agent("ua/1"));
    let out = wire(
      &s,
      "POST http://ex.com:8080/p?q=1 HTTP/1.1\r\nCookie: a=1\r\nCookie: b=2\r\n\r\n",
      "x=1",
      Route::Direct,
    );
    assert!(out.starts_with("POST /p?q=1 HTTP/1.1\r\n"));
    assert!(out.contains("Host: ex.com:8080\r\n"));
    assert!(out.contains("Cookie: a=1; b=2\r\n"));
    assert!(out.contains("Content-Length: 3\r\n"));
    assert!(out.contains("User-Agent: ua/1\r\n"));
    assert!(out.ends_with("\r\n\r\nx=1"));
  }

  #[test]
  fn render_keeps_cookie_lines_when_merging_is_off() {
    let s = sender(ConnectionParam::default().single_cookie_request_header(false));
    let out = wire(
      &s,
      "GET / HTTP/1.1\r\nHost: ex.com\r\nCookie: a=1\r\nCookie: b=2\r\n\r\n",
      "",
      Route::Direct,
    );
    assert!(out.contains("Cookie: a=1\r\n"));
    assert!(out.contains("Cookie: b=2\r\n"));
    assert!(!out.contains("Content-Length"));
  }

  #[test]
  fn forward_route_uses_absolute_form() {
    let s = sender(ConnectionParam::default());
    let out = wire(&s, "GET /x HTTP/1.1\r\nHost: ex.com\r\n\r\n", "", Route::Forward);
    assert!(out.starts_with("GET http://ex.com/x HTTP/1.1\r\n"));
    assert_eq!(out.matches("Host:").count(), 1);
  }

  #[test]
  fn initiator_display() {
    assert_eq!(Initiator::Other(7).to_string(), "other-7");
    assert_eq!(Initiator::ActiveScanner.to_string(), "active-scanner");
  }
}
