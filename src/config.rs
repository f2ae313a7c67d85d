use crate::proxy::ProxyChain;
use std::time::Duration;

/// Default `User-Agent` added to requests that carry none.
pub const DEFAULT_USER_AGENT: &str = concat!("interpose/", env!("CARGO_PKG_VERSION"));

/// Connection parameters shared by every sender built from them.
///
/// ```rust
/// use std::time::Duration;
/// use interpose::ConnectionParam;
///
/// let param = ConnectionParam::default()
///   .timeout(Some(Duration::from_secs(5)))
///   .max_retries(1)
///   .user_agent("scanner/1.0");
/// assert_eq!(param.get_max_retries(), 1);
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionParam {
  connect_timeout: Option<Duration>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  max_retries: u32,
  max_redirects: u32,
  user_agent: String,
  single_cookie_request_header: bool,
  use_global_http_state: bool,
  nodelay: bool,
  keepalive: bool,
  max_idle_per_host: usize,
  max_idle_total: usize,
  proxy_chain: Option<ProxyChain>,
}

impl Default for ConnectionParam {
  fn default() -> Self {
    ConnectionParam {
      connect_timeout: Some(Duration::from_secs(10)),
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      max_retries: 3,
      max_redirects: 100,
      user_agent: DEFAULT_USER_AGENT.to_string(),
      single_cookie_request_header: true,
      use_global_http_state: false,
      nodelay: false,
      keepalive: false,
      max_idle_per_host: 10_000,
      max_idle_total: 10_000,
      proxy_chain: None,
    }
  }
}

impl ConnectionParam {
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectionParam {
    self.connect_timeout = timeout;
    self
  }
  /// Per-operation read and write timeout.
  ///
  /// Default is 30 seconds.
  pub fn timeout(mut self, timeout: Option<Duration>) -> ConnectionParam {
    self.read_timeout = timeout;
    self.write_timeout = timeout;
    self
  }
  /// Enables a read timeout.
  ///
  /// The timeout applies to each read operation, and resets after a
  /// successful read.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectionParam {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectionParam {
    self.write_timeout = timeout;
    self
  }
  /// How many times a failed connect, write or read is retried before the
  /// error reaches the caller.
  pub fn max_retries(mut self, retries: u32) -> ConnectionParam {
    self.max_retries = retries;
    self
  }
  /// Hops followed by the general redirect path.
  pub fn max_redirects(mut self, redirects: u32) -> ConnectionParam {
    self.max_redirects = redirects;
    self
  }
  /// `User-Agent` for requests that carry none.
  pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> ConnectionParam {
    self.user_agent = user_agent.into();
    self
  }
  /// Merge `Cookie` lines into one on the wire.
  ///
  /// Default is `true`.
  pub fn single_cookie_request_header(mut self, value: bool) -> ConnectionParam {
    self.single_cookie_request_header = value;
    self
  }
  /// Share one cookie state between requests that have no requesting user.
  pub fn use_global_http_state(mut self, value: bool) -> ConnectionParam {
    self.use_global_http_state = value;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  pub fn nodelay(mut self, value: bool) -> ConnectionParam {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  pub fn keepalive(mut self, value: bool) -> ConnectionParam {
    self.keepalive = value;
    self
  }
  /// Idle connections kept per `scheme://host:port`.
  pub fn max_idle_per_host(mut self, value: usize) -> ConnectionParam {
    self.max_idle_per_host = value;
    self
  }
  /// Idle connections kept per pool.
  pub fn max_idle_total(mut self, value: usize) -> ConnectionParam {
    self.max_idle_total = value;
    self
  }
  /// Route requests through an upstream proxy.
  pub fn proxy_chain(mut self, chain: Option<ProxyChain>) -> ConnectionParam {
    self.proxy_chain = chain;
    self
  }
}

impl ConnectionParam {
  /// connect timeout
  pub fn get_connect_timeout(&self) -> Option<Duration> {
    self.connect_timeout
  }
  /// read timeout
  pub fn get_read_timeout(&self) -> Option<Duration> {
    self.read_timeout
  }
  /// write timeout
  pub fn get_write_timeout(&self) -> Option<Duration> {
    self.write_timeout
  }
  /// retry count for I/O failures
  pub fn get_max_retries(&self) -> u32 {
    self.max_retries
  }
  /// redirect hop limit
  pub fn get_max_redirects(&self) -> u32 {
    self.max_redirects
  }
  /// default user agent
  pub fn get_user_agent(&self) -> &str {
    &self.user_agent
  }
  /// `Cookie` lines are merged on the wire
  pub fn is_single_cookie_request_header(&self) -> bool {
    self.single_cookie_request_header
  }
  /// global cookie state is on
  pub fn is_use_global_http_state(&self) -> bool {
    self.use_global_http_state
  }
  pub(crate) fn is_nodelay(&self) -> bool {
    self.nodelay
  }
  pub(crate) fn is_keepalive(&self) -> bool {
    self.keepalive
  }
  /// per-host idle cap
  pub fn get_max_idle_per_host(&self) -> usize {
    self.max_idle_per_host
  }
  /// per-pool idle cap
  pub fn get_max_idle_total(&self) -> usize {
    self.max_idle_total
  }
  /// upstream proxy
  pub fn get_proxy_chain(&self) -> Option<&ProxyChain> {
    self.proxy_chain.as_ref()
  }
  /// The chain to use for `host`, `None` when there is no chain or the host
  /// is on the skip list.
  pub fn chain_for(&self, host: &str) -> Option<&ProxyChain> {
    self
      .proxy_chain
      .as_ref()
      .filter(|chain| !chain.should_bypass(host))
  }
}
