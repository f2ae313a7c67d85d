use crate::connector::Route;
use crate::socket::Socket;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio::io::BufReader;

pub(crate) type Connection = BufReader<Socket>;

/// Idle keep-alive connections keyed by `scheme://host:port`.
pub(crate) struct ConnectionPool {
  idle: Mutex<HashMap<String, Vec<(Connection, Route)>>>,
  max_per_host: usize,
  max_total: usize,
}

impl fmt::Debug for ConnectionPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionPool")
      .field("idle", &self.idle_count())
      .field("max_per_host", &self.max_per_host)
      .field("max_total", &self.max_total)
      .finish()
  }
}

impl ConnectionPool {
  pub(crate) fn new(max_per_host: usize, max_total: usize) -> ConnectionPool {
    ConnectionPool {
      idle: Mutex::new(HashMap::new()),
      max_per_host,
      max_total,
    }
  }

  /// Most recently returned connection for `key`.
  pub(crate) fn take(&self, key: &str) -> Option<(Connection, Route)> {
    let mut idle = self.idle.lock().ok()?;
    let entry = idle.get_mut(key)?;
    let conn = entry.pop();
    if entry.is_empty() {
      idle.remove(key);
    }
    if conn.is_some() {
      tracing::debug!("reusing pooled connection to {}", key);
    }
    conn
  }

  /// Keep `conn` for reuse. It is dropped when a cap is reached.
  pub(crate) fn put(&self, key: String, conn: Connection, route: Route) {
    let Ok(mut idle) = self.idle.lock() else {
      return;
    };
    let total: usize = idle.values().map(Vec::len).sum();
    if total >= self.max_total {
      return;
    }
    let entry = idle.entry(key).or_default();
    if entry.len() < self.max_per_host {
      entry.push((conn, route));
    }
  }

  pub(crate) fn idle_count(&self) -> usize {
    self
      .idle
      .lock()
      .map(|idle| idle.values().map(Vec::len).sum())
      .unwrap_or_default()
  }

  /// Close every idle connection.
  pub(crate) fn clear(&self) {
    if let Ok(mut idle) = self.idle.lock() {
      idle.clear();
    }
  }
}
