use super::{HttpSender, Initiator};
use crate::errors::Result;
use crate::message::Message;
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

/// Hooks run around every send of an [`HttpSender`].
///
/// Listeners run in ascending [`priority`](HttpSenderListener::priority)
/// order. A failing or panicking listener is logged and skipped, the send
/// and the other listeners go on.
#[async_trait]
pub trait HttpSenderListener: Send + Sync {
  /// Lower values run first.
  fn priority(&self) -> i32 {
    0
  }
  /// Called before the request goes out. Sends made through `sender` are not
  /// announced to listeners again.
  async fn on_request_send(
    &self,
    message: &mut Message,
    initiator: Initiator,
    sender: &NestedSender,
  ) -> Result<()>;
  /// Called after the response arrived.
  async fn on_response_receive(
    &self,
    message: &mut Message,
    initiator: Initiator,
    sender: &NestedSender,
  ) -> Result<()>;
}

/// The sender as seen from inside a listener callback.
#[derive(Clone, Debug)]
pub struct NestedSender(HttpSender);

impl NestedSender {
  /// Send without notifying listeners.
  pub async fn send(&self, message: &mut Message, follow_redirects: bool) -> Result<()> {
    self.0.send_message(message, follow_redirects, false).await
  }
  /// Who triggered the outer send.
  pub fn initiator(&self) -> Initiator {
    self.0.initiator()
  }
}

#[derive(Clone, Copy)]
enum Phase {
  Request,
  Response,
}

/// Listeners shared by every sender built with the same registry.
#[derive(Default)]
pub struct ListenerRegistry {
  listeners: RwLock<Vec<Arc<dyn HttpSenderListener>>>,
}

impl fmt::Debug for ListenerRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ListenerRegistry")
      .field("listeners", &self.len())
      .finish()
  }
}

impl ListenerRegistry {
  /// An empty registry.
  pub fn new() -> ListenerRegistry {
    ListenerRegistry::default()
  }
  /// Register `listener`.
  pub fn add(&self, listener: Arc<dyn HttpSenderListener>) {
    self
      .listeners
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .push(listener);
  }
  /// Unregister `listener`, returns whether it was registered.
  pub fn remove(&self, listener: &Arc<dyn HttpSenderListener>) -> bool {
    let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
    let before = listeners.len();
    listeners.retain(|l| !same_listener(l, listener));
    listeners.len() != before
  }
  /// Number of registered listeners.
  pub fn len(&self) -> usize {
    self
      .listeners
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }
  /// No listener is registered.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  // 先复制再排序，通知期间的注册和注销不影响本次遍历
  fn snapshot(&self) -> Vec<Arc<dyn HttpSenderListener>> {
    let mut listeners = self
      .listeners
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    listeners.sort_by_key(|l| l.priority());
    listeners
  }

  pub(crate) async fn notify_request(&self, message: &mut Message, sender: &HttpSender) {
    self.notify(Phase::Request, message, sender).await
  }

  pub(crate) async fn notify_response(&self, message: &mut Message, sender: &HttpSender) {
    self.notify(Phase::Response, message, sender).await
  }

  async fn notify(&self, phase: Phase, message: &mut Message, sender: &HttpSender) {
    let listeners = self.snapshot();
    if listeners.is_empty() {
      return;
    }
    let initiator = sender.initiator();
    let nested = NestedSender(sender.clone());
    for listener in listeners {
      let call = match phase {
        Phase::Request => listener.on_request_send(message, initiator, &nested),
        Phase::Response => listener.on_response_receive(message, initiator, &nested),
      };
      match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("listener failed on {}: {}", phase, e),
        Err(_) => tracing::error!("listener panicked on {}", phase),
      }
    }
  }
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Phase::Request => f.write_str("request send"),
      Phase::Response => f.write_str("response receive"),
    }
  }
}

fn same_listener(a: &Arc<dyn HttpSenderListener>, b: &Arc<dyn HttpSenderListener>) -> bool {
  std::ptr::eq(
    Arc::as_ptr(a) as *const (),
    Arc::as_ptr(b) as *const (),
  )
}
