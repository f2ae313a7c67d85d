use crate::cookies::Jar;
use crate::message::Message;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Connection and cookie state that belongs to one requesting user, or to
/// the sender when the global state is in use.
#[derive(Debug, Default)]
pub struct UserState {
  cookies: Jar,
}

impl UserState {
  /// An empty state.
  pub fn new() -> UserState {
    UserState::default()
  }
  /// Cookies collected from responses.
  pub fn cookie_jar(&self) -> &Jar {
    &self.cookies
  }
}

/// The identity a message is sent on behalf of.
///
/// The sender only ever calls these four operations. Implementations live in
/// the authentication layer.
#[async_trait]
pub trait RequestingUser: Send + Sync + Debug {
  /// Rewrite the request so it is sent as this user, e.g. replace the
  /// session cookie or an authorization header.
  fn process_message_to_match_user(&self, message: &mut Message);
  /// The received response looks like it was served to this user.
  fn is_authenticated(&self, message: &Message) -> bool;
  /// Log in again. Returns once the new credentials are in place.
  async fn queue_authentication(&self, message: &Message);
  /// Cookie state of this user.
  fn state(&self) -> Arc<UserState>;
}
