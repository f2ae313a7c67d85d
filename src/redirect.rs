//! Redirect classification, `Location` resolution and the scoping hook used by
//! the general redirect path.
use crate::errors::{Error, Result};
use crate::message::Message;
use std::fmt::Debug;

/// 301, 302, 303, 307 and 308.
pub fn is_redirect_status(status: u16) -> bool {
  matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Statuses after which the followed request becomes a body-less `GET`.
pub fn rewrites_to_get(status: u16) -> bool {
  matches!(status, 301..=303)
}

/// Decides whether a redirect target may be followed and observes every
/// message received along the way.
///
/// ```rust
/// # use interpose::{redirect::RedirectionValidator, Message};
/// #[derive(Debug)]
/// struct SameHost(String);
///
/// impl RedirectionValidator for SameHost {
///   fn is_valid(&self, uri: &http::Uri) -> bool {
///     uri.host() == Some(self.0.as_str())
///   }
///   fn notify_received(&self, _message: &Message) {}
/// }
/// ```
pub trait RedirectionValidator: Send + Sync + Debug {
  /// `uri` is in scope.
  fn is_valid(&self, uri: &http::Uri) -> bool;
  /// Called with each message whose response arrived, redirects included.
  fn notify_received(&self, message: &Message);
}

/// Follows every redirect.
#[derive(Debug, Default, Clone, Copy)]
pub struct FollowAll;

impl RedirectionValidator for FollowAll {
  fn is_valid(&self, _uri: &http::Uri) -> bool {
    true
  }
  fn notify_received(&self, _message: &Message) {}
}

/// Resolve a `Location` value against the URI of the request that produced
/// it.
pub fn resolve_location(base: &http::Uri, location: &str) -> Result<http::Uri> {
  let invalid = || Error::InvalidRedirectLocation(location.to_string());
  let base = url::Url::parse(&base.to_string()).map_err(|_| invalid())?;
  let next = base.join(location.trim()).map_err(|_| invalid())?;
  if !matches!(next.scheme(), "http" | "https") || next.host_str().is_none() {
    return Err(invalid());
  }
  next.as_str().parse::<http::Uri>().map_err(|_| invalid())
}
