//! engine error
use std::io::ErrorKind;
use std::num::ParseIntError;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `interpose::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur when parsing, sending or tunnelling a message.
#[derive(ThisError, Debug)]
pub enum Error {
  /// A header block failed the delimiter, grammar or version checks.
  #[error("malformed header: {0}")]
  MalformedHeader(String),
  /// The `Location` value of a redirect could not be resolved.
  #[error("invalid redirect location: {0}")]
  InvalidRedirectLocation(String),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Certificate authority or leaf generation failed.
  #[error("certificate error: {0}")]
  Certificate(String),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// ParseIntError
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// Unknown Error
  #[error("other: {0}")]
  Other(String),
}

impl Error {
  /// Returns true for a header parse failure.
  pub fn is_malformed_header(&self) -> bool {
    matches!(self, Error::MalformedHeader(_))
  }
  /// Returns true for connect, read, write and timeout failures.
  pub fn is_io(&self) -> bool {
    matches!(self, Error::IO(_))
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUriParts> for Error {
  fn from(value: http::uri::InvalidUriParts) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::Certificate(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn malformed<S: Into<String>>(msg: S) -> Error {
  Error::MalformedHeader(msg.into())
}

pub(crate) fn builder<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Error {
  Error::Other(e.into().to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classifies_errors() {
    assert!(malformed("x").is_malformed_header());
    assert!(new_io_error(ErrorKind::TimedOut, "t").is_io());
    assert!(!Error::InvalidRedirectLocation("::".into()).is_malformed_header());
  }
}
