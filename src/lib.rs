#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # interpose
//!
//! The HTTP protocol core of an intercepting, TLS-capable proxy for security
//! testing.
//!
//! - [`RequestHeader`] / [`ResponseHeader`]: lenient HTTP/1.x header parsing
//!   with a malformed flag, an ordered case-insensitive field map and
//!   in-place header patching.
//! - [`Body`]: byte-exact body storage with lazy, cached charset detection.
//! - [`Message`]: a request and its response, with parameter extraction,
//!   request equality and cloning.
//! - [`HttpSender`]: sends messages over pooled connections, directly or
//!   through an upstream [`ProxyChain`], with redirects, re-authentication
//!   and listeners.
//! - [`TlsProvider`]: trust-all client sockets and server sockets whose
//!   certificates are issued by a [`CertificateAuthority`].
//!
//! ## Parsing and sending a request
//!
//! ```rust,no_run
//! # async fn run() -> interpose::Result<()> {
//! use interpose::{ConnectionParam, HttpSender, Message};
//!
//! let sender = HttpSender::builder()
//!   .param(ConnectionParam::default().max_redirects(5))
//!   .build()?;
//! let mut msg = Message::parse_request("GET /a?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n", "")?;
//! sender.send(&mut msg, true).await?;
//! println!("{} {}", msg.response_header().status_code(), msg.response_body().text());
//! # Ok(())
//! # }
//! ```
//!
//! ## Intercepting TLS
//!
//! After answering a client's `CONNECT`, hand the accepted stream to
//! [`TlsProvider::create_tunnel_server_socket`]. The client is served a leaf
//! certificate for the requested host, signed by the provider's root.
//!
//! ## Optional Features
//!
//! - **gzip**: text decoding of `gzip` and `deflate` encoded bodies.
//! - **serde**: Provides serialization and deserialization support.
//!
mod body;
mod config;
mod connector;
/// Cookie jar used for per-user state
pub mod cookies;
mod errors;
/// Header model
pub mod header;
mod message;
mod proxy;
/// Redirect Handling
pub mod redirect;
mod sender;
mod socket;
/// TLS sockets and certificate issuing
pub mod tls;

pub use body::{Body, MAX_PREALLOCATION, STORAGE_CHARSET};
pub use config::{ConnectionParam, DEFAULT_USER_AGENT};
pub use connector::{Connector, Endpoint, Route};
pub use errors::{Error, Result};
pub use header::{Method, RequestHeader, ResponseHeader};
pub use message::{HtmlParameter, Message, ParameterKind};
pub use proxy::{encode_basic_auth, ProxyChain, ProxyCredentials, ProxySkipList};
pub use sender::{
  HttpSender, HttpSenderListener, Initiator, ListenerRegistry, NestedSender, RequestConfig,
  RequestingUser, SenderBuilder, UserState,
};
pub use socket::{Socket, StreamWrapper, UpgradedConnection};
pub use tls::{CertificateAuthority, Identity, TlsListener, TlsProvider};
