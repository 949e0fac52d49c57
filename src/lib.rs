//! An HTTPS client/server communication library built on
//! [mio](https://docs.rs/mio) and [rustls](https://docs.rs/rustls), with
//! per-host connection pooling and cooperative non-blocking I/O.
//!
//! - **Pooled client:** keep-alive connections cached per host under
//!   soft/hard fd budgets, with speculative parallel connects hedging slow
//!   addresses and a background purger shedding idle sockets under
//!   pressure
//! - **Request/response server:** TLS accept, request parse, user-handler
//!   dispatch, gzip-or-identity responses, adaptive keep-alive that
//!   shrinks as the fd budget fills
//! - **Three request forms:** `https` (GET, data as query), `posts` (POST,
//!   form body), `fulls` (raw body)
//! - **Cooperative I/O:** every socket wait is a bounded poll, so requests
//!   stay cancellable and shutdown is prompt
//!
//! # Quick Start
//!
//! ```no_run
//! use httpscomm::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), httpscomm::Error> {
//! let service = HttpsService::new(Options::default())?;
//!
//! // Serve: answer every request with a small body.
//! let server = service.create_requester(
//!     Arc::new(|request: ServerRequest| {
//!         request.send_reply(b"pong".to_vec(), Headers::new());
//!     }),
//!     "https://cert=cert.pem;key=key.pem@localhost:8443/ping",
//! )?;
//!
//! // Request: a GET over a pooled TLS connection.
//! let handle = service.schedule(Message::new("https://localhost:8443/ping"))?;
//! match handle.recv() {
//!     Some(Ok(response)) => println!("{} byte reply", response.body.len()),
//!     Some(Err(failure)) => eprintln!("request failed: {}", failure.error),
//!     None => eprintln!("request dropped"),
//! }
//! # drop(server);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! [`Options`] covers trust anchors, client identity, hostname checking
//! and debug switches, settable by string key ([`Options::set`]) or from a
//! [`config::Config`] ([`Options::from_config`]). Fd budgets and
//! keep-alive bounds are runtime-settable on the service.

mod cache;
mod client;
mod compress;
mod error;
mod http;
mod limits;
mod location;
mod options;
mod proto;
mod resolver;
mod sched;
mod server;
mod service;
mod sock;
mod tls;

pub use client::{Message, RequestFailure, Response, ResponseHandle};
pub use error::Error;
pub use http::{Headers, RequestKind};
pub use limits::{FdLimits, InputConns};
pub use location::{Location, UserIdentity};
pub use options::{Options, PasswordCallback, PasswordRequest, VerifyCallback};
pub use proto::{FullFormat, GetFormat, HttpsProtocol, PostFormat, RequestFormat};
pub use resolver::ResolvedHost;
pub use server::{OnRequest, ResponseError, Server, ServerRequest};
pub use service::HttpsService;

/// The usual imports for working with httpscomm.
pub mod prelude {
    pub use crate::client::{Message, RequestFailure, Response, ResponseHandle};
    pub use crate::error::Error;
    pub use crate::http::Headers;
    pub use crate::options::Options;
    pub use crate::proto::{FullFormat, GetFormat, HttpsProtocol, PostFormat};
    pub use crate::server::{OnRequest, ResponseError, Server, ServerRequest};
    pub use crate::service::HttpsService;
}
