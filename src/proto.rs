//! The three HTTPS schemes and their protocol adapters.
//!
//! `https` issues GET-form requests, `posts` POST-form, `fulls` raw-body.
//! An adapter binds one request form to the shared machinery of a
//! [`HttpsService`] so callers (typically a scheme registry) can schedule
//! requests and create requesters without caring which form is in play.

use crate::client::{Message, ResponseHandle};
use crate::error::Error;
use crate::http::RequestKind;
use crate::server::{OnRequest, Server};
use crate::service::HttpsService;
use std::marker::PhantomData;
use std::sync::Arc;

/// A request-construction strategy: scheme name plus request form.
pub trait RequestFormat: Send + Sync + 'static {
    const SCHEME: &'static str;
    const KIND: RequestKind;
}

/// `https` — message data travels as the query string.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetFormat;

impl RequestFormat for GetFormat {
    const SCHEME: &'static str = "https";
    const KIND: RequestKind = RequestKind::Get;
}

/// `posts` — message data travels as a form-encoded body.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostFormat;

impl RequestFormat for PostFormat {
    const SCHEME: &'static str = "posts";
    const KIND: RequestKind = RequestKind::Post;
}

/// `fulls` — message data travels as a raw body.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullFormat;

impl RequestFormat for FullFormat {
    const SCHEME: &'static str = "fulls";
    const KIND: RequestKind = RequestKind::Full;
}

/// Resolves a scheme name to its request form.
pub fn kind_for_scheme(scheme: &str) -> Option<RequestKind> {
    if scheme == GetFormat::SCHEME {
        Some(GetFormat::KIND)
    } else if scheme == PostFormat::SCHEME {
        Some(PostFormat::KIND)
    } else if scheme == FullFormat::SCHEME {
        Some(FullFormat::KIND)
    } else {
        None
    }
}

/// One scheme bound to a service.
#[derive(Debug, Clone)]
pub struct HttpsProtocol<F: RequestFormat> {
    service: Arc<HttpsService>,
    _format: PhantomData<F>,
}

impl<F: RequestFormat> HttpsProtocol<F> {
    pub fn new(service: Arc<HttpsService>) -> HttpsProtocol<F> {
        HttpsProtocol {
            service,
            _format: PhantomData,
        }
    }

    pub fn scheme(&self) -> &'static str {
        F::SCHEME
    }

    /// Schedules `msg` using this adapter's request form.
    pub fn schedule_request(&self, msg: Message) -> Result<ResponseHandle, Error> {
        self.service.schedule_as(msg, F::KIND)
    }

    /// Starts a server for `location`, delivering requests to `handler`.
    pub fn create_requester(
        &self,
        handler: Arc<dyn OnRequest>,
        location: &str,
    ) -> Result<Server, Error> {
        self.service.create_requester(handler, location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_names_resolve() {
        assert_eq!(kind_for_scheme("https"), Some(RequestKind::Get));
        assert_eq!(kind_for_scheme("posts"), Some(RequestKind::Post));
        assert_eq!(kind_for_scheme("fulls"), Some(RequestKind::Full));
        assert_eq!(kind_for_scheme("http"), None);
    }
}
