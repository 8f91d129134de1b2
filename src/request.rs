//! Incoming HTTP request type.

use std::collections::HashMap;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use tracing::warn;

use crate::context::ContextRef;
use crate::shutdown::CancelToken;

/// An incoming HTTP request with its body already collected.
#[derive(Debug)]
pub struct Request {
    parts: http::request::Parts,
    body: Bytes,
    pub(crate) params: HashMap<String, String>,
    pub(crate) context: Option<ContextRef>,
}

impl Request {
    pub(crate) fn new(parts: http::request::Parts, body: Bytes) -> Self {
        Self { parts, body, params: HashMap::new(), context: None }
    }

    pub fn method(&self) -> &Method { &self.parts.method }
    pub fn uri(&self) -> &Uri { &self.parts.uri }
    pub fn path(&self) -> &str { self.parts.uri.path() }
    pub fn headers(&self) -> &HeaderMap { &self.parts.headers }
    pub fn body(&self) -> &[u8] { &self.body }

    /// Header lookup. Names are case-insensitive; non-UTF-8 values read as
    /// absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The pooled context of this request.
    ///
    /// Absent only when the request did not come through an [`App`](crate::App),
    /// for example a handler invoked directly in a test. Absence is logged.
    pub fn context(&self) -> Option<&ContextRef> {
        if self.context.is_none() {
            warn!(path = %self.path(), "no request context installed");
        }
        self.context.as_ref()
    }

    // ── Context shortcuts ─────────────────────────────────────────────────────
    //
    // Each degrades to an empty result when no context is installed.

    pub fn request_id(&self) -> Option<String> {
        self.context().map(ContextRef::request_id)
    }

    pub fn span(&self) -> tracing::Span {
        self.context().map_or_else(tracing::Span::none, ContextRef::span)
    }

    pub fn baggage(&self, key: &str) -> Option<String> {
        self.context()?.baggage(key)
    }

    pub fn set_baggage(&self, key: &str, value: &str) {
        if let Some(cx) = self.context() {
            cx.set_baggage(key, value);
        }
    }

    pub fn value<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.context()?.get::<T>()
    }

    pub fn insert_value<T: Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.context()?.insert(value)
    }

    /// Token cancelled when this request ends or the server begins draining.
    /// Without a context it is a fresh token nobody cancels.
    pub fn cancellation(&self) -> CancelToken {
        self.context().map(ContextRef::cancellation).unwrap_or_default()
    }
}

impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self::new(parts, body)
    }
}
