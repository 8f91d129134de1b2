//! Route handlers and their erased form.
//!
//! Routes, middleware layers and the dispatch table all end up as the same
//! value, a [`BoxedHandler`]. For `router.handle("GET /users/{id}", show)`:
//!
//! ```text
//! show                          async fn(Request) -> impl IntoResponse
//!   │ Handler::into_boxed_handler
//!   ▼
//! Arc<FnHandler<show>>          erased, shared by every connection task
//!   │ compose(route chain)      each layer: BoxedHandler -> BoxedHandler
//!   ▼
//! dispatch table entry          looked up once per request
//! ```
//!
//! At request time each layer costs one virtual call and one boxed future.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// The future every erased handler returns.
pub type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// Object-safe call interface. Implemented by plain handlers, by every
/// middleware wrapper and by the router's table lookup.
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture;
}

/// An erased handler. Cloning is a reference-count bump.
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Handler ───────────────────────────────────────────────────────────────────

/// Anything [`Router::handle`](crate::Router::handle) accepts: an async
/// function or closure taking a [`Request`] and returning an
/// [`IntoResponse`], or a [`Boxed`] handler. Sealed.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Wraps a handler that is already erased, e.g. one produced by middleware.
pub struct Boxed(pub BoxedHandler);

impl private::Sealed for Boxed {}

impl Handler for Boxed {
    fn into_boxed_handler(self) -> BoxedHandler {
        self.0
    }
}

struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}
