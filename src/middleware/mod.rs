//! Middleware layer.
//!
//! A middleware is a plain function from handler to handler. It wraps the
//! handler it is given and returns the wrapper; whatever it does before
//! calling the inner handler sees the request first, whatever it does after
//! sees the response last.
//!
//! Chains compose outermost-first: [`compose`] on `[m0, m1]` around `h`
//! yields `m0(m1(h))`, so a request flows `m0 → m1 → h → m1 → m0`.
//!
//! Most middleware is easiest to write with [`from_fn`]:
//!
//! ```rust
//! use keel::middleware::{self, Next};
//! use keel::{Request, Response};
//!
//! let stamp = middleware::from_fn(|req: Request, next: Next| async move {
//!     let mut res = next.run(req).await;
//!     res.headers_mut().insert("x-served-by", "keel".parse().unwrap());
//!     res
//! });
//! ```
//!
//! Built-in middleware:
//! - [`trace`]: one completion line per request with status and latency

use std::future::Future;
use std::sync::Arc;

use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

mod trace;

pub use trace::trace;

/// A handler-wrapping function.
pub type MiddlewareFn = Arc<dyn Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static>;

/// Wraps a closure as a [`MiddlewareFn`].
pub fn middleware<F>(f: F) -> MiddlewareFn
where
    F: Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Folds `chain` around `handler`, innermost (last) first.
///
/// An empty chain returns `handler` unchanged. Composition itself runs no
/// request-time code.
pub fn compose(chain: &[MiddlewareFn], handler: BoxedHandler) -> BoxedHandler {
    chain.iter().rev().fold(handler, |inner, mw| mw(inner))
}

// ── from_fn ───────────────────────────────────────────────────────────────────

/// The rest of the chain, as seen from inside a [`from_fn`] middleware.
///
/// Consumed by [`run`](Next::run), so it can be invoked at most once. Not
/// calling it short-circuits the request.
pub struct Next {
    inner: BoxedHandler,
}

impl Next {
    pub async fn run(self, req: Request) -> Response {
        self.inner.call(req).await
    }
}

/// Builds middleware from an `async fn(Request, Next) -> impl IntoResponse`.
pub fn from_fn<F, Fut, R>(f: F) -> MiddlewareFn
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |inner: BoxedHandler| -> BoxedHandler {
        Arc::new(FromFn { f: Arc::clone(&f), inner })
    })
}

struct FromFn<F> {
    f: Arc<F>,
    inner: BoxedHandler,
}

impl<F, Fut, R> ErasedHandler for FromFn<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.f)(req, Next { inner: Arc::clone(&self.inner) });
        Box::pin(async move { fut.await.into_response() })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::handler::Handler;
    use bytes::Bytes;
    use http::StatusCode;
    use std::sync::Mutex;

    pub(crate) type Log = Arc<Mutex<Vec<String>>>;

    /// Middleware that records `<name>-before` / `<name>-after` around the
    /// inner handler.
    pub(crate) fn recording(name: &'static str, log: &Log) -> MiddlewareFn {
        let log = Arc::clone(log);
        from_fn(move |req: Request, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{name}-before"));
                let res = next.run(req).await;
                log.lock().unwrap().push(format!("{name}-after"));
                res
            }
        })
    }

    pub(crate) fn recording_handler(log: &Log) -> BoxedHandler {
        let log = Arc::clone(log);
        (move |_req: Request| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push("handler".to_owned());
                "ok"
            }
        })
        .into_boxed_handler()
    }

    fn req() -> Request {
        http::Request::get("/").body(Bytes::new()).unwrap().into()
    }

    #[tokio::test]
    async fn onion_order() {
        let log = Log::default();
        let chain = [recording("m0", &log), recording("m1", &log)];
        let composed = compose(&chain, recording_handler(&log));

        composed.call(req()).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["m0-before", "m1-before", "handler", "m1-after", "m0-after"]
        );
    }

    #[tokio::test]
    async fn empty_chain_is_identity() {
        let log = Log::default();
        let handler = recording_handler(&log);
        let composed = compose(&[], Arc::clone(&handler));
        assert!(Arc::ptr_eq(&handler, &composed));
    }

    #[tokio::test]
    async fn composing_runs_nothing() {
        let log = Log::default();
        let _composed = compose(&[recording("m0", &log)], recording_handler(&log));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn short_circuit_skips_inner() {
        let log = Log::default();
        let deny = from_fn(|_req: Request, _next: Next| async { StatusCode::UNAUTHORIZED });
        let composed = compose(&[deny], recording_handler(&log));

        let res = composed.call(req()).await;
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn plain_middleware_closure() {
        let log = Log::default();
        let swap = middleware({
            let log = Arc::clone(&log);
            move |_inner: BoxedHandler| recording_handler(&log)
        });
        let composed = compose(&[swap], (|_req: Request| async { "never" }).into_boxed_handler());
        assert_eq!(composed.call(req()).await.body(), b"ok");
    }
}
