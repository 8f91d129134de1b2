//! Request router, route groups and the frozen [`App`].
//!
//! One radix tree per HTTP method plus one for method-less patterns,
//! O(path-length) lookup. Patterns are `"METHOD /path"` or just `"/path"`
//! (any method). Path parameters use `{name}`; a trailing `{*rest}` (or
//! `{rest...}`) captures the remainder.
//!
//! # Middleware
//!
//! - [`Router::layer`] on the root adds to the **global** chain. It wraps the
//!   whole dispatch, so it sees every request, including 404s and 405s.
//! - [`Group::layer`] adds to that group's **route** chain. A group starts
//!   from a copy of its parent's route chain at the moment it is created.
//! - A route's chain is fixed when it is registered: later `layer` calls
//!   affect only routes registered after them.
//!
//! ```rust
//! use keel::{Request, Router, middleware};
//!
//! # fn main() -> Result<(), keel::Error> {
//! let mut router = Router::new();
//! router.layer(middleware::trace());
//! router.handle("GET /users/{id}", get_user)?;
//! router.group(|api| {
//!     api.layer(middleware::from_fn(|req, next: middleware::Next| next.run(req)));
//!     api.handle("POST /users", create_user)?;
//!     Ok(())
//! })?;
//! let app = router.into_app();
//! # Ok(())
//! # }
//! # async fn get_user(req: Request) -> String { req.param("id").unwrap_or_default().to_owned() }
//! # async fn create_user(_req: Request) -> &'static str { "created" }
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use http::header::{ALLOW, HeaderValue};
use http::{Method, StatusCode};
use matchit::{InsertError, Router as MatchitRouter};
use tracing::{Instrument, debug, error};

use crate::context::ContextPool;
use crate::error::Error;
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler, Handler};
use crate::middleware::{MiddlewareFn, compose};
use crate::request::Request;
use crate::response::Response;
use crate::shutdown::CancelToken;

// ── Dispatch table ────────────────────────────────────────────────────────────

/// Registered routes. `None` keys the method-less patterns.
#[derive(Default)]
struct Table {
    routes: HashMap<Option<Method>, MatchitRouter<Route>>,
}

struct Route {
    handler: BoxedHandler,
    /// Length of the path before its first placeholder. Ranks matches
    /// found in different method trees.
    literal_prefix: usize,
}

enum Lookup {
    Found(BoxedHandler, HashMap<String, String>),
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

impl Table {
    fn insert(&mut self, pattern: &str, handler: BoxedHandler) -> Result<(), Error> {
        let (method, path) = parse_pattern(pattern)?;
        let literal_prefix = path.find('{').unwrap_or(path.len());
        let tree = self.routes.entry(method.clone()).or_default();
        tree.insert(path, Route { handler, literal_prefix }).map_err(|e| match e {
            InsertError::Conflict { with } => Error::RouteConflict {
                pattern: pattern.to_owned(),
                existing: match &method {
                    Some(m) => format!("{m} {with}"),
                    None => with,
                },
            },
            other => Error::InvalidPattern {
                pattern: pattern.to_owned(),
                reason: other.to_string(),
            },
        })
    }

    fn lookup(&self, method: &Method, path: &str) -> Lookup {
        let mut candidates = vec![Some(method.clone())];
        if method == Method::HEAD {
            candidates.push(Some(Method::GET));
        }
        candidates.push(None);

        // Every candidate tree is consulted: a static method-less route must
        // beat a parameterised method route. Ties go to the earlier candidate.
        let mut best: Option<matchit::Match<'_, '_, &Route>> = None;
        for key in &candidates {
            let Some(tree) = self.routes.get(key) else { continue };
            let Ok(matched) = tree.at(path) else { continue };
            if best
                .as_ref()
                .is_none_or(|b| matched.value.literal_prefix > b.value.literal_prefix)
            {
                best = Some(matched);
            }
        }
        if let Some(matched) = best {
            let params = matched
                .params
                .iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            return Lookup::Found(Arc::clone(&matched.value.handler), params);
        }

        let mut allowed: Vec<Method> = self
            .routes
            .iter()
            .filter_map(|(m, tree)| m.as_ref().filter(|_| tree.at(path).is_ok()).cloned())
            .collect();
        if allowed.is_empty() {
            return Lookup::NotFound;
        }
        if allowed.contains(&Method::GET) && !allowed.contains(&Method::HEAD) {
            allowed.push(Method::HEAD);
        }
        allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Lookup::MethodNotAllowed(allowed)
    }
}

/// Splits `"METHOD /path"` and rewrites `{name...}` catch-alls to matchit's
/// `{*name}`.
fn parse_pattern(pattern: &str) -> Result<(Option<Method>, String), Error> {
    let invalid = |reason: &str| Error::InvalidPattern {
        pattern: pattern.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = pattern.trim();
    let (method, path) = match trimmed.split_once(char::is_whitespace) {
        Some((m, rest)) if !m.starts_with('/') => {
            let method = Method::from_bytes(m.as_bytes()).map_err(|_| invalid("bad method"))?;
            (Some(method), rest.trim_start())
        }
        _ => (None, trimmed),
    };

    if !path.starts_with('/') {
        return Err(invalid("path must start with `/`"));
    }

    let path = path
        .split('/')
        .map(|segment| match segment.strip_prefix('{').and_then(|s| s.strip_suffix("...}")) {
            Some(name) => format!("{{*{name}}}"),
            None => segment.to_owned(),
        })
        .collect::<Vec<_>>()
        .join("/");

    Ok((method, path))
}

fn register(
    table: &mut Table,
    chain: &[MiddlewareFn],
    pattern: &str,
    handler: impl Handler,
) -> Result<(), Error> {
    let composed = compose(chain, handler.into_boxed_handler());
    table.insert(pattern, composed)?;
    debug!(pattern, layers = chain.len(), "route registered");
    Ok(())
}

// ── Router ────────────────────────────────────────────────────────────────────

/// The application router.
///
/// Build it once at startup, then freeze it with [`into_app`](Router::into_app).
#[derive(Default)]
pub struct Router {
    table: Table,
    global: Vec<MiddlewareFn>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the global chain.
    pub fn layer(&mut self, mw: MiddlewareFn) -> &mut Self {
        self.global.push(mw);
        self
    }

    /// Registers `handler` at `pattern`.
    ///
    /// Routes on the root router carry no route chain; only the global chain
    /// applies to them.
    ///
    /// # Errors
    ///
    /// [`Error::RouteConflict`] when the pattern is already taken,
    /// [`Error::InvalidPattern`] when it cannot be parsed.
    pub fn handle(&mut self, pattern: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        register(&mut self.table, &[], pattern, handler)?;
        Ok(self)
    }

    /// Opens a group sharing this router's dispatch table with an empty
    /// route chain of its own.
    pub fn group<F>(&mut self, f: F) -> Result<&mut Self, Error>
    where
        F: FnOnce(&mut Group<'_>) -> Result<(), Error>,
    {
        f(&mut Group { table: &mut self.table, chain: Vec::new() })?;
        Ok(self)
    }

    /// Freezes the router: the global chain is composed once around the
    /// dispatch table.
    pub fn into_app(self) -> App {
        self.into_app_with_pool(ContextPool::new())
    }

    pub fn into_app_with_pool(self, pool: ContextPool) -> App {
        let dispatch: BoxedHandler = Arc::new(Dispatch { table: self.table });
        App {
            inner: Arc::new(AppInner {
                service: compose(&self.global, dispatch),
                pool,
            }),
        }
    }
}

/// A sub-router. Shares the parent's dispatch table; owns a snapshot of the
/// parent's route chain.
pub struct Group<'a> {
    table: &'a mut Table,
    chain: Vec<MiddlewareFn>,
}

impl Group<'_> {
    /// Appends to this group's route chain only.
    pub fn layer(&mut self, mw: MiddlewareFn) -> &mut Self {
        self.chain.push(mw);
        self
    }

    pub fn handle(&mut self, pattern: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        register(self.table, &self.chain, pattern, handler)?;
        Ok(self)
    }

    /// Opens a nested group starting from a copy of this group's chain.
    pub fn group<F>(&mut self, f: F) -> Result<&mut Self, Error>
    where
        F: FnOnce(&mut Group<'_>) -> Result<(), Error>,
    {
        f(&mut Group { table: &mut *self.table, chain: self.chain.clone() })?;
        Ok(self)
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

struct Dispatch {
    table: Table,
}

impl ErasedHandler for Dispatch {
    fn call(&self, mut req: Request) -> BoxFuture {
        match self.table.lookup(req.method(), req.path()) {
            Lookup::Found(handler, params) => {
                req.params = params;
                handler.call(req)
            }
            Lookup::MethodNotAllowed(allowed) => {
                let allow = allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
                let mut res = Response::builder()
                    .status(StatusCode::METHOD_NOT_ALLOWED)
                    .text("method not allowed");
                if let Ok(value) = HeaderValue::try_from(allow) {
                    res.headers_mut().insert(ALLOW, value);
                }
                Box::pin(async move { res })
            }
            Lookup::NotFound => Box::pin(async {
                Response::builder().status(StatusCode::NOT_FOUND).text("not found")
            }),
        }
    }
}

// ── App ───────────────────────────────────────────────────────────────────────

/// A frozen router, ready to serve. Cheap to clone.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    service: BoxedHandler,
    pool: ContextPool,
}

impl App {
    /// Runs one request through the global chain and the dispatch table.
    ///
    /// A context is leased for the duration of the call and released on
    /// every exit path. A panicking handler yields `500`.
    pub async fn call(&self, req: http::Request<Bytes>, shutdown: &CancelToken) -> Response {
        let (parts, body) = req.into_parts();
        let lease = self.inner.pool.acquire();
        lease.begin(&parts, shutdown);
        let cx = lease.context();
        let span = cx.span();

        let mut req = Request::new(parts, body);
        req.context = Some(cx);

        let service = Arc::clone(&self.inner.service);
        let outcome = AssertUnwindSafe(async move { service.call(req).await })
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let mut res = outcome.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            span.in_scope(|| error!(panic = %message, "handler panicked"));
            Response::status(StatusCode::INTERNAL_SERVER_ERROR)
        });

        lease.finish(&mut res);
        res
    }

    pub fn pool(&self) -> &ContextPool {
        &self.inner.pool
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").field("pool", &self.inner.pool).finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("global_layers", &self.global.len()).finish_non_exhaustive()
    }
}
