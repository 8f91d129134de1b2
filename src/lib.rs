//! # keel
//!
//! The part of an HTTP service that never changes between services: routing
//! with composable middleware, a pooled per-request context, and a process
//! lifecycle that starts cleanly, drains on SIGTERM and reports every
//! teardown failure.
//!
//! ## What you get
//!
//! - Radix-tree routing via [`matchit`], `"METHOD /path/{param}"` patterns,
//!   404 / 405 handling, route groups with their own middleware chains
//! - Onion-ordered middleware: a global chain around every request, route
//!   chains around the routes registered under them
//! - A [`Context`](context::Context) leased from a pool for each request:
//!   request id, cancellation, OpenTelemetry span and baggage, typed values
//! - A [`Lifecycle`]: config, telemetry, bind, serve, graceful drain bounded
//!   by a grace period, ordered cleanups with joined errors
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::process::ExitCode;
//! use keel::{Lifecycle, Request, Response, StatusCode, middleware};
//!
//! #[tokio::main]
//! async fn main() -> ExitCode {
//!     Lifecycle::new(|router| {
//!         router.layer(middleware::trace());
//!         router.handle("GET /users/{id}", get_user)?;
//!         router.group(|admin| {
//!             admin.layer(middleware::from_fn(require_token));
//!             admin.handle("DELETE /users/{id}", delete_user)?;
//!             Ok(())
//!         })?;
//!         Ok(())
//!     })
//!     .run()
//!     .await
//!     .exit_code()
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//!
//! async fn delete_user(_req: Request) -> StatusCode {
//!     StatusCode::NO_CONTENT
//! }
//!
//! async fn require_token(req: Request, next: middleware::Next) -> Response {
//!     if req.header("authorization").is_none() {
//!         return Response::status(StatusCode::UNAUTHORIZED);
//!     }
//!     next.run(req).await
//! }
//! ```

mod error;
mod lifecycle;
mod request;
mod response;
mod router;
mod server;

pub mod config;
pub mod context;
pub mod handler;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod shutdown;
pub mod telemetry;

pub use config::{Config, ConfigError, ConfigLoader};
pub use context::{ContextPool, ContextRef};
pub use error::{BoxError, Error, JoinedErrors};
pub use handler::Handler;
pub use http::{Method, StatusCode};
pub use lifecycle::{Lifecycle, Observer, Outcome, State};
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::{App, Group, Router};
pub use server::Server;
pub use shutdown::{CancelToken, ShutdownRegistry};
