//! Built-in Kubernetes health-check handlers.
//!
//! Kubernetes asks two questions:
//!
//! | Probe | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the process alive? Failure → restart. |
//! | **Readiness** | `/readyz` | Can the pod serve traffic? Failure → pulled from load-balancer. |
//!
//! The lifecycle mounts both when `server.health_routes` is set, and marks
//! the process not-ready the moment it starts draining so the load balancer
//! stops sending new work while in-flight requests finish.
//!
//! Mounting them by hand:
//!
//! ```rust
//! use keel::{Router, health};
//! use keel::health::Readiness;
//!
//! # fn main() -> Result<(), keel::Error> {
//! let ready = Readiness::new();
//! let mut router = Router::new();
//! router.handle("GET /healthz", health::liveness)?;
//! router.handle("GET /readyz", health::readiness(ready.clone()))?;
//! ready.set(true);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use http::StatusCode;

use crate::handler::Handler;
use crate::{Request, Response};

/// Kubernetes liveness probe handler.
///
/// Always returns `200 OK` with body `"ok"`. If the process can respond to
/// HTTP at all, it is alive.
pub async fn liveness(_req: Request) -> Response {
    Response::text("ok")
}

/// Shared readiness flag. Starts not ready.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Kubernetes readiness probe handler: `200 "ready"` while `flag` is set,
/// `503` otherwise.
pub fn readiness(flag: Readiness) -> impl Handler {
    move |_req: Request| {
        let ready = flag.is_ready();
        async move {
            if ready {
                Response::text("ready")
            } else {
                Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .text("not ready")
            }
        }
    }
}
