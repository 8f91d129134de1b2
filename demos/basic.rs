//! Minimal keel service: JSON endpoints, a guarded admin group, health checks
//! and graceful shutdown.
//!
//! Run with:
//!   KEEL__TELEMETRY__LOG_FORMAT=pretty KEEL__SERVER__ADDR=127.0.0.1:3000 \
//!     cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/users/42
//!   curl -i -X POST http://localhost:3000/users -d '{"name":"alice"}'
//!   curl -i -X DELETE http://localhost:3000/admin/users/42 -H 'authorization: Bearer t'
//!   curl -i http://localhost:3000/slow     # then Ctrl-C while it runs
//!   curl -i http://localhost:3000/readyz

use std::process::ExitCode;
use std::time::Duration;

use keel::middleware::{self, Next};
use keel::{Lifecycle, Request, Response, StatusCode};

#[tokio::main]
async fn main() -> ExitCode {
    Lifecycle::new(|router| {
        router.layer(middleware::trace());

        router.handle("GET /users/{id}", get_user)?;
        router.handle("POST /users", create_user)?;
        router.handle("GET /slow", slow)?;

        router.group(|admin| {
            admin.layer(middleware::from_fn(require_token));
            admin.handle("DELETE /admin/users/{id}", delete_user)?;
            Ok(())
        })?;
        Ok(())
    })
    .on_shutdown("goodbye", || async {
        tracing::info!("flushing nothing in particular");
        Ok(())
    })
    .run()
    .await
    .exit_code()
}

async fn get_user(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    Response::json(format!(r#"{{"id":"{id}","name":"alice"}}"#))
}

async fn create_user(req: Request) -> Response {
    if req.body().is_empty() {
        return Response::status(StatusCode::BAD_REQUEST);
    }
    Response::builder()
        .status(StatusCode::CREATED)
        .header("location", "/users/99")
        .json(r#"{"id":"99","name":"new_user"}"#)
}

// Finishes within the grace period, so Ctrl-C during it still gets a reply.
async fn slow(req: Request) -> &'static str {
    let cancel = req.cancellation();
    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(3)) => "done",
        () = cancel.cancelled() => "cut short by shutdown",
    }
}

async fn delete_user(_req: Request) -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn require_token(req: Request, next: Next) -> Response {
    if req.header("authorization").is_none() {
        return Response::status(StatusCode::UNAUTHORIZED);
    }
    next.run(req).await
}
