mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use keel::middleware::{self, Next};
use keel::telemetry::NoTelemetry;
use keel::{Lifecycle, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;

use common::{local_config, send, send_with};

struct Running {
    addr: std::net::SocketAddr,
    stop: oneshot::Sender<()>,
    run: tokio::task::JoinHandle<keel::Outcome>,
}

impl Running {
    async fn stop(self) {
        self.stop.send(()).unwrap();
        assert!(self.run.await.unwrap().is_success());
    }
}

async fn start(observed: Arc<AtomicUsize>) -> Running {
    let (stop, stopped) = oneshot::channel::<()>();
    let lifecycle = Lifecycle::new(move |router| {
        router.layer(middleware::from_fn(move |req: Request, next: Next| {
            observed.fetch_add(1, Ordering::SeqCst);
            next.run(req)
        }));
        router.layer(middleware::trace());
        router.handle("GET /items/{id}", |req: Request| async move {
            format!("item {}", req.param("id").unwrap_or_default())
        })?;
        router.handle("POST /items", |_req: Request| async { StatusCode::CREATED })?;
        router.group(|admin| {
            admin.layer(middleware::from_fn(|req: Request, next: Next| async move {
                if req.header("authorization").is_none() {
                    return Response::status(StatusCode::UNAUTHORIZED);
                }
                next.run(req).await
            }));
            admin.handle("DELETE /items/{id}", |_req: Request| async { StatusCode::NO_CONTENT })?;
            Ok(())
        })?;
        Ok(())
    })
    .with_config(local_config())
    .with_telemetry(NoTelemetry)
    .shutdown_on(async {
        let _ = stopped.await;
    });

    let mut observer = lifecycle.observe();
    let run = tokio::spawn(lifecycle.run());
    let addr = observer.serving().await.expect("should serve");
    Running { addr, stop, run }
}

#[tokio::test]
async fn routes_params_and_groups_over_tcp() {
    let observed = Arc::new(AtomicUsize::new(0));
    let server = start(Arc::clone(&observed)).await;

    let item = send(server.addr, Method::GET, "/items/7").await.unwrap();
    assert_eq!(item.status, StatusCode::OK);
    assert_eq!(item.text(), "item 7");

    let created = send(server.addr, Method::POST, "/items").await.unwrap();
    assert_eq!(created.status, StatusCode::CREATED);

    let denied = send(server.addr, Method::DELETE, "/items/7").await.unwrap();
    assert_eq!(denied.status, StatusCode::UNAUTHORIZED);

    let allowed = send_with(server.addr, Method::DELETE, "/items/7", &[("authorization", "Bearer t")])
        .await
        .unwrap();
    assert_eq!(allowed.status, StatusCode::NO_CONTENT);

    assert_eq!(observed.load(Ordering::SeqCst), 4);
    server.stop().await;
}

#[tokio::test]
async fn not_found_still_passes_global_chain_once() {
    let observed = Arc::new(AtomicUsize::new(0));
    let server = start(Arc::clone(&observed)).await;

    let missing = send(server.addr, Method::GET, "/missing").await.unwrap();
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn wrong_method_gets_405_with_allow() {
    let server = start(Arc::default()).await;

    let res = send(server.addr, Method::PUT, "/items/3").await.unwrap();
    assert_eq!(res.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(res.headers["allow"], "DELETE, GET, HEAD");

    server.stop().await;
}

#[tokio::test]
async fn request_id_round_trips() {
    let server = start(Arc::default()).await;

    let echoed = send_with(server.addr, Method::GET, "/items/1", &[("x-request-id", "trace-me")])
        .await
        .unwrap();
    assert_eq!(echoed.headers["x-request-id"], "trace-me");

    let generated = send(server.addr, Method::GET, "/items/1").await.unwrap();
    let id = generated.headers["x-request-id"].to_str().unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok(), "{id}");

    server.stop().await;
}

#[tokio::test]
async fn health_probes_are_mounted() {
    let server = start(Arc::default()).await;

    let live = send(server.addr, Method::GET, "/healthz").await.unwrap();
    assert_eq!(live.text(), "ok");
    let ready = send(server.addr, Method::GET, "/readyz").await.unwrap();
    assert_eq!(ready.status, StatusCode::OK);
    assert_eq!(ready.text(), "ready");

    server.stop().await;
}
