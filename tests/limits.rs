mod common;

use std::time::{Duration, Instant};

use keel::telemetry::NoTelemetry;
use keel::{Config, Error, Lifecycle, Method, Request, Router, StatusCode};
use tokio::sync::oneshot;

use common::{local_config, raw_head, raw_until_close, send, send_body};

struct Running {
    addr: std::net::SocketAddr,
    stop: oneshot::Sender<()>,
    run: tokio::task::JoinHandle<keel::Outcome>,
}

impl Running {
    async fn stop(self) {
        self.stop.send(()).unwrap();
        let outcome = self.run.await.unwrap();
        assert!(outcome.is_success(), "{:?}", outcome.error);
    }
}

async fn start<F>(config: Config, routes: F) -> Running
where
    F: FnOnce(&mut Router) -> Result<(), Error> + Send + 'static,
{
    let (stop, stopped) = oneshot::channel::<()>();
    let lifecycle = Lifecycle::new(routes)
        .with_config(config)
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
async fn handler_past_write_timeout_gets_503() {
    let mut config = local_config();
    config.server.write_timeout_secs = 1;
    let server = start(config, |router| {
        router.handle("GET /slow", |_req: Request| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            "too late"
        })?;
        Ok(())
    })
    .await;

    let began = Instant::now();
    let res = send(server.addr, Method::GET, "/slow").await.unwrap();
    assert_eq!(res.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(began.elapsed() < Duration::from_secs(5), "took {:?}", began.elapsed());

    server.stop().await;
}

#[tokio::test]
async fn stalled_body_gets_408() {
    let mut config = local_config();
    config.server.read_timeout_secs = 1;
    let server = start(config, |router| {
        router.handle("POST /upload", |req: Request| async move { req.body().len().to_string() })?;
        Ok(())
    })
    .await;

    let head = raw_head(
        server.addr,
        b"POST /upload HTTP/1.1\r\nhost: keel\r\ncontent-length: 10\r\n\r\nabc",
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 408"), "{head}");

    server.stop().await;
}

#[tokio::test]
async fn oversized_body_gets_413() {
    let mut config = local_config();
    config.server.max_body_bytes = 16;
    let server = start(config, |router| {
        router.handle("POST /upload", |req: Request| async move { req.body().len().to_string() })?;
        Ok(())
    })
    .await;

    let small = send_body(server.addr, Method::POST, "/upload", vec![b'a'; 16]).await.unwrap();
    assert_eq!(small.status, StatusCode::OK);
    assert_eq!(small.text(), "16");

    let large = send_body(server.addr, Method::POST, "/upload", vec![b'a'; 64]).await.unwrap();
    assert_eq!(large.status, StatusCode::PAYLOAD_TOO_LARGE);

    server.stop().await;
}

#[tokio::test]
async fn idle_keep_alive_connection_is_closed() {
    let mut config = local_config();
    config.server.read_timeout_secs = 0;
    config.server.idle_timeout_secs = 1;
    let server = start(config, |router| {
        router.handle("GET /ping", |_req: Request| async { "pong" })?;
        Ok(())
    })
    .await;

    let began = Instant::now();
    let reply = raw_until_close(
        server.addr,
        b"GET /ping HTTP/1.1\r\nhost: keel\r\n\r\n",
        Duration::from_secs(5),
    )
    .await
    .expect("idle connection should be closed by the server");
    assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
    assert!(reply.ends_with("pong"), "{reply}");
    assert!(began.elapsed() >= Duration::from_millis(900), "closed after {:?}", began.elapsed());

    server.stop().await;
}
