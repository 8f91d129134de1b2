//! HTTP server and graceful drain.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! Once the shutdown token passed to [`Server::serve`] is cancelled the
//! server:
//! 1. Stops `listener.accept()` and closes the listener.
//! 2. Tells every open connection to finish its current request and close.
//! 3. Waits for them, bounded by the configured grace period.
//! 4. Aborts whatever is still running after that and reports it as
//!    [`Error::DrainTimeout`].
//!
//! Keep `terminationGracePeriodSeconds` above
//! [`ServerConfig::grace_period`] so step 4 happens here rather than as a
//! SIGKILL.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::response::Response;
use crate::router::App;
use crate::shutdown::CancelToken;

/// A bound HTTP server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
}

impl Server {
    /// Binds the listener described by `config`.
    ///
    /// # Errors
    ///
    /// [`Error::Bind`] when the address is malformed or already in use.
    pub async fn bind(config: &ServerConfig) -> Result<Self, Error> {
        let bind_err = |source| Error::Bind { addr: config.addr.clone(), source };
        let listener = TcpListener::bind(&config.addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        info!(addr = %local_addr, "listener bound");
        Ok(Self { listener, local_addr, config: config.clone() })
    }

    /// The address actually bound. Differs from the configured one when it
    /// asked for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections and dispatches them through `app` until
    /// `shutdown` is cancelled, then drains.
    ///
    /// # Errors
    ///
    /// - [`Error::Listener`] if accepting fails with a non-transient error.
    ///   In-flight connections are drained first.
    /// - [`Error::DrainTimeout`] if connections outlive the grace period.
    pub async fn serve(self, app: App, shutdown: CancelToken) -> Result<(), Error> {
        let Self { listener, local_addr, config } = self;

        let limits = Limits {
            read_timeout: enabled(config.read_timeout()),
            write_timeout: enabled(config.write_timeout()),
            max_body: (config.max_body_bytes > 0).then_some(config.max_body_bytes),
        };
        let idle_timeout = enabled(config.idle_timeout());

        let mut builder = ConnBuilder::new(TokioExecutor::new());
        builder.http1().timer(TokioTimer::new());
        if let Some(read) = limits.read_timeout {
            builder.http1().header_read_timeout(read);
        }
        builder.http2().timer(TokioTimer::new());

        let graceful = GracefulShutdown::new();
        let mut tasks = JoinSet::new();
        let mut failure = None;

        info!(addr = %local_addr, "serving");

        loop {
            tokio::select! {
                // Check shutdown first so a signal stops accepting even if
                // more connections are queued.
                biased;

                () = shutdown.cancelled() => {
                    info!(in_flight = tasks.len(), "shutdown requested, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) if is_transient(&e) => {
                            warn!(error = %e, "transient accept error");
                            continue;
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed, draining connections");
                            failure = Some(Error::Listener(e));
                            break;
                        }
                    };
                    debug!(%peer, "connection accepted");

                    let app = app.clone();
                    let token = shutdown.clone();
                    let activity = Activity::new();
                    let busy = Arc::clone(&activity);
                    let svc = service_fn(move |req| {
                        let app = app.clone();
                        let token = token.clone();
                        let request = busy.begin();
                        async move {
                            let res = dispatch(app, req, token, limits).await;
                            drop(request);
                            Ok::<_, Infallible>(res)
                        }
                    });

                    let conn = builder.serve_connection(TokioIo::new(stream), svc).into_owned();
                    let conn = graceful.watch(conn);
                    tasks.spawn(async move {
                        let idle = async {
                            match idle_timeout {
                                Some(idle) => activity.idle_for(idle).await,
                                None => std::future::pending().await,
                            }
                        };
                        tokio::select! {
                            res = conn => {
                                if let Err(e) = res {
                                    debug!(%peer, error = %e, "connection closed with error");
                                }
                            }
                            () = idle => debug!(%peer, "closing idle connection"),
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        let drained = drain(graceful, tasks, config.grace_period()).await;
        Error::join(failure.into_iter().chain(drained.err())).map_or(Ok(()), Err)
    }
}

/// Waits for watched connections, then aborts the stragglers.
async fn drain(graceful: GracefulShutdown, mut tasks: JoinSet<()>, grace: Duration) -> Result<(), Error> {
    while tasks.try_join_next().is_some() {}

    match tokio::time::timeout(grace, graceful.shutdown()).await {
        Ok(()) => {
            while tasks.join_next().await.is_some() {}
            info!("all connections drained");
            Ok(())
        }
        Err(_) => {
            while tasks.try_join_next().is_some() {}
            let remaining = tasks.len();
            warn!(?grace, remaining, "grace period expired, aborting connections");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            Err(Error::DrainTimeout { grace, remaining })
        }
    }
}

fn enabled(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

// ── Idle connections ──────────────────────────────────────────────────────────

/// Request activity on one connection.
struct Activity(Mutex<ActivityState>);

struct ActivityState {
    in_flight: usize,
    last: Instant,
}

/// Marks one request in flight until dropped.
struct InFlight(Arc<Activity>);

impl Activity {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(ActivityState { in_flight: 0, last: Instant::now() })))
    }

    fn begin(self: &Arc<Self>) -> InFlight {
        let mut state = self.0.lock();
        state.in_flight += 1;
        state.last = Instant::now();
        InFlight(Arc::clone(self))
    }

    /// Resolves once no request has been in flight for `idle`.
    async fn idle_for(&self, idle: Duration) {
        loop {
            let wait = {
                let state = self.0.lock();
                if state.in_flight > 0 {
                    idle
                } else {
                    let quiet = state.last.elapsed();
                    if quiet >= idle {
                        return;
                    }
                    idle - quiet
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.0.0.lock();
        state.in_flight -= 1;
        state.last = Instant::now();
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Per-request bounds. `None` means unbounded.
#[derive(Clone, Copy, Debug)]
struct Limits {
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_body: Option<usize>,
}

/// Collects the body, then runs the request through `app` within the
/// write timeout. Every failure becomes a response, so hyper never sees an
/// error.
async fn dispatch(
    app: App,
    req: hyper::Request<Incoming>,
    shutdown: CancelToken,
    limits: Limits,
) -> http::Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();

    let body = Limited::new(body, limits.max_body.unwrap_or(usize::MAX));
    let body = match within(limits.read_timeout, body.collect()).await {
        Some(Ok(collected)) => collected.to_bytes(),
        Some(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(path = %parts.uri.path(), limit = ?limits.max_body, "request body too large");
            return Response::status(StatusCode::PAYLOAD_TOO_LARGE).into_http();
        }
        Some(Err(e)) => {
            debug!(error = %e, "failed to read request body");
            return Response::status(StatusCode::BAD_REQUEST).into_http();
        }
        None => {
            warn!(path = %parts.uri.path(), "request body read timed out");
            return Response::status(StatusCode::REQUEST_TIMEOUT).into_http();
        }
    };

    let path = parts.uri.path().to_owned();
    let req = http::Request::from_parts(parts, body);
    match within(limits.write_timeout, app.call(req, &shutdown)).await {
        Some(res) => res.into_http(),
        None => {
            warn!(%path, write_timeout = ?limits.write_timeout, "handler exceeded write timeout");
            Response::status(StatusCode::SERVICE_UNAVAILABLE).into_http()
        }
    }
}

/// Runs `fut` to completion, or gives up after `limit` when there is one.
async fn within<F: std::future::Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
