//! Process lifecycle: start, serve, drain, stop.
//!
//! ```text
//! Starting ──► Serving ──► Draining ──► Stopped
//!    │            │
//!    └──► Failed ◄┘
//! ```
//!
//! - **Starting** loads configuration, brings telemetry up (its shutdown is
//!   registered for teardown), builds the router and binds the listener.
//!   Any failure here is reported through the fallback logger and nothing is
//!   left listening.
//! - **Serving** runs the accept loop on a background task while the
//!   foreground waits for either a shutdown signal or the accept loop dying.
//! - **Draining** cancels the shutdown token, marks the process not-ready and
//!   lets in-flight requests finish within the grace period.
//! - **Stopped** / **Failed**: every registered cleanup runs exactly once, in
//!   registration order, and all failures are joined into the outcome.
//!
//! ```rust,no_run
//! use std::process::ExitCode;
//! use keel::{Lifecycle, Request};
//!
//! #[tokio::main]
//! async fn main() -> ExitCode {
//!     Lifecycle::new(|router| {
//!         router.handle("GET /hello", hello)?;
//!         Ok(())
//!     })
//!     .run()
//!     .await
//!     .exit_code()
//! }
//!
//! async fn hello(_req: Request) -> &'static str { "hello" }
//! ```

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::process::ExitCode;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError, ConfigLoader};
use crate::error::{BoxError, Error};
use crate::health::{self, Readiness};
use crate::logging::Loggers;
use crate::router::Router;
use crate::server::Server;
use crate::shutdown::{CancelToken, ShutdownRegistry, Signals};
use crate::telemetry::{OtelTelemetry, Telemetry};

/// Environment prefix read by the default configuration source.
pub const ENV_PREFIX: &str = "KEEL";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Starting,
    Serving,
    Draining,
    Stopped,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Stopped | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Starting => "starting",
            State::Serving => "serving",
            State::Draining => "draining",
            State::Stopped => "stopped",
            State::Failed => "failed",
        })
    }
}

/// How a [`Lifecycle::run`] ended.
#[derive(Debug)]
pub struct Outcome {
    pub state: State,
    /// The bound address, if startup got that far.
    pub local_addr: Option<SocketAddr>,
    /// Every error from every phase, joined.
    pub error: Option<Error>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// `0` on a clean run, `1` if any phase failed.
    pub fn code(&self) -> u8 {
        u8::from(!self.is_success())
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

// ── Observer ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
struct Snapshot {
    state: State,
    local_addr: Option<SocketAddr>,
}

/// Read-only view of a running lifecycle's state.
#[derive(Clone, Debug)]
pub struct Observer(watch::Receiver<Snapshot>);

impl Observer {
    pub fn state(&self) -> State {
        self.0.borrow().state
    }

    /// Waits until the lifecycle is serving and returns its address, or
    /// `None` if it ended without ever serving.
    pub async fn serving(&mut self) -> Option<SocketAddr> {
        let snapshot = self
            .0
            .wait_for(|s| s.state != State::Starting)
            .await
            .ok()?;
        (snapshot.state == State::Serving).then_some(snapshot.local_addr).flatten()
    }

    /// Waits for the next state change.
    pub async fn changed(&mut self) -> Option<State> {
        self.0.changed().await.ok()?;
        Some(self.state())
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

type ConfigSource = Box<dyn FnOnce() -> Result<Config, ConfigError> + Send + 'static>;
type Routes = Box<dyn FnOnce(&mut Router) -> Result<(), Error> + Send + 'static>;
type ShutdownFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum SignalSource {
    Os,
    Custom(ShutdownFuture),
}

/// Orchestrates one run of the service.
pub struct Lifecycle {
    config: ConfigSource,
    telemetry: Box<dyn Telemetry>,
    routes: Routes,
    signal: SignalSource,
    loggers: Loggers,
    registry: ShutdownRegistry,
    state: watch::Sender<Snapshot>,
}

impl Lifecycle {
    /// A lifecycle serving the routes `routes` registers.
    ///
    /// Defaults: configuration from `KEEL__SECTION__KEY` environment
    /// variables, [`OtelTelemetry`], OS signals, a stderr fallback logger.
    pub fn new<F>(routes: F) -> Self
    where
        F: FnOnce(&mut Router) -> Result<(), Error> + Send + 'static,
    {
        let (state, _) = watch::channel(Snapshot { state: State::Starting, local_addr: None });
        Self {
            config: Box::new(|| ConfigLoader::new().with_env_prefix(ENV_PREFIX).load()),
            telemetry: Box::new(OtelTelemetry),
            routes: Box::new(routes),
            signal: SignalSource::Os,
            loggers: Loggers::new(),
            registry: ShutdownRegistry::new(),
            state,
        }
    }

    pub fn with_config(self, config: Config) -> Self {
        self.with_config_source(move || {
            config.validate()?;
            Ok(config)
        })
    }

    pub fn with_config_source<F>(mut self, source: F) -> Self
    where
        F: FnOnce() -> Result<Config, ConfigError> + Send + 'static,
    {
        self.config = Box::new(source);
        self
    }

    pub fn with_telemetry(mut self, telemetry: impl Telemetry + 'static) -> Self {
        self.telemetry = Box::new(telemetry);
        self
    }

    pub fn with_loggers(mut self, loggers: Loggers) -> Self {
        self.loggers = loggers;
        self
    }

    /// Replaces OS signals: draining starts when `signal` resolves.
    pub fn shutdown_on(mut self, signal: impl Future<Output = ()> + Send + 'static) -> Self {
        self.signal = SignalSource::Custom(Box::pin(signal));
        self
    }

    /// Registers an async cleanup. Cleanups run after draining, in
    /// registration order; the telemetry shutdown is registered after these.
    pub fn on_shutdown<F, Fut>(mut self, name: impl Into<String>, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.registry.register(name, cleanup);
        self
    }

    pub fn observe(&self) -> Observer {
        Observer(self.state.subscribe())
    }

    /// Runs the service to completion.
    pub async fn run(self) -> Outcome {
        let Self { config, telemetry, routes, signal, loggers, mut registry, state } = self;
        let mut lifecycle = Run { loggers, state, local_addr: None };

        // ── Starting ──────────────────────────────────────────────────────────
        let started = async {
            let config = config()?;
            let telemetry_shutdown = telemetry.setup(&config.telemetry)?;
            registry.register_blocking("telemetry", telemetry_shutdown);

            let readiness = Readiness::new();
            let mut router = Router::new();
            routes(&mut router)?;
            if config.server.health_routes {
                router.handle("GET /healthz", health::liveness)?;
                router.handle("GET /readyz", health::readiness(readiness.clone()))?;
            }

            let signal: SignalFuture = match signal {
                SignalSource::Os => {
                    let mut signals = Signals::install().map_err(Error::Signal)?;
                    Box::pin(async move {
                        let name = signals.recv().await;
                        signals.force_exit_on_next();
                        name
                    })
                }
                SignalSource::Custom(fut) => Box::pin(async move {
                    fut.await;
                    "shutdown requested"
                }),
            };

            let server = Server::bind(&config.server).await?;
            Ok::<_, Error>((server, router.into_app(), readiness, signal))
        }
        .await;

        let (server, app, readiness, signal) = match started {
            Ok(parts) => parts,
            Err(err) => {
                lifecycle.loggers.fallback().in_scope(|| error!(error = %err, "startup failed"));
                return lifecycle.finish(State::Failed, vec![err], registry).await;
            }
        };

        // ── Serving ───────────────────────────────────────────────────────────
        lifecycle.local_addr = Some(server.local_addr());
        let token = CancelToken::new();
        let serving = tokio::spawn(server.serve(app, token.clone()));
        readiness.set(true);
        lifecycle.enter(State::Serving);

        lifecycle.supervise(serving, signal, &readiness, &token, registry).await
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("registry", &self.registry)
            .field("loggers", &self.loggers)
            .finish_non_exhaustive()
    }
}

/// Folds the accept loop's result into `errors`. Returns whether the
/// listener itself failed.
fn record(res: Result<Result<(), Error>, JoinError>, errors: &mut Vec<Error>) -> bool {
    match res {
        Ok(Ok(())) => false,
        Ok(Err(err)) => {
            let listener_failed = err
                .errors()
                .iter()
                .any(|e| matches!(e, Error::Listener(_)));
            errors.push(err);
            listener_failed
        }
        Err(join) => {
            errors.push(Error::ListenerTask(join.to_string()));
            true
        }
    }
}

type SignalFuture = Pin<Box<dyn Future<Output = &'static str> + Send>>;

struct Run {
    loggers: Loggers,
    state: watch::Sender<Snapshot>,
    local_addr: Option<SocketAddr>,
}

impl Run {
    /// Waits for the accept loop to die or a shutdown signal, then drains
    /// and tears down.
    async fn supervise(
        self,
        mut serving: JoinHandle<Result<(), Error>>,
        signal: SignalFuture,
        readiness: &Readiness,
        token: &CancelToken,
        registry: ShutdownRegistry,
    ) -> Outcome {
        let mut errors = Vec::new();
        let ended_early = tokio::select! {
            res = &mut serving => Some(res),
            name = signal => {
                info!(signal = name, "shutdown signal received");
                None
            }
        };

        // ── Draining ──────────────────────────────────────────────────────────
        readiness.set(false);
        token.cancel();
        let failed = match ended_early {
            Some(res) => {
                let failed = record(res, &mut errors);
                if !failed {
                    warn!("listener stopped without a shutdown request");
                }
                self.enter(State::Draining);
                failed
            }
            None => {
                self.enter(State::Draining);
                record(serving.await, &mut errors);
                false
            }
        };

        let end = if failed { State::Failed } else { State::Stopped };
        self.finish(end, errors, registry).await
    }

    fn enter(&self, state: State) {
        info!(%state, "lifecycle state changed");
        self.state.send_replace(Snapshot { state, local_addr: self.local_addr });
    }

    async fn finish(self, end: State, mut errors: Vec<Error>, registry: ShutdownRegistry) -> Outcome {
        if let Err(err) = registry.run().await {
            errors.push(err);
        }

        let error = Error::join(errors.into_iter().flat_map(flatten));
        self.loggers.fallback().in_scope(|| match &error {
            Some(err) => error!(state = %end, error = %err, "shutdown finished with errors"),
            None => info!(state = %end, "shutdown finished"),
        });
        self.enter(end);

        Outcome { state: end, local_addr: self.local_addr, error }
    }
}

/// Unpacks nested aggregates so the outcome is a single flat list.
fn flatten(err: Error) -> Vec<Error> {
    match err {
        Error::Joined(joined) => joined.into_inner(),
        other => vec![other],
    }
}
