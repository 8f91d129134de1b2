//! Shutdown signalling and teardown.
//!
//! Three pieces cooperate here:
//!
//! - [`CancelToken`] is the single source of truth for "shutdown requested".
//!   The lifecycle owns the root token; the accept loop watches it and every
//!   request context holds a [`child`](CancelToken::child) of it.
//! - [`Signals`] turns SIGINT / SIGTERM / SIGHUP into one event. Once the
//!   first signal arrives, a second one terminates the process immediately.
//! - [`ShutdownRegistry`] collects cleanups during startup and runs each of
//!   them exactly once during teardown, joining every failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::select_all;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{BoxError, Error};

// ── CancelToken ───────────────────────────────────────────────────────────────

/// A cloneable cancellation flag that can be awaited.
///
/// Cancelling a token cancels every child derived from it; cancelling a
/// child leaves the parent untouched. Cancellation is idempotent and
/// permanent.
///
/// ```rust
/// use keel::CancelToken;
///
/// let root = CancelToken::new();
/// let child = root.child();
///
/// child.cancel();
/// assert!(child.is_cancelled());
/// assert!(!root.is_cancelled());
///
/// let other = root.child();
/// root.cancel();
/// assert!(other.is_cancelled());
/// ```
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    node: Arc<Node>,
}

#[derive(Debug, Default)]
struct Node {
    cancelled: AtomicBool,
    notify: Notify,
    parent: Option<Arc<Node>>,
}

impl Node {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a token that is cancelled when either it or `self` is.
    pub fn child(&self) -> Self {
        Self {
            node: Arc::new(Node {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                parent: Some(Arc::clone(&self.node)),
            }),
        }
    }

    pub fn cancel(&self) {
        if !self.node.cancelled.swap(true, Ordering::AcqRel) {
            self.node.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.node.is_cancelled()
    }

    /// Resolves once this token or any of its ancestors is cancelled.
    /// Completes immediately if that already happened.
    pub async fn cancelled(&self) {
        let mut lineage = Vec::new();
        let mut node = Some(&self.node);
        while let Some(n) = node {
            lineage.push(Arc::clone(n));
            node = n.parent.as_ref();
        }

        loop {
            // Register interest before checking the flag so a cancel that
            // lands in between still wakes us.
            let waits: Vec<_> = lineage
                .iter()
                .map(|n| {
                    let mut notified = Box::pin(n.notify.notified());
                    notified.as_mut().enable();
                    notified
                })
                .collect();

            if self.is_cancelled() {
                return;
            }
            select_all(waits).await;
        }
    }
}

// ── OS signals ────────────────────────────────────────────────────────────────

/// Installed handlers for the process shutdown signals.
///
/// On Unix this listens for **SIGINT** (Ctrl-C), **SIGTERM** (sent by the
/// Kubernetes control plane) and **SIGHUP**. Elsewhere only Ctrl-C exists.
pub struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl Signals {
    /// Registers the handlers. Must be called from inside a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
                hangup: signal(SignalKind::hangup())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Waits for the next signal and returns its name.
    pub async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => "SIGINT",
                _ = self.terminate.recv() => "SIGTERM",
                _ = self.hangup.recv()    => "SIGHUP",
            }
        }
        #[cfg(not(unix))]
        {
            match tokio::signal::ctrl_c().await {
                Ok(()) => "ctrl-c",
                Err(e) => {
                    error!(error = %e, "ctrl-c handler failed");
                    std::future::pending().await
                }
            }
        }
    }

    /// Stops treating signals as a graceful request.
    ///
    /// tokio cannot hand the default disposition back to the OS, so this
    /// emulates it: the next signal exits the process with status 130.
    pub fn force_exit_on_next(mut self) {
        tokio::spawn(async move {
            let name = self.recv().await;
            warn!(signal = name, "second signal received, exiting immediately");
            std::process::exit(130);
        });
    }
}

// ── ShutdownRegistry ──────────────────────────────────────────────────────────

type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'static>>;
type Cleanup = Box<dyn FnOnce() -> CleanupFuture + Send + 'static>;

/// Ordered cleanups accumulated while the process starts.
///
/// Registration happens only during startup; [`run`](ShutdownRegistry::run)
/// consumes the registry, which is what makes "exactly once" hold.
#[derive(Default)]
pub struct ShutdownRegistry {
    cleanups: Vec<(String, Cleanup)>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async cleanup.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.cleanups
            .push((name.into(), Box::new(move || Box::pin(cleanup()))));
    }

    /// Registers a cleanup that blocks, such as flushing an exporter.
    /// It runs on tokio's blocking pool.
    pub fn register_blocking<F>(&mut self, name: impl Into<String>, cleanup: F)
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.register(name, move || async move {
            tokio::task::spawn_blocking(cleanup)
                .await
                .map_err(|e| -> BoxError { Box::new(e) })?
        });
    }

    pub fn len(&self) -> usize {
        self.cleanups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cleanups.is_empty()
    }

    /// Runs every cleanup in registration order.
    ///
    /// A failing cleanup never stops the ones after it; all failures come
    /// back joined into a single error.
    pub async fn run(self) -> Result<(), Error> {
        let mut failures = Vec::new();
        for (name, cleanup) in self.cleanups {
            debug!(cleanup = %name, "running shutdown cleanup");
            match cleanup().await {
                Ok(()) => debug!(cleanup = %name, "shutdown cleanup done"),
                Err(source) => {
                    error!(cleanup = %name, error = %source, "shutdown cleanup failed");
                    failures.push(Error::Cleanup { name, source });
                }
            }
        }
        if failures.is_empty() {
            info!("shutdown cleanups complete");
        }
        Error::join(failures).map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownRegistry")
            .field("cleanups", &self.cleanups.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let a = CancelToken::new();
        let b = a.clone();
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn grandchild_sees_root_cancel() {
        let root = CancelToken::new();
        let grandchild = root.child().child();
        root.cancel();
        assert!(grandchild.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_on_parent_cancel() {
        let root = CancelToken::new();
        let child = root.child();

        let waiter = tokio::spawn(async move { child.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        root.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("child should observe parent cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_completes_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(10), token.cancelled())
            .await
            .expect("should not wait");
    }

    #[tokio::test]
    async fn registry_runs_in_order_and_joins_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ShutdownRegistry::new();

        for (name, fail) in [("tracer", false), ("meter", true), ("logger", true), ("cache", false)] {
            let order = Arc::clone(&order);
            registry.register(name, move || async move {
                order.lock().unwrap().push(name);
                if fail {
                    Err(format!("{name} failed").into())
                } else {
                    Ok(())
                }
            });
        }

        let err = registry.run().await.unwrap_err();
        assert_eq!(*order.lock().unwrap(), vec!["tracer", "meter", "logger", "cache"]);
        let names: Vec<_> = err
            .errors()
            .into_iter()
            .map(|e| match e {
                Error::Cleanup { name, .. } => name.clone(),
                other => panic!("unexpected error {other}"),
            })
            .collect();
        assert_eq!(names, vec!["meter", "logger"]);
    }

    #[tokio::test]
    async fn empty_registry_is_ok() {
        assert!(ShutdownRegistry::new().run().await.is_ok());
    }

    #[tokio::test]
    async fn blocking_cleanup_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let mut registry = ShutdownRegistry::new();
        let flag = Arc::clone(&ran);
        registry.register_blocking("flush", move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        registry.run().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
