//! Logger registry.
//!
//! keel logs through `tracing` everywhere. Two kinds of subscriber matter:
//!
//! - the **fallback** logger: a plain stderr formatter with no dependency on
//!   telemetry. The lifecycle uses it for anything that can happen before
//!   telemetry is up or after it has been torn down (startup failures, the
//!   final teardown report).
//! - the **instrumented** logger: installed as the global default by the
//!   telemetry collaborator once exporters exist.
//!
//! [`Loggers`] is built once at startup and passed by reference. Named
//! loggers can be registered for subsystems that want their own output;
//! looking up a name that was never registered yields the fallback.

use std::collections::HashMap;

use tracing::Dispatch;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, TelemetryConfig};

/// Explicit registry of log dispatchers.
#[derive(Clone)]
pub struct Loggers {
    fallback: Dispatch,
    named: HashMap<String, Dispatch>,
}

impl Loggers {
    /// Registry whose fallback writes human-readable lines to stderr.
    pub fn new() -> Self {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(false)
            .finish();
        Self::with_fallback(Dispatch::new(subscriber))
    }

    pub fn with_fallback(fallback: Dispatch) -> Self {
        Self { fallback, named: HashMap::new() }
    }

    pub fn fallback(&self) -> Fallback<'_> {
        Fallback(&self.fallback)
    }

    pub fn register(&mut self, name: impl Into<String>, dispatch: Dispatch) {
        self.named.insert(name.into(), dispatch);
    }

    /// Returns the dispatcher registered under `name`, or the fallback.
    pub fn get(&self, name: &str) -> &Dispatch {
        self.named.get(name).unwrap_or(&self.fallback)
    }
}

impl Default for Loggers {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Loggers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loggers")
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Handle for running code against the fallback logger.
pub struct Fallback<'a>(&'a Dispatch);

impl Fallback<'_> {
    /// Runs `f` with the fallback logger as the current subscriber, so any
    /// `tracing` event inside it bypasses the global one.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(self.0, f)
    }
}

/// Builds the instrumented subscriber described by `config`.
///
/// The caller decides whether to install it globally.
pub(crate) fn instrumented(config: &TelemetryConfig) -> Result<Dispatch, String> {
    let filter = EnvFilter::try_new(&config.log_level)
        .map_err(|e| format!("invalid log level `{}`: {e}", config.log_level))?;

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::NONE)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::NONE)
            .boxed(),
    };

    let subscriber = Registry::default().with(fmt_layer.with_filter(filter));
    Ok(Dispatch::new(subscriber))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capturing() -> (Dispatch, Captured) {
        let sink = Captured::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        (Dispatch::new(subscriber), sink)
    }

    #[test]
    fn fallback_receives_events_in_scope() {
        let (dispatch, sink) = capturing();
        let loggers = Loggers::with_fallback(dispatch);

        loggers.fallback().in_scope(|| tracing::error!("startup failed"));

        let out = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("startup failed"));
    }

    #[test]
    fn unknown_name_resolves_to_fallback() {
        let (fallback, fallback_sink) = capturing();
        let (named, named_sink) = capturing();
        let mut loggers = Loggers::with_fallback(fallback);
        loggers.register("access", named);

        tracing::dispatcher::with_default(loggers.get("access"), || tracing::info!("hit"));
        tracing::dispatcher::with_default(loggers.get("nope"), || tracing::info!("miss"));

        let named_out = String::from_utf8(named_sink.0.lock().unwrap().clone()).unwrap();
        let fallback_out = String::from_utf8(fallback_sink.0.lock().unwrap().clone()).unwrap();
        assert!(named_out.contains("hit"));
        assert!(fallback_out.contains("miss"));
        assert!(!fallback_out.contains("hit"));
    }

    #[test]
    fn instrumented_rejects_bad_filter() {
        let config = TelemetryConfig {
            log_level: "keel=loud".into(),
            ..TelemetryConfig::default()
        };
        assert!(instrumented(&config).is_err());
    }

    #[test]
    fn instrumented_builds_both_formats() {
        for log_format in [LogFormat::Json, LogFormat::Pretty] {
            let config = TelemetryConfig { log_format, ..TelemetryConfig::default() };
            assert!(instrumented(&config).is_ok());
        }
    }
}
