//! Unified error type.
//!
//! Application-level failures (404, 422, etc.) are expressed as HTTP
//! [`Response`](crate::Response) values, not as `Error`s. This type surfaces
//! the operator-visible failures: route registration, startup, the listener,
//! and teardown.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::telemetry::TelemetryError;

/// Boxed error produced by shutdown cleanups and other collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by keel's fallible operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A pattern was registered twice, or overlaps an existing pattern in a
    /// way the dispatch table cannot disambiguate.
    #[error("route conflict: `{pattern}` collides with `{existing}`")]
    RouteConflict { pattern: String, existing: String },

    /// A pattern could not be parsed.
    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("telemetry: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] std::io::Error),

    /// The accept loop hit an error it cannot recover from.
    #[error("listener failed: {0}")]
    Listener(#[source] std::io::Error),

    /// The background accept task panicked or was cancelled.
    #[error("listener task ended abnormally: {0}")]
    ListenerTask(String),

    #[error("drain exceeded grace period of {grace:?}, {remaining} connection(s) aborted")]
    DrainTimeout { grace: Duration, remaining: usize },

    #[error("cleanup `{name}` failed: {source}")]
    Cleanup {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("{0}")]
    Joined(JoinedErrors),
}

impl Error {
    /// Joins every error into one aggregate.
    ///
    /// Returns `None` for an empty iterator and the error itself when there
    /// is exactly one, so callers never see a one-element `Joined`.
    pub fn join(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        let mut errors: Vec<Error> = errors.into_iter().collect();
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Joined(JoinedErrors(errors))),
        }
    }

    /// Flattened view of the errors this value stands for.
    pub fn errors(&self) -> Vec<&Error> {
        match self {
            Error::Joined(joined) => joined.0.iter().collect(),
            other => vec![other],
        }
    }
}

/// Several errors that were collected instead of short-circuiting.
#[derive(Debug)]
pub struct JoinedErrors(Vec<Error>);

impl JoinedErrors {
    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<Error> {
        self.0
    }
}

impl fmt::Display for JoinedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleanup(name: &str) -> Error {
        Error::Cleanup {
            name: name.to_owned(),
            source: format!("{name} exploded").into(),
        }
    }

    #[test]
    fn join_of_nothing_is_none() {
        assert!(Error::join(Vec::new()).is_none());
    }

    #[test]
    fn join_of_one_is_that_error() {
        let err = Error::join([cleanup("tracer")]).unwrap();
        assert!(matches!(err, Error::Cleanup { .. }));
        assert_eq!(err.errors().len(), 1);
    }

    #[test]
    fn join_keeps_every_error_in_order() {
        let err = Error::join([cleanup("tracer"), cleanup("meter")]).unwrap();
        assert_eq!(err.errors().len(), 2);
        let text = err.to_string();
        assert_eq!(
            text,
            "cleanup `tracer` failed: tracer exploded; cleanup `meter` failed: meter exploded"
        );
    }

    #[test]
    fn route_conflict_names_both_patterns() {
        let err = Error::RouteConflict {
            pattern: "GET /a".into(),
            existing: "/a".into(),
        };
        assert!(err.to_string().contains("GET /a"));
    }
}
