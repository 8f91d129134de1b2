//! Typed configuration snapshot.
//!
//! The lifecycle consumes one [`Config`] at startup. It is layered the usual
//! way: built-in defaults, then an optional TOML file, then
//! `PREFIX__SECTION__KEY` environment overrides, then validation.
//!
//! ```toml
//! [server]
//! addr = "0.0.0.0:8080"
//! read_timeout_secs = 5
//! write_timeout_secs = 10
//! idle_timeout_secs = 120
//! shutdown_grace_secs = 5
//! max_body_bytes = 2097152
//!
//! [telemetry]
//! service_name = "orders"
//! log_format = "json"
//! otlp_endpoint = "http://localhost:4317"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
/// Added on top of the longest read/write timeout to form the drain window.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse environment variable {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid {
                field: "server.addr",
                reason: format!("invalid socket address: {}", self.server.addr),
            });
        }
        if self.telemetry.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "telemetry.service_name",
                reason: "must not be empty".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.telemetry.sample_ratio) {
            return Err(ConfigError::Invalid {
                field: "telemetry.sample_ratio",
                reason: "must be between 0.0 and 1.0".into(),
            });
        }
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&self.telemetry.log_level) {
            return Err(ConfigError::Invalid {
                field: "telemetry.log_level",
                reason: e.to_string(),
            });
        }
        Ok(())
    }
}

// ── ServerConfig ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub addr: String,
    /// Zero disables this timeout, as it does the write and idle ones.
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// A connection with no request in flight for this long is closed,
    /// whichever HTTP version it speaks.
    pub idle_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Larger request bodies are answered with `413`. Zero lifts the cap.
    pub max_body_bytes: usize,
    /// Mount `/healthz` and `/readyz` on the router.
    pub health_routes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_owned(),
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            health_routes: true,
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// How long in-flight requests get to finish once draining starts:
    /// the longer of the read and write timeouts, plus the shutdown grace.
    pub fn grace_period(&self) -> Duration {
        self.read_timeout().max(self.write_timeout())
            + Duration::from_secs(self.shutdown_grace_secs)
    }
}

// ── TelemetryConfig ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    /// `EnvFilter` directive, e.g. `info` or `keel=debug,hyper=warn`.
    pub log_level: String,
    pub log_format: LogFormat,
    /// Span export is disabled when unset.
    pub otlp_endpoint: Option<String>,
    pub sample_ratio: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_owned(),
            service_version: env!("CARGO_PKG_VERSION").to_owned(),
            environment: "development".to_owned(),
            log_level: "info".to_owned(),
            log_format: LogFormat::Json,
            otlp_endpoint: None,
            sample_ratio: 1.0,
        }
    }
}

// ── ConfigLoader ──────────────────────────────────────────────────────────────

/// Layered loader: defaults → file → environment → validation.
///
/// ```rust,no_run
/// use keel::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .with_optional_file("keel.toml")?
///     .with_env_prefix("KEEL")
///     .load()?;
/// # Ok::<(), keel::ConfigError>(())
/// ```
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config: Config,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        self.config = toml::from_str(&content)?;
        Ok(self)
    }

    /// Like [`with_file`](Self::with_file), but a missing file is not an error.
    pub fn with_optional_file(self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    pub fn load(mut self) -> Result<Config, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            self.apply_env(&prefix, std::env::vars())?;
        }
        self.config.validate()?;
        Ok(self.config)
    }

    fn apply_env(
        &mut self,
        prefix: &str,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        let marker = format!("{prefix}__");
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(&marker) else { continue };
            let parts: Vec<&str> = rest.split("__").collect();
            let server = &mut self.config.server;
            let telemetry = &mut self.config.telemetry;
            match parts.as_slice() {
                ["SERVER", "ADDR"] => server.addr = value,
                ["SERVER", "READ_TIMEOUT_SECS"] => server.read_timeout_secs = parse(&key, &value)?,
                ["SERVER", "WRITE_TIMEOUT_SECS"] => server.write_timeout_secs = parse(&key, &value)?,
                ["SERVER", "IDLE_TIMEOUT_SECS"] => server.idle_timeout_secs = parse(&key, &value)?,
                ["SERVER", "SHUTDOWN_GRACE_SECS"] => server.shutdown_grace_secs = parse(&key, &value)?,
                ["SERVER", "MAX_BODY_BYTES"] => server.max_body_bytes = parse(&key, &value)?,
                ["SERVER", "HEALTH_ROUTES"] => server.health_routes = parse(&key, &value)?,
                ["TELEMETRY", "SERVICE_NAME"] => telemetry.service_name = value,
                ["TELEMETRY", "SERVICE_VERSION"] => telemetry.service_version = value,
                ["TELEMETRY", "ENVIRONMENT"] => telemetry.environment = value,
                ["TELEMETRY", "LOG_LEVEL"] => telemetry.log_level = value,
                ["TELEMETRY", "LOG_FORMAT"] => {
                    telemetry.log_format = match value.to_ascii_lowercase().as_str() {
                        "json" => LogFormat::Json,
                        "pretty" => LogFormat::Pretty,
                        _ => {
                            return Err(ConfigError::Env {
                                var: key.clone(),
                                reason: "expected `json` or `pretty`".into(),
                            });
                        }
                    }
                }
                ["TELEMETRY", "OTLP_ENDPOINT"] => {
                    telemetry.otlp_endpoint = (!value.is_empty()).then_some(value)
                }
                ["TELEMETRY", "SAMPLE_RATIO"] => telemetry.sample_ratio = parse(&key, &value)?,
                _ => {
                    return Err(ConfigError::Env {
                        var: key.clone(),
                        reason: "unknown configuration key".into(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Env {
        var: key.to_owned(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.addr, DEFAULT_ADDR);
        assert_eq!(config.telemetry.log_format, LogFormat::Json);
    }

    #[test]
    fn grace_period_uses_longest_timeout() {
        let server = ServerConfig {
            read_timeout_secs: 3,
            write_timeout_secs: 7,
            shutdown_grace_secs: 2,
            ..ServerConfig::default()
        };
        assert_eq!(server.grace_period(), Duration::from_secs(9));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [server]
            addr = "127.0.0.1:3000"

            [telemetry]
            log_format = "pretty"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.addr, "127.0.0.1:3000");
        assert_eq!(config.server.write_timeout_secs, DEFAULT_WRITE_TIMEOUT_SECS);
        assert_eq!(config.telemetry.log_format, LogFormat::Pretty);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Config::from_toml_str("[server]\nport = 80\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn invalid_addr_fails_validation() {
        let err = Config::from_toml_str("[server]\naddr = \"nowhere\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "server.addr", .. }));
    }

    #[test]
    fn sample_ratio_is_bounded() {
        let err = Config::from_toml_str("[telemetry]\nsample_ratio = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "telemetry.sample_ratio", .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let mut loader = ConfigLoader::new();
        loader
            .apply_env(
                "KEEL",
                vars(&[
                    ("KEEL__SERVER__ADDR", "127.0.0.1:9000"),
                    ("KEEL__SERVER__WRITE_TIMEOUT_SECS", "30"),
                    ("KEEL__SERVER__MAX_BODY_BYTES", "1024"),
                    ("KEEL__TELEMETRY__OTLP_ENDPOINT", "http://collector:4317"),
                    ("OTHER__SERVER__ADDR", "ignored"),
                ]),
            )
            .unwrap();
        let config = loader.config;
        assert_eq!(config.server.addr, "127.0.0.1:9000");
        assert_eq!(config.server.write_timeout_secs, 30);
        assert_eq!(config.server.max_body_bytes, 1024);
        assert_eq!(
            config.telemetry.otlp_endpoint.as_deref(),
            Some("http://collector:4317")
        );
    }

    #[test]
    fn env_override_with_bad_number_fails() {
        let mut loader = ConfigLoader::new();
        let err = loader
            .apply_env("KEEL", vars(&[("KEEL__SERVER__READ_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[server]\nshutdown_grace_secs = 1").unwrap();

        let config = ConfigLoader::new().with_file(file.path()).unwrap().load().unwrap();
        assert_eq!(config.server.shutdown_grace_secs, 1);
    }

    #[test]
    fn missing_optional_file_is_fine() {
        let config = ConfigLoader::new()
            .with_optional_file("/definitely/not/here.toml")
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn missing_required_file_fails() {
        let err = ConfigLoader::new().with_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
