//! Relay configuration with layered loading.
//!
//! Configuration is read from a TOML file and may be overridden by
//! `RELAY_`-prefixed environment variables. Durations are human-readable
//! strings such as `"10s"` or `"500ms"`.

use figment::{
    providers::{Env, Format, Toml},
    Error as FigmentError, Figment,
};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Total request timeout applied to backend posts when the output config
/// leaves it unset.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Flush-age threshold and backoff ceiling for buffered outputs when the
/// output config leaves it unset.
pub const DEFAULT_MAX_DELAY_INTERVAL: Duration = Duration::from_secs(10);

/// Advisory batch target for buffered outputs, in KB.
pub const DEFAULT_BATCH_SIZE_KB: usize = 512;

/// Errors that can occur when loading or parsing relay configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error from the Figment configuration library.
    #[error("configuration error: {0}")]
    Figment(Box<FigmentError>),

    /// The specified configuration file was not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Display name for log lines. Defaults to `scheme://addr` when empty.
    #[serde(default)]
    pub name: String,

    /// Address and port the relay listens on.
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Combined PEM file holding both the certificate chain and the private
    /// key. When set the relay serves HTTPS.
    #[serde(default)]
    pub ssl_combined_pem: Option<PathBuf>,

    /// Retention policy injected into writes that do not carry an `rp`
    /// parameter.
    #[serde(default)]
    pub default_retention_policy: Option<String>,

    /// Write backends; every admitted write is fanned out to all of them.
    #[serde(default)]
    pub outputs: Vec<HttpOutputConfig>,

    /// Query backends.
    #[serde(default)]
    pub queries: Vec<HttpQueryConfig>,
}

/// Configuration for one write backend.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpOutputConfig {
    /// Backend name for log lines. Defaults to the location when empty.
    #[serde(default)]
    pub name: String,

    /// URL the relay posts writes to, e.g. `http://127.0.0.1:8086/write`.
    pub location: String,

    /// Total request timeout.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub timeout: Option<Duration>,

    /// Accept self-signed certificates from this backend.
    #[serde(default)]
    pub skip_tls_verification: bool,

    /// Per-batch buffer bound in MB. Zero disables buffering and posts
    /// writes synchronously.
    #[serde(default)]
    pub buffer_size_mb: usize,

    /// Advisory batch target in KB.
    #[serde(default)]
    pub max_batch_kb: usize,

    /// Flush-age threshold and backoff ceiling.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub max_delay_interval: Option<Duration>,
}

/// Configuration for one query backend.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpQueryConfig {
    /// Backend name for log lines. Defaults to the location when empty.
    #[serde(default)]
    pub name: String,

    /// URL the relay forwards queries to, e.g. `http://127.0.0.1:8086/query`.
    pub location: String,

    /// Total request timeout.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub timeout: Option<Duration>,
}

impl RelayConfig {
    /// Loads configuration from the default path (`relay.toml`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("relay.toml")
    }

    /// Loads configuration from the specified file path.
    ///
    /// Environment variables prefixed with `RELAY_` override file settings.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RELAY_").split("__"));

        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::string(content))
            .extract::<Self>()
            .map_err(ConfigError::from)
    }
}

const fn default_bind_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9096)
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix("ms") {
        let ms: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        Ok(Duration::from_millis(ms))
    } else if let Some(stripped) = s.strip_suffix('s') {
        let secs: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        Ok(Duration::from_secs(secs))
    } else if let Some(stripped) = s.strip_suffix('m') {
        let mins: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        Ok(Duration::from_secs(mins * 60))
    } else {
        let secs: u64 = s.parse().map_err(|_| format!("invalid duration: {s}"))?;
        Ok(Duration::from_secs(secs))
    }
}
