//! Backend abstractions: posting, buffering, and named composition.

mod poster;
mod retry;

pub use self::poster::{PostResponse, Poster, SimplePoster};
pub use self::retry::RetryBuffer;

use bytes::Bytes;
use std::sync::Arc;

use crate::config::{
    HttpOutputConfig, HttpQueryConfig, DEFAULT_BATCH_SIZE_KB, DEFAULT_HTTP_TIMEOUT,
    DEFAULT_MAX_DELAY_INTERVAL, KB, MB,
};
use crate::error::RelayError;

/// A named backend: a display name plus the poster writes or queries go
/// through. Immutable after construction.
pub struct HttpBackend {
    name: String,
    poster: Arc<dyn Poster>,
}

impl HttpBackend {
    pub fn new(name: impl Into<String>, poster: Arc<dyn Poster>) -> Self {
        Self {
            name: name.into(),
            poster,
        }
    }

    /// Build a write backend. When `buffer_size_mb` is non-zero the poster
    /// is wrapped in a [`RetryBuffer`] so each backend retries its own
    /// failures without blocking admission.
    pub fn new_write(config: &HttpOutputConfig) -> Result<Self, RelayError> {
        let timeout = config.timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT);
        let mut poster: Arc<dyn Poster> = Arc::new(SimplePoster::new(
            &config.location,
            timeout,
            config.skip_tls_verification,
        )?);

        if config.buffer_size_mb > 0 {
            let max_interval = config
                .max_delay_interval
                .unwrap_or(DEFAULT_MAX_DELAY_INTERVAL);
            let max_batch = if config.max_batch_kb > 0 {
                config.max_batch_kb * KB
            } else {
                DEFAULT_BATCH_SIZE_KB * KB
            };
            poster = Arc::new(RetryBuffer::new(
                config.buffer_size_mb * MB,
                max_batch,
                max_interval,
                poster,
            ));
        }

        Ok(Self {
            name: backend_name(&config.name, &config.location),
            poster,
        })
    }

    /// Build a query backend. Queries always go through a direct poster.
    pub fn new_query(config: &HttpQueryConfig) -> Result<Self, RelayError> {
        let timeout = config.timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT);
        let poster = Arc::new(SimplePoster::new(&config.location, timeout, true)?);

        Ok(Self {
            name: backend_name(&config.name, &config.location),
            poster,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn post(
        &self,
        body: Bytes,
        query: &str,
        auth: Option<&str>,
    ) -> Result<PostResponse, RelayError> {
        self.poster.post(body, query, auth).await
    }
}

fn backend_name(name: &str, location: &str) -> String {
    if name.is_empty() {
        location.to_owned()
    } else {
        name.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    fn output_config(toml: &str) -> HttpOutputConfig {
        RelayConfig::parse(toml).unwrap().outputs.remove(0)
    }

    #[tokio::test]
    async fn write_backend_name_defaults_to_location() {
        let config = output_config(
            r#"
            [[outputs]]
            location = "http://127.0.0.1:8086/write"
        "#,
        );

        let backend = HttpBackend::new_write(&config).unwrap();
        assert_eq!(backend.name(), "http://127.0.0.1:8086/write");
    }

    #[tokio::test]
    async fn write_backend_keeps_configured_name() {
        let config = output_config(
            r#"
            [[outputs]]
            name = "local1"
            location = "http://127.0.0.1:8086/write"
            buffer_size_mb = 1
        "#,
        );

        let backend = HttpBackend::new_write(&config).unwrap();
        assert_eq!(backend.name(), "local1");
    }

    #[tokio::test]
    async fn write_backend_rejects_bad_location() {
        let config = output_config(
            r#"
            [[outputs]]
            location = "nonsense"
        "#,
        );

        assert!(matches!(
            HttpBackend::new_write(&config),
            Err(RelayError::InvalidBackendUrl(_))
        ));
    }

    #[tokio::test]
    async fn query_backend_name_defaults_to_location() {
        let config = HttpQueryConfig {
            name: String::new(),
            location: "http://127.0.0.1:8086/query".to_owned(),
            timeout: None,
        };

        let backend = HttpBackend::new_query(&config).unwrap();
        assert_eq!(backend.name(), "http://127.0.0.1:8086/query");
    }
}
