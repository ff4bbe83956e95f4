//! Relay server: listener binding, path dispatch, TLS, and shutdown.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::HttpBackend;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::{query, write};

/// Shared state handed to the request handlers. Backend lists are immutable
/// after construction.
pub struct RelayState {
    pub name: String,
    pub default_rp: Option<String>,
    pub write_backends: Vec<Arc<HttpBackend>>,
    pub query_backends: Vec<Arc<HttpBackend>>,
}

/// A configured relay instance, ready to serve.
pub struct Relay {
    addr: std::net::SocketAddr,
    scheme: &'static str,
    tls: Option<TlsAcceptor>,
    state: Arc<RelayState>,
    closing: AtomicBool,
}

/// Build a relay from configuration and serve it until cancelled.
pub async fn run(config: RelayConfig, cancel: CancellationToken) -> Result<(), RelayError> {
    Relay::new(config)?.serve(cancel).await
}

impl Relay {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let scheme = if config.ssl_combined_pem.is_some() {
            "https"
        } else {
            "http"
        };

        let tls = config
            .ssl_combined_pem
            .as_deref()
            .map(load_tls_acceptor)
            .transpose()?;

        let mut write_backends = Vec::with_capacity(config.outputs.len());
        for output in &config.outputs {
            write_backends.push(Arc::new(HttpBackend::new_write(output)?));
        }

        let mut query_backends = Vec::with_capacity(config.queries.len());
        for query in &config.queries {
            query_backends.push(Arc::new(HttpBackend::new_query(query)?));
        }

        let name = if config.name.is_empty() {
            format!("{scheme}://{}", config.bind_address)
        } else {
            config.name
        };

        Ok(Self {
            addr: config.bind_address,
            scheme,
            tls,
            state: Arc::new(RelayState {
                name,
                default_rp: config.default_retention_policy,
                write_backends,
                query_backends,
            }),
            closing: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Accept connections until the token is cancelled.
    ///
    /// Each connection is served on its own task. Cancellation sets the
    /// closing flag and stops accepting; in-flight fan-out tasks are
    /// abandoned rather than awaited, and retry buffers are not drained.
    pub async fn serve(self, cancel: CancellationToken) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            scheme = self.scheme,
            name = %self.name(),
            addr = %self.addr,
            "starting relay"
        );

        let app = router(self.state.clone());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.closing.store(true, Ordering::SeqCst);
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _peer)) => self.spawn_connection(stream, app.clone()),
                        Err(e) => {
                            // An accept error after close is a clean shutdown.
                            if self.closing.load(Ordering::SeqCst) {
                                break;
                            }
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        info!(name = %self.name(), "relay stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, app: Router) {
        let service = TowerToHyperService::new(app);

        match self.tls.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                                .serve_connection(TokioIo::new(tls_stream), service)
                                .await
                            {
                                debug!(error = %e, "connection error");
                            }
                        }
                        Err(e) => debug!(error = %e, "TLS handshake failed"),
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(error = %e, "connection error");
                    }
                });
            }
        }
    }
}

/// Build the relay's router. Split out so tests can drive it directly.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ping", any(ping))
        .route("/write", any(write::handle))
        .route("/query", any(query::handle))
        .fallback(not_found)
        .with_state(state)
}

async fn ping() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [("X-InfluxDB-Version", "relay")],
    )
}

async fn not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "invalid write endpoint")
}

/// JSON error body in the exact wire shape `{"error":"<message>"}\n`.
pub(crate) fn json_error(code: StatusCode, message: &str) -> Response {
    let body = format!("{}\n", serde_json::json!({ "error": message }));
    let content_length = HeaderValue::from(body.len());

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = code;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, content_length);

    response
}

/// Re-encode query parameters with sorted keys so equal logical queries
/// produce equal downstream query strings (and equal batch keys).
pub(crate) fn sorted_query(params: &[(String, String)]) -> String {
    let mut pairs = params.to_vec();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    serde_urlencoded::to_string(&pairs).unwrap_or_default()
}

/// Load the TLS acceptor from a single combined PEM file holding both the
/// certificate chain and the private key.
fn load_tls_acceptor(path: &std::path::Path) -> Result<TlsAcceptor, RelayError> {
    let pem = std::fs::read(path)?;

    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(RelayError::Tls(format!(
            "{}: no certificate in combined PEM",
            path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| RelayError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| {
            RelayError::Tls(format!("{}: no private key in combined PEM", path.display()))
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn empty_state() -> Arc<RelayState> {
        Arc::new(RelayState {
            name: "test-relay".to_owned(),
            default_rp: None,
            write_backends: Vec::new(),
            query_backends: Vec::new(),
        })
    }

    async fn body_bytes(response: Response) -> bytes::Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn ping_returns_version_header() {
        let app = router(empty_state());

        let response = app
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get("X-InfluxDB-Version").unwrap(),
            "relay"
        );
    }

    #[tokio::test]
    async fn unknown_path_is_json_404() {
        let app = router(empty_state());

        let response = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            &body_bytes(response).await[..],
            b"{\"error\":\"invalid write endpoint\"}\n"
        );
    }

    #[tokio::test]
    async fn write_rejects_non_post_methods() {
        let app = router(empty_state());

        let response = app
            .oneshot(Request::get("/write?db=x").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(header::ALLOW).unwrap(), "POST");
        assert_eq!(
            &body_bytes(response).await[..],
            b"{\"error\":\"invalid write method\"}\n"
        );
    }

    #[tokio::test]
    async fn write_options_is_no_content() {
        let app = router(empty_state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/write")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers().get(header::ALLOW).unwrap(), "POST");
    }

    #[tokio::test]
    async fn write_requires_db() {
        let app = router(empty_state());

        let response = app
            .oneshot(
                Request::post("/write")
                    .body(Body::from("cpu value=1"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            &body_bytes(response).await[..],
            b"{\"error\":\"missing parameter: db\"}\n"
        );
    }

    #[tokio::test]
    async fn write_rejects_unparseable_points() {
        let app = router(empty_state());

        let response = app
            .oneshot(
                Request::post("/write?db=x")
                    .body(Body::from("cpu value="))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            &body_bytes(response).await[..],
            b"{\"error\":\"unable to parse points\"}\n"
        );
    }

    #[test]
    fn json_error_sets_exact_body_and_length() {
        let response = json_error(StatusCode::BAD_REQUEST, "missing parameter: db");

        let expected = "{\"error\":\"missing parameter: db\"}\n";
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_LENGTH)
                .unwrap()
                .to_str()
                .unwrap(),
            expected.len().to_string()
        );
    }

    #[test]
    fn sorted_query_orders_keys() {
        let params = vec![
            ("precision".to_owned(), "s".to_owned()),
            ("db".to_owned(), "x".to_owned()),
        ];
        assert_eq!(sorted_query(&params), "db=x&precision=s");
    }

    #[test]
    fn sorted_query_escapes_values() {
        let params = vec![("q".to_owned(), "SELECT * FROM cpu".to_owned())];
        assert_eq!(sorted_query(&params), "q=SELECT+*+FROM+cpu");
    }

    #[test]
    fn relay_name_falls_back_to_scheme_and_addr() {
        let config = RelayConfig::parse("bind_address = \"127.0.0.1:9096\"").unwrap();
        let relay = Relay::new(config).unwrap();
        assert_eq!(relay.name(), "http://127.0.0.1:9096");
    }
}
