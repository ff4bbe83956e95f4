//! The `/query` endpoint: classify the statement and route it.
//!
//! Reads go to one randomly-chosen backend (all backends are assumed to
//! hold the same data); mutations must reach every backend. Statements the
//! relay cannot route fail closed with a 400.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use tracing::warn;

use crate::backend::PostResponse;
use crate::error::RelayError;
use crate::server::{json_error, sorted_query, RelayState};

/// How a statement is routed, decided by its first keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatementClass {
    /// Safe to answer from any single backend.
    SingleNode,
    /// Must be applied to every backend.
    AllNode,
    /// Unroutable; includes `KILL`, whose target node is unknowable.
    Unsupported,
}

pub(crate) fn classify(token: &str) -> StatementClass {
    match token {
        "SELECT" | "SHOW" => StatementClass::SingleNode,
        "DELETE" | "DROP" | "GRANT" | "REVOKE" | "ALTER" | "SET" | "CREATE" => {
            StatementClass::AllNode
        }
        _ => StatementClass::Unsupported,
    }
}

pub(crate) async fn handle(State(state): State<Arc<RelayState>>, req: Request) -> Response {
    let params: Vec<(String, String)> =
        serde_urlencoded::from_str(req.uri().query().unwrap_or("")).unwrap_or_default();

    let auth = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let statement = params
        .iter()
        .find(|(k, _)| k == "q")
        .map(|(_, v)| v.to_uppercase())
        .unwrap_or_default();
    let token = statement
        .trim_matches(&[' ', '\t', '\r', '\n'][..])
        .split(' ')
        .next()
        .unwrap_or("");

    let query = sorted_query(&params);

    match classify(token) {
        StatementClass::SingleNode => single_node(&state, &query, auth.as_deref()).await,
        StatementClass::AllNode => all_node(&state, &query, auth.as_deref()).await,
        StatementClass::Unsupported => json_error(
            StatusCode::BAD_REQUEST,
            &format!("relay is not support `{token}` expr!"),
        ),
    }
}

/// Forward to one backend chosen uniformly at random and relay its response.
async fn single_node(state: &RelayState, query: &str, auth: Option<&str>) -> Response {
    if state.query_backends.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "request failed");
    }

    let n = rand::thread_rng().gen_range(0..state.query_backends.len());
    let backend = &state.query_backends[n];

    match backend.post(Bytes::new(), query, auth).await {
        Ok(response) => relay_response(response),
        Err(e) => {
            warn!(backend = %backend.name(), error = %e, "query failed");
            json_error(StatusCode::BAD_REQUEST, "request failed")
        }
    }
}

/// Forward to every backend in order. The outcome is overwritten on each
/// iteration, so the final backend alone decides the response: its body on
/// success, 500 with no body on failure, even when an earlier backend
/// succeeded. Results are not merged and partial success is invisible to
/// the client (future work).
async fn all_node(state: &RelayState, query: &str, auth: Option<&str>) -> Response {
    let mut result: Option<Result<PostResponse, RelayError>> = None;

    for backend in &state.query_backends {
        let outcome = backend.post(Bytes::new(), query, auth).await;
        if let Err(e) = &outcome {
            warn!(backend = %backend.name(), error = %e, "query fan-out failed");
        }
        result = Some(outcome);
    }

    match result {
        Some(Ok(response)) => Body::from(response.body).into_response(),
        _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Copy the backend's status, headers, and body onto the client response.
/// `Content-Length` is recomputed from the body rather than copied.
fn relay_response(upstream: PostResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;

    for (name, value) in &upstream.headers {
        if name != header::CONTENT_LENGTH && name != header::TRANSFER_ENCODING {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_route_to_a_single_node() {
        assert_eq!(classify("SELECT"), StatementClass::SingleNode);
        assert_eq!(classify("SHOW"), StatementClass::SingleNode);
    }

    #[test]
    fn mutations_route_to_all_nodes() {
        for token in ["DELETE", "DROP", "GRANT", "REVOKE", "ALTER", "SET", "CREATE"] {
            assert_eq!(classify(token), StatementClass::AllNode, "{token}");
        }
    }

    #[test]
    fn kill_and_unknown_fail_closed() {
        assert_eq!(classify("KILL"), StatementClass::Unsupported);
        assert_eq!(classify("EXPLAIN"), StatementClass::Unsupported);
        assert_eq!(classify(""), StatementClass::Unsupported);
    }

    #[test]
    fn relayed_response_recomputes_content_length() {
        let mut headers = http::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(header::CONTENT_LENGTH, "9999".parse().unwrap());

        let response = relay_response(PostResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"{}"),
        });

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    }
}
