//! The `/write` endpoint: parse, normalise, and fan out.
//!
//! Writes are acknowledged with 204 as soon as they are parsed; delivery to
//! each backend happens on detached tasks. A 204 therefore means "accepted
//! for relay", not "written".

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use flate2::read::GzDecoder;
use influxdb_line_protocol::parse_lines;
use std::fmt::Write as _;
use std::io::Read;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

use crate::server::{json_error, sorted_query, RelayState};

pub(crate) async fn handle(State(state): State<Arc<RelayState>>, req: Request) -> Response {
    let start = SystemTime::now();
    let (parts, body) = req.into_parts();

    if parts.method != Method::POST {
        if parts.method == Method::OPTIONS {
            return (StatusCode::NO_CONTENT, [(header::ALLOW, "POST")]).into_response();
        }
        let mut response = json_error(StatusCode::METHOD_NOT_ALLOWED, "invalid write method");
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("POST"));
        return response;
    }

    let mut params: Vec<(String, String)> =
        serde_urlencoded::from_str(parts.uri.query().unwrap_or("")).unwrap_or_default();

    // Fail early if the database is missing.
    if !params.iter().any(|(k, v)| k == "db" && !v.is_empty()) {
        return json_error(StatusCode::BAD_REQUEST, "missing parameter: db");
    }

    if let Some(default_rp) = &state.default_rp {
        apply_default_rp(&mut params, default_rp);
    }

    let precision = params
        .iter()
        .find(|(k, _)| k == "precision")
        .map(|(_, v)| Precision::parse(v))
        .unwrap_or_default();

    let gzipped = parts
        .headers
        .get(header::CONTENT_ENCODING)
        .is_some_and(|v| v.as_bytes() == b"gzip");

    let auth = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(_) => {
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "problem reading request body",
            )
        }
    };

    let body = if gzipped {
        let mut decoded = Vec::new();
        match GzDecoder::new(&body[..]).read_to_end(&mut decoded) {
            Ok(_) => Bytes::from(decoded),
            Err(_) => return json_error(StatusCode::BAD_REQUEST, "unable to decode gzip body"),
        }
    } else {
        body
    };

    let default_timestamp = precision.from_nanos(unix_nanos(start));
    let normalized = match std::str::from_utf8(&body)
        .ok()
        .and_then(|input| normalize_points(input, default_timestamp).ok())
    {
        Some(normalized) => normalized,
        None => return json_error(StatusCode::BAD_REQUEST, "unable to parse points"),
    };

    let query = sorted_query(&params);

    for backend in &state.write_backends {
        let backend = backend.clone();
        let body = normalized.clone();
        let query = query.clone();
        let auth = auth.clone();
        let relay = state.name.clone();

        tokio::spawn(async move {
            match backend.post(body, &query, auth.as_deref()).await {
                Ok(response) if response.status.is_server_error() => {
                    warn!(
                        relay = %relay,
                        backend = %backend.name(),
                        status = %response.status,
                        "5xx response from backend"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        relay = %relay,
                        backend = %backend.name(),
                        error = %e,
                        "problem posting to backend"
                    );
                }
            }
        });
    }

    StatusCode::NO_CONTENT.into_response()
}

/// Timestamp resolution of a write request.
///
/// Parsed timestamps are relayed verbatim in their original unit; the
/// precision governs the unit used when filling in missing timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Precision {
    #[default]
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl Precision {
    /// Unknown precision strings fall back to nanoseconds, as the upstream
    /// parser does.
    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "u" | "us" => Self::Microseconds,
            "ms" => Self::Milliseconds,
            "s" => Self::Seconds,
            "m" => Self::Minutes,
            "h" => Self::Hours,
            _ => Self::Nanoseconds,
        }
    }

    /// Convert a nanosecond wall-clock reading into this precision's unit.
    pub(crate) fn from_nanos(self, nanos: i64) -> i64 {
        let divisor: i64 = match self {
            Self::Nanoseconds => 1,
            Self::Microseconds => 1_000,
            Self::Milliseconds => 1_000_000,
            Self::Seconds => 1_000_000_000,
            Self::Minutes => 60 * 1_000_000_000,
            Self::Hours => 3_600 * 1_000_000_000,
        };
        nanos / divisor
    }
}

fn unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Re-serialise every parsed point, newline-terminated, filling in missing
/// timestamps. This strips formatting ambiguity so every backend receives
/// the same canonical bytes, and makes resubmission idempotent.
pub(crate) fn normalize_points(
    input: &str,
    default_timestamp: i64,
) -> Result<Bytes, influxdb_line_protocol::Error> {
    let mut out = String::with_capacity(input.len() + 1);

    for line in parse_lines(input) {
        let mut line = line?;
        if line.timestamp.is_none() {
            line.timestamp = Some(default_timestamp);
        }
        let _ = writeln!(out, "{line}");
    }

    Ok(Bytes::from(out))
}

fn apply_default_rp(params: &mut Vec<(String, String)>, default_rp: &str) {
    match params.iter_mut().find(|(k, _)| k == "rp") {
        Some((_, v)) if v.is_empty() => *v = default_rp.to_owned(),
        Some(_) => {}
        None => params.push(("rp".to_owned(), default_rp.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_parse() {
        assert_eq!(Precision::parse(""), Precision::Nanoseconds);
        assert_eq!(Precision::parse("ns"), Precision::Nanoseconds);
        assert_eq!(Precision::parse("u"), Precision::Microseconds);
        assert_eq!(Precision::parse("us"), Precision::Microseconds);
        assert_eq!(Precision::parse("ms"), Precision::Milliseconds);
        assert_eq!(Precision::parse("s"), Precision::Seconds);
        assert_eq!(Precision::parse("m"), Precision::Minutes);
        assert_eq!(Precision::parse("h"), Precision::Hours);
        assert_eq!(Precision::parse("parsecs"), Precision::Nanoseconds);
    }

    #[test]
    fn precision_truncates_wall_clock() {
        let nanos = 1_700_000_000_123_456_789;
        assert_eq!(Precision::Seconds.from_nanos(nanos), 1_700_000_000);
        assert_eq!(Precision::Milliseconds.from_nanos(nanos), 1_700_000_000_123);
        assert_eq!(Precision::Nanoseconds.from_nanos(nanos), nanos);
    }

    #[test]
    fn normalize_keeps_explicit_timestamps() {
        let out = normalize_points("cpu value=1 1700000000", 42).unwrap();
        assert_eq!(&out[..], b"cpu value=1 1700000000\n");
    }

    #[test]
    fn normalize_fills_missing_timestamps() {
        let out = normalize_points("cpu value=1", 1700000000).unwrap();
        assert_eq!(&out[..], b"cpu value=1 1700000000\n");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_points("cpu,host=a value=1 5\nmem value=2i 7", 0).unwrap();
        let twice = normalize_points(std::str::from_utf8(&once).unwrap(), 0).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize_points("cpu value=", 0).is_err());
    }

    #[test]
    fn normalize_empty_body_is_empty() {
        let out = normalize_points("", 0).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn default_rp_fills_missing_and_empty() {
        let mut params = vec![("db".to_owned(), "x".to_owned())];
        apply_default_rp(&mut params, "autogen");
        assert!(params.contains(&("rp".to_owned(), "autogen".to_owned())));

        let mut params = vec![("rp".to_owned(), String::new())];
        apply_default_rp(&mut params, "autogen");
        assert_eq!(params[0].1, "autogen");

        let mut params = vec![("rp".to_owned(), "weekly".to_owned())];
        apply_default_rp(&mut params, "autogen");
        assert_eq!(params[0].1, "weekly");
    }
}
