//! Optional pre-shared API key.
//!
//! With `auth.api_key` unset every endpoint is open. With it set, session
//! creation calls need `Authorization: Bearer <key>` and stream upgrades need
//! a `?token=<key>` query parameter (browsers can't set headers on WebSocket
//! upgrades). `/healthz` is always open.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::protocol::CreateResponse;

/// Expected key, injected as a request extension. `None` disables the check.
#[derive(Clone, Default)]
pub struct ApiKey(pub Option<String>);

impl ApiKey {
    /// Whether `provided` satisfies the configured key.
    pub fn accepts(&self, provided: Option<&str>) -> bool {
        match (&self.0, provided) {
            (None, _) => true,
            (Some(expected), Some(provided)) => {
                constant_time_eq(expected.as_bytes(), provided.as_bytes())
            }
            (Some(_), None) => false,
        }
    }
}

fn reject(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(CreateResponse {
            session_id: String::new(),
            status_code: u32::from(status.as_u16()),
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Axum middleware guarding the creation calls.
///
/// - `401 Unauthorized`: header missing or malformed
/// - `403 Forbidden`: key present but invalid
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let api_key = request.extensions().get::<ApiKey>().cloned().unwrap_or_default();
    if api_key.0.is_none() {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(provided) = provided else {
        return reject(StatusCode::UNAUTHORIZED, "Missing or invalid Authorization header");
    };
    if !api_key.accepts(Some(provided)) {
        return reject(StatusCode::FORBIDDEN, "Invalid API key");
    }

    next.run(request).await
}

/// Constant-time byte comparison.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so the key length does not show in response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_match() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"s3cre"));
        assert!(!constant_time_eq(b"s3cret", b"s3cret!"));
        assert!(!constant_time_eq(b"s3cret", b""));
    }

    #[test]
    fn unset_key_accepts_everything() {
        let key = ApiKey(None);
        assert!(key.accepts(None));
        assert!(key.accepts(Some("anything")));
    }

    #[test]
    fn set_key_requires_a_match() {
        let key = ApiKey(Some("k".into()));
        assert!(key.accepts(Some("k")));
        assert!(!key.accepts(Some("x")));
        assert!(!key.accepts(None));
    }
}
