//! API key authentication.
//!
//! The key is looked up in, in order:
//! 1. `Authorization: Bearer <key>`
//! 2. `X-API-Key: <key>`
//! 3. `?token=<key>` (browsers cannot set headers on WebSocket or
//!    EventSource requests)

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Uri};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use super::error::ApiError;
use super::AppState;

/// Server-held API key, stored as a SHA-256 digest.
///
/// Candidates are hashed before comparison so that the time taken does
/// not depend on how much of the key a guess got right.
#[derive(Clone)]
pub struct ApiKey {
    digest: [u8; 32],
}

impl ApiKey {
    /// Wraps the configured key.
    pub fn new(key: &str) -> Self {
        Self {
            digest: Sha256::digest(key.as_bytes()).into(),
        }
    }

    /// Returns whether `candidate` is the configured key.
    pub fn matches(&self, candidate: &str) -> bool {
        let digest: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        digest == self.digest
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(..)")
    }
}

/// Pulls the credential out of a request. Empty values count as missing.
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return non_empty(token);
        }
    }

    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return non_empty(value);
    }

    uri.query()?
        .split('&')
        .find_map(|param| param.strip_prefix("token="))
        .and_then(non_empty)
}

fn non_empty(token: &str) -> Option<String> {
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Middleware guarding every route except health and root.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(request.headers(), request.uri())
        .ok_or(ApiError::MissingCredentials)?;
    if !state.api_key.matches(&token) {
        tracing::warn!(path = %request.uri().path(), "Rejected request with invalid API key");
        return Err(ApiError::InvalidCredentials);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_key_matches_only_itself() {
        let key = ApiKey::new("secret");
        assert!(key.matches("secret"));
        assert!(!key.matches("secret "));
        assert!(!key.matches(""));
    }

    #[test]
    fn test_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_token(&headers, &uri("/sessions")), Some("abc".into()));
    }

    #[test]
    fn test_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("xyz"));
        assert_eq!(extract_token(&headers, &uri("/sessions")), Some("xyz".into()));
    }

    #[test]
    fn test_query_token() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_token(&headers, &uri("/job/1/stream?a=1&token=q")),
            Some("q".into())
        );
    }

    #[test]
    fn test_missing_or_empty() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers, &uri("/sessions")), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(extract_token(&headers, &uri("/sessions")), None);
    }

    #[test]
    fn test_debug_hides_key() {
        assert_eq!(format!("{:?}", ApiKey::new("secret")), "ApiKey(..)");
    }
}
