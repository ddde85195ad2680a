//! Mapping of daemon errors onto HTTP responses.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::{ErrorBody, ErrorCode};
use thiserror::Error;

use crate::jobs::JobError;
use crate::session::SessionError;

/// Error returned by every handler.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Job(#[from] JobError),

    /// No credential was supplied.
    #[error("authentication required: provide Authorization: Bearer <key>, X-API-Key or ?token=")]
    MissingCredentials,

    /// A credential was supplied but does not match the server key.
    #[error("invalid API key")]
    InvalidCredentials,

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    /// HTTP status and wire code for this error.
    pub fn status_and_code(&self) -> (StatusCode, ErrorCode) {
        match self {
            ApiError::Session(e) => match e {
                SessionError::NotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
                SessionError::InvalidName(_) | SessionError::InvalidTimeout(_) => {
                    (StatusCode::BAD_REQUEST, ErrorCode::BadRequest)
                }
                SessionError::DuplicateName(_) => (StatusCode::CONFLICT, ErrorCode::DuplicateName),
                SessionError::Busy(_) => (StatusCode::CONFLICT, ErrorCode::SessionBusy),
                SessionError::TooManySessions(_) => {
                    (StatusCode::TOO_MANY_REQUESTS, ErrorCode::TooManySessions)
                }
                SessionError::SpawnFailed(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::SpawnFailure)
                }
                SessionError::Terminated(_) => (StatusCode::GONE, ErrorCode::Terminated),
                SessionError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::IoError),
            },
            ApiError::Job(e) => match e {
                JobError::NotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
                JobError::InputClosed(_) => (StatusCode::GONE, ErrorCode::Terminated),
                JobError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::IoError),
            },
            ApiError::MissingCredentials => (StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized),
            ApiError::InvalidCredentials => (StatusCode::FORBIDDEN, ErrorCode::InvalidCredentials),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, ErrorCode::BadRequest),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(code = %code, "{}", self);
        } else {
            tracing::debug!(code = %code, "{}", self);
        }
        (status, Json(ErrorBody::new(code, self.to_string()))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_errors_map_to_statuses() {
        let cases = [
            (SessionError::NotFound("7".into()), StatusCode::NOT_FOUND),
            (SessionError::DuplicateName("a".into()), StatusCode::CONFLICT),
            (SessionError::Busy("a".into()), StatusCode::CONFLICT),
            (SessionError::TooManySessions(2), StatusCode::TOO_MANY_REQUESTS),
            (SessionError::Terminated("a".into()), StatusCode::GONE),
            (SessionError::InvalidName("1".into()), StatusCode::BAD_REQUEST),
            (SessionError::InvalidTimeout("0s".into()), StatusCode::BAD_REQUEST),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status_and_code().0, status);
        }
    }

    #[test]
    fn test_busy_uses_session_busy_code() {
        let (_, code) = ApiError::from(SessionError::Busy("x".into())).status_and_code();
        assert_eq!(code, ErrorCode::SessionBusy);
    }

    #[test]
    fn test_credentials_distinguish_missing_from_invalid() {
        assert_eq!(
            ApiError::MissingCredentials.status_and_code(),
            (StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized)
        );
        assert_eq!(
            ApiError::InvalidCredentials.status_and_code(),
            (StatusCode::FORBIDDEN, ErrorCode::InvalidCredentials)
        );
    }

    #[test]
    fn test_job_not_found() {
        let error = ApiError::from(JobError::NotFound("abc".into()));
        assert_eq!(error.status_and_code().0, StatusCode::NOT_FOUND);
        assert_eq!(error.to_string(), "job not found: abc");
    }
}
