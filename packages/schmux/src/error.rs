use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Error taxonomy shared by every manager.
///
/// Managers never swallow errors; the HTTP edge maps each kind to a status
/// code and an `{"error": ...}` body.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchmuxError {
    /// Input failed a pre-check. Never retried.
    #[error("{0}")]
    Validation(String),
    /// Referenced id does not exist.
    #[error("{0}")]
    NotFound(String),
    /// Operation not legal in the current state.
    #[error("{0}")]
    Conflict(String),
    /// External command failed but may succeed on retry.
    #[error("{0}")]
    Transient(String),
    /// External dependency missing or unusable.
    #[error("{0}")]
    Fatal(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
}

pub type Result<T> = std::result::Result<T, SchmuxError>;

impl SchmuxError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SchmuxError::Validation(_) => StatusCode::BAD_REQUEST,
            SchmuxError::NotFound(_) => StatusCode::NOT_FOUND,
            SchmuxError::Conflict(_) => StatusCode::CONFLICT,
            SchmuxError::Transient(_) => StatusCode::BAD_GATEWAY,
            SchmuxError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SchmuxError::Unauthorized => StatusCode::UNAUTHORIZED,
            SchmuxError::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for SchmuxError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            SchmuxError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SchmuxError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            SchmuxError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            SchmuxError::Transient("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            SchmuxError::Fatal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            SchmuxError::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(SchmuxError::Forbidden.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn display_preserves_message() {
        let err = SchmuxError::Conflict("sync already running".into());
        assert_eq!(err.to_string(), "sync already running");
    }
}
