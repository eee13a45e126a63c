use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::pathguard::FilenameError;
use crate::pipeline::PipelineError;
use crate::resumables::ResumableError;
use crate::staging::StagingError;
use crate::tenant::TenantError;

/// API error taxonomy. Every request failure is caught at the handler
/// boundary and rendered as a single `{"message": ...}` JSON envelope with
/// the status the wire contract requires.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing authorization header")]
    MissingAuth,
    #[error("Malformed authorization header")]
    MalformedAuth,
    #[error("Token does not grant access to this tenant")]
    TenantMismatch,
    #[error("Not authorized: {0}")]
    InvalidToken(String),
    #[error("Invalid tenant identifier")]
    BadTenant,
    #[error("Illegal filename: {0}")]
    IllegalFilename(String),
    #[error("{0}")]
    ExportForbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PolicyDenied(String),
    #[error("{0}")]
    RangeUnsatisfiable(String),
    #[error("Multipart byte range requests not supported")]
    RangeMultipart,
    #[error("{0}")]
    PreconditionFailed(String),
    /// Reported with HTTP 200 for wire compatibility; the proxy rewrites
    /// it to 400.
    #[error("chunk_order_incorrect")]
    ChunkOrderIncorrect,
    #[error("Upstream decoder failed: {0}")]
    UpstreamFailed(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    BackendUnavailable(String),
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingAuth
            | ApiError::MalformedAuth
            | ApiError::TenantMismatch
            | ApiError::BadTenant
            | ApiError::IllegalFilename(_)
            | ApiError::PolicyDenied(_)
            | ApiError::PreconditionFailed(_)
            | ApiError::UpstreamFailed(_)
            | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            ApiError::ExportForbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RangeUnsatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::RangeMultipart => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::ChunkOrderIncorrect => StatusCode::OK,
            ApiError::BackendUnavailable(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(err) => {
                tracing::error!(target: "api::error", error = ?err, "Internal server error");
                "Internal server error".to_string()
            }
            other => {
                tracing::warn!(
                    target: "api::error",
                    status = status.as_u16(),
                    error = %other,
                    "Request failed"
                );
                other.to_string()
            }
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingHeader => ApiError::MissingAuth,
            AuthError::MalformedHeader => ApiError::MalformedAuth,
            AuthError::TenantMismatch => ApiError::TenantMismatch,
            AuthError::Invalid(msg) => ApiError::InvalidToken(msg),
        }
    }
}

impl From<TenantError> for ApiError {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::BadTenant => ApiError::BadTenant,
            TenantError::BackendUnavailable(msg) => ApiError::BackendUnavailable(msg),
        }
    }
}

impl From<FilenameError> for ApiError {
    fn from(err: FilenameError) -> Self {
        ApiError::IllegalFilename(err.to_string())
    }
}

impl From<ResumableError> for ApiError {
    fn from(err: ResumableError) -> Self {
        match err {
            ResumableError::NotFound => ApiError::NotFound("no such resumable".to_string()),
            ResumableError::BadChunk => {
                ApiError::BadRequest("invalid chunk or id parameter".to_string())
            }
            ResumableError::OutOfOrder => ApiError::ChunkOrderIncorrect,
            ResumableError::Meta(msg) => ApiError::BackendUnavailable(msg),
            ResumableError::Io(e) => ApiError::Internal(e.into()),
        }
    }
}

impl From<StagingError> for ApiError {
    fn from(err: StagingError) -> Self {
        match err {
            StagingError::ActiveWriter => {
                ApiError::BadRequest("file is currently being written".to_string())
            }
            StagingError::AlreadySettled => ApiError::ChunkOrderIncorrect,
            StagingError::Io(e) => ApiError::Internal(e.into()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Key(msg) => ApiError::BadRequest(msg),
            PipelineError::Spawn { stage, source } => {
                ApiError::BackendUnavailable(format!("cannot start {}: {}", stage, source))
            }
            PipelineError::Upstream { stage, status } => {
                ApiError::UpstreamFailed(format!("{} exited with {}", stage, status))
            }
            PipelineError::Io(e) => ApiError::Internal(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::MissingAuth.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::InvalidToken("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::ExportForbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::RangeUnsatisfiable("x".into()).status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(ApiError::RangeMultipart.status(), StatusCode::METHOD_NOT_ALLOWED);
        // preserved for wire compatibility with existing clients
        assert_eq!(ApiError::ChunkOrderIncorrect.status(), StatusCode::OK);
    }

    #[test]
    fn test_order_violations_map_to_chunk_order_incorrect() {
        assert!(matches!(
            ApiError::from(ResumableError::OutOfOrder),
            ApiError::ChunkOrderIncorrect
        ));
        assert!(matches!(
            ApiError::from(StagingError::AlreadySettled),
            ApiError::ChunkOrderIncorrect
        ));
    }
}
