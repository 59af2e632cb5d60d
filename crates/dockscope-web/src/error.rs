use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use dockscope_logs::StreamError;

/// Failures reported before a response body is started
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("stdout or stderr is required")]
    MissingStdType,

    #[error("ids query parameter is required")]
    MissingIds,

    #[error("unknown host {0}")]
    UnknownHost(String),

    #[error("container {0} not found")]
    ContainerNotFound(String),

    #[error("streaming unsupported")]
    FlushUnsupported,

    #[error(transparent)]
    Upstream(#[from] dockscope_docker::Error),
}

impl ApiError {
    /// Lookup failures of a known host
    pub fn from_lookup(id: &str, error: dockscope_docker::Error) -> Self {
        match error {
            dockscope_docker::Error::NotFound(_) => Self::ContainerNotFound(id.to_string()),
            other => Self::Upstream(other),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingStdType | Self::MissingIds => StatusCode::BAD_REQUEST,
            Self::UnknownHost(_) | Self::ContainerNotFound(_) => StatusCode::NOT_FOUND,
            Self::FlushUnsupported | Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(error: StreamError) -> Self {
        match error {
            StreamError::NoStdType => Self::MissingStdType,
            StreamError::FlushUnsupported => Self::FlushUnsupported,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::MissingStdType.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::MissingIds.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::UnknownHost("h".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(StreamError::FlushUnsupported).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_lookup_not_found_maps_to_404() {
        let error = ApiError::from_lookup("c1", dockscope_docker::Error::NotFound("c1".into()));
        assert!(matches!(error, ApiError::ContainerNotFound(ref id) if id == "c1"));

        let error = ApiError::from_lookup("c1", dockscope_docker::Error::Stream("reset".into()));
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
