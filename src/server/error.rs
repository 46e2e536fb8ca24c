use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::types::ErrorResponse;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("Empty file")]
    EmptyFile,

    #[error("Missing form field 'file'")]
    MissingFile,

    #[error("Invalid multipart body: {detail}")]
    Multipart { status: StatusCode, detail: String },

    #[error("Could not decode image: {0}")]
    Decode(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MultipartError> for PredictError {
    fn from(e: MultipartError) -> Self {
        // 上限超過は 413 のまま返す
        PredictError::Multipart {
            status: e.status(),
            detail: e.body_text(),
        }
    }
}

impl PredictError {
    pub fn status(&self) -> StatusCode {
        match self {
            PredictError::EmptyFile | PredictError::MissingFile | PredictError::Decode(_) => {
                StatusCode::BAD_REQUEST
            }
            PredictError::Multipart { status, .. } => *status,
            PredictError::Inference(_) | PredictError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "Request error");
            "Server error".to_string()
        } else {
            tracing::warn!(error = %self, status = %status, "Rejected request");
            self.to_string()
        };

        (status, Json(ErrorResponse { detail })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(PredictError::EmptyFile.status(), StatusCode::BAD_REQUEST);
        assert_eq!(PredictError::MissingFile.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            PredictError::Decode("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PredictError::Multipart {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                detail: "length limit exceeded".into(),
            }
            .into_response()
            .status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            PredictError::Inference("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            PredictError::Internal("x".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
