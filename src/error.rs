//! Error taxonomy for the download pipeline and its HTTP mapping.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Terminal failures of the resolve/download pipeline.
///
/// A session token with no open subscription is deliberately not represented
/// here: publishing to an absent session is a no-op, never an error.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    #[error("invalid video URL")]
    InvalidIdentifier,

    #[error("format itag={0} not found")]
    EncodingNotFound(u32),

    #[error("no downloadable formats found")]
    NoUsableEncodings,

    #[error("upstream request failed: {0}")]
    UpstreamUnavailable(String),

    #[error("stream error: {0}")]
    UpstreamStream(String),
}

impl DownloadError {
    /// Status code used when the error is caught before any response bytes
    /// have been flushed. Mid-stream failures never reach this mapping.
    pub fn status(&self) -> StatusCode {
        match self {
            DownloadError::InvalidIdentifier => StatusCode::BAD_REQUEST,
            DownloadError::EncodingNotFound(_) => StatusCode::NOT_FOUND,
            DownloadError::NoUsableEncodings
            | DownloadError::UpstreamUnavailable(_)
            | DownloadError::UpstreamStream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        Self {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
