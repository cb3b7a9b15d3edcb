//! Error types crossing the HTTP boundary.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use unified_inference_common::{ErrorCode, ErrorDetail, ErrorResponse, ModelFormat, ModelType};

use crate::lifecycle::LifecycleError;

/// Where clients are sent for format and installation guidance.
pub const INSTALL_ENDPOINT: &str = "/v1/models/install";

/// Errors returned to callers of the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("model is required (in the JSON body or as a query parameter)")]
    ModelRequired,

    #[error("Model '{model}' is not registered")]
    ModelNotFound { model: String, available: Vec<String> },

    #[error("Model '{model}' uses an unsupported format: {reason}")]
    FormatNotSupported { model: String, reason: String },

    #[error("No default {0} model is configured")]
    NoDefaultModel(ModelType),

    #[error("Model '{0}' is not available")]
    ModelUnavailable(String),

    #[error("GPU backend for '{model}' is overloaded")]
    Backpressure { model: String, retry_after: u64 },

    #[error("Backend timed out: {0}")]
    BackendTimeout(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ModelRequired | Error::FormatNotSupported { .. } => StatusCode::BAD_REQUEST,
            Error::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            Error::ModelUnavailable(_) | Error::BackendUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Backpressure { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::NoDefaultModel(_) | Error::Proxy(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ModelRequired => ErrorCode::ModelRequired,
            Error::ModelNotFound { .. } => ErrorCode::ModelNotFound,
            Error::FormatNotSupported { .. } => ErrorCode::FormatNotSupported,
            Error::NoDefaultModel(_) => ErrorCode::NoDefaultModel,
            Error::ModelUnavailable(_) => ErrorCode::ModelUnavailable,
            Error::Backpressure { .. } => ErrorCode::GpuOverloaded,
            Error::BackendTimeout(_) => ErrorCode::BackendTimeout,
            Error::BackendUnavailable(_) => ErrorCode::BackendUnavailable,
            Error::Proxy(_) => ErrorCode::ProxyError,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Structured body for this error.
    pub fn detail(&self) -> ErrorDetail {
        let detail = ErrorDetail::new(self.code(), self.to_string());
        match self {
            Error::ModelRequired => detail.with_hint(
                "Pass \"model\" in the JSON body or as ?model=<name>; see GET /v1/models",
            ),
            Error::ModelNotFound { available, .. } => detail
                .with_available_models(available.clone())
                .with_install_endpoint(INSTALL_ENDPOINT),
            Error::FormatNotSupported { .. } => detail
                .with_preferred_formats(ModelFormat::PREFERRED.to_vec())
                .with_install_endpoint(INSTALL_ENDPOINT),
            Error::NoDefaultModel(_) => {
                detail.with_hint("Mark one model of this type as default: true")
            }
            Error::ModelUnavailable(_) => {
                detail.with_hint("Check GET /v1/status for the backend error")
            }
            Error::Backpressure { retry_after, .. } => detail
                .with_hint("No CPU offload target is available; retry later")
                .with_retry_after(*retry_after),
            _ => detail,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorResponse::from(self.detail()));

        let mut response = (status, body).into_response();
        if let Error::Backpressure { retry_after, .. } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

impl From<LifecycleError> for Error {
    fn from(err: LifecycleError) -> Self {
        Error::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
