//! Structured error bodies returned by the orchestrator.
//!
//! Every error crossing the HTTP boundary has the shape
//! `{"error": {"code": "...", "message": "...", ...}}` so clients can branch on `code`.

use serde::{Deserialize, Serialize};

use crate::ModelFormat;

/// Machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ModelRequired,
    ModelNotFound,
    FormatNotSupported,
    NoDefaultModel,
    ModelUnavailable,
    GpuOverloaded,
    BackendTimeout,
    BackendUnavailable,
    ProxyError,
    InternalError,
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_formats: Option<Vec<ModelFormat>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_endpoint: Option<String>,
    /// Seconds the client should wait before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorDetail {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
            available_models: None,
            preferred_formats: None,
            install_endpoint: None,
            retry_after: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_available_models(mut self, models: Vec<String>) -> Self {
        self.available_models = Some(models);
        self
    }

    pub fn with_preferred_formats(mut self, formats: Vec<ModelFormat>) -> Self {
        self.preferred_formats = Some(formats);
        self
    }

    pub fn with_install_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.install_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }
}

/// Wrapper so the detail sits under an `error` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

impl From<ErrorDetail> for ErrorResponse {
    fn from(error: ErrorDetail) -> Self {
        Self { error }
    }
}
