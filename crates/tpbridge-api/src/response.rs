// Uniform result shape for platform API calls.
//
// Transport failures, HTTP status errors and decode failures all collapse
// into the same failure form so callers never branch on the error origin.

use serde::Serialize;

use crate::error::{ApiError, ApiErrorKind};

/// Outcome of a platform API call.
///
/// Constructed only through [`success`](Self::success) and
/// [`failure`](Self::failure), so `data` is present exactly when `success`
/// is `true` and a failure always carries a non-empty message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    message: String,
    data: Option<T>,
    #[serde(skip)]
    error_kind: Option<ApiErrorKind>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error_kind: None,
        }
    }

    pub fn failure(err: &ApiError) -> Self {
        Self {
            success: false,
            message: err.response_message(),
            data: None,
            error_kind: Some(err.kind()),
        }
    }

    pub(crate) fn from_result(result: Result<(String, T), ApiError>) -> Self {
        match result {
            Ok((message, data)) => Self::success(message, data),
            Err(err) => Self::failure(&err),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Raw response body on success, diagnostic text on failure.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub(crate) fn data_mut(&mut self) -> Option<&mut T> {
        self.data.as_mut()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    /// What went wrong, for failures. `None` on success.
    pub fn error_kind(&self) -> Option<ApiErrorKind> {
        self.error_kind
    }

    /// Convert into a `Result`, keeping the message as the error.
    pub fn into_result(self) -> Result<T, String> {
        match self.data {
            Some(data) if self.success => Ok(data),
            _ => Err(self.message),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            success: self.success,
            message: self.message,
            data: self.data.map(f),
            error_kind: self.error_kind,
        }
    }
}
