//! Mapping of core errors onto HTTP responses.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use vmctl_core::{ErrorKind, VmctlError};

/// Error returned by a handler.
#[derive(Debug)]
pub enum ApiError {
    Core(VmctlError),
    /// Malformed body, unknown operation, missing field
    BadRequest(String),
    /// A stats request did not finish within the configured bound
    Timeout { vm_name: String, after_secs: u64 },
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Core(e) => match e.kind() {
                ErrorKind::VmNotFound | ErrorKind::NoMatchingVms => StatusCode::NOT_FOUND,
                ErrorKind::VmNotRunning => StatusCode::BAD_REQUEST,
                ErrorKind::VmAlreadyExists => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Core(e) => e.kind().as_str(),
            Self::BadRequest(_) => "bad_request",
            Self::Timeout { .. } => "timeout",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Core(e) => e.to_string(),
            Self::BadRequest(reason) => reason.clone(),
            Self::Timeout { vm_name, after_secs } => {
                format!("Stats for {} did not complete within {}s", vm_name, after_secs)
            }
        }
    }
}

impl From<VmctlError> for ApiError {
    fn from(err: VmctlError) -> Self {
        Self::Core(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{}", self.message());
        }

        let mut body = json!({
            "status": "error",
            "kind": self.kind(),
            "message": self.message(),
        });
        if let Self::Core(e) = &self {
            if let Some(vm_name) = e.vm_name() {
                body["vm_name"] = json!(vm_name);
            }
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (VmctlError::VmNotFound { vm_name: "a".into() }, StatusCode::NOT_FOUND),
            (VmctlError::NoMatchingVms { selector: "prefix 'web_'".into() }, StatusCode::NOT_FOUND),
            (VmctlError::VmNotRunning { vm_name: "a".into() }, StatusCode::BAD_REQUEST),
            (VmctlError::VmAlreadyExists { vm_name: "a".into() }, StatusCode::CONFLICT),
            (VmctlError::driver("a", "boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status_code(), expected);
        }

        let timeout = ApiError::Timeout { vm_name: "a".into(), after_secs: 10 };
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timeout.message(), "Stats for a did not complete within 10s");
    }
}
