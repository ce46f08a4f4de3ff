use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Caller-facing error classes shared by every component error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    UnsupportedRepository,
    BuildFailure,
    RuntimeUnavailable,
    SessionNotFound,
    TaskNotFound,
    BridgeError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::UnsupportedRepository => "unsupported_repository",
            ErrorKind::BuildFailure => "build_failure",
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::TaskNotFound => "task_not_found",
            ErrorKind::BridgeError => "bridge_error",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::UnsupportedRepository => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::BuildFailure => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::RuntimeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::SessionNotFound | ErrorKind::TaskNotFound => StatusCode::NOT_FOUND,
            ErrorKind::BridgeError => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorKind,
    message: String,
}

/// HTTP rendering of a component error: status from the kind, JSON body.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        (
            status,
            Json(ErrorBody {
                error: self.kind,
                message: self.message,
            }),
        )
            .into_response()
    }
}

macro_rules! api_error_from {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for ApiError {
                fn from(err: $err) -> Self {
                    ApiError::new(err.kind(), err.to_string())
                }
            }
        )*
    };
}

api_error_from!(
    crate::store::StoreError,
    crate::runtime::RuntimeError,
    crate::pipeline::PipelineError,
    crate::bridge::BridgeError,
    crate::teardown::TeardownError,
);
