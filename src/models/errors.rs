use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::observability::{failure_response, ErrorDetail, ErrorMessage, Failure};

/// Error returned by request handlers.
///
/// `Http` errors are classified: their status and message reach the client
/// verbatim. `Internal` errors become a generic 500 and their detail is only
/// logged and reported.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http {
        status: StatusCode,
        message: ErrorMessage,
        name: String,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// A classified error named after its status (`NotFoundException`, ...).
    pub fn new(status: StatusCode, message: impl Into<ErrorMessage>) -> Self {
        ApiError::Http {
            status,
            message: message.into(),
            name: exception_name(status).to_string(),
        }
    }

    pub fn bad_request(message: impl Into<ErrorMessage>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<ErrorMessage>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<ErrorMessage>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<ErrorMessage>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<ErrorMessage>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unprocessable(message: impl Into<ErrorMessage>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Http { status, .. } => *status,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_failure(&self) -> Failure {
        match self {
            ApiError::Http {
                status,
                message,
                name,
            } => Failure::Classified {
                status: status.as_u16(),
                message: message.clone(),
                name: name.clone(),
            },
            ApiError::Internal(error) => Failure::Unclassified(ErrorDetail::from_anyhow(error)),
        }
    }
}

fn exception_name(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "BadRequestException",
        StatusCode::UNAUTHORIZED => "UnauthorizedException",
        StatusCode::FORBIDDEN => "ForbiddenException",
        StatusCode::NOT_FOUND => "NotFoundException",
        StatusCode::METHOD_NOT_ALLOWED => "MethodNotAllowedException",
        StatusCode::CONFLICT => "ConflictException",
        StatusCode::PAYLOAD_TOO_LARGE => "PayloadTooLargeException",
        StatusCode::UNPROCESSABLE_ENTITY => "UnprocessableEntityException",
        StatusCode::TOO_MANY_REQUESTS => "ThrottlerException",
        StatusCode::INTERNAL_SERVER_ERROR => "InternalServerErrorException",
        StatusCode::SERVICE_UNAVAILABLE => "ServiceUnavailableException",
        StatusCode::GATEWAY_TIMEOUT => "GatewayTimeoutException",
        _ => "HttpException",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        failure_response(self.to_failure())
    }
}

/// Result type alias for request handlers
pub type ApiResult<T> = Result<T, ApiError>;
