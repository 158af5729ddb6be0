//! Error taxonomy for the gateway and its HTTP mapping.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use llm_gateway_common::ErrorBody;

use crate::auth::{AuthError, QuotaError};
use crate::gateway::RouteError;

/// Every way a client request can end without a normal response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Unauthenticated(#[from] AuthError),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Model '{0}' is not served by any backend")]
    UnknownModel(String),

    #[error("No healthy backend available for model '{0}'")]
    NoHealthyBackend(String),

    #[error("Upstream unavailable after {attempts} attempt(s): {last_error}")]
    UpstreamUnavailable { attempts: u32, last_error: String },

    #[error("Upstream timed out after {attempts} attempt(s)")]
    UpstreamTimeout { attempts: u32 },

    #[error("Backend rejected the request (HTTP {status}): {message}")]
    BackendRejected { status: u16, message: String },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnknownModel(_) => StatusCode::NOT_FOUND,
            GatewayError::NoHealthyBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BackendRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::StreamInterrupted(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// OpenAI `error.type` value.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated(_) => "authentication_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::InvalidRequest(_)
            | GatewayError::UnknownModel(_)
            | GatewayError::BackendRejected { .. } => "invalid_request_error",
            _ => "server_error",
        }
    }

    /// Machine-readable `error.code` value.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated(_) => "invalid_api_key",
            GatewayError::RateLimited { .. } => "rate_limit_exceeded",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::UnknownModel(_) => "model_not_found",
            GatewayError::NoHealthyBackend(_) => "no_healthy_backend",
            GatewayError::UpstreamUnavailable { .. } => "upstream_unavailable",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::BackendRejected { .. } => "backend_rejected",
            GatewayError::StreamInterrupted(_) => "stream_interrupted",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.error_type(), self.code(), self.to_string())
    }
}

impl From<RouteError> for GatewayError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::UnknownModel(model) => GatewayError::UnknownModel(model),
            RouteError::NoHealthyBackend(model) => GatewayError::NoHealthyBackend(model),
        }
    }
}

impl From<QuotaError> for GatewayError {
    fn from(err: QuotaError) -> Self {
        GatewayError::RateLimited {
            retry_after_secs: err.retry_after_secs(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, Json(self.to_body())).into_response();

        if let GatewayError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(GatewayError::Unauthenticated(AuthError::MissingHeader), 401)]
    #[case(GatewayError::RateLimited { retry_after_secs: 6 }, 429)]
    #[case(GatewayError::InvalidRequest("messages must not be empty".into()), 400)]
    #[case(GatewayError::UnknownModel("ghost-model".into()), 404)]
    #[case(GatewayError::NoHealthyBackend("llama3-8b".into()), 503)]
    #[case(GatewayError::UpstreamUnavailable { attempts: 3, last_error: "refused".into() }, 503)]
    #[case(GatewayError::UpstreamTimeout { attempts: 3 }, 504)]
    #[case(GatewayError::BackendRejected { status: 422, message: "bad".into() }, 422)]
    fn test_status_mapping(#[case] err: GatewayError, #[case] expected: u16) {
        assert_eq!(err.status_code().as_u16(), expected);
    }

    #[test]
    fn test_rate_limited_sets_retry_after_header() {
        let response = GatewayError::RateLimited { retry_after_secs: 6 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "6");
    }

    #[test]
    fn test_error_body_codes() {
        let body = GatewayError::UnknownModel("ghost-model".into()).to_body();
        assert_eq!(body.error.code.as_deref(), Some("model_not_found"));
        assert_eq!(body.error.error_type, "invalid_request_error");
        assert!(body.error.message.contains("ghost-model"));
    }

    #[test]
    fn test_route_error_conversion() {
        let err: GatewayError = RouteError::NoHealthyBackend("mistral-7b".into()).into();
        assert!(matches!(err, GatewayError::NoHealthyBackend(m) if m == "mistral-7b"));
    }
}
