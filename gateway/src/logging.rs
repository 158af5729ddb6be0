use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Correlates a client request with gateway logs; echoed on the response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Names the backend that served a request.
pub const BACKEND_HEADER: &str = "x-gateway-backend";

/// Request ID assigned by `request_logger`, or a fresh one outside the middleware.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_request_id)
}

fn new_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}

/// Middleware that logs HTTP requests at INFO level.
///
/// Keeps a client-supplied `x-request-id`, or assigns one.
pub async fn request_logger(mut request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let id = request_id(request.headers());
    if let Ok(value) = HeaderValue::from_str(&id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let status = response.status();
    let backend = response
        .headers()
        .get(BACKEND_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    // For streams this is time to first byte, not stream length.
    tracing::info!(
        request_id = %id,
        method = %method,
        path = %path,
        status = %status.as_u16(),
        backend = %backend,
        duration_ms = %start.elapsed().as_millis(),
        "HTTP request"
    );

    response
}
