use std::sync::Arc;

use axum::body::Body;
use http::{Request, StatusCode};
use llm_gateway::test_util::{create_test_state, mock_backend, TEST_API_KEY, TEST_MODEL};
use llm_gateway::{app, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn backend_replying(content: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(mock_backend::completion(TEST_MODEL, content)),
        )
        .mount(&server)
        .await;
    server
}

async fn backend_failing(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(status).set_body_string("backend says no"))
        .mount(&server)
        .await;
    server
}

async fn backend_streaming(body: String) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;
    server
}

fn port(server: &MockServer) -> u16 {
    server.address().port()
}

fn backend_id(server: &MockServer) -> String {
    format!("127.0.0.1:{}", port(server))
}

async fn received(server: &MockServer) -> usize {
    server.received_requests().await.map(|r| r.len()).unwrap_or(0)
}

fn chat(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {}", TEST_API_KEY))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn simple_chat(model: &str, stream: bool) -> Request<Body> {
    chat(json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hello"}],
        "stream": stream
    }))
}

fn get(uri: &str, authorized: bool) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if authorized {
        builder = builder.header("authorization", format!("Bearer {}", TEST_API_KEY));
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(
    state: &Arc<AppState>,
    request: Request<Body>,
) -> (StatusCode, http::HeaderMap, String) {
    let response = app(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn test_health_is_public() {
    let backend = backend_replying("hi").await;
    let state = create_test_state(&[port(&backend)]).await;

    let (status, headers, body) = send(&state, get("/health", false)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-request-id"));

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["backends"]["total"], 1);
    assert_eq!(json["backends"]["healthy"], 1);
}

#[tokio::test]
async fn test_missing_key_is_unauthorized() {
    let backend = backend_replying("hi").await;
    let state = create_test_state(&[port(&backend)]).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(json!({"model": TEST_MODEL, "messages": []}).to_string()))
        .unwrap();
    let (status, _, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"]["code"], "invalid_api_key");
    assert_eq!(received(&backend).await, 0);
}

#[tokio::test]
async fn test_wrong_key_is_unauthorized() {
    let backend = backend_replying("hi").await;
    let state = create_test_state(&[port(&backend)]).await;

    let request = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("authorization", "Bearer sk-wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&state, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_chat_completion() {
    let backend = backend_replying("Hello there").await;
    let state = create_test_state(&[port(&backend)]).await;

    let (status, headers, body) = send(&state, simple_chat(TEST_MODEL, false)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-gateway-backend"], backend_id(&backend).as_str());
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["object"], "chat.completion");
    assert_eq!(json["choices"][0]["message"]["content"], "Hello there");
    assert_eq!(state.tracker.current_load(&backend_id(&backend)).await, 0);
}

#[tokio::test]
async fn test_forwards_sampling_parameters() {
    let backend = backend_replying("ok").await;
    let state = create_test_state(&[port(&backend)]).await;

    let (status, _, _) = send(
        &state,
        chat(json!({
            "model": TEST_MODEL,
            "messages": [{"role": "user", "content": "Hello"}],
            "temperature": 0.2,
            "max_tokens": 64,
            "stop": ["\n\n"],
            "seed": 7,
            "response_format": {"type": "json_object"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let requests = backend.received_requests().await.unwrap();
    let forwarded: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(forwarded["max_tokens"], 64);
    assert_eq!(forwarded["stop"][0], "\n\n");
    assert_eq!(forwarded["stream"], false);
    assert!(forwarded.get("top_p").is_none());
    assert_eq!(forwarded["seed"], 7);
    assert_eq!(forwarded["response_format"]["type"], "json_object");
}

#[tokio::test]
async fn test_invalid_request() {
    let backend = backend_replying("hi").await;
    let state = create_test_state(&[port(&backend)]).await;

    let (status, _, body) = send(&state, chat(json!({"model": TEST_MODEL, "messages": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("messages"));

    let (status, _, _) = send(&state, chat(json!({"messages": "not a list"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(received(&backend).await, 0);
}

#[tokio::test]
async fn test_unknown_model_never_reaches_a_backend() {
    let backend = backend_replying("hi").await;
    let state = create_test_state(&[port(&backend)]).await;

    let (status, _, body) = send(&state, simple_chat("ghost-model", false)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"]["code"], "model_not_found");
    assert_eq!(received(&backend).await, 0);
}

#[tokio::test]
async fn test_eleventh_request_is_rate_limited() {
    let backend = backend_replying("hi").await;
    let state = create_test_state(&[port(&backend)]).await;

    for _ in 0..10 {
        let (status, _, _) = send(&state, simple_chat(TEST_MODEL, false)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, headers, body) = send(&state, simple_chat(TEST_MODEL, false)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry_after >= 1);
    assert!(body.contains("rate_limit_exceeded"));
    assert_eq!(received(&backend).await, 10);
}

#[tokio::test]
async fn test_fails_over_from_server_error() {
    let broken = backend_failing(500).await;
    let healthy = backend_replying("from the healthy one").await;
    let state = create_test_state(&[port(&broken), port(&healthy)]).await;

    let (status, headers, body) = send(&state, simple_chat(TEST_MODEL, false)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-gateway-backend"], backend_id(&healthy).as_str());
    assert!(body.contains("from the healthy one"));
    assert_eq!(received(&broken).await, 1);
}

#[tokio::test]
async fn test_fails_over_from_refused_connection() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let healthy = backend_replying("still here").await;
    let state = create_test_state(&[dead_port, port(&healthy)]).await;

    let (status, headers, _) = send(&state, simple_chat(TEST_MODEL, false)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-gateway-backend"], backend_id(&healthy).as_str());
}

#[tokio::test]
async fn test_all_backends_failing_is_unavailable() {
    let first = backend_failing(503).await;
    let second = backend_failing(502).await;
    let state = create_test_state(&[port(&first), port(&second)]).await;

    let (status, _, body) = send(&state, simple_chat(TEST_MODEL, false)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"]["code"], "upstream_unavailable");
    assert_eq!(received(&first).await + received(&second).await, 2);
}

#[tokio::test]
async fn test_backend_client_error_is_passed_through() {
    let rejecting = backend_failing(422).await;
    let other = backend_replying("unused").await;
    let state = create_test_state(&[port(&rejecting), port(&other)]).await;

    let (status, _, body) = send(&state, simple_chat(TEST_MODEL, false)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body.contains("backend says no"));
    assert_eq!(received(&other).await, 0);
}

#[tokio::test]
async fn test_streaming_relays_chunks_in_order() {
    let backend = backend_streaming(mock_backend::sse_body(TEST_MODEL, &["Hel", "lo", "!"])).await;
    let state = create_test_state(&[port(&backend)]).await;

    let (status, headers, body) = send(&state, simple_chat(TEST_MODEL, true)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let hel = body.find("\"Hel\"").unwrap();
    let lo = body.find("\"lo\"").unwrap();
    let bang = body.find("\"!\"").unwrap();
    assert!(hel < lo && lo < bang);
    assert!(body.trim_end().ends_with("data: [DONE]"));
    assert_eq!(state.tracker.current_load(&backend_id(&backend)).await, 0);
}

#[tokio::test]
async fn test_truncated_stream_ends_with_one_error_event() {
    let backend =
        backend_streaming(mock_backend::truncated_sse_body(TEST_MODEL, &["Hel", "lo"])).await;
    let state = create_test_state(&[port(&backend)]).await;

    let (status, _, body) = send(&state, simple_chat(TEST_MODEL, true)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"Hel\""));
    assert!(body.contains("\"lo\""));
    assert_eq!(body.matches("stream_interrupted").count(), 1);
    assert!(!body.contains("[DONE]"));
    assert!(body.trim_end().ends_with('}'));
}

#[tokio::test]
async fn test_models_lists_routable_models() {
    let backend = backend_replying("hi").await;
    let state = create_test_state(&[port(&backend)]).await;

    let (status, _, _) = send(&state, get("/v1/models", false)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, body) = send(&state, get("/v1/models", true)).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["object"], "list");
    assert_eq!(json["data"][0]["id"], TEST_MODEL);
}

#[tokio::test]
async fn test_backends_snapshot() {
    let first = backend_replying("hi").await;
    let second = backend_failing(500).await;
    let state = create_test_state(&[port(&first), port(&second)]).await;

    let (status, _, body) = send(&state, get("/v1/backends", true)).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_str(&body).unwrap();
    let data = json["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["id"], backend_id(&first));
    assert_eq!(data[0]["health"], "healthy");
    assert_eq!(data[0]["in_flight"], 0);
    assert_eq!(data[1]["models"][0], TEST_MODEL);
}
