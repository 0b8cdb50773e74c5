use std::time::Duration;

use attrgen::clients::{ClientError, CompletionClient, CompletionRequest, OpenAiCompatibleClient};
use attrgen::keys::ApiKey;
use serde_json::json;
use wiremock::matchers::{bearer_token, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> CompletionRequest {
    CompletionRequest {
        model: "test-model".to_string(),
        system_prompt: "You describe objects.".to_string(),
        user_prompt: "List 2 colors".to_string(),
        temperature: 0.2,
    }
}

fn key() -> ApiKey {
    ApiKey::new("primary", "sk-test-abcdefgh")
}

#[tokio::test]
async fn returns_first_choice_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(bearer_token("sk-test-abcdefgh"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "messages": [
                {"role": "system", "content": "You describe objects."},
                {"role": "user", "content": "List 2 colors"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "[\"red\", \"blue\"]"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiCompatibleClient::new(&format!("{}/v1", server.uri()), 5_000).unwrap();
    let reply = client.complete(&request(), &key()).await.unwrap();
    assert_eq!(reply, "[\"red\", \"blue\"]");
}

#[tokio::test]
async fn unauthorized_maps_to_key_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let client = OpenAiCompatibleClient::new(&server.uri(), 5_000).unwrap();
    let err = client.complete(&request(), &key()).await.unwrap_err();
    assert!(err.is_unauthorized());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_string("rate limited"),
        )
        .mount(&server)
        .await;

    let client = OpenAiCompatibleClient::new(&server.uri(), 5_000).unwrap();
    let err = client.complete(&request(), &key()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    match err {
        ClientError::Status { status, body, .. } => {
            assert_eq!(status, 429);
            assert_eq!(body, "rate limited");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn empty_content_is_retryable_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "   "}}]
        })))
        .mount(&server)
        .await;

    let client = OpenAiCompatibleClient::new(&server.uri(), 5_000).unwrap();
    let err = client.complete(&request(), &key()).await.unwrap_err();
    assert!(matches!(err, ClientError::Empty));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(500))
                .set_body_json(json!({"choices": []})),
        )
        .mount(&server)
        .await;

    let client = OpenAiCompatibleClient::new(&server.uri(), 50).unwrap();
    let err = client.complete(&request(), &key()).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { timeout_ms: 50 }));
}
