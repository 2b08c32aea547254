use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use risk_agents::config::Config;
use risk_agents::llm::{Completion, LlmClient, LlmError};

fn config_for(server: &MockServer) -> Config {
    Config {
        api_key: "test-key".to_string(),
        base_url: server.uri(),
        model: "test/model".to_string(),
        max_retries: 3,
        retry_delay: 0.01,
        min_request_interval: 0.0,
        item_delay: 0.0,
        ..Config::default()
    }
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    }))
}

#[tokio::test]
async fn sends_system_and_user_messages_with_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "test/model",
            "messages": [
                { "role": "system", "content": "你是专家" },
                { "role": "user", "content": "分析" }
            ]
        })))
        .respond_with(completion("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config_for(&server)).unwrap();
    let options = client.default_options();
    let text = client.complete("你是专家", "分析", &options).await.unwrap();
    assert_eq!(text, "ok");
}

#[tokio::test]
async fn rate_limit_is_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("def check_risk(data_dict):\n    return True"))
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config_for(&server)).unwrap();
    let options = client.default_options();
    let text = client.complete("s", "p", &options).await.unwrap();
    assert!(text.starts_with("def check_risk"));
}

#[tokio::test]
async fn auth_failure_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config_for(&server)).unwrap();
    let options = client.default_options();
    let err = client.complete("s", "p", &options).await.unwrap_err();
    match err {
        LlmError::Auth { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "invalid key");
        }
        other => panic!("expected auth error, got {other:?}"),
    }
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown model"))
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config_for(&server)).unwrap();
    let options = client.default_options();
    let err = client.complete("s", "p", &options).await.unwrap_err();
    match err {
        LlmError::Api { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "unknown model");
        }
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn request_timeout_status_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(408))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config_for(&server)).unwrap();
    let options = client.default_options();
    assert_eq!(client.complete("s", "p", &options).await.unwrap(), "ok");
}

#[tokio::test]
async fn empty_content_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("   "))
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config_for(&server)).unwrap();
    let options = client.default_options();
    let err = client.complete("s", "p", &options).await.unwrap_err();
    assert!(matches!(err, LlmError::EmptyResponse));
}

#[tokio::test]
async fn persistent_server_errors_exhaust_the_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = LlmClient::new(config_for(&server)).unwrap();
    let options = client.default_options();
    let err = client.complete("s", "p", &options).await.unwrap_err();
    match err {
        LlmError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, LlmError::ServerBusy { status: 503 }));
        }
        other => panic!("expected exhausted error, got {other:?}"),
    }
}

#[tokio::test]
async fn json_mode_requests_json_object_format() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "response_format": { "type": "json_object" } })))
        .respond_with(completion("{\"a\":1}"))
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config_for(&server)).unwrap();
    let options = client.default_options().json();
    let text = client.complete("s", "p", &options).await.unwrap();
    assert_eq!(text, "{\"a\":1}");
}
