use std::sync::Arc;
use std::time::Duration;

use mushroom_ai::{
    error::EngineError,
    serve,
    server::{ERROR_BAD_REQUEST, ERROR_INTERNAL, ERROR_NO_RESPONSE, GENERATE_PATH, HEALTH_PATH},
    types::{ErrorBody, GenerateResponse, HealthResponse},
    Completer, Completion, RemoteCompleter, Result, ServeHandle,
};
use pretty_assertions::assert_eq;
use serde_json::json;

struct ScriptedCompleter;

#[async_trait::async_trait]
impl Completer for ScriptedCompleter {
    async fn complete(&self, prompt: &str) -> Result<Completion> {
        match prompt {
            "fail" => Err(EngineError::Timeout {
                operation: "generation".to_string(),
                duration: Duration::from_secs(30),
            }),
            "silent" => Ok(Completion::text("")),
            _ => Ok(Completion::text(format!("You said: {prompt}"))),
        }
    }
}

async fn start() -> ServeHandle {
    serve(Arc::new(ScriptedCompleter), "127.0.0.1:0").await.unwrap()
}

fn url(handle: &ServeHandle, path: &str) -> String {
    format!("{}{}", handle.local_url(), path)
}

#[tokio::test]
async fn test_healthcheck() {
    let handle = start().await;
    let resp = reqwest::get(url(&handle, HEALTH_PATH)).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: HealthResponse = resp.json().await.unwrap();
    assert_eq!(body.status, "ok");
    assert_eq!(body.message, "Server is running");
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_generate_success() {
    let handle = start().await;
    let resp = reqwest::Client::new()
        .post(url(&handle, GENERATE_PATH))
        .json(&json!({"prompt": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: GenerateResponse = resp.json().await.unwrap();
    assert_eq!(body.response, "You said: hello");
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_prompt_is_bad_request() {
    let handle = start().await;
    let client = reqwest::Client::new();

    for body in [json!({}), json!({"prompt": ""}), json!({"text": "hi"})] {
        let resp = client
            .post(url(&handle, GENERATE_PATH))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let error: ErrorBody = resp.json().await.unwrap();
        assert_eq!(error.error, ERROR_BAD_REQUEST);
        assert_eq!(error.details, None);
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let handle = start().await;
    let resp = reqwest::Client::new()
        .post(url(&handle, GENERATE_PATH))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let error: ErrorBody = resp.json().await.unwrap();
    assert_eq!(error.error, ERROR_BAD_REQUEST);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_completion_is_internal_error() {
    let handle = start().await;
    let resp = reqwest::Client::new()
        .post(url(&handle, GENERATE_PATH))
        .json(&json!({"prompt": "silent"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);

    let error: ErrorBody = resp.json().await.unwrap();
    assert_eq!(error.error, ERROR_INTERNAL);
    assert_eq!(error.details.as_deref(), Some(ERROR_NO_RESPONSE));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_completer_error_is_internal_error() {
    let handle = start().await;
    let resp = reqwest::Client::new()
        .post(url(&handle, GENERATE_PATH))
        .json(&json!({"prompt": "fail"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);

    let error: ErrorBody = resp.json().await.unwrap();
    assert_eq!(error.error, ERROR_INTERNAL);
    assert!(error.details.unwrap().contains("generation"));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_completer_round_trip() {
    let handle = start().await;
    let remote = RemoteCompleter::new(&handle.local_url(), Duration::from_secs(5)).unwrap();

    let completion = remote.complete("mushrooms").await.unwrap();
    assert_eq!(completion.text, "You said: mushrooms");

    let err = remote.complete("fail").await.unwrap_err();
    assert!(matches!(err, EngineError::Generation(_)));
    assert!(err.to_string().contains("500"));

    handle.shutdown().await.unwrap();
}
