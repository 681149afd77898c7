//! AlertmanagerClient against an in-process fake of the v2 silences API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde_json::Value;
use wmcs_cookbooks::alerts::{host_matcher, silence_host, AlertError, Matcher, SilenceRequest};
use wmcs_cookbooks::{AlertmanagerClient, SilenceId, SilenceManager};

#[derive(Default)]
struct FakeAlertmanager {
    silences: HashMap<String, Value>,
    requests: usize,
}

type Shared = Arc<Mutex<FakeAlertmanager>>;

async fn post_silence(State(state): State<Shared>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let mut state = state.lock().unwrap();
    state.requests += 1;
    let id = format!("silence-{}", state.silences.len() + 1);
    state.silences.insert(id.clone(), body);
    (StatusCode::OK, Json(serde_json::json!({ "silenceID": id })))
}

async fn delete_silence(State(state): State<Shared>, Path(id): Path<String>) -> (StatusCode, String) {
    let mut state = state.lock().unwrap();
    state.requests += 1;
    match id.as_str() {
        "expired" => (StatusCode::INTERNAL_SERVER_ERROR, "silence expired-1 already expired".to_string()),
        "broken" => (StatusCode::INTERNAL_SERVER_ERROR, "storage failure".to_string()),
        _ if state.silences.remove(&id).is_some() => (StatusCode::OK, String::new()),
        _ => (StatusCode::NOT_FOUND, format!("silence {} not found", id)),
    }
}

async fn start_fake() -> (String, Shared) {
    let state: Shared = Arc::new(Mutex::new(FakeAlertmanager::default()));
    let router = Router::new()
        .route("/api/v2/silences", post(post_silence))
        .route("/api/v2/silence/:id", delete(delete_silence))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}/", addr), state)
}

#[tokio::test]
async fn test_create_and_remove_silence() {
    let (url, state) = start_fake().await;
    let client = AlertmanagerClient::new(&url, "ops");

    let id = silence_host(&client, "cloudcephosd1001", Duration::from_secs(3600), "Draining", Some("T12345"))
        .await
        .unwrap();
    assert_eq!(id, SilenceId::new("silence-1"));

    {
        let state = state.lock().unwrap();
        let body = &state.silences["silence-1"];
        assert_eq!(body["createdBy"], "ops");
        assert_eq!(body["comment"], "Draining - T12345");
        assert_eq!(body["matchers"][0], serde_json::to_value(host_matcher("cloudcephosd1001")).unwrap());
        let starts = chrono::DateTime::parse_from_rfc3339(body["startsAt"].as_str().unwrap()).unwrap();
        let ends = chrono::DateTime::parse_from_rfc3339(body["endsAt"].as_str().unwrap()).unwrap();
        assert_eq!((ends - starts).num_seconds(), 3600);
    }

    client.remove_silence(&id).await.unwrap();
    assert!(state.lock().unwrap().silences.is_empty());
}

#[tokio::test]
async fn test_remove_unknown_or_expired_silence_is_ok() {
    let (url, _state) = start_fake().await;
    let client = AlertmanagerClient::new(&url, "ops");

    client.remove_silence(&SilenceId::new("missing")).await.unwrap();
    client.remove_silence(&SilenceId::new("expired")).await.unwrap();
}

#[tokio::test]
async fn test_remove_silence_server_error() {
    let (url, _state) = start_fake().await;
    let client = AlertmanagerClient::new(&url, "ops");

    match client.remove_silence(&SilenceId::new("broken")).await {
        Err(AlertError::Status { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "storage failure");
        }
        other => panic!("Expected Status error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dry_run_does_not_call_alertmanager() {
    let (url, state) = start_fake().await;
    let client = AlertmanagerClient::new(&url, "ops").with_dry_run(true);

    let request = SilenceRequest {
        matchers: vec![Matcher::regex("service", "~.*ceph.*")],
        duration: Duration::from_secs(600),
        comment: "maintenance".to_string(),
    };
    let id = client.create_silence(&request).await.unwrap();
    client.remove_silence(&id).await.unwrap();

    assert_eq!(state.lock().unwrap().requests, 0);
}
