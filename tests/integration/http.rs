//! HTTP round trips against a local fake server.
//!
//! Covers the task invoker and the data API store end to end.

use axum::Router;
use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::{get, post};
use cadence::testing::ScriptedInvoker;
use cadence::{
    DagDefinition, DagExecutor, DataApiOptions, DataApiStore, DefinitionStore, ExecutionStatus,
    HttpInvoker, HttpInvokerOptions, InMemoryStore, InvocationError, StorageError, TaskDefinition,
    TaskInvoker,
};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Captured {
    auth: Vec<String>,
    finds: Vec<Value>,
    upserts: Vec<Value>,
    flaky_calls: usize,
}

type Shared = Arc<Mutex<Captured>>;

async fn ok() -> StatusCode {
    StatusCode::OK
}

async fn fail() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

async fn unavailable() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn slow() -> StatusCode {
    tokio::time::sleep(Duration::from_secs(2)).await;
    StatusCode::OK
}

async fn json_only(headers: HeaderMap) -> StatusCode {
    match headers.get(header::CONTENT_TYPE) {
        Some(value) if value == "application/json" => StatusCode::OK,
        _ => StatusCode::UNSUPPORTED_MEDIA_TYPE,
    }
}

async fn flaky(State(state): State<Shared>) -> (StatusCode, &'static str) {
    let mut captured = state.lock().unwrap();
    captured.flaky_calls += 1;
    if captured.flaky_calls < 3 {
        (StatusCode::BAD_GATEWAY, "warming up")
    } else {
        (StatusCode::OK, "")
    }
}

fn record_auth(state: &Shared, headers: &HeaderMap) {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.lock().unwrap().auth.push(auth);
}

async fn find(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    record_auth(&state, &headers);
    state.lock().unwrap().finds.push(body);
    Json(json!({
        "documents": [
            {
                "uuid": "nightly",
                "name": "Nightly",
                "cron": "0 0 2 * * *",
                "enabled": true,
                "tasks": [
                    {
                        "uuid": "extract",
                        "name": "Extract",
                        "endpoint": "http://svc/extract",
                        "retry_on_failure": true,
                        "max_retries": 3
                    }
                ]
            }
        ]
    }))
}

async fn upsert(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    record_auth(&state, &headers);
    state.lock().unwrap().upserts.push(body);
    Json(json!({ "matchedCount": 1 }))
}

async fn denied() -> (StatusCode, &'static str) {
    (StatusCode::UNAUTHORIZED, "invalid api key")
}

/// Start the fake server and return its base URL.
async fn serve(state: Shared) -> String {
    let router = Router::new()
        .route("/ok", get(ok))
        .route("/fail", get(fail))
        .route("/unavailable", get(unavailable))
        .route("/slow", get(slow))
        .route("/json-only", get(json_only))
        .route("/flaky", get(flaky))
        .route("/api/find", post(find))
        .route("/api/upsert", post(upsert))
        .route("/denied/find", post(denied))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn task_at(base: &str, path: &str) -> TaskDefinition {
    TaskDefinition::new(path, path, format!("{}/{}", base, path))
}

#[tokio::test]
async fn test_invoker_maps_responses() {
    let base = serve(Shared::default()).await;
    let invoker = HttpInvoker::new(HttpInvokerOptions::default()).unwrap();

    assert_eq!(invoker.invoke(&task_at(&base, "ok")).await, Ok(()));
    assert_eq!(invoker.invoke(&task_at(&base, "json-only")).await, Ok(()));

    let err = invoker.invoke(&task_at(&base, "fail")).await.unwrap_err();
    assert_eq!(
        err,
        InvocationError::Status {
            status: 500,
            body: "boom".to_string()
        }
    );
    assert_eq!(err.detail(), "boom");

    let err = invoker
        .invoke(&task_at(&base, "unavailable"))
        .await
        .unwrap_err();
    assert_eq!(err.detail(), "HTTP 503");
}

#[tokio::test]
async fn test_invoker_sends_configured_content_type() {
    let base = serve(Shared::default()).await;
    let invoker = HttpInvoker::new(HttpInvokerOptions {
        content_type: "text/plain".to_string(),
        timeout: None,
    })
    .unwrap();

    let err = invoker
        .invoke(&task_at(&base, "json-only"))
        .await
        .unwrap_err();
    assert!(matches!(err, InvocationError::Status { status: 415, .. }));
}

#[tokio::test]
async fn test_invoker_transport_failures() {
    let base = serve(Shared::default()).await;
    let invoker = HttpInvoker::new(HttpInvokerOptions {
        timeout: Some(Duration::from_millis(100)),
        ..HttpInvokerOptions::default()
    })
    .unwrap();

    let err = invoker.invoke(&task_at(&base, "slow")).await.unwrap_err();
    assert!(matches!(err, InvocationError::Transport(_)));

    let refused = TaskDefinition::new("x", "x", "http://127.0.0.1:1/unreachable");
    let err = invoker.invoke(&refused).await.unwrap_err();
    assert!(matches!(err, InvocationError::Transport(_)));
    assert!(!err.detail().is_empty());

    let empty = TaskDefinition::new("e", "e", "");
    assert_eq!(
        invoker.invoke(&empty).await,
        Err(InvocationError::EmptyEndpoint)
    );
}

#[tokio::test]
async fn test_dag_over_http_with_retry_and_failure() {
    let state = Shared::default();
    let base = serve(state.clone()).await;
    let invoker = Arc::new(HttpInvoker::new(HttpInvokerOptions::default()).unwrap());
    let store = Arc::new(InMemoryStore::new());

    let dag = DagDefinition::new("http", "Over HTTP", "0 * * * * *")
        .with_task(task_at(&base, "ok"))
        .with_task(task_at(&base, "flaky").with_retries(5))
        .with_task(task_at(&base, "fail"))
        .with_task(task_at(&base, "ok"));

    let execution = DagExecutor::from_parts(invoker, store.clone())
        .run_dag(&dag)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.task_executions.len(), 3);
    assert_eq!(execution.task_executions[1].attempts, 3);
    assert_eq!(execution.task_executions[1].status, ExecutionStatus::Success);
    assert_eq!(execution.task_executions[2].error.as_deref(), Some("boom"));
    assert_eq!(state.lock().unwrap().flaky_calls, 3);
}

#[tokio::test]
async fn test_data_api_fetches_enabled_definitions() {
    let state = Shared::default();
    let base = serve(state.clone()).await;
    let store = DataApiStore::new(DataApiOptions::new(
        format!("{}/api/", base),
        SecretString::from("secret-key"),
    ))
    .unwrap();

    let dags = store.fetch_enabled_dags().await.unwrap();

    assert_eq!(dags.len(), 1);
    assert_eq!(dags[0].id.as_str(), "nightly");
    assert_eq!(dags[0].tasks[0].max_retries, 3);
    assert!(dags[0].tasks[0].retry_on_failure);

    let captured = state.lock().unwrap();
    assert_eq!(captured.auth, vec!["Bearer secret-key".to_string()]);
    assert_eq!(
        captured.finds[0],
        json!({
            "database": "scheduler",
            "collection": "dags",
            "query": { "enabled": true },
        })
    );
}

#[tokio::test]
async fn test_data_api_receives_execution_upserts() {
    let state = Shared::default();
    let base = serve(state.clone()).await;
    let store = Arc::new(
        DataApiStore::new(DataApiOptions::new(
            format!("{}/api", base),
            SecretString::from("k"),
        ))
        .unwrap(),
    );

    let dag = DagDefinition::new("wire", "Wire", "0 * * * * *")
        .with_task(TaskDefinition::new("a", "A", "http://svc/a"));
    let execution = DagExecutor::from_parts(Arc::new(ScriptedInvoker::new()), store)
        .run_dag(&dag)
        .await
        .unwrap();

    let captured = state.lock().unwrap();
    let collections: Vec<&str> = captured
        .upserts
        .iter()
        .map(|u| u["collection"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(
        collections,
        vec![
            "dag_executions",
            "task_executions",
            "task_executions",
            "dag_executions",
            "dag_executions",
        ]
    );

    let first = &captured.upserts[0];
    assert_eq!(first["database"], "scheduler");
    assert_eq!(first["upsert"], true);
    assert_eq!(first["query"]["uuid"], execution.id.to_string());
    assert_eq!(first["update"]["$set"]["status"], "running");
    assert_eq!(first["update"]["$set"]["failing_task_execution_uuid"], "");

    let last = captured.upserts.last().unwrap();
    assert_eq!(last["update"]["$set"]["status"], "success");
    assert_eq!(last["update"]["$set"]["dag_uuid"], "wire");
    assert_eq!(
        last["update"]["$set"]["task_executions"][0]["attempts"],
        1
    );
}

#[tokio::test]
async fn test_data_api_surfaces_error_status() {
    let base = serve(Shared::default()).await;
    let store = DataApiStore::new(DataApiOptions::new(
        format!("{}/denied", base),
        SecretString::from("wrong"),
    ))
    .unwrap();

    let err = store.fetch_enabled_dags().await.unwrap_err();
    match err {
        StorageError::Status { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "invalid api key");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
