//! HTTP surface tests, driven through the router with `oneshot`.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use fieldsync_server::catalog::default_registry;
use fieldsync_server::config::{Config, SyncSettings};
use fieldsync_server::session::SyncManager;
use fieldsync_server::store::{MemoryStore, SharedStore};
use fieldsync_server::{app, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "s3cret";

fn test_app() -> (Arc<MemoryStore>, Router) {
    let store = Arc::new(MemoryStore::new());
    let shared: SharedStore = store.clone();
    let registry = default_registry(Arc::clone(&shared)).unwrap();
    let manager = SyncManager::new(shared, registry, SyncSettings::default()).unwrap();
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_url: String::new(),
        auth_secret: Some(SECRET.to_string()),
        sync: SyncSettings::default(),
    };
    let state = AppState {
        manager,
        config: Arc::new(config),
    };
    (store, app(state))
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {SECRET}"));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn start(app: &Router) -> String {
    let (status, body) = send(app, request(Method::POST, "/sync", Some(json!({})))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["sessionId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_open() {
    let (_, app) = test_app();
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["nodeRole"], "central");
}

#[tokio::test]
async fn sync_routes_need_the_secret() {
    let (_, app) = test_app();
    let anonymous = Request::builder()
        .method(Method::POST)
        .uri("/sync")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = send(&app, anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .method(Method::POST)
        .uri("/sync")
        .header(header::AUTHORIZATION, "Bearer guess")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn pull_round_trip() {
    let (store, app) = test_app();
    store.write_row("patients", json!({"id": "p1", "first_name": "Ana"}));
    store.write_row("patient_issues", json!({"id": "i1", "patient_id": "p1"}));
    let id = start(&app).await;

    let (status, _) = send(&app, request(Method::POST, &format!("/sync/{id}/pull"), Some(json!({})))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut count = None;
    for _ in 0..500 {
        let (status, body) = send(&app, request(Method::GET, &format!("/sync/{id}/pull/count"), None)).await;
        assert_eq!(status, StatusCode::OK);
        if body["ready"] == true {
            count = body["count"].as_i64();
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(count, Some(2));

    let (status, page) = send(&app, request(Method::GET, &format!("/sync/{id}/pull?limit=1"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["records"][0]["recordType"], "Patient");
    assert_eq!(page["hasMore"], true);

    let next = &page["next"];
    let uri = format!(
        "/sync/{id}/pull?afterRank={}&afterId={}&limit=10",
        next["rank"], next["id"]
    );
    let (_, page) = send(&app, request(Method::GET, &uri, None)).await;
    assert_eq!(page["records"][0]["recordType"], "PatientIssue");
    assert_eq!(page["hasMore"], false);

    let (status, _) = send(&app, request(Method::GET, &format!("/sync/{id}/pull?afterRank=1"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, session) = send(&app, request(Method::POST, &format!("/sync/{id}/pull/complete"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["status"], "OUTGOING");

    let (status, session) = send(&app, request(Method::DELETE, &format!("/sync/{id}"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["status"], "CLOSED");

    let (status, _) = send(&app, request(Method::GET, &format!("/sync/{id}"), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn push_round_trip() {
    let (store, app) = test_app();
    let id = start(&app).await;

    let changes = json!({"changes": [
        {"recordType": "Patient", "recordId": "p7", "data": {"id": "p7", "first_name": "Mo"}}
    ]});
    let (status, body) = send(&app, request(Method::POST, &format!("/sync/{id}/push"), Some(changes))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["staged"], 1);

    let (status, report) = send(
        &app,
        request(Method::POST, &format!("/sync/{id}/push/complete"), Some(json!({"upToTick": 12}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["applied"], 1);
    assert!(store.row("patients", "p7").is_some());

    let bad = json!({"changes": [{"recordType": "Spaceship", "recordId": "s1", "data": {}}]});
    let (status, body) = send(&app, request(Method::POST, &format!("/sync/{id}/push"), Some(bad))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Spaceship"));

    let (status, _) = send(&app, request(Method::GET, &format!("/sync/{id}"), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn unmatched_channel_is_a_bad_request_and_poisons_the_session() {
    let (_, app) = test_app();
    let id = start(&app).await;

    let filter = json!({"channels": ["foo/bar/baz"]});
    let (status, _) = send(&app, request(Method::POST, &format!("/sync/{id}/pull"), Some(filter))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, request(Method::GET, &format!("/sync/{id}"), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("foo/bar/baz"));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let (_, app) = test_app();
    let uri = format!("/sync/{}", uuid::Uuid::new_v4());
    let (status, _) = send(&app, request(Method::GET, &uri, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn channel_lookups() {
    let (_, app) = test_app();

    let (status, body) = send(&app, request(Method::GET, "/sync/channels/p1", None)).await;
    assert_eq!(status, StatusCode::OK);
    let channels: Vec<&str> = body["channels"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(channels.contains(&"patient/p1/issue"));

    let (status, body) = send(&app, request(Method::GET, "/sync/channel?path=patient/p1/issue", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["recordType"], "PatientIssue");
    assert_eq!(body["params"]["patientId"], "p1");

    let (status, _) = send(&app, request(Method::GET, "/sync/channel?path=nowhere/at/all", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
